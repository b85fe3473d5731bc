use axum::http::{HeaderMap, HeaderValue, Method};
use coop_gateway::files::{resolver::resolve_in, FileCategory};
use coop_gateway::rate_limit::{RateLimitConfig, RateLimitKey, RateLimiterService};
use coop_gateway::router::{default_rewrites, FileRouter, RewriteTable};
use coop_gateway::threat::{ScanRequest, SecurityConfig, ThreatScanner};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::collections::BTreeMap;
use std::sync::Arc;

fn segments(path: &str) -> Vec<String> {
    path.split('/').map(str::to_string).collect()
}

fn benchmark_rewrite_and_match(c: &mut Criterion) {
    let table = RewriteTable::new(&default_rewrites()).unwrap();
    let router = FileRouter::new().unwrap();

    let mut group = c.benchmark_group("routing");
    for path in ["/News/File/2024/report.pdf", "/api/news", "/Slide/File/a/b/c/d.pptx"] {
        group.bench_with_input(BenchmarkId::new("rewrite_and_match", path), &path, |b, path| {
            b.iter(|| {
                if let Some(internal) = table.rewrite(black_box(path)) {
                    let _ = router.match_file(&internal);
                }
            });
        });
    }
    group.finish();
}

fn benchmark_resolver(c: &mut Criterion) {
    let category = Arc::new(FileCategory::new(
        "News",
        std::env::temp_dir().join("bench-news"),
        &["pdf", "jpg", "png"],
        50 * 1024 * 1024,
        3600,
    ));

    let mut group = c.benchmark_group("resolver");
    for (name, path) in [
        ("clean", "2024/q1/report.pdf"),
        ("encoded", "2024/annual%20report.pdf"),
        ("traversal", "..%2f..%2fetc/passwd"),
        ("hidden", "2024/.env"),
    ] {
        let raw = segments(path);
        group.bench_with_input(BenchmarkId::new("resolve", name), &raw, |b, raw| {
            b.iter(|| resolve_in(black_box(&category), black_box(raw)));
        });
    }
    group.finish();
}

fn benchmark_threat_scan(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let config = SecurityConfig::default();
    let limiter = Arc::new(RateLimiterService::local_only(BTreeMap::new()));
    let scanner = ThreatScanner::new(&config, limiter).unwrap();

    let mut browser = HeaderMap::new();
    browser.insert(
        "user-agent",
        HeaderValue::from_static("Mozilla/5.0 (X11; Linux x86_64) Firefox/124.0"),
    );
    let mut scanner_ua = HeaderMap::new();
    scanner_ua.insert("user-agent", HeaderValue::from_static("sqlmap/1.7"));

    let cases = [
        ("clean", "/api/news", Some("page=2"), &browser),
        ("injection", "/api/news", Some("q=1'%20or%20'1'='1"), &browser),
        ("scanner", "/api/members", None, &scanner_ua),
        ("malicious_path", "/wp-admin/install.php", None, &browser),
    ];

    let mut group = c.benchmark_group("threat_scan");
    for (name, path, query, headers) in cases {
        group.bench_function(name, |b| {
            b.to_async(&rt).iter(|| {
                let request = ScanRequest {
                    method: &Method::GET,
                    path,
                    query,
                    headers,
                    body: &[],
                    client_ip: Some("203.0.113.5".parse().unwrap()),
                    forwarded: false,
                };
                let scanner = &scanner;
                async move { black_box(scanner.evaluate(&request).await) }
            });
        });
    }
    group.finish();
}

fn benchmark_rate_limit(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let service = RateLimiterService::local_only(BTreeMap::new());
    let config = RateLimitConfig::new(u32::MAX, 60_000);

    let mut counter = 0u64;
    c.bench_function("rate_limit_local_check", |b| {
        b.to_async(&rt).iter(|| {
            counter += 1;
            let key = RateLimitKey::new("bench", format!("10.0.{}.{}", (counter >> 8) & 255, counter & 255));
            let service = &service;
            let config = &config;
            async move { black_box(service.check_with(&key, config).await) }
        });
    });
}

criterion_group!(
    benches,
    benchmark_rewrite_and_match,
    benchmark_resolver,
    benchmark_threat_scan,
    benchmark_rate_limit
);
criterion_main!(benches);
