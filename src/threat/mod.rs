//! Threat screening
//!
//! Every request that is not on the bypass list runs through a fixed
//! battery of independent checks. All matching rules are collected (no
//! short-circuit) and their scores summed into a [`SecurityVerdict`].
//!
//! Directory traversal and malicious-path probes are hard failures: they
//! deny regardless of the configured threshold and deny when their input
//! cannot be decoded. The remaining checks are advisory and fail open.

pub mod allowlist;
pub mod patterns;

pub use self::allowlist::{IpAllowList, IpRange};

use crate::error::{GatewayError, Result};
use crate::gateway::headers::default_security_headers;
use crate::rate_limit::{RateLimitConfig, RateLimitKey, RateLimiterService};
use axum::http::{header, HeaderMap, Method, StatusCode};
use regex::RegexSet;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, warn};

/// Limiter name used for the per-IP volume signal
pub const VOLUME_LIMITER: &str = "threat-volume";

/// Security configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Requests scoring at or above this are denied
    #[serde(default = "default_max_threat_score")]
    pub max_threat_score: u32,
    /// IPs or CIDR ranges that skip screening (loopback is always included)
    #[serde(default)]
    pub ip_allowlist: Vec<String>,
    /// Case-insensitive user-agent substrings of known scanning tools
    #[serde(default = "default_user_agent_blacklist")]
    pub user_agent_blacklist: Vec<String>,
    /// Extra malicious-path regexes, added to the built-in set
    #[serde(default)]
    pub malicious_patterns: Vec<String>,
    /// Path prefixes that skip screening and rate limiting
    #[serde(default = "default_bypass_prefixes")]
    pub bypass_prefixes: Vec<String>,
    /// Per-IP volume that starts contributing to the threat score
    #[serde(default = "default_volume")]
    pub volume: RateLimitConfig,
    /// Headers attached to every response
    #[serde(default = "default_security_headers")]
    pub headers: BTreeMap<String, String>,
}

fn default_max_threat_score() -> u32 {
    50
}

fn default_user_agent_blacklist() -> Vec<String> {
    patterns::DEFAULT_USER_AGENT_BLACKLIST
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_bypass_prefixes() -> Vec<String> {
    ["/health", "/metrics", "/favicon.ico", "/robots.txt", "/_next/static/", "/static/"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_volume() -> RateLimitConfig {
    RateLimitConfig::new(300, 60_000)
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            max_threat_score: default_max_threat_score(),
            ip_allowlist: vec![],
            user_agent_blacklist: default_user_agent_blacklist(),
            malicious_patterns: vec![],
            bypass_prefixes: default_bypass_prefixes(),
            volume: default_volume(),
            headers: default_security_headers(),
        }
    }
}

/// Individual screening rules
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreatRule {
    DirectoryTraversal,
    MaliciousPath,
    ScannerUserAgent,
    Injection,
    RequestFlood,
    SuspiciousMethod,
    MissingUserAgent,
}

impl ThreatRule {
    pub fn name(&self) -> &'static str {
        match self {
            ThreatRule::DirectoryTraversal => "directory_traversal",
            ThreatRule::MaliciousPath => "malicious_path",
            ThreatRule::ScannerUserAgent => "scanner_user_agent",
            ThreatRule::Injection => "injection_pattern",
            ThreatRule::RequestFlood => "request_flood",
            ThreatRule::SuspiciousMethod => "suspicious_method",
            ThreatRule::MissingUserAgent => "missing_user_agent",
        }
    }

    pub fn score(&self) -> u32 {
        match self {
            ThreatRule::DirectoryTraversal => 100,
            ThreatRule::MaliciousPath => 100,
            ThreatRule::ScannerUserAgent => 60,
            ThreatRule::Injection => 50,
            ThreatRule::RequestFlood => 50,
            ThreatRule::SuspiciousMethod => 30,
            ThreatRule::MissingUserAgent => 20,
        }
    }

    /// Hard-fail rules deny on their own, whatever the threshold
    pub fn is_hard_fail(&self) -> bool {
        matches!(
            self,
            ThreatRule::DirectoryTraversal | ThreatRule::MaliciousPath
        )
    }

    fn description(&self) -> &'static str {
        match self {
            ThreatRule::DirectoryTraversal => "Directory traversal attempt",
            ThreatRule::MaliciousPath => "Malicious path pattern",
            ThreatRule::ScannerUserAgent => "Blacklisted user agent",
            ThreatRule::Injection => "Injection pattern in request",
            ThreatRule::RequestFlood => "Request volume exceeded",
            ThreatRule::SuspiciousMethod => "Suspicious HTTP method",
            ThreatRule::MissingUserAgent => "Missing user agent",
        }
    }
}

/// Outcome of screening one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityVerdict {
    pub allow: bool,
    pub threat_score: u32,
    pub reason: Option<String>,
    /// Every rule that matched, in evaluation order
    pub threats: Vec<String>,
    pub hard_fail: bool,
}

impl SecurityVerdict {
    /// Verdict for trusted clients
    pub fn trusted() -> Self {
        Self {
            allow: true,
            threat_score: 0,
            reason: None,
            threats: vec![],
            hard_fail: false,
        }
    }

    fn from_matches(matches: &[ThreatRule], max_threat_score: u32) -> Self {
        let threat_score = matches.iter().map(|rule| rule.score()).sum::<u32>();
        let hard_fail = matches.iter().any(|rule| rule.is_hard_fail());

        Self {
            allow: !hard_fail && threat_score < max_threat_score,
            threat_score,
            reason: matches.first().map(|rule| rule.description().to_string()),
            threats: matches.iter().map(|rule| rule.name().to_string()).collect(),
            hard_fail,
        }
    }

    pub fn has_threat(&self, rule: ThreatRule) -> bool {
        self.threats.iter().any(|t| t == rule.name())
    }

    /// Status returned to a denied client.
    ///
    /// Probes for paths we do not serve get a plain 404 so scanners learn
    /// nothing; everything else is 403.
    pub fn status_code(&self) -> StatusCode {
        if self.has_threat(ThreatRule::MaliciousPath)
            && !self.has_threat(ThreatRule::DirectoryTraversal)
        {
            StatusCode::NOT_FOUND
        } else {
            StatusCode::FORBIDDEN
        }
    }

    /// Error for a denied verdict, `None` when the request is allowed
    pub fn to_error(&self, path: &str) -> Option<GatewayError> {
        if self.allow {
            return None;
        }

        let reason = self
            .reason
            .clone()
            .unwrap_or_else(|| "Request blocked".to_string());

        Some(if self.has_threat(ThreatRule::DirectoryTraversal) {
            GatewayError::PathTraversal(reason)
        } else if self.status_code() == StatusCode::NOT_FOUND {
            GatewayError::NotFound(path.to_string())
        } else {
            GatewayError::Forbidden(reason)
        })
    }
}

/// The parts of a request the scanner looks at
#[derive(Debug)]
pub struct ScanRequest<'a> {
    pub method: &'a Method,
    pub path: &'a str,
    pub query: Option<&'a str>,
    pub headers: &'a HeaderMap,
    pub body: &'a [u8],
    pub client_ip: Option<IpAddr>,
    /// `client_ip` was taken from `X-Forwarded-For` rather than the socket
    pub forwarded: bool,
}

/// Pattern-based request classifier
pub struct ThreatScanner {
    max_threat_score: u32,
    allowlist: IpAllowList,
    user_agent_blacklist: Vec<String>,
    malicious_paths: RegexSet,
    injection: RegexSet,
    volume: RateLimitConfig,
    limiter: Arc<RateLimiterService>,
}

impl ThreatScanner {
    pub fn new(config: &SecurityConfig, limiter: Arc<RateLimiterService>) -> Result<Self> {
        let malicious_paths = RegexSet::new(
            patterns::DEFAULT_MALICIOUS_PATTERNS
                .iter()
                .map(|p| format!("(?i){}", p))
                .chain(config.malicious_patterns.iter().map(|p| format!("(?i){}", p))),
        )
        .map_err(|e| GatewayError::Config(format!("Invalid malicious path pattern: {}", e)))?;

        let injection = RegexSet::new(
            patterns::INJECTION_PATTERNS
                .iter()
                .map(|p| format!("(?i){}", p)),
        )
        .map_err(|e| GatewayError::Config(format!("Invalid injection pattern: {}", e)))?;

        Ok(Self {
            max_threat_score: config.max_threat_score,
            allowlist: IpAllowList::new(&config.ip_allowlist)?,
            user_agent_blacklist: config
                .user_agent_blacklist
                .iter()
                .map(|ua| ua.to_lowercase())
                .filter(|ua| !ua.is_empty())
                .collect(),
            malicious_paths,
            injection,
            volume: config.volume.clone(),
            limiter,
        })
    }

    /// Screen a request
    pub async fn evaluate(&self, request: &ScanRequest<'_>) -> SecurityVerdict {
        if let Some(ip) = request.client_ip {
            let listed = if request.forwarded {
                self.allowlist.contains_configured(&ip)
            } else {
                self.allowlist.contains(&ip)
            };
            if listed {
                debug!(ip = %ip, "Client on allow-list, skipping screening");
                return SecurityVerdict::trusted();
            }
        }

        let mut matches = Vec::new();

        if self.is_traversal(request) {
            matches.push(ThreatRule::DirectoryTraversal);
        }
        if self.is_malicious_path(request.path) {
            matches.push(ThreatRule::MaliciousPath);
        }

        match request
            .headers
            .get(header::USER_AGENT)
            .map(|value| value.to_str())
        {
            None => matches.push(ThreatRule::MissingUserAgent),
            Some(Ok(agent)) if agent.trim().is_empty() => {
                matches.push(ThreatRule::MissingUserAgent)
            }
            Some(Ok(agent)) => {
                if self.is_blacklisted_agent(agent) {
                    matches.push(ThreatRule::ScannerUserAgent);
                }
            }
            Some(Err(_)) => {
                debug!("User agent is not valid UTF-8, skipping blacklist check");
            }
        }

        if self.has_injection(request) {
            matches.push(ThreatRule::Injection);
        }

        if *request.method == Method::TRACE
            || *request.method == Method::CONNECT
            || request.method.as_str().eq_ignore_ascii_case("TRACK")
        {
            matches.push(ThreatRule::SuspiciousMethod);
        }

        let identifier = request
            .client_ip
            .map(|ip| ip.to_string())
            .unwrap_or_default();
        let key = RateLimitKey::new(VOLUME_LIMITER, identifier);
        if !self.limiter.check_with(&key, &self.volume).await.allowed {
            matches.push(ThreatRule::RequestFlood);
        }

        let verdict = SecurityVerdict::from_matches(&matches, self.max_threat_score);

        if !verdict.threats.is_empty() {
            warn!(
                target: "security",
                client = %key.identifier,
                method = %request.method,
                path = %request.path,
                score = verdict.threat_score,
                threats = ?verdict.threats,
                allow = verdict.allow,
                "Threat rules matched"
            );
        }

        verdict
    }

    fn is_traversal(&self, request: &ScanRequest<'_>) -> bool {
        if patterns::has_traversal_token(request.path) {
            return true;
        }
        request
            .query
            .map(patterns::query_has_traversal)
            .unwrap_or(false)
    }

    fn is_malicious_path(&self, path: &str) -> bool {
        // Undecodable paths are already hard-failed as traversal
        let decoded = patterns::decode_once(path)
            .map(|p| p.into_owned())
            .unwrap_or_else(|| path.to_string());
        self.malicious_paths.is_match(path) || self.malicious_paths.is_match(&decoded)
    }

    fn is_blacklisted_agent(&self, agent: &str) -> bool {
        let agent = agent.to_lowercase();
        self.user_agent_blacklist
            .iter()
            .any(|blocked| agent.contains(blocked.as_str()))
    }

    fn has_injection(&self, request: &ScanRequest<'_>) -> bool {
        if let Some(query) = request.query {
            match patterns::decode_once(&query.replace('+', " ")) {
                Some(decoded) if self.injection.is_match(&decoded) => return true,
                Some(_) => {}
                None => debug!("Query is not decodable, skipping injection check"),
            }
        }

        if request.body.is_empty() {
            return false;
        }
        match std::str::from_utf8(request.body) {
            Ok(text) => self.injection.is_match(text),
            Err(_) => {
                debug!("Body is not UTF-8 text, skipping injection check");
                false
            }
        }
    }
}
