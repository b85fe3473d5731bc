use anyhow::Context;
use coop_gateway::{config::GatewayConfig, init_gateway, observability::init_tracing};
use std::env;
use std::path::PathBuf;
use std::process;

const DEFAULT_CONFIG_PATH: &str = "config/gateway.yaml";

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Gateway error: {:#}", e);
        eprintln!("Usage: coop-gateway [config_file]");
        process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    // An explicit path must exist; the default one is optional
    let config_path = match env::args().nth(1) {
        Some(path) => Some(PathBuf::from(path)),
        None => Some(PathBuf::from(DEFAULT_CONFIG_PATH)).filter(|p| p.exists()),
    };

    let config = GatewayConfig::load(config_path.as_deref()).with_context(|| {
        format!(
            "failed to load configuration from {}",
            config_path
                .as_deref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "environment".to_string())
        )
    })?;

    init_tracing(&config.logging)?;

    config.validate().context("invalid configuration")?;

    init_gateway(config).await?;
    Ok(())
}
