//! Main entry point for the claim server.

use anyhow::Result;
use clap::{Arg, Command};
use claim_server::{config::ClaimConfig, http::start_server};
use std::path::Path;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_CONFIG_PATH: &str = "claim-config.toml";

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    let matches = Command::new("claim-server")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Token Claim Server - email-verified ERC-20 allocation claims")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Path to configuration file")
                .env("CLAIM_CONFIG")
                .default_value(DEFAULT_CONFIG_PATH),
        )
        .arg(
            Arg::new("generate-config")
                .long("generate-config")
                .help("Generate a default configuration file and exit")
                .action(clap::ArgAction::SetTrue),
        )
        .get_matches();

    let config_path = matches
        .get_one::<String>("config")
        .map(String::as_str)
        .unwrap_or(DEFAULT_CONFIG_PATH);

    if matches.get_flag("generate-config") {
        return generate_config(config_path);
    }

    info!("Starting claim server v{}", env!("CARGO_PKG_VERSION"));
    info!("Loading configuration from: {}", config_path);

    let config = match load_config(config_path) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            error!("Use --generate-config to create a default configuration file");
            std::process::exit(1);
        }
    };

    if let Err(e) = config.validate() {
        error!("Configuration validation failed: {}", e);
        std::process::exit(1);
    }

    info!("Configuration loaded and validated successfully");
    info!("Server will bind to: {}:{}", config.http.bind_address, config.http.port);
    info!("Ethereum RPC: {} (chain {})", config.ethereum.rpc_url, config.ethereum.chain_id);
    info!("Token: {} at {}", config.token.symbol, config.token.contract_address);
    if config.smtp.enabled {
        info!("SMTP server: {}:{}", config.smtp.server, config.smtp.port);
    }

    if let Err(e) = start_server(&config).await {
        error!("Server error: {}", e);
        std::process::exit(1);
    }

    Ok(())
}

/// Load configuration from file
fn load_config(path: &str) -> Result<ClaimConfig> {
    if !Path::new(path).exists() {
        return Err(anyhow::anyhow!(
            "Configuration file '{}' not found. Use --generate-config to create one.",
            path
        ));
    }

    ClaimConfig::from_file(path).map_err(|e| anyhow::anyhow!("Failed to parse config: {}", e))
}

/// Generate a default configuration file
fn generate_config(path: &str) -> Result<()> {
    let config = ClaimConfig::default();

    config.save_to_file(path)?;

    println!("Generated default configuration file: {}", path);
    println!();
    println!("Before running the server, edit:");
    println!("  ethereum.private_key           distributor wallet key");
    println!("  token.contract_address         ERC-20 being distributed");
    println!("  security.pepper                32+ character secret; never rotate once allocations exist");
    println!("  security.session_secret        32+ character secret");
    println!("  admin.password                 basic-auth password for /api/admin");
    println!("  smtp.*                         set enabled = true with real credentials to mail codes");
    println!();
    println!("Example usage after configuration:");
    println!("  claim-server --config {}", path);

    Ok(())
}
