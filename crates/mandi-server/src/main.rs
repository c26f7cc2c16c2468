//! mandi-server: realtime vendor/customer marketplace.
//!
//! Usage:
//!   mandi-server [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>   Config file path (default: config/server.toml)
//!   --port <PORT>         Gateway WebSocket port (overrides config)
//!   --api-port <PORT>     REST API port (overrides config)

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use mandi_server::api::{spawn_api_server, ApiServerConfig, ApiState};
use mandi_server::config::ServerConfig;
use mandi_server::gateway::server::{spawn_gateway_server, GatewayConfig};
use mandi_server::oracle::{gemini::GeminiClient, payment::RazorpayClient, KeyRing};
use mandi_server::session::SessionStore;

/// CLI arguments for mandi-server.
#[derive(Parser, Debug)]
#[command(name = "mandi-server")]
#[command(about = "Realtime vendor/customer marketplace server")]
#[command(version)]
struct Args {
    /// Config file path
    #[arg(short, long, default_value = "config/server.toml")]
    config: PathBuf,

    /// Gateway WebSocket port (overrides config file)
    #[arg(long)]
    port: Option<u16>,

    /// REST API port (overrides config file)
    #[arg(long)]
    api_port: Option<u16>,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<()> {
    // Load environment variables from .env file (if present)
    if let Err(e) = dotenvy::dotenv() {
        if !matches!(e, dotenvy::Error::Io(ref io_err) if io_err.kind() == std::io::ErrorKind::NotFound)
        {
            eprintln!("Warning: Failed to load .env file: {}", e);
        }
    }

    let args = Args::parse();

    // Load configuration
    let mut config = if args.config.exists() {
        ServerConfig::from_file(&args.config)
            .with_context(|| format!("Failed to load config from {:?}", args.config))?
    } else {
        ServerConfig::default()
    };

    // Apply environment variable overrides (credentials, ports)
    config.apply_env_overrides();

    // Apply CLI overrides
    if let Some(port) = args.port {
        config.gateway.port = port;
    }
    if let Some(port) = args.api_port {
        config.api.port = port;
    }

    // Initialize logging
    let log_level = match config.log_level.0.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder().with_max_level(log_level).finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set global tracing subscriber")?;

    info!("Starting mandi-server");

    // Validate configuration before proceeding
    config.validate().context("Configuration validation failed")?;

    // Oracle clients share one credential ring
    let keys = Arc::new(KeyRing::new(config.oracle.api_keys.clone()));
    info!(keys = keys.len(), "Gemini credential ring initialized");

    let gemini = Arc::new(GeminiClient::new(
        Arc::clone(&keys),
        config.oracle.base_url.clone(),
        config.oracle.model.clone(),
    ));

    if !config.payment.is_configured() {
        warn!("Razorpay credentials not set; online settlement will be unavailable");
    }
    let razorpay = Arc::new(RazorpayClient::new(
        config.payment.key_id.clone().unwrap_or_default(),
        config.payment.key_secret.clone().unwrap_or_default(),
        config.payment.base_url.clone(),
    ));

    let store = Arc::new(SessionStore::new());
    let services = mandi_server::core_services(
        store,
        gemini.clone(),
        gemini.clone(),
        gemini,
        razorpay,
    );

    // REST API
    let api_state = Arc::new(ApiState {
        services: Arc::clone(&services),
        oracle_keys: keys,
    });
    let api_config = ApiServerConfig {
        port: config.api.port,
        enable_cors: config.api.enable_cors,
    };
    let api_handle = spawn_api_server(api_config, api_state);

    // Realtime gateway
    let gateway_config = GatewayConfig {
        port: config.gateway.port,
        max_clients: config.gateway.max_clients,
    };
    let (gateway, gateway_handle) = spawn_gateway_server(gateway_config, services);

    // Run until interrupted
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown signal received");

    let _ = gateway.shutdown_handle().send(());
    let _ = gateway_handle.await;
    api_handle.abort();

    info!("mandi-server stopped");
    Ok(())
}
