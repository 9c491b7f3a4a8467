//! Certificate Lookup Proxy
//!
//! Cached, single-flight, concurrency-limited access to the upstream certificate API.

use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use cert_proxy::{
    cli::{Cli, Command},
    config::Config,
    lookup::CertificateService,
    proxy::Proxy,
    setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    match cli.command {
        Some(Command::Lookup { control_number }) => run_lookup(&config, &control_number).await,
        Some(Command::Serve) | None => run_server(config).await,
    }
}

/// Load configuration and apply CLI overrides
fn load_config(cli: &Cli) -> cert_proxy::Result<Config> {
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(ref host) = cli.host {
        config.server.host = host.clone();
    }
    Ok(config)
}

/// One-shot lookup printed as JSON
async fn run_lookup(config: &Config, control_number: &str) -> ExitCode {
    let service = match CertificateService::from_config(config) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("❌ Failed to create lookup service: {e}");
            return ExitCode::FAILURE;
        }
    };

    match service.lookup(control_number).await {
        Ok(record) => match serde_json::to_string_pretty(&record) {
            Ok(json) => {
                println!("{json}");
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("❌ Failed to serialize record: {e}");
                ExitCode::FAILURE
            }
        },
        Err(e) => {
            eprintln!("❌ Lookup failed: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Run the proxy server
async fn run_server(config: Config) -> ExitCode {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.server.port,
        tls = config.server.tls.is_some(),
        "Starting certificate proxy"
    );

    let proxy = match Proxy::new(config) {
        Ok(p) => p,
        Err(e) => {
            error!("Failed to create proxy: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = proxy.run().await {
        error!("Proxy error: {e}");
        return ExitCode::FAILURE;
    }

    info!("Proxy shutdown complete");
    ExitCode::SUCCESS
}
