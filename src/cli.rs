//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Certificate lookup proxy - cached, single-flight access to the upstream certificate API
#[derive(Parser, Debug)]
#[command(name = "cert-proxy")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "CERT_PROXY_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, env = "CERT_PROXY_PORT")]
    pub port: Option<u16>,

    /// Host to bind to
    #[arg(long, env = "CERT_PROXY_HOST")]
    pub host: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "CERT_PROXY_LOG_LEVEL", global = true)]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "CERT_PROXY_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand (optional - defaults to server mode)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the proxy server (default)
    Serve,

    /// Look up one control number through the cache and upstream, then exit
    Lookup {
        /// Control number to look up
        #[arg(required = true)]
        control_number: String,
    },
}
