//! Certificate Lookup Proxy Library
//!
//! Looks up certificate records by control number on a third-party API,
//! shielding callers from upstream latency and rate limits.
//!
//! # Features
//!
//! - **TTL + LRU cache**: records are served from memory for a fixed TTL
//! - **Single-flight**: concurrent lookups of one control number share one upstream call
//! - **Bounded concurrency**: at most N upstream calls at a time, admitted FIFO
//! - **Load shedding**: a bounded admission queue rejects fetches when full
//! - **Production Ready**: health endpoint, structured logging, TLS, graceful shutdown

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cache;
pub mod cli;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod lookup;
pub mod proxy;
pub mod upstream;

pub use error::{Error, FetchError, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => subscriber
            .with(fmt::layer().json())
            .try_init()
            .map_err(|e| Error::Internal(format!("Failed to install subscriber: {e}"))),
        _ => subscriber
            .with(fmt::layer())
            .try_init()
            .map_err(|e| Error::Internal(format!("Failed to install subscriber: {e}"))),
    }
}
