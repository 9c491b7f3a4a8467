//! Proxy server

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{info, warn};

use super::router::{AppState, create_router};
use crate::config::{Config, TlsConfig};
use crate::lookup::CertificateService;
use crate::{Error, Result};

/// Certificate lookup proxy server
pub struct Proxy {
    /// Configuration
    config: Config,
    /// Cache + fetch coordinator
    service: Arc<CertificateService>,
}

impl Proxy {
    /// Create a new proxy.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(config: Config) -> Result<Self> {
        let service = Arc::new(CertificateService::from_config(&config)?);
        Ok(Self { config, service })
    }

    /// The router serving this proxy's routes
    pub fn router(&self) -> Router {
        create_router(Arc::new(AppState {
            service: Arc::clone(&self.service),
            frontend: self.config.frontend.clone(),
        }))
    }

    /// Run until Ctrl+C / SIGTERM
    pub async fn run(self) -> Result<()> {
        let server = &self.config.server;
        let addr = SocketAddr::new(
            server
                .host
                .parse()
                .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
            server.port,
        );
        let app = self.router();
        let scheme = if server.tls.is_some() { "https" } else { "http" };

        info!("============================================================");
        info!("CERT PROXY v{}", env!("CARGO_PKG_VERSION"));
        info!("============================================================");
        info!(host = %server.host, port = server.port, scheme, "Listening");
        info!(
            concurrency = self.config.coordinator.concurrency,
            queue_limit = self.config.coordinator.queue_limit,
            cache_entries = self.config.cache.max_entries,
            cache_ttl_secs = self.config.cache.ttl.as_secs(),
            "Fetch pipeline"
        );
        info!("  GET {scheme}://{}:{}/api/certificate/{{controlNumber}}", server.host, server.port);
        if self.config.frontend.enabled {
            info!(static_dir = %self.config.frontend.static_dir.display(), "Frontend enabled");
        }
        if self.config.upstream.secret.is_empty() {
            warn!("Upstream secret is empty");
        }
        info!("============================================================");

        match &server.tls {
            Some(tls) => serve_tls(addr, tls, app, server.shutdown_timeout).await,
            None => serve_plain(addr, app).await,
        }?;

        info!("Proxy stopped");
        Ok(())
    }
}

async fn serve_plain(addr: SocketAddr, app: Router) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| Error::Internal(e.to_string()))
}

async fn serve_tls(
    addr: SocketAddr,
    tls: &TlsConfig,
    app: Router,
    shutdown_timeout: Duration,
) -> Result<()> {
    // Fails only when a provider is already installed, which is fine
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let rustls_config = RustlsConfig::from_pem_file(&tls.cert_path, &tls.key_path)
        .await
        .map_err(|e| {
            Error::Config(format!(
                "Failed to load TLS certificate {} / key {}: {e}",
                tls.cert_path.display(),
                tls.key_path.display()
            ))
        })?;

    let handle = axum_server::Handle::new();
    let shutdown_handle = handle.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        shutdown_handle.graceful_shutdown(Some(shutdown_timeout));
    });

    axum_server::bind_rustls(addr, rustls_config)
        .handle(handle)
        .serve(app.into_make_service())
        .await?;
    Ok(())
}

/// Shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
}
