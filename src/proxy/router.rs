//! HTTP router and handlers

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    handler::HandlerWithoutStateExt,
    http::{HeaderMap, HeaderValue, Method, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use serde_json::json;
use tower_http::{catch_panic::CatchPanicLayer, services::ServeDir, trace::TraceLayer};
use tracing::{error, warn};

use super::frontend;
use crate::config::FrontendConfig;
use crate::error::FetchError;
use crate::lookup::CertificateService;
use crate::Error;

/// Shared application state
pub struct AppState {
    /// Cache + fetch coordinator
    pub service: Arc<CertificateService>,
    /// Static frontend configuration
    pub frontend: FrontendConfig,
}

impl AppState {
    /// Directory error pages are read from, if the frontend is enabled
    fn static_dir(&self) -> Option<&std::path::Path> {
        self.frontend
            .enabled
            .then_some(self.frontend.static_dir.as_path())
    }
}

/// State handle passed to every handler
pub type SharedState = Arc<AppState>;

/// Create the router
pub fn create_router(state: SharedState) -> Router {
    let router = Router::new()
        .route("/health", get(health_handler))
        .route("/api/certificate", get(missing_control_number_handler))
        .route("/api/certificate/", get(missing_control_number_handler))
        .route("/api/certificate/{control_number}", get(certificate_handler))
        .method_not_allowed_fallback(frontend::method_not_allowed);

    let router = if state.frontend.enabled {
        let static_dir = state.frontend.static_dir.clone();
        let fallback = {
            let static_dir = static_dir.clone();
            move |method: Method| {
                let static_dir = static_dir.clone();
                async move { frontend::not_found(Some(static_dir.as_path()), &method).await }
            }
        };
        let assets = ServeDir::new(&static_dir)
            .call_fallback_on_method_not_allowed(true)
            .fallback(fallback.into_service());

        router
            .route("/", get(frontend::index_handler))
            .fallback_service(assets)
    } else {
        router.fallback(|method: Method| async move { frontend::not_found(None, &method).await })
    };

    router
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// GET /api/certificate/{control_number}
async fn certificate_handler(
    State(state): State<SharedState>,
    Path(control_number): Path<String>,
    headers: HeaderMap,
) -> Response {
    match state.service.lookup(&control_number).await {
        Ok(record) => Json(record).into_response(),
        Err(e) => lookup_error_response(&state, &headers, &control_number, &e).await,
    }
}

/// GET /api/certificate with no control number
async fn missing_control_number_handler() -> Response {
    validation_error("Control number required")
}

/// Map a lookup failure to an HTTP response
async fn lookup_error_response(
    state: &AppState,
    headers: &HeaderMap,
    control_number: &str,
    err: &Error,
) -> Response {
    match err {
        Error::Validation(message) => validation_error(message),
        Error::Fetch(FetchError::Overloaded(pending)) => {
            warn!(control_number, pending, "Lookup rejected, fetch queue full");
            let mut response = (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({"error": "Service busy, retry shortly"})),
            )
                .into_response();
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from_static("1"));
            response
        }
        Error::Fetch(fetch) if fetch.is_upstream_failure() => {
            warn!(control_number, error = %fetch, "Certificate lookup failed upstream");
            frontend::server_error(state.static_dir(), headers).await
        }
        _ => {
            error!(control_number, error = %err, "Certificate fetch error");
            frontend::server_error(state.static_dir(), headers).await
        }
    }
}

fn validation_error(message: &str) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({"error": message}))).into_response()
}

/// Health check handler
async fn health_handler(State(state): State<SharedState>) -> impl IntoResponse {
    let stats = state.service.stats();
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "cache": stats.cache,
        "coordinator": stats.coordinator,
    }))
}
