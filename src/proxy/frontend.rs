//! Static frontend and error pages

use std::path::Path;

use axum::{
    Json,
    extract::{RawQuery, State},
    http::{HeaderMap, Method, StatusCode, header},
    response::{Html, IntoResponse, Redirect, Response},
};
use serde_json::json;
use tracing::warn;

use super::router::SharedState;

/// Where the frontend is sent when `index.html` cannot be read
const FRONTEND_ERROR_REDIRECT: &str = "/error.html?msg=Failed+to+load+frontend";

/// GET / - serve `index.html` with the requested control number injected
pub async fn index_handler(
    State(state): State<SharedState>,
    RawQuery(query): RawQuery,
) -> Response {
    let control_id = control_id_from_query(query.as_deref());
    let path = state.frontend.static_dir.join("index.html");
    match tokio::fs::read_to_string(&path).await {
        Ok(html) => Html(inject_control_id(&html, &control_id)).into_response(),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to load frontend");
            Redirect::to(FRONTEND_ERROR_REDIRECT).into_response()
        }
    }
}

/// First `id` parameter of the query string, empty when absent.
///
/// Never fails: repeated or malformed parameters still serve the page.
fn control_id_from_query(query: Option<&str>) -> String {
    query
        .and_then(|q| {
            url::form_urlencoded::parse(q.as_bytes())
                .find(|(key, _)| key == "id")
                .map(|(_, value)| value.into_owned())
        })
        .unwrap_or_default()
}

/// Insert `window.INIT_CONTROL_ID` before the closing body tag.
///
/// The id is written as a JSON string literal with `<`, `>` and `&` escaped,
/// so a crafted id cannot close the script element.
pub fn inject_control_id(html: &str, control_id: &str) -> String {
    let literal = serde_json::to_string(control_id)
        .unwrap_or_else(|_| "\"\"".to_string())
        .replace('<', "\\u003c")
        .replace('>', "\\u003e")
        .replace('&', "\\u0026");
    let script = format!("<script>window.INIT_CONTROL_ID = {literal};</script></body>");
    html.replacen("</body>", &script, 1)
}

/// Response for requests no route matched
///
/// `GET`/`HEAD` get a 404 (the `404.html` page when available), any other
/// method gets a 405.
pub async fn not_found(static_dir: Option<&Path>, method: &Method) -> Response {
    if method != Method::GET && method != Method::HEAD {
        return method_not_allowed().await;
    }

    if let Some(page) = read_page(static_dir, "404.html").await {
        return (StatusCode::NOT_FOUND, Html(page)).into_response();
    }
    (StatusCode::NOT_FOUND, Json(json!({"error": "Not found"}))).into_response()
}

/// 405 for routes that exist but not for this method
pub async fn method_not_allowed() -> Response {
    (
        StatusCode::METHOD_NOT_ALLOWED,
        Json(json!({"error": "Method not allowed"})),
    )
        .into_response()
}

/// Generic failure response
///
/// Clients that accept HTML get `500.html` when it exists; everyone else
/// gets a JSON body. No error detail is exposed either way.
pub async fn server_error(static_dir: Option<&Path>, headers: &HeaderMap) -> Response {
    if accepts_html(headers) {
        if let Some(page) = read_page(static_dir, "500.html").await {
            return (StatusCode::INTERNAL_SERVER_ERROR, Html(page)).into_response();
        }
    }
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"error": "Unexpected server error"})),
    )
        .into_response()
}

/// Whether the `Accept` header admits `text/html`.
///
/// A missing or empty header accepts anything. Ranges `text/html`, `text/*`
/// and `*/*` count unless their `q` is zero.
fn accepts_html(headers: &HeaderMap) -> bool {
    let Some(accept) = headers.get(header::ACCEPT) else {
        return true;
    };
    let Ok(accept) = accept.to_str() else {
        return false;
    };
    if accept.trim().is_empty() {
        return true;
    }

    accept.split(',').any(|range| {
        let mut params = range.split(';');
        let media_type = params.next().unwrap_or_default().trim();
        let quality = params
            .find_map(|p| p.trim().strip_prefix("q="))
            .map_or(Some(1.0), |q| q.trim().parse::<f32>().ok());

        quality.is_some_and(|q| q > 0.0)
            && ["text/html", "text/*", "*/*"]
                .iter()
                .any(|html| media_type.eq_ignore_ascii_case(html))
    })
}

async fn read_page(static_dir: Option<&Path>, name: &str) -> Option<String> {
    let dir = static_dir?;
    tokio::fs::read_to_string(dir.join(name)).await.ok()
}
