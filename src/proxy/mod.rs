//! HTTP surface of the certificate proxy

pub mod frontend;
mod router;
mod server;

pub use router::{AppState, SharedState, create_router};
pub use server::Proxy;
