//! HTTP surface of the ShopStream media engine: the WebSocket signaling
//! endpoint, stream-lifecycle routes for the application layer, and the
//! Prometheus metrics exposition.

pub mod http;
pub mod signaling;

pub use http::{create_router, AppState};
