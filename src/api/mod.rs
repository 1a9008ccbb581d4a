//! HTTP and WebSocket surface of the crash engine

pub mod errors;
pub mod handlers;
pub mod middleware;
pub mod routes;
pub mod server;
pub mod websocket;

pub use handlers::AppState;
pub use server::{build_app, ApiServer};
