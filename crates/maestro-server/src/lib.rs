//! HTTP/WebSocket surface for the maestro control plane.

pub mod api_errors;
pub mod api_models;
pub mod config;
pub mod handlers;
pub mod middleware;
pub mod secrets;
pub mod state;
pub mod ws;

pub use config::Config;
pub use handlers::build_router;
pub use state::AppState;
