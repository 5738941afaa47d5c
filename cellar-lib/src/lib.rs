//! Daemon wiring for cellar: configuration, the shared context and the REST
//! surface over the lifecycle core.

pub mod api_routes;
pub mod api_server;
pub mod config;
pub mod context;

pub use api_server::{build_router, serve, ApiError, ApiState};
pub use config::{ConfigError, DaemonConfig};
pub use context::{CellarContext, DaemonError};
