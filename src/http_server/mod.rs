//! # HTTP Server Module
//!
//! Thin routing over the subsystems. Handlers validate input, apply rate
//! limits and call straight into the services.
//!
//! # Endpoints
//!
//! - `/health` - Health check
//! - `/events/*` - Push stream, poll and publish
//! - `/queue/*` - Queue API
//! - `/pubsub/*` - Broker publish, history and analytics
//! - `/monitor/*` - Gateway metrics

pub mod config;
pub mod error;
pub mod event_routes;
pub mod monitor_routes;
pub mod pubsub_routes;
pub mod queue_routes;
pub mod server;

pub use config::HttpServerConfig;
pub use error::{ApiError, ApiResult, ErrorResponse};
pub use server::HttpServer;
