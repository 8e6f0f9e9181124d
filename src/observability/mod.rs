//! Observability
//!
//! Structured logging through `tracing`. Gateway metrics live in
//! [`crate::gateway::ConnectionMonitor`] and broker counters in
//! [`crate::pubsub::Analytics`].

mod logger;

pub use logger::init_logging;
