//! eventgate - at-least-once event delivery
//!
//! A visibility-timeout queue, a pub/sub broker with retries and dead
//! letters, and a gateway pushing events to browser clients with a polling
//! fallback, all coordinated through one shared store.

pub mod cli;
pub mod client;
pub mod clock;
pub mod gateway;
pub mod http_server;
pub mod observability;
pub mod pubsub;
pub mod queue;
pub mod store;
pub mod subsystems;
