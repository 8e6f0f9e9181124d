//! # Client Coordination
//!
//! Building blocks for an event-consuming client:
//! - [`ConnectionManager`]: push/pull state machine with backoff
//! - [`SingleFlight`], [`SequentialExecutor`], [`Debouncer`]: keyed
//!   operation coordination
//! - [`Poller`] and [`HybridClient`]: the receiving side of both transports
//!
//! Every protected operation runs under a [`CancellationToken`] and fails
//! with [`ClientError::Cancelled`] when it fires first.

mod cancel;
mod debounce;
mod errors;
mod hybrid;
mod local;
mod poller;
mod reconnect;
mod sequential;
mod single_flight;

pub use cancel::{cancellable, CancellationToken};
pub use debounce::Debouncer;
pub use errors::{ClientError, ClientResult};
pub use hybrid::{HybridClient, HybridConfig, PushTransport};
pub use local::{GatewayPollTransport, GatewayPushTransport};
pub use poller::{PollTransport, Poller};
pub use reconnect::{ConnectionManager, ConnectionMethod, ReconnectDecision, ReconnectPolicy};
pub use sequential::SequentialExecutor;
pub use single_flight::SingleFlight;
