//! calsync Relay - Remote agent channel
//!
//! Sources that sit in networks the service cannot reach are synced through
//! a forwarding agent. The agent pushes normalized events; this crate
//! authenticates the push, persists accepted events in a bounded per-source
//! inbox kept by the state store and exposes them to the sync controller as an
//! [`IEventFeed`](calsync_core::ports::IEventFeed).
//!
//! ## Modules
//!
//! - [`channel`] - `AgentChannel`: registration, `push`, `heartbeat`,
//!   `agent_health`
//! - [`feed`] - `RelayFeed`, the controller-facing feed
//! - [`inbox`] - sequenced, durable batches and relay cursors
//! - [`credential`] - bearer generation and hashing

pub mod channel;
pub mod credential;
pub mod error;
pub mod feed;
pub mod inbox;
pub mod types;

pub use channel::AgentChannel;
pub use error::RelayError;
pub use feed::RelayFeed;
pub use types::{AgentAck, AgentBatch, AgentHealth, RejectedEvent};
