//! Port definitions (hexagonal architecture interfaces)
//!
//! Ports are the traits the controller depends on; their implementations
//! live in adapter crates (`calsync-cache`, `calsync-relay`) or outside the
//! workspace (provider adapters, credential backends).
//!
//! ## Ports Overview
//!
//! - [`IProviderAdapter`] - fetch and write events for one provider family
//! - [`ICredentialProvider`] - resolve and refresh opaque credentials
//! - [`IEventFeed`] - batches pushed by remote agents
//! - [`ISyncStateStore`] - configuration, tokens, agents and dedup index

pub mod credentials;
pub mod event_feed;
pub mod provider;
pub mod state_store;

pub use credentials::{Credential, CredentialError, ICredentialProvider};
pub use event_feed::IEventFeed;
pub use provider::{FetchPage, FetchRequest, IProviderAdapter, ProviderError, ProviderRegistry};
pub use state_store::{dedup_event_id, ISyncStateStore};
