//! Use cases (interactors) for calsync
//!
//! Thin coordinators between domain entities and ports.
//!
//! ## Use Cases
//!
//! - [`AuthorizeUseCase`] - credential resolution, refresh and auth state
//! - [`ConfigureUseCase`] - validated configuration edits

pub mod authorize;
pub mod configure;

pub use authorize::AuthorizeUseCase;
pub use configure::ConfigureUseCase;
