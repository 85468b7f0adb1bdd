//! Agent bearer credentials
//!
//! A bearer is handed to the agent once at registration; only its SHA-256
//! (hex) is stored.

use sha2::{Digest, Sha256};
use uuid::Uuid;

const BEARER_PREFIX: &str = "csa_";

/// Fresh random bearer credential
pub fn generate_bearer() -> String {
    format!(
        "{BEARER_PREFIX}{}{}",
        Uuid::new_v4().simple(),
        Uuid::new_v4().simple()
    )
}

/// Hex SHA-256 of a bearer, as stored on the registration
pub fn hash_bearer(bearer: &str) -> String {
    format!("{:x}", Sha256::digest(bearer.as_bytes()))
}
