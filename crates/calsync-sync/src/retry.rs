//! In-pass retry for provider calls
//!
//! Transient and rate-limited failures are retried with exponential backoff
//! (`retry.base_delay_ms * 2^(attempt-1)`, capped at `retry.max_delay_ms`).
//! A provider's `retry_after` hint replaces the computed delay, subject to
//! the same cap. Every other failure is returned immediately.

use std::future::Future;

use calsync_core::config::RetryConfig;
use calsync_core::ports::ProviderError;
use tracing::{info, warn};

/// Runs `f` until it succeeds, fails permanently, or `max_attempts` calls
/// have been made
pub async fn with_retry<F, Fut, T>(
    operation: &str,
    config: &RetryConfig,
    mut f: F,
) -> Result<T, ProviderError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match f().await {
            Ok(value) => {
                if attempt > 1 {
                    info!(operation, attempt, "Operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) if err.is_transient() && attempt < max_attempts => {
                let delay = match &err {
                    ProviderError::RateLimited {
                        retry_after: Some(hint),
                    } => config.clamp(*hint),
                    _ => config.delay_for(attempt),
                };
                warn!(
                    operation,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Transient provider error, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
