//! Retry utilities: backoff builders and retryable error classification.
//!
//! Uses `backon` for exponential backoff with jitter.

use std::time::Duration;

use backon::ExponentialBuilder;

use crate::bus::BusError;

/// Total attempts allowed by [`subscription_creation_backoff`].
pub const SUBSCRIPTION_CREATION_ATTEMPTS: u32 = 2;

/// Backoff for ephemeral subscription creation.
///
/// Creation races are expected to be rare and to resolve on a second
/// attempt, so the bound is tight.
///
/// - Min delay: 200ms
/// - Max delay: 2s
/// - Max attempts: [`SUBSCRIPTION_CREATION_ATTEMPTS`]
/// - Jitter enabled
pub fn subscription_creation_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(200))
        .with_max_delay(Duration::from_secs(2))
        .with_max_times(SUBSCRIPTION_CREATION_ATTEMPTS as usize - 1)
        .with_jitter()
}

/// Determines if a transport error may succeed on retry.
///
/// Retryable:
/// - `Transient`: throttling, timeouts, dropped connections
/// - `EntityAlreadyExists`: a name claimed by a concurrent creator
///
/// Everything else reflects state a retry cannot change.
pub fn is_retryable_bus_error(error: &BusError) -> bool {
    matches!(
        error,
        BusError::Transient(_) | BusError::EntityAlreadyExists(_)
    )
}
