//! Reconnect and timeout utilities.
//!
//! The helpers in this module are transport-agnostic and are used by the
//! realtime connection worker to pace reconnect attempts and to bound the
//! connect and handshake waits.

use std::future::Future;
use std::time::Duration;

use tracing::debug;

/// Delay applied between reconnect attempts unless configured otherwise.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(1);
/// Reconnect attempts allowed after a drop unless configured otherwise.
pub const DEFAULT_RECONNECT_RETRIES: u32 = 10;

/// Policy controlling whether and how often a dropped connection is retried.
///
/// The delay is fixed: every attempt waits the same amount of time. The retry
/// counter is owned by the caller and must be reset after each successful
/// open.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconnectPolicy {
    /// Never reconnect; the first failure is terminal.
    Disabled,
    /// Reconnect after `delay`, at most `retries` consecutive times.
    Fixed {
        /// Wait before each reconnect attempt.
        delay: Duration,
        /// Maximum consecutive attempts without a successful open.
        retries: u32,
    },
}

impl ReconnectPolicy {
    /// Builds a fixed-delay policy.
    pub fn fixed(delay: Duration, retries: u32) -> Self {
        Self::Fixed { delay, retries }
    }

    /// Returns the delay to wait before the next attempt, if another attempt
    /// is allowed after `retries_used` consecutive failures.
    pub fn next_delay(&self, retries_used: u32) -> Option<Duration> {
        match *self {
            Self::Disabled => None,
            Self::Fixed { delay, retries } => {
                let allowed = retries_used < retries;
                debug!(
                    event = "reconnect_budget_checked",
                    retries_used,
                    retries,
                    allowed
                );
                allowed.then_some(delay)
            }
        }
    }

    /// Returns `true` when the policy may ever reconnect.
    pub fn is_enabled(&self) -> bool {
        !matches!(self, Self::Disabled | Self::Fixed { retries: 0, .. })
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::fixed(DEFAULT_RECONNECT_DELAY, DEFAULT_RECONNECT_RETRIES)
    }
}

/// Applies a timeout to an async computation.
pub async fn with_timeout<T, Fut>(
    timeout: Duration,
    future: Fut,
) -> Result<T, tokio::time::error::Elapsed>
where
    Fut: Future<Output = T>,
{
    tokio::time::timeout(timeout, future).await
}
