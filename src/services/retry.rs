//! Fixed-interval retry for mutating remote calls.

use std::{fmt::Display, future::Future, time::Duration};
use tracing::warn;

/// Maximum number of attempts for a put or delete.
pub const MAX_ATTEMPTS: u32 = 10;
/// Pause between attempts.
pub const RETRY_BACKOFF: Duration = Duration::from_millis(1000);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: MAX_ATTEMPTS,
            backoff: RETRY_BACKOFF,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts,
            backoff,
        }
    }

    /// Run `operation` until it succeeds or `max_attempts` attempts have been
    /// made, sleeping `backoff` between attempts. The last error is returned
    /// unchanged. At least one attempt is always made.
    pub async fn retry<T, E, F, Fut>(&self, mut operation: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(err) if attempt >= max_attempts => return Err(err),
                Err(err) => {
                    warn!(
                        "attempt {}/{} failed: {}; retrying in {:?}",
                        attempt, max_attempts, err, self.backoff
                    );
                    tokio::time::sleep(self.backoff).await;
                    attempt += 1;
                }
            }
        }
    }
}
