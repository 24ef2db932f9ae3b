//! Bounded retry for transient store errors.
//!
//! Exponential backoff with jitter, capped at three attempts. Anything that
//! still fails after that propagates; only `Error::Transient` is retried.

use std::future::Future;
use std::time::Duration;

use crate::error::Result;

/// Maximum attempts, including the first.
pub const MAX_ATTEMPTS: u32 = 3;

/// Base backoff before the first retry.
const BACKOFF_BASE: Duration = Duration::from_millis(100);

/// Backoff cap.
const BACKOFF_MAX: Duration = Duration::from_secs(2);

/// Runs `op`, retrying transient failures with exponential backoff.
///
/// # Errors
///
/// Returns the last error once attempts are exhausted, or immediately for
/// non-transient errors.
pub async fn retry_transient<T, F, Fut>(op_name: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut backoff = BACKOFF_BASE;

    for attempt in 1..=MAX_ATTEMPTS {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < MAX_ATTEMPTS => {
                let delay = backoff.min(BACKOFF_MAX) + Duration::from_millis(rand_jitter());
                tracing::warn!(
                    op = op_name,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "transient store error, backing off"
                );
                tokio::time::sleep(delay).await;
                backoff = backoff.saturating_mul(2);
            }
            Err(e) => return Err(e),
        }
    }

    unreachable!("loop either returns a value or an error")
}

/// Random jitter for backoff (0-50ms) without a full RNG dependency.
fn rand_jitter() -> u64 {
    use std::time::SystemTime;
    let seed = u64::from(
        SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .subsec_nanos(),
    );
    seed % 50
}
