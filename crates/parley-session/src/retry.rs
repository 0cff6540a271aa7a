//! Bounded retry for startup-time restore calls.
//!
//! Only restoring the persisted session reference is retried. Streams and
//! chat commands are never repeated automatically.

use std::future::Future;
use std::time::Duration;

use log::{debug, warn};
use parley_protocol::SubjectSessionResponse;

use crate::client::{ClientError, GatewayClient};

/// Attempts made by [`restore_session_reference`].
pub const RESTORE_ATTEMPTS: u32 = 3;

const RESTORE_BACKOFF: Duration = Duration::from_millis(200);

/// Run `op` up to `attempts` times, sleeping `base_delay * attempt` between
/// tries. Errors for which `retryable` is false are returned immediately.
pub async fn retry_with_backoff<T, E, F, Fut, R>(
    attempts: u32,
    base_delay: Duration,
    retryable: R,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < attempts && retryable(&err) => {
                let backoff = base_delay * attempt;
                debug!(
                    "attempt {}/{} failed: {}; retrying in {:?}",
                    attempt, attempts, err, backoff
                );
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
            Err(err) => {
                if attempt > 1 {
                    warn!("giving up after {} attempts: {}", attempt, err);
                }
                return Err(err);
            }
        }
    }
}

/// Look up the session persisted for `subject_id`, retrying transient
/// failures.
pub async fn restore_session_reference(
    client: &GatewayClient,
    subject_id: &str,
) -> Result<Option<SubjectSessionResponse>, ClientError> {
    retry_with_backoff(
        RESTORE_ATTEMPTS,
        RESTORE_BACKOFF,
        ClientError::is_transient,
        || client.subject_session(subject_id),
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug)]
    struct Flaky(bool);

    impl std::fmt::Display for Flaky {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "flaky (retryable: {})", self.0)
        }
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, Flaky> = retry_with_backoff(
            3,
            Duration::from_millis(1),
            |e: &Flaky| e.0,
            || async {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 { Err(Flaky(true)) } else { Ok(n) }
            },
        )
        .await;
        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_stops_after_attempt_limit() {
        let calls = AtomicU32::new(0);
        let result: Result<(), Flaky> = retry_with_backoff(
            3,
            Duration::from_millis(1),
            |e: &Flaky| e.0,
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Flaky(true))
            },
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_is_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), Flaky> = retry_with_backoff(
            3,
            Duration::from_millis(1),
            |e: &Flaky| e.0,
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Flaky(false))
            },
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
