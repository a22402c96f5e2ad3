//! Bounded, cancellable waits
//!
//! Waiting for a member to come ONLINE, for a replica to apply a set of
//! transactions or for a channel to report healthy all go through
//! [`poll_until`]. The wait always ends: with the value, with
//! [`TopologyError::Timeout`], or with [`TopologyError::Cancelled`].

use crate::error::{Result, TopologyError};
use std::future::Future;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    pub timeout: Duration,
    pub interval: Duration,
}

impl PollSettings {
    pub fn new(timeout: Duration, interval: Duration) -> Self {
        Self { timeout, interval }
    }
}

/// Run `check` until it yields a value, the timeout expires or `cancel` fires.
///
/// The first check runs immediately. A check returning `Err` aborts the wait
/// with that error.
pub async fn poll_until<T, F, Fut>(
    what: &str,
    settings: PollSettings,
    cancel: &CancellationToken,
    mut check: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    let start = Instant::now();

    loop {
        if cancel.is_cancelled() {
            return Err(TopologyError::Cancelled(what.to_string()));
        }

        if let Some(value) = check().await? {
            return Ok(value);
        }

        let elapsed = start.elapsed();
        if elapsed >= settings.timeout {
            tracing::debug!("Gave up waiting for {} after {:?}", what, elapsed);
            return Err(TopologyError::Timeout {
                what: what.to_string(),
                elapsed,
            });
        }

        let nap = settings.interval.min(settings.timeout - elapsed);
        tokio::select! {
            _ = cancel.cancelled() => {
                return Err(TopologyError::Cancelled(what.to_string()));
            }
            _ = tokio::time::sleep(nap) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn settings(timeout_ms: u64) -> PollSettings {
        PollSettings::new(Duration::from_millis(timeout_ms), Duration::from_millis(5))
    }

    #[tokio::test]
    async fn test_returns_first_value() {
        let calls = AtomicU32::new(0);
        let calls_ref = &calls;
        let token = CancellationToken::new();

        let value = poll_until("counter", settings(1_000), &token, move || async move {
            let n = calls_ref.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(if n >= 3 { Some(n) } else { None })
        })
        .await
        .unwrap();

        assert_eq!(value, 3);
    }

    #[tokio::test]
    async fn test_times_out() {
        let token = CancellationToken::new();
        let err = poll_until("nothing", settings(30), &token, || async { Ok::<Option<()>, _>(None) })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(err.to_string().contains("nothing"));
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_wait() {
        let token = CancellationToken::new();
        let child = token.child_token();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            token.cancel();
        });

        let err = poll_until("forever", settings(60_000), &child, || async { Ok::<Option<()>, _>(None) })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
    }

    #[tokio::test]
    async fn test_check_error_aborts() {
        let token = CancellationToken::new();
        let err = poll_until("broken", settings(1_000), &token, || async {
            Err::<Option<()>, _>(TopologyError::Quorum("lost".to_string()))
        })
        .await
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Quorum);
    }
}
