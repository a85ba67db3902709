use tokio::time::sleep;
use tracing::trace;

use crate::timing::Backoff;

/// Evaluate `check` until it yields a value or the retry budget runs out.
///
/// Best-effort readiness wait: `1 + max_retries` evaluations with the
/// backoff delays in between, returning the last (empty) result on failure.
pub async fn wait_for<T>(backoff: &Backoff, mut check: impl FnMut() -> Option<T>) -> Option<T> {
    let mut attempt = 0;
    loop {
        if let Some(value) = check() {
            trace!(attempt, "ready");
            return Some(value);
        }
        if attempt >= backoff.max_retries {
            trace!(attempt, "gave up waiting");
            return None;
        }
        sleep(backoff.delay(attempt)).await;
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn returns_immediately_when_ready() {
        let start = Instant::now();
        assert_eq!(wait_for(&Backoff::default(), || Some(1)).await, Some(1));
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_six_evaluations() {
        let start = Instant::now();
        let mut evaluations = 0;
        let result: Option<()> = wait_for(&Backoff::default(), || {
            evaluations += 1;
            None
        })
        .await;
        assert_eq!(result, None);
        assert_eq!(evaluations, 6);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(3100), "{:?}", elapsed);
        assert!(elapsed < Duration::from_millis(3200), "{:?}", elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_on_later_attempt() {
        let mut evaluations = 0;
        let result = wait_for(&Backoff::default(), || {
            evaluations += 1;
            (evaluations == 3).then_some("ready")
        })
        .await;
        assert_eq!(result, Some("ready"));
        assert_eq!(evaluations, 3);
    }
}
