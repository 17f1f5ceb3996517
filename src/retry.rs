pub(crate) const MAX_ATTEMPTS: u32 = 3;
pub(crate) const RETRY_DELAY_SECS: u64 = 3;

/// Await `$operation` up to `MAX_ATTEMPTS` times with a fixed delay. The
/// operation expression is re-evaluated for every attempt.
macro_rules! retry_db_operation {
    ($context:expr, $operation:expr) => {{
        let context_value: String = $context.into();
        let mut attempt = 1;

        loop {
            match ($operation).await {
                Ok(value) => break Ok(value),
                Err(err) if attempt >= $crate::retry::MAX_ATTEMPTS => {
                    break Err(anyhow::Error::from(err)
                        .context(format!("{} failed after {} attempts", context_value, attempt)))
                }
                Err(err) => {
                    log::warn!(
                        "Attempt {}/{} for {} failed: {}. Retrying in {}s.",
                        attempt,
                        $crate::retry::MAX_ATTEMPTS,
                        context_value,
                        err,
                        $crate::retry::RETRY_DELAY_SECS
                    );
                    tokio::time::sleep(std::time::Duration::from_secs(
                        $crate::retry::RETRY_DELAY_SECS,
                    ))
                    .await;
                    attempt += 1;
                }
            }
        }
    }};
}

pub(crate) use retry_db_operation;

#[cfg(test)]
mod tests {
    use anyhow::{anyhow, Result};
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_success() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let attempt = move || async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(anyhow!("connection reset"))
            } else {
                Ok(7)
            }
        };
        let result: Result<i32> = retry_db_operation!("loading bars", attempt());
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let attempt = move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(anyhow!("connection reset"))
        };
        let result: Result<()> = retry_db_operation!("appending trial", attempt());
        let err = result.unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), super::MAX_ATTEMPTS);
        assert!(format!("{:#}", err).contains("appending trial failed after 3 attempts"));
    }
}
