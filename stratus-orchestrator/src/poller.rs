use crate::settings::PollSettings;
use anyhow::Result;
use std::future::Future;
use std::time::Duration;
use stratus_common::CpiError;
use tokio::time::{sleep, Instant};

/// Fixed-interval, deadline-bounded wait.
///
/// The predicate runs immediately and then once per `interval` until it
/// yields a value. An `Err` from the predicate aborts the wait at once. When
/// the deadline passes without a value the wait fails with
/// [`CpiError::Timeout`] naming the condition.
#[derive(Debug, Clone, Copy)]
pub struct Poller {
    timeout: Duration,
    interval: Duration,
}

impl From<PollSettings> for Poller {
    fn from(p: PollSettings) -> Self {
        Self::new(p.timeout, p.interval)
    }
}

impl Poller {
    pub fn new(timeout: Duration, interval: Duration) -> Self {
        Self { timeout, interval }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub async fn poll<T, F, Fut>(&self, condition: &str, mut attempt: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Option<T>>>,
    {
        let started = Instant::now();
        let mut tries: u32 = 0;
        loop {
            tries += 1;
            if let Some(value) = attempt().await? {
                if tries > 1 {
                    tracing::debug!(condition, attempts = tries, "condition reached");
                }
                return Ok(value);
            }
            let waited = started.elapsed();
            if waited >= self.timeout {
                tracing::warn!(condition, attempts = tries, ?waited, "gave up waiting");
                return Err(CpiError::Timeout {
                    condition: condition.to_string(),
                    waited,
                }
                .into());
            }
            sleep(self.interval).await;
        }
    }

    pub async fn wait_until<F, Fut>(&self, condition: &str, mut predicate: F) -> Result<()>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<bool>>,
    {
        self.poll(condition, || {
            let fut = predicate();
            async move { Ok(fut.await?.then_some(())) }
        })
        .await
    }
}
