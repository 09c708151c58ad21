use std::time::Duration;

use rand::Rng;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::FetchError;
use crate::metrics::UPSTREAM_RETRIES;
use crate::range::ByteRange;
use crate::remote::{ByteStream, RemoteFile, TransferMode};

#[derive(Debug, Clone, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_jitter_max_ms")]
    pub jitter_max_ms: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_jitter_max_ms() -> u64 {
    400
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            jitter_max_ms: default_jitter_max_ms(),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt + 1`: `base * 2^attempt + jitter_ms`.
    pub fn delay_for(&self, attempt: u32, jitter_ms: u64) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let backoff = self.base_delay_ms.saturating_mul(factor);
        Duration::from_millis(backoff.saturating_add(jitter_ms.min(self.jitter_max_ms)))
    }

    fn jittered_delay(&self, attempt: u32) -> Duration {
        let jitter = rand::thread_rng().gen_range(0..=self.jitter_max_ms);
        self.delay_for(attempt, jitter)
    }
}

/// Opens upstream byte streams, retrying transient failures with jittered backoff.
///
/// Holds no per-request state, so one instance serves every request.
#[derive(Debug, Clone, Default)]
pub struct ResilientFetcher {
    policy: RetryPolicy,
}

impl ResilientFetcher {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Open `range` of `file`, giving up early once `cancel` fires.
    ///
    /// No attempt is started after cancellation has been observed, and a
    /// pending backoff sleep is interrupted immediately.
    pub async fn open(
        &self,
        file: &dyn RemoteFile,
        range: Option<ByteRange>,
        cancel: &CancellationToken,
    ) -> Result<ByteStream, FetchError> {
        let mut attempt: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(FetchError::Cancelled);
            }

            let mode = if attempt > 0 {
                TransferMode::Conservative
            } else {
                TransferMode::Normal
            };

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                res = file.open_range(range, mode) => res,
            };

            let err = match result {
                Ok(stream) => {
                    if cancel.is_cancelled() {
                        return Err(FetchError::Cancelled);
                    }
                    if attempt > 0 {
                        debug!("Upstream open recovered: id={} attempts={}", file.id(), attempt + 1);
                    }
                    return Ok(stream);
                }
                Err(err) => err,
            };

            if !err.kind.is_retryable() || attempt >= self.policy.max_retries {
                return Err(FetchError::Upstream {
                    attempts: attempt + 1,
                    source: err,
                });
            }

            let delay = self.policy.jittered_delay(attempt);
            attempt += 1;
            UPSTREAM_RETRIES.with_label_values(&[err.kind.as_str()]).inc();
            warn!(
                "Upstream retry #{} in {}ms: id={} reason={}",
                attempt,
                delay.as_millis(),
                file.id(),
                err
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
