use super::analyzer::{Analyzer, AnalyzerError, Completion, CompletionRequest};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Bounded retries around one analyzer call.
///
/// Recoverable failures wait `base_delay` between attempts; rate-limited
/// attempts wait `base_delay * 2^(attempt-1)`. Fatal failures return at once.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn delay_for(&self, attempt: u32, error: &AnalyzerError) -> Duration {
        match error {
            AnalyzerError::RateLimited(_) => {
                let exp = attempt.saturating_sub(1).min(16);
                self.base_delay.saturating_mul(1 << exp)
            }
            _ => self.base_delay,
        }
    }

    pub async fn call(
        &self,
        analyzer: &dyn Analyzer,
        request: &CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<Completion, AnalyzerError> {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            let result = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(AnalyzerError::Cancelled),
                r = analyzer.complete(request.clone()) => r,
            };
            let err = match result {
                Ok(done) => return Ok(done),
                Err(e) if e.is_fatal() || attempt >= max_attempts => return Err(e),
                Err(e) => e,
            };
            let delay = self.delay_for(attempt, &err);
            warn!(
                attempt,
                max_attempts,
                kind = err.kind(),
                delay_ms = delay.as_millis() as u64,
                "Analyzer call failed, retrying: {err}"
            );
            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(AnalyzerError::Cancelled),
                () = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }
}
