use rand::Rng;
use std::future::Future;
use std::time::Duration;
use uuid::Uuid;

use crate::gateway::GatewayError;

const DEFAULT_DELAYS_MS: [u64; 4] = [0, 500, 1500, 3000];

#[derive(Debug, thiserror::Error)]
pub enum InvokeError {
    #[error("timeout exceeded after {}ms", .0.as_millis())]
    Timeout(Duration),
    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

impl InvokeError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, InvokeError::Timeout(_))
    }
}

/// Ordered delays (ms) before each attempt. The first entry belongs to the
/// initial attempt, which always starts immediately. Never empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrySchedule {
    delays_ms: Vec<u64>,
}

impl Default for RetrySchedule {
    fn default() -> Self {
        Self {
            delays_ms: DEFAULT_DELAYS_MS.to_vec(),
        }
    }
}

impl RetrySchedule {
    pub fn new(delays_ms: Vec<u64>) -> Self {
        if delays_ms.is_empty() {
            return Self::default();
        }
        Self { delays_ms }
    }

    /// Parses a comma separated list, dropping entries that are not finite,
    /// non-negative numbers.
    pub fn parse(raw: &str) -> Self {
        let delays_ms = raw
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .filter_map(|s| s.parse::<f64>().ok())
            .filter(|n| n.is_finite() && *n >= 0.0)
            .map(|n| n as u64)
            .collect();
        Self::new(delays_ms)
    }

    pub fn delays_ms(&self) -> &[u64] {
        &self.delays_ms
    }

    pub fn attempts(&self) -> usize {
        self.delays_ms.len()
    }
}

/// `base + U[0, floor(base * 0.2))`. Never shorter than `base`.
pub fn jittered_delay<R: Rng>(base_ms: u64, rng: &mut R) -> Duration {
    let span = base_ms / 5;
    let extra = if span == 0 { 0 } else { rng.random_range(0..span) };
    Duration::from_millis(base_ms.saturating_add(extra))
}

#[derive(Debug, Clone)]
pub struct ResilientInvoker {
    schedule: RetrySchedule,
    attempt_timeout: Duration,
    request_id: Option<Uuid>,
}

impl ResilientInvoker {
    pub fn new(schedule: RetrySchedule, attempt_timeout: Duration) -> Self {
        Self {
            schedule,
            attempt_timeout,
            request_id: None,
        }
    }

    /// Same policy, with log lines tagged by `request_id`.
    pub fn for_request(&self, request_id: Uuid) -> Self {
        Self {
            request_id: Some(request_id),
            ..self.clone()
        }
    }

    pub fn schedule(&self) -> &RetrySchedule {
        &self.schedule
    }

    /// `"[<id>] "` for request-scoped invokers, empty otherwise.
    pub fn log_tag(&self) -> String {
        self.request_id
            .map(|id| format!("[{}] ", id))
            .unwrap_or_default()
    }

    /// Runs one attempt under the per-attempt timeout. On expiry the attempt
    /// future is dropped, which aborts the in-flight request.
    pub async fn attempt<T, Fut>(&self, call: Fut) -> Result<T, InvokeError>
    where
        Fut: Future<Output = Result<T, GatewayError>>,
    {
        match tokio::time::timeout(self.attempt_timeout, call).await {
            Ok(result) => result.map_err(InvokeError::from),
            Err(_) => Err(InvokeError::Timeout(self.attempt_timeout)),
        }
    }

    /// Runs `call` until it succeeds or the schedule is exhausted. Attempts
    /// never overlap. The error of the final attempt is returned.
    pub async fn invoke<T, F, Fut>(&self, mut call: F) -> Result<T, InvokeError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, GatewayError>>,
    {
        let total = self.schedule.attempts();
        let mut index = 0;
        loop {
            let err = match self.attempt(call()).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            let Some(&next_base) = self.schedule.delays_ms().get(index + 1) else {
                log::error!("{}Inference failed after {} attempt(s): {}", self.log_tag(), total, err);
                return Err(err);
            };

            let delay = jittered_delay(next_base, &mut rand::rng());
            log::warn!(
                "{}Inference attempt {}/{} failed: {}; retrying in {}ms",
                self.log_tag(),
                index + 1,
                total,
                err,
                delay.as_millis()
            );
            tokio::time::sleep(delay).await;
            index += 1;
        }
    }
}
