// Drives one polling attempt for a target:
// SELECT_SOURCE -> EXECUTE -> CLASSIFY -> {SUCCESS | RETRY | GIVE_UP}.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use relay_common::{EngineSettings, ExecutionKind, ItemBatch, SelectionStrategy, Target};
use tracing::{debug, info, warn};

use crate::breaker::CircuitBreaker;
use crate::humanize::Humanizer;
use crate::registry::{SourceOutcome, SourceRegistry};
use crate::stats::EngineStats;
use crate::transport::{FetchError, Fetcher};

/// Retry and backoff parameters.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub growth_factor: f64,
    pub cap_delay: Duration,
    /// Fraction of each delay applied as ± jitter.
    pub jitter: f64,
    pub attempt_timeout: Duration,
}

impl RetryPolicy {
    pub fn from_settings(settings: &EngineSettings) -> Self {
        Self {
            max_retries: settings.max_retries.max(1),
            base_delay: settings.base_delay,
            growth_factor: settings.growth_factor,
            cap_delay: settings.cap_delay,
            jitter: settings.retry_jitter,
            attempt_timeout: settings.attempt_timeout,
        }
    }

    /// `min(base * growth^attempt, cap)` before jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = self.growth_factor.max(1.0).powi(attempt.min(64) as i32);
        let secs = self.base_delay.as_secs_f64() * factor;
        if !secs.is_finite() || secs >= self.cap_delay.as_secs_f64() {
            self.cap_delay
        } else {
            Duration::from_secs_f64(secs)
        }
    }
}

/// How one call to [`RetryOrchestrator::poll_target`] ended.
#[derive(Debug, Clone)]
pub enum PollResult {
    /// A well-formed batch, possibly empty.
    Batch(ItemBatch),
    /// The upstream asked us to back off until `reset_at`.
    RateLimited {
        source: String,
        reset_at: DateTime<Utc>,
    },
    /// Retries exhausted; the target's breaker has been charged one failure.
    GaveUp { attempts: u32, last_error: String },
}

pub struct RetryOrchestrator {
    policy: RetryPolicy,
    strategy: SelectionStrategy,
    fetcher: Arc<dyn Fetcher>,
    humanizer: Arc<dyn Humanizer>,
    stats: Arc<EngineStats>,
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl RetryOrchestrator {
    pub fn new(
        policy: RetryPolicy,
        strategy: SelectionStrategy,
        fetcher: Arc<dyn Fetcher>,
        humanizer: Arc<dyn Humanizer>,
        stats: Arc<EngineStats>,
    ) -> Self {
        Self {
            policy,
            strategy,
            fetcher,
            humanizer,
            stats,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Poll `target` through the sources in `registry`, retrying with
    /// backoff. Source health is updated after every attempt; `breaker` is
    /// charged exactly once if the attempt gives up.
    pub async fn poll_target(
        &self,
        target: &Target,
        registry: &Mutex<SourceRegistry>,
        breaker: &Mutex<CircuitBreaker>,
    ) -> PollResult {
        let mut attempt: u32 = 0;
        let mut prefer_direct = false;

        loop {
            // SELECT_SOURCE
            let selected = {
                let now = Utc::now();
                let mut reg = lock(registry);
                if prefer_direct {
                    reg.select_source_of_kind(self.strategy, ExecutionKind::Direct, now)
                        .or_else(|| reg.select_source(self.strategy, now))
                } else {
                    reg.select_source(self.strategy, now)
                }
            };
            prefer_direct = false;

            let Some(source) = selected else {
                warn!(target_id = %target.target_id, class = %target.class, "No sources configured for target class");
                lock(breaker).record_failure(Utc::now());
                self.stats.record_give_up();
                return PollResult::GaveUp {
                    attempts: attempt,
                    last_error: format!("no sources for class '{}'", target.class),
                };
            };

            // EXECUTE
            self.stats.record_attempt();
            debug!(target_id = %target.target_id, source = %source.name, kind = %source.kind, attempt, "Executing source");
            let result = match tokio::time::timeout(
                self.policy.attempt_timeout,
                AssertUnwindSafe(self.fetcher.fetch(&source, target)).catch_unwind(),
            )
            .await
            {
                Ok(Ok(result)) => result,
                Ok(Err(_)) => Err(FetchError::Transport("fetcher panicked".to_string())),
                Err(_) => Err(FetchError::Timeout(self.policy.attempt_timeout)),
            };

            // CLASSIFY
            let now = Utc::now();
            let err = match result {
                Ok(items) => {
                    lock(registry).report_outcome(&source.name, SourceOutcome::Success, now);
                    lock(breaker).record_success();
                    self.stats.record_success();
                    info!(
                        target_id = %target.target_id,
                        source = %source.name,
                        items = items.len(),
                        attempts = attempt + 1,
                        "Poll succeeded"
                    );
                    return PollResult::Batch(ItemBatch {
                        target_id: target.target_id.clone(),
                        source: source.name.clone(),
                        fetched_at: now,
                        items,
                    });
                }
                Err(FetchError::RateLimited { reset_at }) => {
                    lock(registry).report_outcome(&source.name, SourceOutcome::RateLimited, now);
                    self.stats.record_rate_limited();
                    info!(target_id = %target.target_id, source = %source.name, %reset_at, "Poll rate limited");
                    return PollResult::RateLimited {
                        source: source.name.clone(),
                        reset_at,
                    };
                }
                Err(err) => err,
            };

            lock(registry).report_outcome(&source.name, SourceOutcome::Failure, now);
            self.stats.record_failure();
            attempt += 1;

            // GIVE_UP
            if attempt >= self.policy.max_retries {
                lock(breaker).record_failure(now);
                self.stats.record_give_up();
                warn!(
                    target_id = %target.target_id,
                    attempts = attempt,
                    error = %err,
                    "Poll gave up after retries"
                );
                return PollResult::GaveUp {
                    attempts: attempt,
                    last_error: err.to_string(),
                };
            }

            // RETRY
            if let FetchError::PoolExhausted { .. } = err {
                prefer_direct = lock(registry).has_active(ExecutionKind::Direct);
                if prefer_direct {
                    info!(target_id = %target.target_id, source = %source.name, "Session pool exhausted, falling back to direct source");
                    continue;
                }
            }

            let base = self.policy.backoff(attempt);
            let delay = self
                .humanizer
                .jitter(base, base.mul_f64(self.policy.jitter.clamp(0.0, 1.0)));
            warn!(
                target_id = %target.target_id,
                source = %source.name,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Attempt failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }
}
