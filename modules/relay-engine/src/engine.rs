// The long-lived engine: owns every piece of polling state and runs the
// primary schedule, the fallback timer and the session sweep.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use relay_common::{
    add_saturating, save_targets, EngineSettings, RelayError, Result, SourceSpec, Target,
};
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::breaker::{BreakerHealth, CircuitBreaker};
use crate::dedup::DedupStore;
use crate::delivery::{DeliveryPipeline, DeliveryReport, DeliverySink, SinkDirectory};
use crate::humanize::{Humanizer, RandomHumanizer};
use crate::orchestrator::{PollResult, RetryOrchestrator, RetryPolicy};
use crate::registry::{SourceHealth, SourceRegistry};
use crate::schedule::{SchedulePolicy, ScheduleState, Scheduler};
use crate::session_pool::SessionPool;
use crate::stats::{EngineStats, StatsSnapshot};
use crate::transport::Fetcher;

/// How one dispatch of a target ended.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum DispatchOutcome {
    #[serde(rename_all = "camelCase")]
    Polled {
        source: String,
        fetched: usize,
        report: DeliveryReport,
        next_check_at: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    RateLimited {
        source: String,
        reset_at: DateTime<Utc>,
        next_check_at: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    GaveUp {
        attempts: u32,
        last_error: String,
        next_check_at: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    BreakerOpen { closes_at: Option<DateTime<Utc>> },
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetHealth {
    #[serde(flatten)]
    pub target: Target,
    pub breaker: BreakerHealth,
    pub schedule: Option<ScheduleState>,
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolHealth {
    pub cap: usize,
    pub live_sessions: usize,
}

/// Point-in-time view served by the control surface.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSnapshot {
    pub started_at: DateTime<Utc>,
    pub targets: Vec<TargetHealth>,
    pub sources: Vec<SourceHealth>,
    pub dedup_size: usize,
    pub dedup_pending_write: bool,
    pub pool: Option<PoolHealth>,
    pub stats: StatsSnapshot,
}

pub struct EngineBuilder {
    settings: EngineSettings,
    targets: Vec<Target>,
    sources: Vec<SourceSpec>,
    targets_file: Option<PathBuf>,
    dedup_file: PathBuf,
    schedule_file: PathBuf,
    fetcher: Option<Arc<dyn Fetcher>>,
    humanizer: Arc<dyn Humanizer>,
    sinks: SinkDirectory,
    pool: Option<Arc<SessionPool>>,
    stats: Arc<EngineStats>,
}

impl EngineBuilder {
    pub fn targets(mut self, targets: Vec<Target>) -> Self {
        self.targets = targets;
        self
    }

    pub fn sources(mut self, sources: Vec<SourceSpec>) -> Self {
        self.sources = sources;
        self
    }

    /// Where operator edits to the target list are written back.
    pub fn targets_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.targets_file = Some(path.into());
        self
    }

    pub fn dedup_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.dedup_file = path.into();
        self
    }

    pub fn schedule_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.schedule_file = path.into();
        self
    }

    pub fn fetcher(mut self, fetcher: Arc<dyn Fetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn humanizer(mut self, humanizer: Arc<dyn Humanizer>) -> Self {
        self.humanizer = humanizer;
        self
    }

    pub fn sink(mut self, name: impl Into<String>, sink: Arc<dyn DeliverySink>) -> Self {
        self.sinks.register(name, sink);
        self
    }

    pub fn session_pool(mut self, pool: Arc<SessionPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn stats(mut self, stats: Arc<EngineStats>) -> Self {
        self.stats = stats;
        self
    }

    pub fn build(self) -> Result<Engine> {
        let fetcher = self
            .fetcher
            .ok_or_else(|| RelayError::Config("engine needs a fetcher".to_string()))?;
        let settings = self.settings;
        let now = Utc::now();

        let mut seen = HashSet::new();
        for target in &self.targets {
            if !seen.insert(target.target_id.as_str()) {
                return Err(RelayError::DuplicateTarget(target.target_id.clone()));
            }
        }

        let mut by_class: HashMap<String, Vec<SourceSpec>> = HashMap::new();
        for spec in self.sources {
            by_class.entry(spec.class.clone()).or_default().push(spec);
        }
        let registries: HashMap<String, Arc<Mutex<SourceRegistry>>> = by_class
            .into_iter()
            .map(|(class, specs)| {
                let registry = SourceRegistry::new(
                    class.clone(),
                    specs,
                    self.humanizer.clone(),
                    settings.reactivation_cooldown_min,
                    settings.reactivation_cooldown_max,
                );
                (class, Arc::new(Mutex::new(registry)))
            })
            .collect();

        for target in &self.targets {
            if !registries.contains_key(&target.class) {
                warn!(target_id = %target.target_id, class = %target.class, "Target has no sources for its class");
            }
        }

        let mut scheduler = Scheduler::load(
            self.schedule_file,
            SchedulePolicy::from_settings(&settings),
            self.humanizer.clone(),
        );
        let breakers = self
            .targets
            .iter()
            .map(|t| {
                scheduler.track(&t.target_id, now);
                (t.target_id.clone(), new_breaker(&settings))
            })
            .collect();

        let dedup = DedupStore::load(self.dedup_file, settings.dedup_max_items);
        let orchestrator = RetryOrchestrator::new(
            RetryPolicy::from_settings(&settings),
            settings.selection_strategy,
            fetcher,
            self.humanizer.clone(),
            self.stats.clone(),
        );
        let pipeline = DeliveryPipeline::new(settings.inter_item_delay, self.stats.clone());

        info!(
            targets = self.targets.len(),
            classes = registries.len(),
            dedup_ids = dedup.len(),
            rendered = self.pool.is_some(),
            "Engine initialized"
        );

        Ok(Engine {
            inner: Arc::new(EngineInner {
                settings,
                started_at: now,
                targets: RwLock::new(self.targets),
                targets_file: self.targets_file,
                registries: Mutex::new(registries),
                breakers: Mutex::new(breakers),
                scheduler: Mutex::new(scheduler),
                dedup: Mutex::new(dedup),
                orchestrator,
                pipeline,
                sinks: self.sinks,
                pool: self.pool,
                stats: self.stats,
                humanizer: self.humanizer,
                dispatch: tokio::sync::Mutex::new(None),
            }),
        })
    }
}

fn new_breaker(settings: &EngineSettings) -> Arc<Mutex<CircuitBreaker>> {
    Arc::new(Mutex::new(CircuitBreaker::new(
        settings.breaker_failure_threshold,
        settings.breaker_reset_timeout,
    )))
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

struct EngineInner {
    settings: EngineSettings,
    started_at: DateTime<Utc>,
    targets: RwLock<Vec<Target>>,
    targets_file: Option<PathBuf>,
    registries: Mutex<HashMap<String, Arc<Mutex<SourceRegistry>>>>,
    breakers: Mutex<HashMap<String, Arc<Mutex<CircuitBreaker>>>>,
    scheduler: Mutex<Scheduler>,
    dedup: Mutex<DedupStore>,
    orchestrator: RetryOrchestrator,
    pipeline: DeliveryPipeline,
    sinks: SinkDirectory,
    pool: Option<Arc<SessionPool>>,
    stats: Arc<EngineStats>,
    humanizer: Arc<dyn Humanizer>,
    /// Serializes attempts across targets. Holds when the previous attempt
    /// finished.
    dispatch: tokio::sync::Mutex<Option<Instant>>,
}

/// Clears a target's in-flight flag if its dispatch future is dropped early.
struct InFlight<'a> {
    engine: &'a EngineInner,
    target_id: &'a str,
    armed: bool,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.armed {
            lock(&self.engine.scheduler).abandon(self.target_id);
        }
    }
}

/// Handle to the engine. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    pub fn builder(settings: EngineSettings) -> EngineBuilder {
        EngineBuilder {
            settings,
            targets: Vec::new(),
            sources: Vec::new(),
            targets_file: None,
            dedup_file: PathBuf::from("data/processed_ids.json"),
            schedule_file: PathBuf::from("data/schedule_state.json"),
            fetcher: None,
            humanizer: Arc::new(RandomHumanizer),
            sinks: SinkDirectory::new(reqwest::Client::new()),
            pool: None,
            stats: Arc::new(EngineStats::default()),
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.inner.settings
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    pub fn targets(&self) -> Vec<Target> {
        self.inner
            .targets
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn target(&self, target_id: &str) -> Result<Target> {
        self.inner
            .targets
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|t| t.target_id == target_id)
            .cloned()
            .ok_or_else(|| RelayError::UnknownTarget(target_id.to_string()))
    }

    fn breaker(&self, target_id: &str) -> Arc<Mutex<CircuitBreaker>> {
        lock(&self.inner.breakers)
            .entry(target_id.to_string())
            .or_insert_with(|| new_breaker(&self.inner.settings))
            .clone()
    }

    fn registry(&self, class: &str) -> Arc<Mutex<SourceRegistry>> {
        lock(&self.inner.registries)
            .entry(class.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(SourceRegistry::new(
                    class,
                    Vec::new(),
                    self.inner.humanizer.clone(),
                    self.inner.settings.reactivation_cooldown_min,
                    self.inner.settings.reactivation_cooldown_max,
                )))
            })
            .clone()
    }

    fn persist_schedule(&self) {
        if let Err(e) = lock(&self.inner.scheduler).persist() {
            self.inner.stats.record_persistence_error();
            warn!(error = %e, "Failed to persist schedule state, will retry next cycle");
        }
    }

    /// Run one attempt for `target_id` now, ignoring its schedule but not
    /// its breaker.
    pub async fn poll_now(&self, target_id: &str) -> Result<DispatchOutcome> {
        self.dispatch(target_id).await
    }

    async fn dispatch(&self, target_id: &str) -> Result<DispatchOutcome> {
        let inner = &*self.inner;
        let target = self.target(target_id)?;
        let breaker = self.breaker(target_id);

        let blocked = {
            let now = Utc::now();
            let mut b = lock(&breaker);
            if b.before_attempt(now) {
                None
            } else {
                Some(b.closes_at())
            }
        };
        if let Some(closes_at) = blocked {
            inner.stats.record_breaker_skip();
            let until = closes_at.unwrap_or_else(|| add_saturating(Utc::now(), inner.settings.base_interval));
            lock(&inner.scheduler).defer(target_id, until);
            debug!(target_id, ?closes_at, "Breaker open, dispatch skipped");
            return Ok(DispatchOutcome::BreakerOpen { closes_at });
        }

        if !lock(&inner.scheduler).try_begin(target_id, Utc::now()) {
            return Err(RelayError::AttemptInProgress(target_id.to_string()));
        }
        let mut in_flight = InFlight {
            engine: inner,
            target_id,
            armed: true,
        };

        let mut turn = inner.dispatch.lock().await;
        if let Some(finished) = *turn {
            let spacing = inner.humanizer.jitter(
                inner.settings.inter_target_delay,
                inner.settings.inter_target_delay / 4,
            );
            let remaining = spacing.saturating_sub(finished.elapsed());
            if !remaining.is_zero() {
                debug!(target_id, ?remaining, "Spacing dispatch after previous attempt");
                tokio::time::sleep(remaining).await;
            }
        }
        let registry = self.registry(&target.class);
        let result = inner
            .orchestrator
            .poll_target(&target, &registry, &breaker)
            .await;

        let delivered = match &result {
            PollResult::Batch(batch) => Some(match inner.sinks.resolve(&target.sink_ref) {
                Some(sink) => {
                    inner
                        .pipeline
                        .deliver(batch, sink.as_ref(), &inner.dedup)
                        .await
                }
                None => {
                    warn!(target_id, sink_ref = %target.sink_ref, "No sink for target, items left undelivered");
                    DeliveryReport {
                        failed: batch.items.len(),
                        ..Default::default()
                    }
                }
            }),
            _ => None,
        };

        *turn = Some(Instant::now());
        drop(turn);
        let next_check_at = lock(&inner.scheduler).on_attempt_result(target_id, &result, Utc::now());
        in_flight.armed = false;
        self.persist_schedule();

        Ok(match result {
            PollResult::Batch(batch) => DispatchOutcome::Polled {
                source: batch.source,
                fetched: batch.items.len(),
                report: delivered.unwrap_or_default(),
                next_check_at,
            },
            PollResult::RateLimited { source, reset_at } => DispatchOutcome::RateLimited {
                source,
                reset_at,
                next_check_at,
            },
            PollResult::GaveUp {
                attempts,
                last_error,
            } => DispatchOutcome::GaveUp {
                attempts,
                last_error,
                next_check_at,
            },
        })
    }

    /// Targets in dispatch order: by priority, rotated to resume where the
    /// previous cycle stopped.
    fn rotation(&self) -> (Vec<Target>, usize) {
        let mut targets = self.targets();
        targets.sort_by_key(|t| t.priority);
        let start = if targets.is_empty() {
            0
        } else {
            lock(&self.inner.scheduler).next_target_index() % targets.len()
        };
        (targets, start)
    }

    /// Dispatch every due target once, one at a time. Spacing between
    /// attempts is enforced by `dispatch` itself. Returns how many were
    /// dispatched.
    pub async fn run_cycle(&self, shutdown: &mut watch::Receiver<bool>) -> usize {
        let (targets, start) = self.rotation();
        let len = targets.len();
        let mut dispatched = 0;

        for offset in 0..len {
            if *shutdown.borrow() {
                break;
            }
            let index = (start + offset) % len;
            let target = &targets[index];
            if !lock(&self.inner.scheduler).is_due(&target.target_id, Utc::now()) {
                continue;
            }

            match self.dispatch(&target.target_id).await {
                Ok(DispatchOutcome::BreakerOpen { .. }) => {}
                Ok(outcome) => {
                    dispatched += 1;
                    debug!(target_id = %target.target_id, ?outcome, "Dispatch finished");
                }
                Err(e) => debug!(target_id = %target.target_id, error = %e, "Dispatch skipped"),
            }
            lock(&self.inner.scheduler).set_next_target_index((index + 1) % len);
        }

        self.inner.pipeline.flush_pending(&self.inner.dedup);
        self.persist_schedule();
        dispatched
    }

    /// Force-dispatch the highest-priority target whose schedule has
    /// stalled, if any.
    pub async fn run_fallback_check(&self) -> Option<String> {
        let now = Utc::now();
        let targets = self.targets();
        let open: HashSet<String> = targets
            .iter()
            .filter(|t| !lock(&self.breaker(&t.target_id)).before_attempt(now))
            .map(|t| t.target_id.clone())
            .collect();

        let stalled = lock(&self.inner.scheduler)
            .stalled_target(&targets, now, |t| open.contains(&t.target_id))
            .map(|t| t.target_id.clone())?;

        warn!(target_id = %stalled, "Primary schedule stalled, fallback dispatching");
        self.inner.stats.record_fallback_dispatch();
        if let Err(e) = self.dispatch(&stalled).await {
            debug!(target_id = %stalled, error = %e, "Fallback dispatch skipped");
        }
        Some(stalled)
    }

    /// Drive the primary schedule, fallback timer and pool sweep until
    /// `shutdown` flips to true, then flush state and close the pool.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) {
        info!("Engine running");
        tokio::join!(
            self.primary_loop(shutdown.clone()),
            self.fallback_loop(shutdown.clone()),
            self.sweep_loop(shutdown.clone()),
        );
        self.shutdown().await;
    }

    async fn primary_loop(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            self.run_cycle(&mut shutdown).await;
            let wait = {
                let now = Utc::now();
                lock(&self.inner.scheduler)
                    .earliest_next_check()
                    .and_then(|at| (at - now).to_std().ok())
                    .unwrap_or(Duration::from_secs(1))
                    .clamp(Duration::from_secs(1), self.inner.settings.base_interval)
            };
            if sleep_or_shutdown(wait, &mut shutdown).await {
                return;
            }
        }
    }

    async fn fallback_loop(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            if sleep_or_shutdown(self.inner.settings.fallback_period, &mut shutdown).await {
                return;
            }
            self.run_fallback_check().await;
        }
    }

    async fn sweep_loop(&self, mut shutdown: watch::Receiver<bool>) {
        let Some(pool) = self.inner.pool.clone() else {
            return;
        };
        loop {
            if sleep_or_shutdown(self.inner.settings.pool_sweep_interval, &mut shutdown).await {
                return;
            }
            pool.sweep(Utc::now()).await;
        }
    }

    /// Flush the dedup store and schedule state, then close pooled
    /// sessions.
    pub async fn shutdown(&self) {
        {
            let mut dedup = lock(&self.inner.dedup);
            if dedup.is_dirty() {
                match dedup.persist() {
                    Ok(()) => info!(ids = dedup.len(), "Dedup store flushed"),
                    Err(e) => warn!(error = %e, "Failed to flush dedup store on shutdown"),
                }
            }
        }
        if let Err(e) = lock(&self.inner.scheduler).persist() {
            warn!(error = %e, "Failed to flush schedule state on shutdown");
        }
        if let Some(pool) = &self.inner.pool {
            pool.close_all().await;
        }
        info!("Engine stopped");
    }

    pub fn add_target(&self, target: Target) -> Result<()> {
        if target.target_id.trim().is_empty() {
            return Err(RelayError::Config("targetId must not be empty".to_string()));
        }
        {
            let mut targets = self.inner.targets.write().unwrap_or_else(|e| e.into_inner());
            if targets.iter().any(|t| t.target_id == target.target_id) {
                return Err(RelayError::DuplicateTarget(target.target_id));
            }
            targets.push(target.clone());
            self.write_targets(&targets)?;
        }
        lock(&self.inner.scheduler).track(&target.target_id, Utc::now());
        self.breaker(&target.target_id);
        info!(target_id = %target.target_id, class = %target.class, priority = target.priority, "Target added");
        Ok(())
    }

    pub fn remove_target(&self, target_id: &str) -> Result<Target> {
        let removed = {
            let mut targets = self.inner.targets.write().unwrap_or_else(|e| e.into_inner());
            let pos = targets
                .iter()
                .position(|t| t.target_id == target_id)
                .ok_or_else(|| RelayError::UnknownTarget(target_id.to_string()))?;
            let removed = targets.remove(pos);
            self.write_targets(&targets)?;
            removed
        };
        lock(&self.inner.scheduler).untrack(target_id);
        lock(&self.inner.breakers).remove(target_id);
        info!(target_id, "Target removed");
        Ok(removed)
    }

    fn write_targets(&self, targets: &[Target]) -> Result<()> {
        match &self.inner.targets_file {
            Some(path) => save_targets(path, targets),
            None => Ok(()),
        }
    }

    pub fn reset_breaker(&self, target_id: &str) -> Result<BreakerHealth> {
        self.target(target_id)?;
        let breaker = self.breaker(target_id);
        let mut b = lock(&breaker);
        b.reset();
        info!(target_id, "Breaker reset by operator");
        Ok(b.snapshot())
    }

    pub fn health(&self) -> HealthSnapshot {
        let targets = self.targets();
        let target_health = targets
            .into_iter()
            .map(|target| {
                let breaker = lock(&self.breaker(&target.target_id)).snapshot();
                let schedule = lock(&self.inner.scheduler)
                    .state(&target.target_id)
                    .cloned();
                TargetHealth {
                    target,
                    breaker,
                    schedule,
                }
            })
            .collect();

        let registries: Vec<_> = lock(&self.inner.registries).values().cloned().collect();
        let mut sources: Vec<SourceHealth> = registries
            .iter()
            .flat_map(|r| lock(r).snapshot())
            .collect();
        sources.sort_by(|a, b| (&a.class, a.priority, &a.name).cmp(&(&b.class, b.priority, &b.name)));

        let (dedup_size, dedup_pending_write) = {
            let dedup = lock(&self.inner.dedup);
            (dedup.len(), dedup.is_dirty())
        };

        HealthSnapshot {
            started_at: self.inner.started_at,
            targets: target_health,
            sources,
            dedup_size,
            dedup_pending_write,
            pool: self.inner.pool.as_ref().map(|p| PoolHealth {
                cap: p.cap(),
                live_sessions: p.live_sessions(),
            }),
            stats: self.inner.stats.snapshot(),
        }
    }
}

/// Sleep for `delay`; returns true if shutdown was signalled first.
async fn sleep_or_shutdown(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    if *shutdown.borrow() {
        return true;
    }
    let closed = tokio::select! {
        _ = tokio::time::sleep(delay) => false,
        changed = shutdown.changed() => changed.is_err(),
    };
    closed || *shutdown.borrow()
}
