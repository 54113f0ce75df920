// Health and selection state for the sources serving one target class.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::seq::{IndexedRandom, IteratorRandom};
use relay_common::{add_saturating, ExecutionKind, SelectionStrategy, SourceSpec};
use serde::Serialize;
use tracing::{info, warn};

use crate::humanize::Humanizer;

/// Result of one attempt against a source, as far as its health is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceOutcome {
    Success,
    Failure,
    /// Explicit throttling. Does not count against the source.
    RateLimited,
}

#[derive(Debug, Clone)]
struct SourceState {
    spec: SourceSpec,
    active: bool,
    fail_count: u32,
    last_used_at: Option<DateTime<Utc>>,
    reactivate_at: Option<DateTime<Utc>>,
}

impl SourceState {
    fn max_fails(&self) -> u32 {
        self.spec.max_fails.max(1)
    }

    fn reactivate(&mut self) {
        self.active = true;
        self.fail_count /= 2;
        self.reactivate_at = None;
    }
}

/// Point-in-time view of one source for the health snapshot.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceHealth {
    pub name: String,
    pub class: String,
    pub kind: ExecutionKind,
    pub active: bool,
    pub fail_count: u32,
    pub max_fails: u32,
    pub priority: u32,
    pub last_used_at: Option<DateTime<Utc>>,
    pub reactivate_at: Option<DateTime<Utc>>,
}

/// Tracks failures per source, deactivates sources that cross `max_fails`,
/// and brings them back after a randomized cooldown with half their
/// failure count.
pub struct SourceRegistry {
    class: String,
    sources: Vec<SourceState>,
    humanizer: Arc<dyn Humanizer>,
    cooldown_min: Duration,
    cooldown_max: Duration,
}

impl SourceRegistry {
    pub fn new(
        class: impl Into<String>,
        specs: Vec<SourceSpec>,
        humanizer: Arc<dyn Humanizer>,
        cooldown_min: Duration,
        cooldown_max: Duration,
    ) -> Self {
        let sources = specs
            .into_iter()
            .map(|spec| SourceState {
                spec,
                active: true,
                fail_count: 0,
                last_used_at: None,
                reactivate_at: None,
            })
            .collect();
        Self {
            class: class.into(),
            sources,
            humanizer,
            cooldown_min,
            cooldown_max,
        }
    }

    pub fn class(&self) -> &str {
        &self.class
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Pick the next source according to `strategy`.
    ///
    /// Sources whose cooldown has elapsed are reactivated first. If nothing is
    /// active afterwards, about a third of all sources are force-reactivated
    /// so polling can always make progress. Returns `None` only when the
    /// registry has no sources at all.
    pub fn select_source(
        &mut self,
        strategy: SelectionStrategy,
        now: DateTime<Utc>,
    ) -> Option<SourceSpec> {
        self.reactivate_due(now);
        if !self.sources.iter().any(|s| s.active) {
            self.force_reactivate();
        }
        self.pick(strategy, None, now)
    }

    /// Like [`select_source`](Self::select_source) but only among active
    /// sources of `kind`. Never force-reactivates.
    pub fn select_source_of_kind(
        &mut self,
        strategy: SelectionStrategy,
        kind: ExecutionKind,
        now: DateTime<Utc>,
    ) -> Option<SourceSpec> {
        self.reactivate_due(now);
        self.pick(strategy, Some(kind), now)
    }

    fn pick(
        &mut self,
        strategy: SelectionStrategy,
        kind: Option<ExecutionKind>,
        now: DateTime<Utc>,
    ) -> Option<SourceSpec> {
        let candidates: Vec<usize> = self
            .sources
            .iter()
            .enumerate()
            .filter(|(_, s)| s.active && kind.map_or(true, |k| s.spec.kind == k))
            .map(|(i, _)| i)
            .collect();

        let chosen = match strategy {
            SelectionStrategy::Random => candidates.choose(&mut rand::rng()).copied(),
            SelectionStrategy::Priority => candidates
                .iter()
                .copied()
                .min_by_key(|&i| self.sources[i].spec.priority),
            // Never-used sources sort first (None < Some).
            SelectionStrategy::RoundRobin => candidates
                .iter()
                .copied()
                .min_by_key(|&i| self.sources[i].last_used_at),
        }?;

        let source = &mut self.sources[chosen];
        source.last_used_at = Some(now);
        Some(source.spec.clone())
    }

    /// Update a source's health after an attempt.
    pub fn report_outcome(&mut self, name: &str, outcome: SourceOutcome, now: DateTime<Utc>) {
        let Some(source) = self.sources.iter_mut().find(|s| s.spec.name == name) else {
            warn!(source = name, class = %self.class, "Outcome reported for unknown source");
            return;
        };

        match outcome {
            SourceOutcome::Success => {
                source.fail_count = source.fail_count.saturating_sub(1);
                source.last_used_at = Some(now);
            }
            SourceOutcome::RateLimited => {}
            SourceOutcome::Failure => {
                source.fail_count += 1;
                if source.active && source.fail_count >= source.max_fails() {
                    let cooldown = self.humanizer.between(self.cooldown_min, self.cooldown_max);
                    source.active = false;
                    source.reactivate_at = Some(add_saturating(now, cooldown));
                    warn!(
                        source = name,
                        class = %self.class,
                        fail_count = source.fail_count,
                        cooldown_secs = cooldown.as_secs(),
                        "Source deactivated"
                    );
                }
            }
        }
    }

    /// Reactivate every source whose cooldown has elapsed.
    pub fn reactivate_due(&mut self, now: DateTime<Utc>) {
        for source in &mut self.sources {
            if source.active {
                continue;
            }
            if source.reactivate_at.is_some_and(|at| at <= now) {
                source.reactivate();
                info!(
                    source = %source.spec.name,
                    class = %self.class,
                    fail_count = source.fail_count,
                    "Source reactivated after cooldown"
                );
            }
        }
    }

    /// Reactivate a random third (at least one) of all sources, halving
    /// their failure counts. Returns how many were brought back.
    pub fn force_reactivate(&mut self) -> usize {
        if self.sources.is_empty() {
            return 0;
        }
        let count = self.sources.len().div_ceil(3);
        let picked = (0..self.sources.len()).choose_multiple(&mut rand::rng(), count);
        for &i in &picked {
            self.sources[i].reactivate();
        }
        warn!(
            class = %self.class,
            reactivated = picked.len(),
            total = self.sources.len(),
            "No active sources, force-reactivated a subset"
        );
        picked.len()
    }

    pub fn has_active(&self, kind: ExecutionKind) -> bool {
        self.sources.iter().any(|s| s.active && s.spec.kind == kind)
    }

    pub fn snapshot(&self) -> Vec<SourceHealth> {
        self.sources
            .iter()
            .map(|s| SourceHealth {
                name: s.spec.name.clone(),
                class: self.class.clone(),
                kind: s.spec.kind,
                active: s.active,
                fail_count: s.fail_count,
                max_fails: s.max_fails(),
                priority: s.spec.priority,
                last_used_at: s.last_used_at,
                reactivate_at: s.reactivate_at,
            })
            .collect()
    }
}
