use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Process-lifetime counters shared by the orchestrator, pipeline and
/// scheduler.
#[derive(Debug, Default)]
pub struct EngineStats {
    attempts: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    rate_limited: AtomicU64,
    give_ups: AtomicU64,
    delivered: AtomicU64,
    duplicates_skipped: AtomicU64,
    delivery_failures: AtomicU64,
    persistence_errors: AtomicU64,
    breaker_skips: AtomicU64,
    fallback_dispatches: AtomicU64,
}

macro_rules! counter {
    ($record:ident, $field:ident) => {
        pub fn $record(&self) {
            self.$field.fetch_add(1, Ordering::Relaxed);
        }
    };
}

impl EngineStats {
    counter!(record_attempt, attempts);
    counter!(record_success, successes);
    counter!(record_failure, failures);
    counter!(record_rate_limited, rate_limited);
    counter!(record_give_up, give_ups);
    counter!(record_delivered, delivered);
    counter!(record_duplicate, duplicates_skipped);
    counter!(record_delivery_failure, delivery_failures);
    counter!(record_persistence_error, persistence_errors);
    counter!(record_breaker_skip, breaker_skips);
    counter!(record_fallback_dispatch, fallback_dispatches);

    pub fn snapshot(&self) -> StatsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            attempts: get(&self.attempts),
            successes: get(&self.successes),
            failures: get(&self.failures),
            rate_limited: get(&self.rate_limited),
            give_ups: get(&self.give_ups),
            delivered: get(&self.delivered),
            duplicates_skipped: get(&self.duplicates_skipped),
            delivery_failures: get(&self.delivery_failures),
            persistence_errors: get(&self.persistence_errors),
            breaker_skips: get(&self.breaker_skips),
            fallback_dispatches: get(&self.fallback_dispatches),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    pub rate_limited: u64,
    pub give_ups: u64,
    pub delivered: u64,
    pub duplicates_skipped: u64,
    pub delivery_failures: u64,
    pub persistence_errors: u64,
    pub breaker_skips: u64,
    pub fallback_dispatches: u64,
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "\n=== Relay Stats ===")?;
        writeln!(f, "Attempts:            {}", self.attempts)?;
        writeln!(f, "  succeeded:         {}", self.successes)?;
        writeln!(f, "  failed:            {}", self.failures)?;
        writeln!(f, "  rate limited:      {}", self.rate_limited)?;
        writeln!(f, "Gave up:             {}", self.give_ups)?;
        writeln!(f, "Breaker skips:       {}", self.breaker_skips)?;
        writeln!(f, "Fallback dispatches: {}", self.fallback_dispatches)?;
        writeln!(f, "Delivered:           {}", self.delivered)?;
        writeln!(f, "  duplicates:        {}", self.duplicates_skipped)?;
        writeln!(f, "  failed:            {}", self.delivery_failures)?;
        write!(f, "Persistence errors:  {}", self.persistence_errors)
    }
}
