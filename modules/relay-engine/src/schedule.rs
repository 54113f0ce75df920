use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use relay_common::{add_saturating, persist, EngineSettings, Result, Target};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::humanize::Humanizer;
use crate::orchestrator::PollResult;

/// Per-target scheduling state.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleState {
    pub next_check_at: Option<DateTime<Utc>>,
    pub rate_limit_reset_at: Option<DateTime<Utc>>,
    /// True for the whole duration of one attempt.
    pub in_progress: bool,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_outcome: Option<AttemptOutcome>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum AttemptOutcome {
    Success,
    RateLimited,
    GaveUp,
    BreakerOpen,
}

/// On-disk schedule state: the latest upstream rate-limit reset and where
/// the primary rotation left off.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleFile {
    #[serde(default)]
    pub reset_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub next_target_index: usize,
}

#[derive(Debug, Clone)]
pub struct SchedulePolicy {
    pub base_interval: Duration,
    pub interval_jitter: Duration,
    pub minimum_interval: Duration,
    pub safety_buffer: Duration,
    pub stall_threshold: Duration,
}

impl SchedulePolicy {
    pub fn from_settings(settings: &EngineSettings) -> Self {
        Self {
            base_interval: settings.base_interval,
            interval_jitter: settings.interval_jitter,
            minimum_interval: settings.minimum_interval,
            safety_buffer: settings.rate_limit_safety_buffer,
            stall_threshold: settings.stall_threshold,
        }
    }

    /// Earliest time the next attempt may run after a rate limit that
    /// resets at `reset_at`.
    pub fn after_rate_limit(&self, reset_at: DateTime<Utc>, now: DateTime<Utc>) -> DateTime<Utc> {
        let by_reset = add_saturating(reset_at, self.safety_buffer);
        let by_floor = add_saturating(now, self.minimum_interval);
        by_reset.max(by_floor)
    }

    /// `now + base_interval ± jitter`, never sooner than the minimum interval.
    pub fn regular(&self, now: DateTime<Utc>, humanizer: &dyn Humanizer) -> DateTime<Utc> {
        let delay = humanizer
            .jitter(self.base_interval, self.interval_jitter)
            .max(self.minimum_interval);
        add_saturating(now, delay)
    }
}

/// Decides when each target is polled next and keeps the shared rotation
/// state that survives restarts.
pub struct Scheduler {
    policy: SchedulePolicy,
    humanizer: Arc<dyn Humanizer>,
    states: BTreeMap<String, ScheduleState>,
    path: PathBuf,
    file: ScheduleFile,
    dirty: bool,
}

impl Scheduler {
    /// Load persisted state from `path`. A missing file starts fresh; an
    /// unreadable one is logged and ignored.
    pub fn load(path: impl Into<PathBuf>, policy: SchedulePolicy, humanizer: Arc<dyn Humanizer>) -> Self {
        let path = path.into();
        let file = match persist::read_json::<ScheduleFile>(&path) {
            Ok(Some(file)) => {
                info!(path = %path.display(), reset_at = ?file.reset_at, next_target_index = file.next_target_index, "Loaded schedule state");
                file
            }
            Ok(None) => ScheduleFile::default(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Schedule state unreadable, starting fresh");
                ScheduleFile::default()
            }
        };
        Self {
            policy,
            humanizer,
            states: BTreeMap::new(),
            path,
            file,
            dirty: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn policy(&self) -> &SchedulePolicy {
        &self.policy
    }

    pub fn file(&self) -> &ScheduleFile {
        &self.file
    }

    /// Start tracking `target_id`. A new target is due immediately unless a
    /// persisted rate limit is still in force.
    pub fn track(&mut self, target_id: &str, now: DateTime<Utc>) {
        if self.states.contains_key(target_id) {
            return;
        }
        let next = match self.file.reset_at {
            Some(reset) if reset > now => self.policy.after_rate_limit(reset, now),
            _ => now,
        };
        self.states.insert(
            target_id.to_string(),
            ScheduleState {
                next_check_at: Some(next),
                ..Default::default()
            },
        );
    }

    pub fn untrack(&mut self, target_id: &str) {
        self.states.remove(target_id);
    }

    pub fn state(&self, target_id: &str) -> Option<&ScheduleState> {
        self.states.get(target_id)
    }

    pub fn is_due(&self, target_id: &str, now: DateTime<Utc>) -> bool {
        self.states
            .get(target_id)
            .is_some_and(|s| !s.in_progress && s.next_check_at.map_or(true, |at| at <= now))
    }

    pub fn is_in_progress(&self, target_id: &str) -> bool {
        self.states.get(target_id).is_some_and(|s| s.in_progress)
    }

    /// Mark an attempt as started. Returns false if one is already in flight.
    pub fn try_begin(&mut self, target_id: &str, now: DateTime<Utc>) -> bool {
        self.track(target_id, now);
        match self.states.get_mut(target_id) {
            Some(state) if !state.in_progress => {
                state.in_progress = true;
                state.last_attempt_at = Some(now);
                true
            }
            _ => false,
        }
    }

    /// Record how an attempt ended and compute the target's next check.
    pub fn on_attempt_result(
        &mut self,
        target_id: &str,
        result: &PollResult,
        now: DateTime<Utc>,
    ) -> DateTime<Utc> {
        let (next, outcome, reset) = match result {
            PollResult::RateLimited { reset_at, .. } => (
                self.policy.after_rate_limit(*reset_at, now),
                AttemptOutcome::RateLimited,
                Some(*reset_at),
            ),
            PollResult::Batch(_) => (
                self.policy.regular(now, self.humanizer.as_ref()),
                AttemptOutcome::Success,
                None,
            ),
            PollResult::GaveUp { .. } => (
                self.policy.regular(now, self.humanizer.as_ref()),
                AttemptOutcome::GaveUp,
                None,
            ),
        };

        if let Some(reset) = reset {
            if self.file.reset_at.map_or(true, |at| at < reset) {
                self.file.reset_at = Some(reset);
                self.dirty = true;
            }
        }

        let state = self.states.entry(target_id.to_string()).or_default();
        state.in_progress = false;
        state.next_check_at = Some(next);
        state.last_outcome = Some(outcome);
        if reset.is_some() {
            state.rate_limit_reset_at = reset;
        }
        debug!(target_id, next_check_at = %next, ?outcome, "Next check scheduled");
        next
    }

    /// Push a target's next check to `until` without running an attempt,
    /// e.g. while its breaker is open.
    pub fn defer(&mut self, target_id: &str, until: DateTime<Utc>) {
        let state = self.states.entry(target_id.to_string()).or_default();
        state.in_progress = false;
        state.next_check_at = Some(until);
        state.last_outcome = Some(AttemptOutcome::BreakerOpen);
    }

    /// Clear the in-flight flag without touching the schedule.
    pub fn abandon(&mut self, target_id: &str) {
        if let Some(state) = self.states.get_mut(target_id) {
            state.in_progress = false;
        }
    }

    /// The earliest upcoming check among idle targets.
    pub fn earliest_next_check(&self) -> Option<DateTime<Utc>> {
        self.states
            .values()
            .filter(|s| !s.in_progress)
            .filter_map(|s| s.next_check_at)
            .min()
    }

    /// Highest-priority target whose primary schedule has gone quiet: no
    /// state at all, or a check overdue by more than the stall threshold.
    /// Targets for which `blocked` returns true are skipped.
    pub fn stalled_target<'a>(
        &self,
        targets: &'a [Target],
        now: DateTime<Utc>,
        blocked: impl Fn(&Target) -> bool,
    ) -> Option<&'a Target> {
        let threshold = self.policy.stall_threshold;
        let mut stalled: Vec<&Target> = targets
            .iter()
            .filter(|t| match self.states.get(&t.target_id) {
                None => true,
                Some(s) if s.in_progress => false,
                Some(s) => s.next_check_at.map_or(true, |at| add_saturating(at, threshold) < now),
            })
            .filter(|t| !blocked(t))
            .collect();
        stalled.sort_by_key(|t| t.priority);
        stalled.first().copied()
    }

    pub fn next_target_index(&self) -> usize {
        self.file.next_target_index
    }

    pub fn set_next_target_index(&mut self, index: usize) {
        if self.file.next_target_index != index {
            self.file.next_target_index = index;
            self.dirty = true;
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Write the schedule file if anything changed. Stays dirty on failure
    /// so the next cycle retries.
    pub fn persist(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        persist::write_json_atomic(&self.path, &self.file)?;
        self.dirty = false;
        Ok(())
    }

    pub fn snapshot(&self) -> BTreeMap<String, ScheduleState> {
        self.states.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::humanize::FixedHumanizer;
    use chrono::Duration as ChronoDuration;
    use relay_common::ItemBatch;

    fn policy() -> SchedulePolicy {
        SchedulePolicy {
            base_interval: Duration::from_secs(600),
            interval_jitter: Duration::from_secs(120),
            minimum_interval: Duration::from_secs(60),
            safety_buffer: Duration::from_secs(30),
            stall_threshold: Duration::from_secs(3600),
        }
    }

    fn scheduler(dir: &Path) -> Scheduler {
        Scheduler::load(dir.join("schedule.json"), policy(), Arc::new(FixedHumanizer))
    }

    fn empty_batch(target_id: &str, now: DateTime<Utc>) -> PollResult {
        PollResult::Batch(ItemBatch {
            target_id: target_id.into(),
            source: "s".into(),
            fetched_at: now,
            items: vec![],
        })
    }

    #[test]
    fn new_target_is_due_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = scheduler(dir.path());
        let now = Utc::now();
        s.track("a", now);
        assert!(s.is_due("a", now));
    }

    #[test]
    fn success_schedules_base_interval() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = scheduler(dir.path());
        let now = Utc::now();
        assert!(s.try_begin("a", now));
        let next = s.on_attempt_result("a", &empty_batch("a", now), now);
        assert_eq!(next, now + ChronoDuration::seconds(600));
        assert!(!s.is_in_progress("a"));
        assert!(!s.is_due("a", now));
    }

    #[test]
    fn rate_limit_waits_for_reset_plus_buffer() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = scheduler(dir.path());
        let now = Utc::now();
        let reset = now + ChronoDuration::minutes(15);
        s.try_begin("a", now);
        let next = s.on_attempt_result(
            "a",
            &PollResult::RateLimited {
                source: "s".into(),
                reset_at: reset,
            },
            now,
        );
        assert!(next >= reset + ChronoDuration::seconds(30));
        assert_eq!(s.state("a").unwrap().rate_limit_reset_at, Some(reset));
        assert_eq!(s.file().reset_at, Some(reset));
        assert!(s.is_dirty());
    }

    #[test]
    fn rate_limit_in_the_past_still_honours_minimum_interval() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = scheduler(dir.path());
        let now = Utc::now();
        let next = s.on_attempt_result(
            "a",
            &PollResult::RateLimited {
                source: "s".into(),
                reset_at: now - ChronoDuration::minutes(5),
            },
            now,
        );
        assert_eq!(next, now + ChronoDuration::seconds(60));
    }

    #[test]
    fn reset_at_the_end_of_time_saturates() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = scheduler(dir.path());
        let now = Utc::now();
        let reset = DateTime::<Utc>::MAX_UTC - ChronoDuration::seconds(10);
        s.try_begin("a", now);
        let next = s.on_attempt_result(
            "a",
            &PollResult::RateLimited {
                source: "s".into(),
                reset_at: reset,
            },
            now,
        );
        assert_eq!(next, DateTime::<Utc>::MAX_UTC);
        assert!(!s.is_in_progress("a"));

        // A target added afterwards is seeded from the same reset.
        s.track("b", now);
        assert_eq!(s.state("b").unwrap().next_check_at, Some(DateTime::<Utc>::MAX_UTC));

        let targets = vec![Target::new("a", 1, "sink"), Target::new("b", 2, "sink")];
        assert!(s.stalled_target(&targets, now, |_| false).is_none());
    }

    #[test]
    fn give_up_still_advances_next_check() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = scheduler(dir.path());
        let now = Utc::now();
        s.try_begin("a", now);
        let next = s.on_attempt_result(
            "a",
            &PollResult::GaveUp {
                attempts: 5,
                last_error: "boom".into(),
            },
            now,
        );
        assert!(next > now);
    }

    #[test]
    fn only_one_attempt_in_flight() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = scheduler(dir.path());
        let now = Utc::now();
        assert!(s.try_begin("a", now));
        assert!(!s.try_begin("a", now));
        s.abandon("a");
        assert!(s.try_begin("a", now));
    }

    #[test]
    fn persisted_reset_seeds_new_targets_after_restart() {
        let dir = tempfile::tempdir().unwrap();
        let now = Utc::now();
        let reset = now + ChronoDuration::minutes(10);
        {
            let mut s = scheduler(dir.path());
            s.on_attempt_result(
                "a",
                &PollResult::RateLimited {
                    source: "s".into(),
                    reset_at: reset,
                },
                now,
            );
            s.set_next_target_index(2);
            s.persist().unwrap();
            assert!(!s.is_dirty());
        }

        let mut s = scheduler(dir.path());
        assert_eq!(s.next_target_index(), 2);
        s.track("b", now);
        assert!(!s.is_due("b", now));
        assert!(s.state("b").unwrap().next_check_at.unwrap() >= reset + ChronoDuration::seconds(30));
    }

    #[test]
    fn stalled_target_prefers_highest_priority() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = scheduler(dir.path());
        let now = Utc::now();
        let targets = vec![
            Target::new("low", 5, "sink"),
            Target::new("high", 1, "sink"),
            Target::new("fresh", 0, "sink"),
        ];
        let long_ago = now - ChronoDuration::hours(3);
        s.track("low", long_ago);
        s.track("high", long_ago);
        s.track("fresh", now);

        let picked = s.stalled_target(&targets, now, |_| false).unwrap();
        assert_eq!(picked.target_id, "high");

        let picked = s
            .stalled_target(&targets, now, |t| t.target_id == "high")
            .unwrap();
        assert_eq!(picked.target_id, "low");
    }

    #[test]
    fn nothing_stalls_while_schedule_is_current() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = scheduler(dir.path());
        let now = Utc::now();
        let targets = vec![Target::new("a", 1, "sink")];
        s.track("a", now - ChronoDuration::minutes(30));
        assert!(s.stalled_target(&targets, now, |_| false).is_none());
    }
}
