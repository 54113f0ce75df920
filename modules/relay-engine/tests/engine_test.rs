//! Integration tests driving the whole engine with an in-process fetcher and
//! sink. Persistence goes to temp directories.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use relay_common::{
    load_targets, CandidateItem, EngineSettings, ExecutionKind, NewItem, SelectionStrategy,
    SourceSpec, Target,
};
use relay_engine::{
    DedupStore, DeliverySink, DispatchOutcome, Engine, FetchError, Fetcher, FixedHumanizer,
};
use tokio::sync::watch;

// ---------------------------------------------------------------------------
// Fakes
// ---------------------------------------------------------------------------

type Script = dyn Fn(&SourceSpec, usize) -> Result<Vec<CandidateItem>, FetchError> + Send + Sync;

/// Answers each fetch by calling a script with the source and the call index.
struct ScriptedFetcher {
    script: Box<Script>,
    calls: Mutex<Vec<String>>,
    count: AtomicUsize,
}

impl ScriptedFetcher {
    fn new(
        script: impl Fn(&SourceSpec, usize) -> Result<Vec<CandidateItem>, FetchError>
            + Send
            + Sync
            + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            script: Box::new(script),
            calls: Mutex::new(Vec::new()),
            count: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Fetcher for ScriptedFetcher {
    async fn fetch(
        &self,
        source: &SourceSpec,
        _target: &Target,
    ) -> Result<Vec<CandidateItem>, FetchError> {
        let n = self.count.fetch_add(1, Ordering::SeqCst);
        self.calls.lock().unwrap().push(source.name.clone());
        (self.script)(source, n)
    }
}

#[derive(Default)]
struct RecordingSink {
    items: Mutex<Vec<NewItem>>,
}

impl RecordingSink {
    fn ids(&self) -> Vec<String> {
        self.items
            .lock()
            .unwrap()
            .iter()
            .map(|i| i.item_id.clone())
            .collect()
    }
}

#[async_trait]
impl DeliverySink for RecordingSink {
    async fn deliver(&self, item: &NewItem) -> anyhow::Result<()> {
        self.items.lock().unwrap().push(item.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn fast_settings() -> EngineSettings {
    EngineSettings {
        base_delay: Duration::from_millis(1),
        cap_delay: Duration::from_millis(5),
        attempt_timeout: Duration::from_secs(2),
        inter_target_delay: Duration::ZERO,
        inter_item_delay: Duration::ZERO,
        ..EngineSettings::default()
    }
}

fn direct(name: &str, priority: u32) -> SourceSpec {
    SourceSpec::new(name, "https://feeds.example/{target}", ExecutionKind::Direct, priority, 10)
}

fn items(ids: &[&str]) -> Vec<CandidateItem> {
    ids.iter().map(|id| CandidateItem::new(*id)).collect()
}

fn build(
    dir: &Path,
    settings: EngineSettings,
    sources: Vec<SourceSpec>,
    fetcher: Arc<ScriptedFetcher>,
    sink: Arc<RecordingSink>,
) -> Engine {
    Engine::builder(settings)
        .targets(vec![Target::new("@alice", 1, "main")])
        .sources(sources)
        .targets_file(dir.join("targets.json"))
        .dedup_file(dir.join("processed_ids.json"))
        .schedule_file(dir.join("schedule_state.json"))
        .fetcher(fetcher)
        .humanizer(Arc::new(FixedHumanizer))
        .sink("main", sink)
        .build()
        .unwrap()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn five_transport_errors_charge_breaker_once_and_deliver_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let fetcher = ScriptedFetcher::new(|_, _| Err(FetchError::Transport("connection reset".into())));
    let sink = Arc::new(RecordingSink::default());
    let engine = build(dir.path(), fast_settings(), vec![direct("feed", 1)], fetcher.clone(), sink.clone());

    let outcome = engine.poll_now("@alice").await.unwrap();

    assert!(matches!(outcome, DispatchOutcome::GaveUp { attempts: 5, .. }));
    assert_eq!(fetcher.calls().len(), 5);
    assert!(sink.ids().is_empty());

    let health = engine.health();
    assert_eq!(health.targets[0].breaker.failures, 1);
    assert!(!health.targets[0].breaker.is_open);
    assert_eq!(health.stats.give_ups, 1);
    assert_eq!(health.sources[0].fail_count, 5);
}

#[tokio::test]
async fn processed_id_is_not_redelivered_after_restart() {
    let dir = tempfile::tempdir().unwrap();

    let first_sink = Arc::new(RecordingSink::default());
    let engine = build(
        dir.path(),
        fast_settings(),
        vec![direct("feed", 1)],
        ScriptedFetcher::new(|_, _| Ok(items(&["X"]))),
        first_sink.clone(),
    );
    engine.poll_now("@alice").await.unwrap();
    engine.shutdown().await;
    assert_eq!(first_sink.ids(), vec!["X"]);
    drop(engine);

    let second_sink = Arc::new(RecordingSink::default());
    let engine = build(
        dir.path(),
        fast_settings(),
        vec![direct("feed", 1)],
        ScriptedFetcher::new(|_, _| Ok(items(&["X", "Y"]))),
        second_sink.clone(),
    );
    let outcome = engine.poll_now("@alice").await.unwrap();

    assert_eq!(second_sink.ids(), vec!["Y"]);
    match outcome {
        DispatchOutcome::Polled { report, .. } => {
            assert_eq!(report.delivered, 1);
            assert_eq!(report.duplicates, 1);
        }
        other => panic!("expected a polled outcome, got {other:?}"),
    }
}

#[tokio::test]
async fn rate_limit_defers_next_check_without_counting_failures() {
    let dir = tempfile::tempdir().unwrap();
    let reset_at = Utc::now() + ChronoDuration::minutes(10);
    let fetcher = ScriptedFetcher::new(move |_, _| Err(FetchError::RateLimited { reset_at }));
    let sink = Arc::new(RecordingSink::default());
    let engine = build(dir.path(), fast_settings(), vec![direct("feed", 1)], fetcher.clone(), sink);

    let outcome = engine.poll_now("@alice").await.unwrap();

    match outcome {
        DispatchOutcome::RateLimited { next_check_at, .. } => {
            assert!(next_check_at >= reset_at + ChronoDuration::seconds(30));
        }
        other => panic!("expected rate limited, got {other:?}"),
    }
    assert_eq!(fetcher.calls().len(), 1, "rate limit stops the attempt");

    let health = engine.health();
    assert_eq!(health.sources[0].fail_count, 0);
    assert_eq!(health.targets[0].breaker.failures, 0);

    let persisted: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(dir.path().join("schedule_state.json")).unwrap(),
    )
    .unwrap();
    assert!(persisted.get("resetAt").is_some());
}

#[tokio::test]
async fn open_breaker_blocks_dispatch_until_reset() {
    let dir = tempfile::tempdir().unwrap();
    let settings = EngineSettings {
        max_retries: 1,
        breaker_failure_threshold: 1,
        ..fast_settings()
    };
    let fetcher = ScriptedFetcher::new(|_, n| {
        if n == 0 {
            Err(FetchError::Parse("empty body".into()))
        } else {
            Ok(items(&["after-reset"]))
        }
    });
    let sink = Arc::new(RecordingSink::default());
    let engine = build(dir.path(), settings, vec![direct("feed", 1)], fetcher.clone(), sink.clone());

    assert!(matches!(
        engine.poll_now("@alice").await.unwrap(),
        DispatchOutcome::GaveUp { .. }
    ));
    assert!(matches!(
        engine.poll_now("@alice").await.unwrap(),
        DispatchOutcome::BreakerOpen { closes_at: Some(_) }
    ));
    assert_eq!(fetcher.calls().len(), 1, "no attempt while the breaker is open");
    assert_eq!(engine.stats().breaker_skips, 1);

    let breaker = engine.reset_breaker("@alice").unwrap();
    assert!(!breaker.is_open);

    assert!(matches!(
        engine.poll_now("@alice").await.unwrap(),
        DispatchOutcome::Polled { .. }
    ));
    assert_eq!(sink.ids(), vec!["after-reset"]);
}

#[tokio::test]
async fn exhausted_pool_falls_back_to_direct_source() {
    let dir = tempfile::tempdir().unwrap();
    let settings = EngineSettings {
        selection_strategy: SelectionStrategy::Priority,
        ..fast_settings()
    };
    let rendered = SourceSpec::new(
        "browser",
        "https://site.example/{target}",
        ExecutionKind::Rendered,
        0,
        10,
    );
    let fetcher = ScriptedFetcher::new(|source, _| match source.kind {
        ExecutionKind::Rendered => Err(FetchError::PoolExhausted { cap: 3 }),
        ExecutionKind::Direct => Ok(items(&["via-direct"])),
    });
    let sink = Arc::new(RecordingSink::default());
    let engine = build(
        dir.path(),
        settings,
        vec![rendered, direct("feed", 1)],
        fetcher.clone(),
        sink.clone(),
    );

    let outcome = engine.poll_now("@alice").await.unwrap();

    assert!(matches!(outcome, DispatchOutcome::Polled { ref source, .. } if source == "feed"));
    assert_eq!(fetcher.calls(), vec!["browser", "feed"]);
    assert_eq!(sink.ids(), vec!["via-direct"]);

    let browser = engine
        .health()
        .sources
        .into_iter()
        .find(|s| s.name == "browser")
        .unwrap();
    assert_eq!(browser.fail_count, 1);
}

#[tokio::test]
async fn target_without_sources_gives_up_immediately() {
    let dir = tempfile::tempdir().unwrap();
    let fetcher = ScriptedFetcher::new(|_, _| Ok(Vec::new()));
    let sink = Arc::new(RecordingSink::default());
    let engine = build(
        dir.path(),
        fast_settings(),
        vec![direct("feed", 1).with_class("video")],
        fetcher.clone(),
        sink,
    );

    let outcome = engine.poll_now("@alice").await.unwrap();
    assert!(matches!(outcome, DispatchOutcome::GaveUp { attempts: 0, .. }));
    assert!(fetcher.calls().is_empty());
}

#[tokio::test]
async fn operator_edits_are_written_to_targets_file() {
    let dir = tempfile::tempdir().unwrap();
    let fetcher = ScriptedFetcher::new(|_, _| Ok(Vec::new()));
    let sink = Arc::new(RecordingSink::default());
    let engine = build(dir.path(), fast_settings(), vec![direct("feed", 1)], fetcher, sink);
    let file = dir.path().join("targets.json");

    engine.add_target(Target::new("@bob", 2, "main")).unwrap();
    assert!(engine.add_target(Target::new("@bob", 3, "main")).is_err());

    let on_disk = load_targets(&file).unwrap();
    assert_eq!(on_disk.len(), 2);
    assert!(on_disk.iter().any(|t| t.target_id == "@bob"));

    let removed = engine.remove_target("@alice").unwrap();
    assert_eq!(removed.target_id, "@alice");
    assert!(engine.remove_target("@alice").is_err());
    assert!(engine.poll_now("@alice").await.is_err());

    let on_disk = load_targets(&file).unwrap();
    assert_eq!(on_disk.len(), 1);
    assert_eq!(on_disk[0].target_id, "@bob");
}

#[tokio::test]
async fn run_loop_delivers_then_flushes_on_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    let fetcher = ScriptedFetcher::new(|_, _| Ok(items(&["first", "second"])));
    let sink = Arc::new(RecordingSink::default());
    let engine = build(dir.path(), fast_settings(), vec![direct("feed", 1)], fetcher, sink.clone());

    let (tx, rx) = watch::channel(false);
    let handle = tokio::spawn({
        let engine = engine.clone();
        async move { engine.run(rx).await }
    });

    for _ in 0..200 {
        if sink.ids().len() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(sink.ids().len(), 2);

    tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("engine stops after shutdown signal")
        .unwrap();

    let store = DedupStore::load(dir.path().join("processed_ids.json"), 100);
    assert!(store.contains("first") && store.contains("second"));
}

#[tokio::test]
async fn reset_at_the_end_of_time_is_survivable() {
    let dir = tempfile::tempdir().unwrap();
    let reset_at = DateTime::<Utc>::MAX_UTC - ChronoDuration::seconds(10);
    let fetcher = ScriptedFetcher::new(move |_, _| Err(FetchError::RateLimited { reset_at }));
    let sink = Arc::new(RecordingSink::default());
    let engine = build(dir.path(), fast_settings(), vec![direct("feed", 1)], fetcher, sink);

    match engine.poll_now("@alice").await.unwrap() {
        DispatchOutcome::RateLimited { next_check_at, .. } => {
            assert_eq!(next_check_at, DateTime::<Utc>::MAX_UTC);
        }
        other => panic!("expected rate limited, got {other:?}"),
    }

    // New targets inherit the persisted reset without overflowing.
    engine.add_target(Target::new("@bob", 2, "main")).unwrap();
    let health = engine.health();
    let bob = health
        .targets
        .iter()
        .find(|t| t.target.target_id == "@bob")
        .unwrap();
    assert_eq!(
        bob.schedule.as_ref().unwrap().next_check_at,
        Some(DateTime::<Utc>::MAX_UTC)
    );
    assert!(engine.run_fallback_check().await.is_none());
}

#[tokio::test]
async fn fallback_dispatches_highest_priority_stalled_target() {
    let dir = tempfile::tempdir().unwrap();
    let settings = EngineSettings {
        stall_threshold: Duration::ZERO,
        ..fast_settings()
    };
    let fetcher = ScriptedFetcher::new(|_, n| {
        let id = format!("item-{n}");
        Ok(items(&[id.as_str()]))
    });
    let sink = Arc::new(RecordingSink::default());
    let engine = Engine::builder(settings)
        .targets(vec![
            Target::new("@low", 5, "main"),
            Target::new("@high", 1, "main"),
        ])
        .sources(vec![direct("feed", 1)])
        .dedup_file(dir.path().join("processed_ids.json"))
        .schedule_file(dir.path().join("schedule_state.json"))
        .fetcher(fetcher.clone())
        .humanizer(Arc::new(FixedHumanizer))
        .sink("main", sink.clone())
        .build()
        .unwrap();

    // Both targets were due at build time and nothing has polled them since.
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(engine.run_fallback_check().await.as_deref(), Some("@high"));
    assert_eq!(fetcher.calls().len(), 1);
    assert_eq!(sink.ids(), vec!["item-0"]);
    assert_eq!(engine.stats().fallback_dispatches, 1);

    // @high is now scheduled in the future, so @low is next.
    assert_eq!(engine.run_fallback_check().await.as_deref(), Some("@low"));
    assert_eq!(engine.stats().fallback_dispatches, 2);
    assert!(engine.run_fallback_check().await.is_none());
}

#[tokio::test]
async fn back_to_back_forced_polls_are_spaced() {
    let dir = tempfile::tempdir().unwrap();
    let settings = EngineSettings {
        inter_target_delay: Duration::from_millis(200),
        ..fast_settings()
    };
    let fetcher = ScriptedFetcher::new(|_, _| Ok(Vec::new()));
    let sink = Arc::new(RecordingSink::default());
    let engine = build(dir.path(), settings, vec![direct("feed", 1)], fetcher.clone(), sink);

    let started = std::time::Instant::now();
    engine.poll_now("@alice").await.unwrap();
    engine.poll_now("@alice").await.unwrap();

    assert_eq!(fetcher.calls().len(), 2);
    assert!(
        started.elapsed() >= Duration::from_millis(200),
        "second poll ran after {:?}",
        started.elapsed()
    );
}
