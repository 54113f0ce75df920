pub mod backends;
pub mod breaker;
pub mod dedup;
pub mod delivery;
pub mod engine;
pub mod humanize;
pub mod orchestrator;
pub mod registry;
pub mod schedule;
pub mod session_pool;
pub mod stats;
pub mod transport;

pub use backends::{BrowserlessFactory, ChromeFactory};
pub use breaker::{BreakerHealth, CircuitBreaker};
pub use dedup::DedupStore;
pub use delivery::{DeliveryPipeline, DeliveryReport, DeliverySink, SinkDirectory, WebhookSink};
pub use engine::{DispatchOutcome, Engine, EngineBuilder, HealthSnapshot, PoolHealth, TargetHealth};
pub use humanize::{Fingerprint, FixedHumanizer, Humanizer, RandomHumanizer};
pub use orchestrator::{PollResult, RetryOrchestrator, RetryPolicy};
pub use registry::{SourceHealth, SourceOutcome, SourceRegistry};
pub use schedule::{AttemptOutcome, SchedulePolicy, ScheduleState, Scheduler};
pub use session_pool::{PoolError, RenderError, RenderSession, SessionFactory, SessionLease, SessionPool};
pub use stats::{EngineStats, StatsSnapshot};
pub use transport::{DirectTransport, FetchError, Fetcher, RenderedTransport, SourceExecutor};
