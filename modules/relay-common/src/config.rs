use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use tracing::info;

use crate::error::{RelayError, Result};
use crate::persist::{read_json, write_json_atomic};
use crate::types::{SourceSpec, Target};

/// How the Source Registry chooses among active sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SelectionStrategy {
    /// Uniform over active sources.
    Random,
    /// Lowest `priority` value among active sources.
    Priority,
    /// Least-recently-used active source.
    #[default]
    RoundRobin,
}

impl FromStr for SelectionStrategy {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "random" => Ok(SelectionStrategy::Random),
            "priority" => Ok(SelectionStrategy::Priority),
            "roundrobin" | "round_robin" | "round-robin" => Ok(SelectionStrategy::RoundRobin),
            other => Err(RelayError::Config(format!(
                "unknown selection strategy '{other}' (expected random, priority or roundRobin)"
            ))),
        }
    }
}

/// Tunables for retry, breaker, pool, scheduling and delivery.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    // Retry orchestrator
    pub max_retries: u32,
    pub base_delay: Duration,
    pub growth_factor: f64,
    pub cap_delay: Duration,
    /// Fraction of each backoff delay used as ± jitter.
    pub retry_jitter: f64,
    pub attempt_timeout: Duration,
    pub selection_strategy: SelectionStrategy,

    // Circuit breaker (one per target)
    pub breaker_failure_threshold: u32,
    pub breaker_reset_timeout: Duration,

    // Source registry
    pub reactivation_cooldown_min: Duration,
    pub reactivation_cooldown_max: Duration,

    // Session pool
    pub pool_cap: usize,
    pub session_max_lifetime: Duration,
    pub pool_sweep_interval: Duration,

    // Scheduler
    pub base_interval: Duration,
    pub interval_jitter: Duration,
    pub minimum_interval: Duration,
    pub rate_limit_safety_buffer: Duration,
    pub inter_target_delay: Duration,
    pub fallback_period: Duration,
    pub stall_threshold: Duration,

    // Delivery
    pub inter_item_delay: Duration,
    pub dedup_max_items: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_secs(2),
            growth_factor: 2.0,
            cap_delay: Duration::from_secs(60),
            retry_jitter: 0.3,
            attempt_timeout: Duration::from_secs(20),
            selection_strategy: SelectionStrategy::RoundRobin,
            breaker_failure_threshold: 3,
            breaker_reset_timeout: Duration::from_secs(30 * 60),
            reactivation_cooldown_min: Duration::from_secs(10 * 60),
            reactivation_cooldown_max: Duration::from_secs(30 * 60),
            pool_cap: 3,
            session_max_lifetime: Duration::from_secs(30 * 60),
            pool_sweep_interval: Duration::from_secs(60),
            base_interval: Duration::from_secs(10 * 60),
            interval_jitter: Duration::from_secs(2 * 60),
            minimum_interval: Duration::from_secs(60),
            rate_limit_safety_buffer: Duration::from_secs(30),
            inter_target_delay: Duration::from_secs(5),
            fallback_period: Duration::from_secs(2 * 60 * 60),
            stall_threshold: Duration::from_secs(60 * 60),
            inter_item_delay: Duration::from_millis(1500),
            dedup_max_items: 2000,
        }
    }
}

impl EngineSettings {
    /// Defaults overridden by any `RELAY_*` tunables present in the environment.
    pub fn from_env() -> Result<Self> {
        let d = Self::default();
        Ok(Self {
            max_retries: env_parse("RELAY_MAX_RETRIES", d.max_retries)?,
            base_delay: env_millis("RELAY_BASE_DELAY_MS", d.base_delay)?,
            growth_factor: env_parse("RELAY_GROWTH_FACTOR", d.growth_factor)?,
            cap_delay: env_millis("RELAY_CAP_DELAY_MS", d.cap_delay)?,
            retry_jitter: env_parse("RELAY_RETRY_JITTER", d.retry_jitter)?,
            attempt_timeout: env_millis("RELAY_ATTEMPT_TIMEOUT_MS", d.attempt_timeout)?,
            selection_strategy: env_parse("RELAY_SELECTION_STRATEGY", d.selection_strategy)?,
            breaker_failure_threshold: env_parse(
                "RELAY_BREAKER_THRESHOLD",
                d.breaker_failure_threshold,
            )?,
            breaker_reset_timeout: env_millis("RELAY_BREAKER_RESET_MS", d.breaker_reset_timeout)?,
            reactivation_cooldown_min: env_millis(
                "RELAY_COOLDOWN_MIN_MS",
                d.reactivation_cooldown_min,
            )?,
            reactivation_cooldown_max: env_millis(
                "RELAY_COOLDOWN_MAX_MS",
                d.reactivation_cooldown_max,
            )?,
            pool_cap: env_parse("RELAY_POOL_CAP", d.pool_cap)?,
            session_max_lifetime: env_millis("RELAY_SESSION_TTL_MS", d.session_max_lifetime)?,
            pool_sweep_interval: env_millis("RELAY_POOL_SWEEP_MS", d.pool_sweep_interval)?,
            base_interval: env_millis("RELAY_BASE_INTERVAL_MS", d.base_interval)?,
            interval_jitter: env_millis("RELAY_INTERVAL_JITTER_MS", d.interval_jitter)?,
            minimum_interval: env_millis("RELAY_MIN_INTERVAL_MS", d.minimum_interval)?,
            rate_limit_safety_buffer: env_millis(
                "RELAY_RATE_LIMIT_BUFFER_MS",
                d.rate_limit_safety_buffer,
            )?,
            inter_target_delay: env_millis("RELAY_INTER_TARGET_DELAY_MS", d.inter_target_delay)?,
            fallback_period: env_millis("RELAY_FALLBACK_PERIOD_MS", d.fallback_period)?,
            stall_threshold: env_millis("RELAY_STALL_THRESHOLD_MS", d.stall_threshold)?,
            inter_item_delay: env_millis("RELAY_INTER_ITEM_DELAY_MS", d.inter_item_delay)?,
            dedup_max_items: env_parse("RELAY_DEDUP_MAX_ITEMS", d.dedup_max_items)?,
        })
    }
}

/// Which engine backs rendered sources.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderBackend {
    /// No rendering; rendered sources always fail over to direct ones.
    None,
    /// Local headless Chromium, one profile directory per session.
    Chrome { bin: String },
    /// Remote Browserless instance.
    Browserless {
        base_url: String,
        token: Option<String>,
    },
}

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub targets_file: PathBuf,
    pub sources_file: PathBuf,

    // Control surface
    pub host: String,
    pub port: u16,

    pub render_backend: RenderBackend,
    pub engine: EngineSettings,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let data_dir = PathBuf::from(env::var("RELAY_DATA_DIR").unwrap_or_else(|_| "data".into()));
        let targets_file = env::var("RELAY_TARGETS_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("targets.json"));
        let sources_file = env::var("RELAY_SOURCES_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("sources.json"));

        let render_backend = match env::var("RENDER_BACKEND")
            .unwrap_or_else(|_| "none".into())
            .to_ascii_lowercase()
            .as_str()
        {
            "none" | "" => RenderBackend::None,
            "chrome" => RenderBackend::Chrome {
                bin: env::var("CHROME_BIN").unwrap_or_else(|_| "chromium".to_string()),
            },
            "browserless" => RenderBackend::Browserless {
                base_url: required_env("BROWSERLESS_URL")?,
                token: env::var("BROWSERLESS_TOKEN").ok().filter(|t| !t.is_empty()),
            },
            other => {
                return Err(RelayError::Config(format!(
                    "RENDER_BACKEND must be none, chrome or browserless, got '{other}'"
                )))
            }
        };

        Ok(Self {
            data_dir,
            targets_file,
            sources_file,
            host: env::var("RELAY_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            port: env_parse("RELAY_PORT", 3100)?,
            render_backend,
            engine: EngineSettings::from_env()?,
        })
    }

    pub fn dedup_file(&self) -> PathBuf {
        self.data_dir.join("processed_ids.json")
    }

    pub fn schedule_file(&self) -> PathBuf {
        self.data_dir.join("schedule_state.json")
    }

    /// Log the effective configuration without secrets.
    pub fn log_redacted(&self) {
        let backend = match &self.render_backend {
            RenderBackend::None => "none".to_string(),
            RenderBackend::Chrome { bin } => format!("chrome ({bin})"),
            RenderBackend::Browserless { base_url, token } => format!(
                "browserless ({base_url}, token {})",
                if token.is_some() { "set" } else { "unset" }
            ),
        };
        info!(
            data_dir = %self.data_dir.display(),
            targets_file = %self.targets_file.display(),
            sources_file = %self.sources_file.display(),
            bind = %format!("{}:{}", self.host, self.port),
            render_backend = %backend,
            max_retries = self.engine.max_retries,
            pool_cap = self.engine.pool_cap,
            base_interval_secs = self.engine.base_interval.as_secs(),
            strategy = ?self.engine.selection_strategy,
            "Configuration loaded"
        );
    }
}

/// Load the operator's target list. A missing file means no targets yet.
pub fn load_targets(path: &Path) -> Result<Vec<Target>> {
    Ok(read_json(path)?.unwrap_or_default())
}

pub fn save_targets(path: &Path, targets: &[Target]) -> Result<()> {
    write_json_atomic(path, targets)
}

/// Load the operator's source list. Sources are required to poll anything.
pub fn load_sources(path: &Path) -> Result<Vec<SourceSpec>> {
    let sources: Vec<SourceSpec> = read_json(path)?.ok_or_else(|| {
        RelayError::Config(format!("sources file {} not found", path.display()))
    })?;
    if sources.is_empty() {
        return Err(RelayError::Config(format!(
            "sources file {} lists no sources",
            path.display()
        )));
    }
    Ok(sources)
}

fn required_env(key: &str) -> Result<String> {
    env::var(key).map_err(|_| RelayError::Config(format!("{key} environment variable is required")))
}

fn env_parse<T: FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| RelayError::Config(format!("{key}: {e}"))),
        Err(_) => Ok(default),
    }
}

fn env_millis(key: &str, default: Duration) -> Result<Duration> {
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Duration::from_millis)
            .map_err(|e| RelayError::Config(format!("{key}: {e}"))),
        Err(_) => Ok(default),
    }
}
