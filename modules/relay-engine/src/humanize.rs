// Resilience heuristics: timing jitter and browser fingerprints.
//
// Everything random about *how* the engine looks to an upstream goes through
// the `Humanizer` trait so tests can swap in `FixedHumanizer` and get a fully
// deterministic state machine.

use std::time::Duration;

use rand::Rng;
use serde::Serialize;

/// Identifying traits presented to an upstream on one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Fingerprint {
    pub user_agent: String,
    pub accept_language: String,
    pub viewport_width: u32,
    pub viewport_height: u32,
    /// How long a rendered page is given to settle before capture.
    pub settle: Duration,
}

const PROFILES: &[(&str, &str, u32, u32, u64)] = &[
    (
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
        "en-US,en;q=0.9",
        1920,
        1080,
        1800,
    ),
    (
        "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Safari/605.1.15",
        "en-GB,en;q=0.8",
        1440,
        900,
        2200,
    ),
    (
        "Mozilla/5.0 (X11; Linux x86_64; rv:125.0) Gecko/20100101 Firefox/125.0",
        "en-US,en;q=0.7",
        1366,
        768,
        1500,
    ),
    (
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:124.0) Gecko/20100101 Firefox/124.0",
        "en-US,en;q=0.5",
        1536,
        864,
        2600,
    ),
];

fn profile(index: usize) -> Fingerprint {
    let (ua, lang, w, h, settle_ms) = PROFILES[index % PROFILES.len()];
    Fingerprint {
        user_agent: ua.to_string(),
        accept_language: lang.to_string(),
        viewport_width: w,
        viewport_height: h,
        settle: Duration::from_millis(settle_ms),
    }
}

/// Pluggable source of timing variance and request fingerprints.
pub trait Humanizer: Send + Sync {
    /// `base` shifted by a uniform offset in `[-max_offset, +max_offset]`,
    /// never below zero.
    fn jitter(&self, base: Duration, max_offset: Duration) -> Duration;

    /// A duration drawn from `[min, max]`.
    fn between(&self, min: Duration, max: Duration) -> Duration;

    /// Fingerprint for the next outbound request.
    fn fingerprint(&self) -> Fingerprint;
}

/// Production humanizer backed by the thread-local RNG.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomHumanizer;

impl Humanizer for RandomHumanizer {
    fn jitter(&self, base: Duration, max_offset: Duration) -> Duration {
        let spread = max_offset.as_millis() as i64;
        if spread == 0 {
            return base;
        }
        let offset = rand::rng().random_range(-spread..=spread);
        let millis = (base.as_millis() as i64 + offset).max(0);
        Duration::from_millis(millis as u64)
    }

    fn between(&self, min: Duration, max: Duration) -> Duration {
        if max <= min {
            return min;
        }
        let ms = rand::rng().random_range(min.as_millis() as u64..=max.as_millis() as u64);
        Duration::from_millis(ms)
    }

    fn fingerprint(&self) -> Fingerprint {
        profile(rand::rng().random_range(0..PROFILES.len()))
    }
}

/// Deterministic humanizer: no jitter, lower bound of every range, and the
/// same fingerprint every time.
#[derive(Debug, Default, Clone, Copy)]
pub struct FixedHumanizer;

impl Humanizer for FixedHumanizer {
    fn jitter(&self, base: Duration, _max_offset: Duration) -> Duration {
        base
    }

    fn between(&self, min: Duration, _max: Duration) -> Duration {
        min
    }

    fn fingerprint(&self) -> Fingerprint {
        profile(0)
    }
}
