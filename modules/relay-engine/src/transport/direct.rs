use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use relay_common::{CandidateItem, SourceSpec, Target};
use reqwest::header::{ACCEPT, ACCEPT_LANGUAGE, USER_AGENT};
use reqwest::StatusCode;
use tracing::{debug, info, warn};

use super::{endpoint_for, parse, FetchError};
use crate::humanize::Humanizer;

const FEED_ACCEPT: &str =
    "application/rss+xml, application/atom+xml, application/feed+json, application/xml;q=0.9, text/xml;q=0.9, */*;q=0.8";

/// Plain HTTP fetch of a feed endpoint.
pub struct DirectTransport {
    client: reqwest::Client,
    humanizer: Arc<dyn Humanizer>,
    /// Used as the reset time when a 429 carries no usable header.
    minimum_interval: Duration,
}

impl DirectTransport {
    pub fn new(
        timeout: Duration,
        humanizer: Arc<dyn Humanizer>,
        minimum_interval: Duration,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build direct HTTP client")?;
        Ok(Self {
            client,
            humanizer,
            minimum_interval,
        })
    }

    pub async fn fetch(
        &self,
        source: &SourceSpec,
        target: &Target,
    ) -> Result<Vec<CandidateItem>, FetchError> {
        let url = endpoint_for(source, target)?;
        let fingerprint = self.humanizer.fingerprint();
        debug!(url, source = %source.name, "Direct fetch");

        let resp = self
            .client
            .get(&url)
            .header(USER_AGENT, &fingerprint.user_agent)
            .header(ACCEPT_LANGUAGE, &fingerprint.accept_language)
            .header(ACCEPT, FEED_ACCEPT)
            .send()
            .await
            .map_err(|e| FetchError::Transport(e.to_string()))?;

        let status = resp.status();
        let now = Utc::now();
        let throttled = status == StatusCode::TOO_MANY_REQUESTS
            || (status == StatusCode::SERVICE_UNAVAILABLE
                && resp.headers().contains_key("retry-after"));
        if throttled {
            let reset_at = parse::rate_limit_reset(resp.headers(), now)
                .unwrap_or_else(|| parse::reset_after(now, self.minimum_interval));
            info!(url, source = %source.name, %reset_at, "Upstream rate limited");
            return Err(FetchError::RateLimited { reset_at });
        }
        if !status.is_success() {
            warn!(url, source = %source.name, status = status.as_u16(), "Non-success status");
            return Err(FetchError::Transport(format!("HTTP {status}")));
        }

        let body = resp
            .bytes()
            .await
            .map_err(|e| FetchError::Transport(format!("failed to read body: {e}")))?;
        let items = parse::parse_feed(&body)?;
        debug!(url, source = %source.name, items = items.len(), "Feed parsed");
        Ok(items)
    }
}
