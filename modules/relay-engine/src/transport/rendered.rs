use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use relay_common::{CandidateItem, SourceSpec, Target};
use tracing::{debug, info};

use super::{endpoint_for, parse, FetchError};
use crate::humanize::Humanizer;
use crate::session_pool::{PoolError, RenderError, SessionPool};

/// Fetch through a pooled rendering session.
pub struct RenderedTransport {
    pool: Arc<SessionPool>,
    humanizer: Arc<dyn Humanizer>,
    minimum_interval: Duration,
}

impl RenderedTransport {
    pub fn new(
        pool: Arc<SessionPool>,
        humanizer: Arc<dyn Humanizer>,
        minimum_interval: Duration,
    ) -> Self {
        Self {
            pool,
            humanizer,
            minimum_interval,
        }
    }

    pub async fn fetch(
        &self,
        source: &SourceSpec,
        target: &Target,
    ) -> Result<Vec<CandidateItem>, FetchError> {
        let url = endpoint_for(source, target)?;

        let lease = self.pool.acquire(Utc::now()).await.map_err(|e| match e {
            PoolError::Exhausted { cap } => FetchError::PoolExhausted { cap },
            other => FetchError::Transport(other.to_string()),
        })?;

        let fingerprint = self.humanizer.fingerprint();
        debug!(url, source = %source.name, session = %lease.id(), "Rendered fetch");

        let html = lease
            .session()
            .render(&url, &fingerprint)
            .await
            .map_err(|e| match e {
                RenderError::RateLimited { retry_after } => {
                    let wait = retry_after.unwrap_or(self.minimum_interval);
                    let reset_at = parse::reset_after(Utc::now(), wait);
                    info!(url, source = %source.name, %reset_at, "Renderer rate limited");
                    FetchError::RateLimited { reset_at }
                }
                RenderError::Failed(msg) => FetchError::Transport(msg),
            })?;
        drop(lease);

        let fallback_reset = parse::reset_after(Utc::now(), self.minimum_interval);
        let items = parse::parse_rendered(&html, &url, source.link_pattern.as_deref(), fallback_reset)?;
        debug!(url, source = %source.name, items = items.len(), "Rendered page parsed");
        Ok(items)
    }
}
