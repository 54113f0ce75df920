// Source execution: endpoint building, outcome taxonomy, and the direct and
// rendered transports behind one `Fetcher` seam.

mod direct;
pub mod parse;
mod rendered;

pub use direct::DirectTransport;
pub use rendered::RenderedTransport;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use relay_common::{CandidateItem, ExecutionKind, SourceSpec, Target};
use thiserror::Error;

/// Why one attempt against a source did not yield a batch.
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    /// Connection failure or non-success status.
    #[error("transport error: {0}")]
    Transport(String),

    #[error("timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    /// Empty or structurally invalid response.
    #[error("parse error: {0}")]
    Parse(String),

    /// Explicit throttling with the time the upstream will accept requests again.
    #[error("rate limited until {reset_at}")]
    RateLimited { reset_at: DateTime<Utc> },

    /// No rendering session free under the pool cap.
    #[error("no rendering session available (cap {cap})")]
    PoolExhausted { cap: usize },
}

/// Executes one source for one target.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(
        &self,
        source: &SourceSpec,
        target: &Target,
    ) -> Result<Vec<CandidateItem>, FetchError>;
}

/// Build the request URL for `target` from a source's endpoint template.
pub fn endpoint_for(source: &SourceSpec, target: &Target) -> Result<String, FetchError> {
    let encoded: String = url::form_urlencoded::byte_serialize(target.target_id.as_bytes()).collect();
    let raw = if source.base_endpoint.contains("{target}") {
        source.base_endpoint.replace("{target}", &encoded)
    } else {
        format!("{}/{}", source.base_endpoint.trim_end_matches('/'), encoded)
    };

    let parsed = url::Url::parse(&raw)
        .map_err(|e| FetchError::Transport(format!("invalid endpoint {raw}: {e}")))?;
    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        return Err(FetchError::Transport(format!(
            "only http/https endpoints are allowed, got: {}",
            parsed.scheme()
        )));
    }
    Ok(parsed.into())
}

/// Dispatches to the direct or rendered transport by the source's kind.
pub struct SourceExecutor {
    direct: DirectTransport,
    rendered: Option<RenderedTransport>,
}

impl SourceExecutor {
    pub fn new(direct: DirectTransport, rendered: Option<RenderedTransport>) -> Self {
        Self { direct, rendered }
    }
}

#[async_trait]
impl Fetcher for SourceExecutor {
    async fn fetch(
        &self,
        source: &SourceSpec,
        target: &Target,
    ) -> Result<Vec<CandidateItem>, FetchError> {
        match source.kind {
            ExecutionKind::Direct => self.direct.fetch(source, target).await,
            ExecutionKind::Rendered => match &self.rendered {
                Some(rendered) => rendered.fetch(source, target).await,
                None => Err(FetchError::Transport(
                    "no rendering backend configured".to_string(),
                )),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(endpoint: &str) -> SourceSpec {
        SourceSpec::new("s", endpoint, ExecutionKind::Direct, 1, 5)
    }

    #[test]
    fn placeholder_is_replaced_and_encoded() {
        let t = Target::new("some user", 1, "main");
        let url = endpoint_for(&source("https://mirror.example/{target}/rss"), &t).unwrap();
        assert_eq!(url, "https://mirror.example/some+user/rss");
    }

    #[test]
    fn id_is_appended_without_placeholder() {
        let t = Target::new("UCabc", 1, "main");
        let url = endpoint_for(&source("https://feeds.example/channel/"), &t).unwrap();
        assert_eq!(url, "https://feeds.example/channel/UCabc");
    }

    #[test]
    fn non_http_endpoints_are_rejected() {
        let t = Target::new("x", 1, "main");
        assert!(endpoint_for(&source("file:///etc/{target}"), &t).is_err());
        assert!(endpoint_for(&source("not a url"), &t).is_err());
    }
}
