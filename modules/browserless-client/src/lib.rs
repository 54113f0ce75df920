pub mod error;

pub use error::{BrowserlessError, Result};

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Serialize;
use tracing::debug;

/// Browser viewport dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

/// Per-request browser settings sent alongside the URL.
#[derive(Debug, Clone, Default)]
pub struct ContentOptions {
    pub user_agent: Option<String>,
    pub viewport: Option<Viewport>,
    pub extra_headers: BTreeMap<String, String>,
    /// Extra time to let the page settle after load.
    pub wait_for_timeout: Option<Duration>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ContentRequest<'a> {
    url: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    user_agent: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    viewport: Option<Viewport>,
    #[serde(rename = "setExtraHTTPHeaders", skip_serializing_if = "BTreeMap::is_empty")]
    extra_headers: &'a BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    wait_for_timeout: Option<u64>,
    goto_options: GotoOptions,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GotoOptions {
    wait_until: &'static str,
}

impl<'a> ContentRequest<'a> {
    fn new(url: &'a str, options: &'a ContentOptions) -> Self {
        Self {
            url,
            user_agent: options.user_agent.as_deref(),
            viewport: options.viewport,
            extra_headers: &options.extra_headers,
            wait_for_timeout: options.wait_for_timeout.map(|d| d.as_millis() as u64),
            goto_options: GotoOptions {
                wait_until: "networkidle2",
            },
        }
    }
}

pub struct BrowserlessClient {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl BrowserlessClient {
    pub fn new(base_url: &str, token: Option<&str>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.map(String::from),
        })
    }

    /// Fetch fully-rendered HTML for a URL via the Browserless /content
    /// endpoint, loading it with the given browser profile.
    pub async fn content_with(&self, url: &str, options: &ContentOptions) -> Result<String> {
        let mut endpoint = format!("{}/content", self.base_url);
        if let Some(ref token) = self.token {
            endpoint.push_str(&format!("?token={token}"));
        }

        let body = ContentRequest::new(url, options);
        debug!(url, "Requesting rendered content");

        let resp = self
            .client
            .post(&endpoint)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        if status.as_u16() == 429 {
            let retry_after = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(BrowserlessError::RateLimited { retry_after });
        }
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(BrowserlessError::Api {
                status: status.as_u16(),
                message,
            });
        }

        Ok(resp.text().await?)
    }
}
