// Concrete rendering sessions: a remote Browserless instance or a local
// headless Chromium.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use browserless_client::{BrowserlessClient, BrowserlessError, ContentOptions, Viewport};
use tracing::{debug, info, warn};

use crate::humanize::Fingerprint;
use crate::session_pool::{RenderError, RenderSession, SessionFactory};

// --- Browserless ---

pub struct BrowserlessFactory {
    base_url: String,
    token: Option<String>,
    timeout: Duration,
}

impl BrowserlessFactory {
    pub fn new(base_url: &str, token: Option<&str>, timeout: Duration) -> Self {
        info!(base_url, "Browserless rendering backend");
        Self {
            base_url: base_url.to_string(),
            token: token.map(String::from),
            timeout,
        }
    }
}

#[async_trait]
impl SessionFactory for BrowserlessFactory {
    async fn create(&self) -> anyhow::Result<Arc<dyn RenderSession>> {
        let client = BrowserlessClient::new(&self.base_url, self.token.as_deref(), self.timeout)
            .context("Failed to build Browserless client")?;
        Ok(Arc::new(BrowserlessSession { client }))
    }

    fn name(&self) -> &str {
        "browserless"
    }
}

/// One Browserless client with its own connection pool.
struct BrowserlessSession {
    client: BrowserlessClient,
}

fn content_options(fp: &Fingerprint) -> ContentOptions {
    let mut options = ContentOptions {
        user_agent: Some(fp.user_agent.clone()),
        viewport: Some(Viewport {
            width: fp.viewport_width,
            height: fp.viewport_height,
        }),
        wait_for_timeout: Some(fp.settle),
        ..Default::default()
    };
    options
        .extra_headers
        .insert("Accept-Language".to_string(), fp.accept_language.clone());
    options
}

#[async_trait]
impl RenderSession for BrowserlessSession {
    async fn render(&self, url: &str, fingerprint: &Fingerprint) -> Result<String, RenderError> {
        match self.client.content_with(url, &content_options(fingerprint)).await {
            Ok(html) if html.is_empty() => Err(RenderError::Failed("empty HTML response".into())),
            Ok(html) => Ok(html),
            Err(BrowserlessError::RateLimited { retry_after }) => {
                Err(RenderError::RateLimited { retry_after })
            }
            Err(e) => Err(RenderError::Failed(e.to_string())),
        }
    }

    async fn close(&self) {}
}

// --- Local Chromium ---

pub struct ChromeFactory {
    chrome_bin: String,
}

impl ChromeFactory {
    pub fn new(chrome_bin: impl Into<String>) -> Self {
        let chrome_bin = chrome_bin.into();
        info!(chrome_bin, "Chrome rendering backend");
        Self { chrome_bin }
    }
}

#[async_trait]
impl SessionFactory for ChromeFactory {
    async fn create(&self) -> anyhow::Result<Arc<dyn RenderSession>> {
        let profile = tempfile::tempdir().context("Failed to create temp profile dir")?;
        debug!(profile = %profile.path().display(), "Chrome profile created");
        Ok(Arc::new(ChromeSession {
            chrome_bin: self.chrome_bin.clone(),
            profile: Mutex::new(Some(profile)),
        }))
    }

    fn name(&self) -> &str {
        "chrome"
    }
}

/// A persistent Chromium profile directory; cookies and cache carry over
/// between renders until the session is closed.
struct ChromeSession {
    chrome_bin: String,
    profile: Mutex<Option<tempfile::TempDir>>,
}

#[async_trait]
impl RenderSession for ChromeSession {
    async fn render(&self, url: &str, fingerprint: &Fingerprint) -> Result<String, RenderError> {
        let profile_dir = self
            .profile
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|p| p.path().display().to_string())
            .ok_or_else(|| RenderError::Failed("session already closed".into()))?;

        let lang = fingerprint
            .accept_language
            .split(',')
            .next()
            .unwrap_or("en-US");
        let args = [
            "--headless".to_string(),
            "--no-sandbox".to_string(),
            "--disable-gpu".to_string(),
            "--disable-dev-shm-usage".to_string(),
            format!("--user-data-dir={profile_dir}"),
            format!("--user-agent={}", fingerprint.user_agent),
            format!("--lang={lang}"),
            format!(
                "--window-size={},{}",
                fingerprint.viewport_width, fingerprint.viewport_height
            ),
            format!("--virtual-time-budget={}", fingerprint.settle.as_millis()),
            "--dump-dom".to_string(),
            url.to_string(),
        ];

        let output = tokio::process::Command::new(&self.chrome_bin)
            .args(&args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| RenderError::Failed(format!("failed to run Chrome: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(url, stderr = %stderr, "Chrome exited with error");
            return Err(RenderError::Failed(format!("Chrome exited with {}", output.status)));
        }
        if output.stdout.is_empty() {
            return Err(RenderError::Failed("empty DOM output".into()));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn close(&self) {
        let profile = self.profile.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(dir) = profile {
            if let Err(e) = dir.close() {
                warn!(error = %e, "Failed to remove Chrome profile dir");
            }
        }
    }
}
