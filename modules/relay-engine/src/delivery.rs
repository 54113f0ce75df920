// Dedup filtering and ordered delivery of new items to a sink.

use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use relay_common::{ItemBatch, NewItem};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::dedup::DedupStore;
use crate::stats::EngineStats;

/// Downstream receiver of new items. Formatting is the sink's business.
#[async_trait]
pub trait DeliverySink: Send + Sync {
    async fn deliver(&self, item: &NewItem) -> anyhow::Result<()>;
}

/// POSTs each item as JSON to an HTTP endpoint.
pub struct WebhookSink {
    url: String,
    http: reqwest::Client,
}

impl WebhookSink {
    pub fn new(url: impl Into<String>, http: reqwest::Client) -> Self {
        Self {
            url: url.into(),
            http,
        }
    }
}

#[async_trait]
impl DeliverySink for WebhookSink {
    async fn deliver(&self, item: &NewItem) -> anyhow::Result<()> {
        let resp = self.http.post(&self.url).json(item).send().await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            warn!(status = %status, body = %body, "Sink returned non-success");
            anyhow::bail!("sink returned {status}");
        }

        Ok(())
    }
}

/// Resolves a target's `sink_ref`: registered names first, then `http(s)://`
/// references as webhook sinks (created once and cached).
pub struct SinkDirectory {
    named: HashMap<String, Arc<dyn DeliverySink>>,
    webhooks: Mutex<HashMap<String, Arc<dyn DeliverySink>>>,
    http: reqwest::Client,
}

impl SinkDirectory {
    pub fn new(http: reqwest::Client) -> Self {
        Self {
            named: HashMap::new(),
            webhooks: Mutex::new(HashMap::new()),
            http,
        }
    }

    pub fn register(&mut self, name: impl Into<String>, sink: Arc<dyn DeliverySink>) {
        self.named.insert(name.into(), sink);
    }

    pub fn resolve(&self, sink_ref: &str) -> Option<Arc<dyn DeliverySink>> {
        if let Some(sink) = self.named.get(sink_ref) {
            return Some(sink.clone());
        }
        if !(sink_ref.starts_with("http://") || sink_ref.starts_with("https://")) {
            return None;
        }
        let mut webhooks = self.webhooks.lock().unwrap_or_else(|e| e.into_inner());
        let sink = webhooks
            .entry(sink_ref.to_string())
            .or_insert_with(|| Arc::new(WebhookSink::new(sink_ref, self.http.clone())));
        Some(sink.clone())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryReport {
    pub delivered: usize,
    pub duplicates: usize,
    pub failed: usize,
}

/// Filters a batch through the dedup store and delivers the rest in order,
/// persisting the store after every confirmed delivery.
pub struct DeliveryPipeline {
    inter_item_delay: Duration,
    stats: Arc<EngineStats>,
}

fn lock(m: &Mutex<DedupStore>) -> std::sync::MutexGuard<'_, DedupStore> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl DeliveryPipeline {
    pub fn new(inter_item_delay: Duration, stats: Arc<EngineStats>) -> Self {
        Self {
            inter_item_delay,
            stats,
        }
    }

    /// Deliver every unseen item of `batch` to `sink`, newest first.
    ///
    /// An item is marked only after the sink confirms it. A failed delivery
    /// leaves it unmarked so the next successful poll retries it. If the
    /// store can't be written the ID stays recorded in memory and the write
    /// is retried on the next cycle.
    pub async fn deliver(
        &self,
        batch: &ItemBatch,
        sink: &dyn DeliverySink,
        dedup: &Mutex<DedupStore>,
    ) -> DeliveryReport {
        let mut report = DeliveryReport::default();
        self.flush_pending(dedup);

        // Stable sort: undated items keep arrival order after dated ones.
        let mut items: Vec<_> = batch.items.iter().collect();
        items.sort_by_key(|item| Reverse(item.created_at));

        let mut first = true;
        for item in items {
            if lock(dedup).contains(&item.id) {
                report.duplicates += 1;
                self.stats.record_duplicate();
                continue;
            }

            if !first && !self.inter_item_delay.is_zero() {
                tokio::time::sleep(self.inter_item_delay).await;
            }
            first = false;

            let new_item = NewItem::from_candidate(batch, item);
            match sink.deliver(&new_item).await {
                Ok(()) => {
                    report.delivered += 1;
                    self.stats.record_delivered();
                    debug!(target_id = %batch.target_id, item_id = %item.id, "Delivered");

                    let mut store = lock(dedup);
                    store.insert(item.id.clone());
                    if let Err(e) = store.persist() {
                        self.stats.record_persistence_error();
                        warn!(item_id = %item.id, error = %e, "Failed to persist dedup store, will retry next cycle");
                    }
                }
                Err(e) => {
                    report.failed += 1;
                    self.stats.record_delivery_failure();
                    warn!(target_id = %batch.target_id, item_id = %item.id, error = %e, "Delivery failed, item left for next poll");
                }
            }
        }

        if report.delivered > 0 || report.failed > 0 {
            info!(
                target_id = %batch.target_id,
                delivered = report.delivered,
                duplicates = report.duplicates,
                failed = report.failed,
                "Batch delivered"
            );
        }
        report
    }

    /// Retry a write that failed on an earlier cycle.
    pub fn flush_pending(&self, dedup: &Mutex<DedupStore>) {
        let mut store = lock(dedup);
        if store.is_dirty() {
            match store.persist() {
                Ok(()) => info!(ids = store.len(), "Recovered pending dedup store write"),
                Err(e) => {
                    self.stats.record_persistence_error();
                    warn!(error = %e, "Dedup store still not writable");
                }
            }
        }
    }
}
