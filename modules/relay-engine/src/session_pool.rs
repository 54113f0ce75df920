// Bounded pool of long-lived rendering sessions.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use relay_common::to_chrono;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::humanize::Fingerprint;

#[derive(Debug, Error)]
pub enum RenderError {
    /// The renderer or the page reported throttling.
    #[error("rendering rate limited")]
    RateLimited { retry_after: Option<Duration> },

    #[error("rendering failed: {0}")]
    Failed(String),
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("session pool exhausted (cap {cap})")]
    Exhausted { cap: usize },

    #[error("failed to create rendering session: {0}")]
    Create(String),

    #[error("session pool is shut down")]
    Closed,
}

/// One live rendering engine instance.
#[async_trait]
pub trait RenderSession: Send + Sync {
    /// Load `url` with the given fingerprint and return the rendered HTML.
    async fn render(&self, url: &str, fingerprint: &Fingerprint) -> Result<String, RenderError>;

    /// Release the session's underlying resources.
    async fn close(&self);
}

/// Creates rendering sessions on demand.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn create(&self) -> anyhow::Result<Arc<dyn RenderSession>>;

    fn name(&self) -> &str;
}

struct Slot {
    id: Uuid,
    session: Arc<dyn RenderSession>,
    created_at: DateTime<Utc>,
    in_use: bool,
}

#[derive(Default)]
struct PoolState {
    slots: Vec<Slot>,
    /// Sessions being created right now; they count against the cap.
    pending: usize,
    closed: bool,
}

struct PoolInner {
    state: Mutex<PoolState>,
    max_lifetime: chrono::Duration,
}

impl PoolInner {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_expired(&self, slot: &Slot, now: DateTime<Utc>) -> bool {
        now - slot.created_at > self.max_lifetime
    }

    fn release(&self, id: Uuid) {
        let now = Utc::now();
        let expired = {
            let mut state = self.lock();
            let Some(pos) = state.slots.iter().position(|s| s.id == id) else {
                // Already removed by close_all().
                return;
            };
            if state.closed || self.is_expired(&state.slots[pos], now) {
                Some(state.slots.swap_remove(pos).session)
            } else {
                state.slots[pos].in_use = false;
                None
            }
        };

        if let Some(session) = expired {
            debug!(session = %id, "Closing expired session on release");
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move { session.close().await });
            }
        }
    }
}

/// A capacity unit held while a session is being created. Released on drop
/// so a cancelled creation can't leak pool capacity.
struct Reservation<'a> {
    inner: &'a PoolInner,
    armed: bool,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.inner.lock().pending -= 1;
        }
    }
}

/// Exclusive use of one pooled session. Returned to the pool on drop.
pub struct SessionLease {
    id: Uuid,
    session: Arc<dyn RenderSession>,
    created_at: DateTime<Utc>,
    pool: Arc<PoolInner>,
}

impl SessionLease {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn session(&self) -> &dyn RenderSession {
        self.session.as_ref()
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        self.pool.release(self.id);
    }
}

/// Caps concurrent rendering sessions and retires them after a maximum
/// lifetime.
///
/// Acquisition never waits: when every slot is busy it fails with
/// [`PoolError::Exhausted`] so the caller can fall back to a cheaper source.
pub struct SessionPool {
    factory: Arc<dyn SessionFactory>,
    cap: usize,
    inner: Arc<PoolInner>,
}

impl SessionPool {
    pub fn new(factory: Arc<dyn SessionFactory>, cap: usize, max_lifetime: Duration) -> Self {
        info!(factory = factory.name(), cap, ttl_secs = max_lifetime.as_secs(), "Session pool initialized");
        Self {
            factory,
            cap: cap.max(1),
            inner: Arc::new(PoolInner {
                state: Mutex::new(PoolState::default()),
                max_lifetime: to_chrono(max_lifetime),
            }),
        }
    }

    pub fn cap(&self) -> usize {
        self.cap
    }

    /// Sessions currently held by the pool, idle or leased.
    pub fn live_sessions(&self) -> usize {
        self.inner.lock().slots.len()
    }

    /// Lease a session: expired idle sessions are evicted first, then an idle
    /// one is reused, then a new one is created if the cap allows.
    pub async fn acquire(&self, now: DateTime<Utc>) -> Result<SessionLease, PoolError> {
        self.sweep(now).await;

        {
            let mut state = self.inner.lock();
            if state.closed {
                return Err(PoolError::Closed);
            }
            let reusable = state
                .slots
                .iter_mut()
                .find(|s| !s.in_use && now - s.created_at <= self.inner.max_lifetime);
            if let Some(slot) = reusable {
                slot.in_use = true;
                return Ok(SessionLease {
                    id: slot.id,
                    session: slot.session.clone(),
                    created_at: slot.created_at,
                    pool: self.inner.clone(),
                });
            }
            if state.slots.len() + state.pending >= self.cap {
                return Err(PoolError::Exhausted { cap: self.cap });
            }
            state.pending += 1;
        }

        let mut reservation = Reservation {
            inner: &self.inner,
            armed: true,
        };
        let session = self
            .factory
            .create()
            .await
            .map_err(|e| PoolError::Create(e.to_string()))?;

        let id = Uuid::new_v4();
        let registered = {
            let mut state = self.inner.lock();
            state.pending -= 1;
            reservation.armed = false;
            if state.closed {
                false
            } else {
                state.slots.push(Slot {
                    id,
                    session: session.clone(),
                    created_at: now,
                    in_use: true,
                });
                info!(session = %id, factory = self.factory.name(), live = state.slots.len(), "Rendering session created");
                true
            }
        };

        if !registered {
            session.close().await;
            return Err(PoolError::Closed);
        }

        Ok(SessionLease {
            id,
            session,
            created_at: now,
            pool: self.inner.clone(),
        })
    }

    /// Close idle sessions older than the maximum lifetime. Leased sessions
    /// past their lifetime are closed when returned.
    pub async fn sweep(&self, now: DateTime<Utc>) -> usize {
        let expired: Vec<(Uuid, Arc<dyn RenderSession>)> = {
            let mut state = self.inner.lock();
            let (old, keep): (Vec<Slot>, Vec<Slot>) = std::mem::take(&mut state.slots)
                .into_iter()
                .partition(|s| !s.in_use && self.inner.is_expired(s, now));
            state.slots = keep;
            old.into_iter().map(|s| (s.id, s.session)).collect()
        };

        for (id, session) in &expired {
            debug!(session = %id, "Evicting expired session");
            session.close().await;
        }
        if !expired.is_empty() {
            info!(evicted = expired.len(), "Session pool sweep");
        }
        expired.len()
    }

    /// Close every session and refuse further acquisitions.
    pub async fn close_all(&self) {
        let sessions: Vec<Arc<dyn RenderSession>> = {
            let mut state = self.inner.lock();
            state.closed = true;
            state.slots.drain(..).map(|s| s.session).collect()
        };
        let count = sessions.len();
        for session in sessions {
            session.close().await;
        }
        if count > 0 {
            warn!(closed = count, "Session pool shut down");
        }
    }
}
