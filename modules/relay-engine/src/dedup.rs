// Persisted set of delivered item IDs.

use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};

use relay_common::persist::{read_json, write_json_atomic};
use relay_common::Result;
use tracing::{debug, warn};

/// Bounded, insertion-ordered set of processed item IDs backed by a JSON
/// array on disk.
///
/// Membership only changes by insertion, except that once the set grows past
/// `max_items` the oldest IDs are trimmed. Writes go through a temp file and a
/// rename, so a crash mid-write leaves the previous file intact.
#[derive(Debug)]
pub struct DedupStore {
    path: PathBuf,
    max_items: usize,
    order: VecDeque<String>,
    members: HashSet<String>,
    dirty: bool,
}

impl DedupStore {
    /// Load the store from `path`. A missing file starts empty.
    ///
    /// An unreadable file is logged and replaced on the next persist: losing
    /// the record risks duplicate deliveries, which is preferable to refusing
    /// to start.
    pub fn load(path: impl Into<PathBuf>, max_items: usize) -> Self {
        let path = path.into();
        let ids: Vec<String> = match read_json(&path) {
            Ok(Some(ids)) => ids,
            Ok(None) => Vec::new(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Dedup store unreadable, starting empty");
                Vec::new()
            }
        };

        let mut store = Self {
            path,
            max_items: max_items.max(1),
            order: VecDeque::new(),
            members: HashSet::new(),
            dirty: false,
        };
        for id in ids {
            store.insert(id);
        }
        store.dirty = false;
        debug!(path = %store.path.display(), ids = store.len(), "Dedup store loaded");
        store
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn contains(&self, id: &str) -> bool {
        self.members.contains(id)
    }

    /// Record an ID. Returns false if it was already present.
    pub fn insert(&mut self, id: impl Into<String>) -> bool {
        let id = id.into();
        if self.members.contains(&id) {
            return false;
        }
        self.members.insert(id.clone());
        self.order.push_back(id);
        while self.order.len() > self.max_items {
            if let Some(oldest) = self.order.pop_front() {
                self.members.remove(&oldest);
            }
        }
        self.dirty = true;
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// True when in-memory state has changes not yet written to disk.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Write the full set to disk. On failure the store stays dirty so the
    /// next cycle retries.
    pub fn persist(&mut self) -> Result<()> {
        let ids: Vec<&String> = self.order.iter().collect();
        write_json_atomic(&self.path, &ids)?;
        self.dirty = false;
        Ok(())
    }
}
