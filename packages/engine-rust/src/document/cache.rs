//! In-process cache of decoded documents.
//!
//! Each entry remembers the generation of every record type it was decoded
//! with. An entry is served only while all of those types are still
//! current, and redefinition of any of them purges it eagerly.
//!
//! A reader that decoded a document from the store inserts it only if no
//! key was invalidated since it captured [`DocumentCache::epoch`], so a
//! save that commits while the read is in flight cannot be shadowed by the
//! older copy.

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;
use tracing::trace;

use crate::registry::{GeneratedRecordType, RedefinitionObserver, TypeRegistry};

use super::Document;

struct CachedDocument {
    document: Document,
    /// `(type name, generation)` of every type the document was decoded with.
    types: Vec<(String, u64)>,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<String, CachedDocument>,
    /// Keys, least recently inserted first.
    order: VecDeque<String>,
    /// Bumped by every invalidation.
    epoch: u64,
}

impl CacheState {
    fn remove(&mut self, key: &str) -> bool {
        if self.entries.remove(key).is_none() {
            return false;
        }
        self.order.retain(|k| k != key);
        true
    }

    fn purge_type(&mut self, type_name: &str) -> usize {
        let stale: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, cached)| cached.types.iter().any(|(name, _)| name == type_name))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &stale {
            self.remove(key);
        }
        stale.len()
    }
}

/// Bounded cache of decoded documents keyed by canonical key.
pub struct DocumentCache {
    capacity: usize,
    state: Mutex<CacheState>,
}

impl DocumentCache {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            state: Mutex::new(CacheState::default()),
        }
    }

    /// Cached document for `key`, if every type it was decoded with is still
    /// current in `registry`.
    pub fn get(&self, key: &str, registry: &TypeRegistry) -> Option<Document> {
        let mut state = self.state.lock();
        let cached = state.entries.get(key)?;
        let fresh = cached
            .types
            .iter()
            .all(|(name, generation)| registry.generation(name) == Some(*generation));
        if fresh {
            return Some(cached.document.clone());
        }
        trace!(key = %key, "dropping cached document decoded with stale types");
        state.remove(key);
        None
    }

    /// Current invalidation epoch. Capture it before reading a document
    /// that will be passed to [`insert`](Self::insert).
    #[must_use]
    pub fn epoch(&self) -> u64 {
        self.state.lock().epoch
    }

    /// Caches `document` under `key`, evicting the oldest entry when full.
    /// Nothing is cached if any key was invalidated after `epoch` was
    /// captured.
    pub fn insert(
        &self,
        key: String,
        document: Document,
        types: &[&GeneratedRecordType],
        epoch: u64,
    ) {
        if self.capacity == 0 {
            return;
        }
        let types = types
            .iter()
            .filter_map(|ty| {
                ty.handle()
                    .map(|h| (ty.type_name().to_string(), h.generation))
            })
            .collect();
        let mut state = self.state.lock();
        if state.epoch != epoch {
            trace!(key = %key, "not caching document read before an invalidation");
            return;
        }
        state.remove(&key);
        while state.entries.len() >= self.capacity {
            let Some(oldest) = state.order.pop_front() else {
                break;
            };
            state.entries.remove(&oldest);
        }
        state.order.push_back(key.clone());
        state.entries.insert(key, CachedDocument { document, types });
    }

    pub fn invalidate(&self, key: &str) {
        let mut state = self.state.lock();
        state.epoch = state.epoch.wrapping_add(1);
        state.remove(key);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl RedefinitionObserver for DocumentCache {
    fn on_redefine(&self, type_name: &str, _: &GeneratedRecordType, _: &GeneratedRecordType) {
        let purged = self.state.lock().purge_type(type_name);
        if purged > 0 {
            trace!(type_name = %type_name, purged, "purged documents of redefined type");
        }
    }

    fn on_evict(&self, type_name: &str) {
        self.state.lock().purge_type(type_name);
    }

    fn on_clear(&self) {
        let mut state = self.state.lock();
        state.entries.clear();
        state.order.clear();
    }
}
