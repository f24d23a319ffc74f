//! Buffered session shared by the storage engines.
//!
//! A [`BufferedSession`] keeps its writes in a [`WriteSet`] and reads through
//! it to the committed state of a [`KvBackend`]. On commit the whole set is
//! handed to the backend, which must apply it atomically.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;

use dynastore_core::{StoreError, StoreResult};

use super::session::StoreSession;

/// Committed state of a storage engine.
///
/// Implementations are synchronous; sessions call them between awaits and
/// never hold backend guards across one.
pub trait KvBackend: Send + Sync + 'static {
    /// Committed value of `key` in `table`.
    fn get(&self, table: &str, key: &str) -> anyhow::Result<Option<Vec<u8>>>;

    /// Committed entries of `table` whose key starts with `prefix`, in key
    /// order.
    fn scan_prefix(&self, table: &str, prefix: &str) -> anyhow::Result<Vec<(String, Vec<u8>)>>;

    /// Committed keys of `table` starting with `prefix`, in key order.
    fn scan_keys(&self, table: &str, prefix: &str) -> anyhow::Result<Vec<String>>;

    /// Applies all writes in `writes` atomically, or none of them.
    fn apply(&self, writes: WriteSet) -> anyhow::Result<()>;
}

/// Uncommitted writes of one session.
///
/// `None` marks a deletion. Later writes to the same key replace earlier
/// ones.
#[derive(Debug, Default)]
pub struct WriteSet {
    ops: BTreeMap<(String, String), Option<Vec<u8>>>,
}

impl WriteSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, table: &str, key: &str, value: Vec<u8>) {
        self.ops
            .insert((table.to_string(), key.to_string()), Some(value));
    }

    pub fn delete(&mut self, table: &str, key: &str) {
        self.ops.insert((table.to_string(), key.to_string()), None);
    }

    /// `None` if the session never touched the key, `Some(None)` if it
    /// deleted it.
    #[must_use]
    pub fn lookup(&self, table: &str, key: &str) -> Option<Option<&[u8]>> {
        self.ops
            .get(&(table.to_string(), key.to_string()))
            .map(Option::as_deref)
    }

    /// Layers this set's writes over committed scan results.
    #[must_use]
    pub fn overlay_scan(
        &self,
        table: &str,
        prefix: &str,
        committed: Vec<(String, Vec<u8>)>,
    ) -> Vec<(String, Vec<u8>)> {
        let mut merged: BTreeMap<String, Vec<u8>> = committed.into_iter().collect();
        for ((_, key), op) in self.touched(table, prefix) {
            match op {
                Some(value) => {
                    merged.insert(key.clone(), value.clone());
                }
                None => {
                    merged.remove(key);
                }
            }
        }
        merged.into_iter().collect()
    }

    /// Layers this set's writes over committed keys.
    #[must_use]
    pub fn overlay_keys(&self, table: &str, prefix: &str, committed: Vec<String>) -> Vec<String> {
        let mut merged: BTreeSet<String> = committed.into_iter().collect();
        for ((_, key), op) in self.touched(table, prefix) {
            if op.is_some() {
                merged.insert(key.clone());
            } else {
                merged.remove(key);
            }
        }
        merged.into_iter().collect()
    }

    fn touched<'a>(
        &'a self,
        table: &'a str,
        prefix: &'a str,
    ) -> impl Iterator<Item = (&'a (String, String), &'a Option<Vec<u8>>)> {
        self.ops
            .range((table.to_string(), prefix.to_string())..)
            .take_while(move |((op_table, key), _)| op_table == table && key.starts_with(prefix))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Consumes the set, yielding `(table, key, value)` in table/key order.
    pub fn into_ops(self) -> impl Iterator<Item = (String, String, Option<Vec<u8>>)> {
        self.ops
            .into_iter()
            .map(|((table, key), value)| (table, key, value))
    }
}

/// [`StoreSession`] that buffers writes until commit.
pub struct BufferedSession<B: KvBackend> {
    backend: Arc<B>,
    writes: WriteSet,
}

impl<B: KvBackend> BufferedSession<B> {
    #[must_use]
    pub fn new(backend: Arc<B>) -> Self {
        Self {
            backend,
            writes: WriteSet::new(),
        }
    }
}

#[async_trait]
impl<B: KvBackend> StoreSession for BufferedSession<B> {
    async fn get(&mut self, table: &str, key: &str) -> StoreResult<Option<Vec<u8>>> {
        if let Some(buffered) = self.writes.lookup(table, key) {
            return Ok(buffered.map(<[u8]>::to_vec));
        }
        self.backend.get(table, key).map_err(StoreError::io)
    }

    async fn put(&mut self, table: &str, key: &str, value: Vec<u8>) -> StoreResult<()> {
        self.writes.put(table, key, value);
        Ok(())
    }

    async fn delete(&mut self, table: &str, key: &str) -> StoreResult<()> {
        self.writes.delete(table, key);
        Ok(())
    }

    async fn scan_prefix(
        &mut self,
        table: &str,
        prefix: &str,
    ) -> StoreResult<Vec<(String, Vec<u8>)>> {
        let committed = self
            .backend
            .scan_prefix(table, prefix)
            .map_err(StoreError::io)?;
        Ok(self.writes.overlay_scan(table, prefix, committed))
    }

    async fn scan_keys(&mut self, table: &str, prefix: &str) -> StoreResult<Vec<String>> {
        let committed = self
            .backend
            .scan_keys(table, prefix)
            .map_err(StoreError::io)?;
        Ok(self.writes.overlay_keys(table, prefix, committed))
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        let Self { backend, writes } = *self;
        if writes.is_empty() {
            return Ok(());
        }
        let count = writes.len();
        backend.apply(writes).map_err(StoreError::io)?;
        tracing::trace!(writes = count, "session committed");
        Ok(())
    }

    async fn rollback(self: Box<Self>) {
        if !self.writes.is_empty() {
            tracing::debug!(writes = self.writes.len(), "session rolled back");
        }
    }
}
