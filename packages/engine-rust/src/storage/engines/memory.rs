//! In-memory [`DurableStore`] backed by ordered maps.
//!
//! Committed state lives behind one `RwLock`, so a commit is atomic with
//! respect to every reader. Suitable for tests and for deployments that do
//! not need the data to outlive the process.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use dynastore_core::StoreResult;

use crate::storage::session::{DurableStore, StoreSession};
use crate::storage::write_set::{BufferedSession, KvBackend, WriteSet};

type Table = BTreeMap<String, Vec<u8>>;

/// In-memory store. Clones share the same data.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<MemoryBackend>,
}

#[derive(Default)]
struct MemoryBackend {
    tables: RwLock<BTreeMap<String, Table>>,
}

impl MemoryStore {
    /// Creates a new, empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of committed records in `table`.
    #[must_use]
    pub fn table_len(&self, table: &str) -> usize {
        self.inner.tables.read().get(table).map_or(0, BTreeMap::len)
    }

    /// Committed keys of `table`, in order.
    #[must_use]
    pub fn keys(&self, table: &str) -> Vec<String> {
        self.inner
            .tables
            .read()
            .get(table)
            .map(|t| t.keys().cloned().collect())
            .unwrap_or_default()
    }
}

impl KvBackend for MemoryBackend {
    fn get(&self, table: &str, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        Ok(self
            .tables
            .read()
            .get(table)
            .and_then(|t| t.get(key).cloned()))
    }

    fn scan_prefix(&self, table: &str, prefix: &str) -> anyhow::Result<Vec<(String, Vec<u8>)>> {
        let tables = self.tables.read();
        let Some(entries) = tables.get(table) else {
            return Ok(Vec::new());
        };
        Ok(entries
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }

    fn scan_keys(&self, table: &str, prefix: &str) -> anyhow::Result<Vec<String>> {
        let tables = self.tables.read();
        let Some(entries) = tables.get(table) else {
            return Ok(Vec::new());
        };
        Ok(entries
            .range(prefix.to_string()..)
            .map(|(key, _)| key)
            .take_while(|key| key.starts_with(prefix))
            .cloned()
            .collect())
    }

    fn apply(&self, writes: WriteSet) -> anyhow::Result<()> {
        let mut tables = self.tables.write();
        for (table, key, value) in writes.into_ops() {
            match value {
                Some(value) => {
                    tables.entry(table).or_default().insert(key, value);
                }
                None => {
                    if let Some(entries) = tables.get_mut(&table) {
                        entries.remove(&key);
                    }
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn begin_session(&self) -> StoreResult<Box<dyn StoreSession>> {
        Ok(Box::new(BufferedSession::new(Arc::clone(&self.inner))))
    }
}
