//! Persistent [`DurableStore`] on top of `redb`.
//!
//! Each logical table maps to a `redb` table of `&str -> &[u8]`. A session's
//! write set is applied in a single write transaction, so commits are atomic
//! and durable once `commit` returns.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use redb::backends::InMemoryBackend;
use redb::{Database, ReadableTable, TableDefinition, TableError};
use tracing::info;

use dynastore_core::StoreResult;

use crate::storage::record::{
    BACKLINKS_TABLE, BLOBS_TABLE, BLOB_CHUNKS_TABLE, DOCUMENTS_TABLE, LINKS_TABLE, LOCKS_TABLE,
    TYPES_TABLE,
};
use crate::storage::session::{DurableStore, StoreSession};
use crate::storage::write_set::{BufferedSession, KvBackend, WriteSet};

fn table(name: &str) -> TableDefinition<'_, &'static str, &'static [u8]> {
    TableDefinition::new(name)
}

/// `redb`-backed store. Clones share the same database.
#[derive(Clone, Debug)]
pub struct RedbStore {
    inner: Arc<RedbBackend>,
}

#[derive(Debug)]
struct RedbBackend {
    db: Database,
}

impl RedbStore {
    /// Opens or creates the database file at `path`.
    ///
    /// # Errors
    ///
    /// Fails if the parent directory cannot be created or the file is not a
    /// valid database.
    pub fn persistent(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!("loading store database from {}", path.to_string_lossy());
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!(
                    "failed to create database directory at {}",
                    path.to_string_lossy()
                )
            })?;
        }
        let db = Database::builder()
            .create(path)
            .context("failed to open store database")?;
        Self::open(db)
    }

    /// Creates a database that lives only in memory.
    ///
    /// # Errors
    ///
    /// Fails if the initial table setup cannot be committed.
    pub fn in_memory() -> Result<Self> {
        info!("using in-memory store database");
        let db = Database::builder().create_with_backend(InMemoryBackend::new())?;
        Self::open(db)
    }

    /// Wraps an open database, creating the engine's tables if missing.
    ///
    /// # Errors
    ///
    /// Fails if the table setup cannot be committed.
    pub fn open(db: Database) -> Result<Self> {
        let write_tx = db.begin_write()?;
        for name in [
            TYPES_TABLE,
            DOCUMENTS_TABLE,
            BLOBS_TABLE,
            BLOB_CHUNKS_TABLE,
            LINKS_TABLE,
            BACKLINKS_TABLE,
            LOCKS_TABLE,
        ] {
            let _table = write_tx.open_table(table(name))?;
        }
        write_tx.commit()?;
        Ok(Self {
            inner: Arc::new(RedbBackend { db }),
        })
    }
}

impl KvBackend for RedbBackend {
    fn get(&self, name: &str, key: &str) -> Result<Option<Vec<u8>>> {
        let tx = self.db.begin_read()?;
        let entries = match tx.open_table(table(name)) {
            Ok(entries) => entries,
            Err(TableError::TableDoesNotExist(_)) => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let Some(row) = entries.get(key)? else {
            return Ok(None);
        };
        Ok(Some(row.value().to_vec()))
    }

    fn scan_prefix(&self, name: &str, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let tx = self.db.begin_read()?;
        let entries = match tx.open_table(table(name)) {
            Ok(entries) => entries,
            Err(TableError::TableDoesNotExist(_)) => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut out = Vec::new();
        for row in entries.range(prefix..)? {
            let (key, value) = row?;
            let key = key.value();
            if !key.starts_with(prefix) {
                break;
            }
            out.push((key.to_string(), value.value().to_vec()));
        }
        Ok(out)
    }

    fn scan_keys(&self, name: &str, prefix: &str) -> Result<Vec<String>> {
        let tx = self.db.begin_read()?;
        let entries = match tx.open_table(table(name)) {
            Ok(entries) => entries,
            Err(TableError::TableDoesNotExist(_)) => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut out = Vec::new();
        for row in entries.range(prefix..)? {
            let (key, _) = row?;
            let key = key.value();
            if !key.starts_with(prefix) {
                break;
            }
            out.push(key.to_string());
        }
        Ok(out)
    }

    fn apply(&self, writes: WriteSet) -> Result<()> {
        let tx = self.db.begin_write()?;
        for (name, key, value) in writes.into_ops() {
            let mut entries = tx.open_table(table(&name))?;
            match value {
                Some(value) => {
                    entries.insert(key.as_str(), value.as_slice())?;
                }
                None => {
                    entries.remove(key.as_str())?;
                }
            }
        }
        tx.commit()?;
        Ok(())
    }
}

#[async_trait]
impl DurableStore for RedbStore {
    async fn begin_session(&self) -> StoreResult<Box<dyn StoreSession>> {
        Ok(Box::new(BufferedSession::new(Arc::clone(&self.inner))))
    }
}
