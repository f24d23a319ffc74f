//! Document links and edit locks.
//!
//! Outgoing links are stored per source document and mirrored into a
//! backlink table keyed by target, so both directions are a prefix scan.
//! Links and locks belong to the document as a whole, never to one
//! translation.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use dynastore_core::escape::escape;
use dynastore_core::{canonical_key, DocumentReference, StoreResult};

use crate::storage::{
    decode_record, encode_record, finish, DurableStore, StoreSession, BACKLINKS_TABLE,
    LINKS_TABLE, LOCKS_TABLE,
};

const LINK: &str = "link";
const LOCK: &str = "lock";

#[derive(Debug, Serialize, Deserialize)]
struct LinkRecord {
    source: DocumentReference,
    target: DocumentReference,
}

/// Edit lock held on a document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentLock {
    pub document: DocumentReference,
    /// User holding the lock.
    pub user: String,
    /// Milliseconds since the Unix epoch.
    pub acquired_at: i64,
}

/// Prefix of every entry keyed under `reference`. Escaped keys never
/// contain `/`, so no other document's entries share it.
fn entry_prefix(reference: &DocumentReference) -> String {
    format!("{}/", escape(&canonical_key(reference, None)))
}

fn entry_key(owner: &DocumentReference, other: &DocumentReference) -> String {
    format!("{}{}", entry_prefix(owner), canonical_key(other, None))
}

/// Persists the link graph between documents and their edit locks.
pub struct LinkAndLockStore {
    store: Arc<dyn DurableStore>,
}

impl LinkAndLockStore {
    #[must_use]
    pub fn new(store: Arc<dyn DurableStore>) -> Self {
        Self { store }
    }

    /// Replaces the outgoing links of `source` with `targets`. Duplicate
    /// targets are stored once.
    ///
    /// # Errors
    ///
    /// Returns [`dynastore_core::StoreError::Io`] if the session fails.
    pub async fn save_links(
        &self,
        source: &DocumentReference,
        targets: &[DocumentReference],
    ) -> StoreResult<()> {
        let mut session = self.store.begin_session().await?;
        let result = self.save_links_in(session.as_mut(), source, targets).await;
        finish(session, result).await
    }

    /// [`save_links`](Self::save_links) as a step of an enclosing session.
    ///
    /// # Errors
    ///
    /// See [`save_links`](Self::save_links).
    pub async fn save_links_in(
        &self,
        session: &mut dyn StoreSession,
        source: &DocumentReference,
        targets: &[DocumentReference],
    ) -> StoreResult<()> {
        self.delete_links_in(session, source).await?;
        let mut seen = BTreeSet::new();
        for target in targets {
            if !seen.insert(canonical_key(target, None)) {
                continue;
            }
            let record = encode_record(
                LINK,
                &LinkRecord {
                    source: source.clone(),
                    target: target.clone(),
                },
            )?;
            session
                .put(LINKS_TABLE, &entry_key(source, target), record.clone())
                .await?;
            session
                .put(BACKLINKS_TABLE, &entry_key(target, source), record)
                .await?;
        }
        debug!(source = %canonical_key(source, None), links = seen.len(), "saved links");
        Ok(())
    }

    /// Documents `source` links to, ordered by canonical key.
    ///
    /// # Errors
    ///
    /// Returns [`dynastore_core::StoreError::Corrupt`] or
    /// [`dynastore_core::StoreError::Io`] on storage failures.
    pub async fn load_links(&self, source: &DocumentReference) -> StoreResult<Vec<DocumentReference>> {
        let mut session = self.store.begin_session().await?;
        let result = Self::scan_links(session.as_mut(), LINKS_TABLE, source).await;
        let links = finish(session, result).await?;
        Ok(links.into_iter().map(|link| link.target).collect())
    }

    /// Documents linking to `target`, ordered by canonical key.
    ///
    /// # Errors
    ///
    /// See [`load_links`](Self::load_links).
    pub async fn load_backlinks(
        &self,
        target: &DocumentReference,
    ) -> StoreResult<Vec<DocumentReference>> {
        let mut session = self.store.begin_session().await?;
        let result = Self::scan_links(session.as_mut(), BACKLINKS_TABLE, target).await;
        let links = finish(session, result).await?;
        Ok(links.into_iter().map(|link| link.source).collect())
    }

    /// Removes every outgoing link of `source`.
    ///
    /// # Errors
    ///
    /// See [`load_links`](Self::load_links).
    pub async fn delete_links(&self, source: &DocumentReference) -> StoreResult<()> {
        let mut session = self.store.begin_session().await?;
        let result = self.delete_links_in(session.as_mut(), source).await;
        finish(session, result).await
    }

    /// [`delete_links`](Self::delete_links) as a step of an enclosing
    /// session.
    ///
    /// # Errors
    ///
    /// See [`load_links`](Self::load_links).
    pub async fn delete_links_in(
        &self,
        session: &mut dyn StoreSession,
        source: &DocumentReference,
    ) -> StoreResult<()> {
        for link in Self::scan_links(session, LINKS_TABLE, source).await? {
            session
                .delete(LINKS_TABLE, &entry_key(source, &link.target))
                .await?;
            session
                .delete(BACKLINKS_TABLE, &entry_key(&link.target, source))
                .await?;
        }
        Ok(())
    }

    /// Lock held on `document`, if any.
    ///
    /// # Errors
    ///
    /// See [`load_links`](Self::load_links).
    pub async fn load_lock(&self, document: &DocumentReference) -> StoreResult<Option<DocumentLock>> {
        let mut session = self.store.begin_session().await?;
        let result = session
            .get(LOCKS_TABLE, &canonical_key(document, None))
            .await;
        finish(session, result)
            .await?
            .map(|bytes| decode_record(LOCK, &bytes))
            .transpose()
    }

    /// Stores `lock`, replacing any lock on the same document.
    ///
    /// # Errors
    ///
    /// See [`load_links`](Self::load_links).
    pub async fn save_lock(&self, lock: &DocumentLock) -> StoreResult<()> {
        let mut session = self.store.begin_session().await?;
        let key = canonical_key(&lock.document, None);
        let result = match encode_record(LOCK, lock) {
            Ok(bytes) => session.put(LOCKS_TABLE, &key, bytes).await,
            Err(err) => Err(err),
        };
        finish(session, result).await?;
        debug!(document = %key, user = %lock.user, "saved lock");
        Ok(())
    }

    /// Releases the lock on `document`. Returns whether one was held.
    ///
    /// # Errors
    ///
    /// See [`load_links`](Self::load_links).
    pub async fn delete_lock(&self, document: &DocumentReference) -> StoreResult<bool> {
        let mut session = self.store.begin_session().await?;
        let result = Self::delete_lock_in(session.as_mut(), &canonical_key(document, None)).await;
        finish(session, result).await
    }

    async fn delete_lock_in(session: &mut dyn StoreSession, key: &str) -> StoreResult<bool> {
        let held = session.get(LOCKS_TABLE, key).await?.is_some();
        session.delete(LOCKS_TABLE, key).await?;
        Ok(held)
    }

    async fn scan_links(
        session: &mut dyn StoreSession,
        table: &str,
        owner: &DocumentReference,
    ) -> StoreResult<Vec<LinkRecord>> {
        session
            .scan_prefix(table, &entry_prefix(owner))
            .await?
            .into_iter()
            .map(|(_, bytes)| decode_record(LINK, &bytes))
            .collect()
    }
}
