//! Attachment content, stored as blobs.
//!
//! Content of attachment `file` on document `doc` lives under the blob id
//! `<canonical key of doc>@<file>`. The `_in` variants run inside a
//! caller's session, so content can commit together with the document
//! record that lists it.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};

use dynastore_core::{canonical_key, DocumentReference, StoreResult};

use crate::blob::{BlobStore, ChunkedBlobStore};
use crate::storage::StoreSession;

/// Blob id holding the content of `filename` attached to `document`.
#[must_use]
pub fn attachment_blob_id(document: &DocumentReference, filename: &str) -> String {
    format!("{}@{filename}", canonical_key(document, None))
}

/// Reads and writes attachment content through a [`ChunkedBlobStore`].
#[derive(Clone)]
pub struct AttachmentContentStore {
    blobs: Arc<ChunkedBlobStore>,
}

impl AttachmentContentStore {
    #[must_use]
    pub fn new(blobs: Arc<ChunkedBlobStore>) -> Self {
        Self { blobs }
    }

    /// [`save`](Self::save) as a step of an enclosing session.
    ///
    /// # Errors
    ///
    /// Returns [`dynastore_core::StoreError::Io`] if reading `source` or
    /// the session fails.
    pub async fn save_in(
        &self,
        session: &mut dyn StoreSession,
        document: &DocumentReference,
        filename: &str,
        source: &mut (dyn AsyncRead + Unpin + Send),
    ) -> StoreResult<u64> {
        self.blobs
            .save_in(session, &attachment_blob_id(document, filename), source)
            .await
    }

    /// [`delete`](Self::delete) as a step of an enclosing session.
    ///
    /// # Errors
    ///
    /// Returns [`dynastore_core::StoreError::Io`] if the session fails.
    pub async fn delete_in(
        &self,
        session: &mut dyn StoreSession,
        document: &DocumentReference,
        filename: &str,
    ) -> StoreResult<bool> {
        self.blobs
            .delete_in(session, &attachment_blob_id(document, filename))
            .await
    }

    /// Replaces the content of `filename` on `document`.
    ///
    /// # Errors
    ///
    /// Returns [`dynastore_core::StoreError::Io`] if reading `source` or
    /// storing fails.
    pub async fn save(
        &self,
        document: &DocumentReference,
        filename: &str,
        source: &mut (dyn AsyncRead + Unpin + Send),
    ) -> StoreResult<u64> {
        self.blobs
            .save(&attachment_blob_id(document, filename), source)
            .await
    }

    /// Streams the content of `filename` on `document` into `sink`.
    /// Returns `None` if no content is stored.
    ///
    /// # Errors
    ///
    /// Returns [`dynastore_core::StoreError::Io`] if loading or writing
    /// `sink` fails.
    pub async fn load(
        &self,
        document: &DocumentReference,
        filename: &str,
        sink: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> StoreResult<Option<u64>> {
        self.blobs
            .load(&attachment_blob_id(document, filename), sink)
            .await
    }

    /// # Errors
    ///
    /// Returns [`dynastore_core::StoreError::Io`] if the delete fails.
    pub async fn delete(&self, document: &DocumentReference, filename: &str) -> StoreResult<bool> {
        self.blobs
            .delete(&attachment_blob_id(document, filename))
            .await
    }

    /// # Errors
    ///
    /// Returns [`dynastore_core::StoreError::Io`] if the lookup fails.
    pub async fn exists(&self, document: &DocumentReference, filename: &str) -> StoreResult<bool> {
        self.blobs
            .exists(&attachment_blob_id(document, filename))
            .await
    }
}
