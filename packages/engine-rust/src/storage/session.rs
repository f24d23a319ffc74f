//! Transactional store traits.
//!
//! Every read and write performed by one engine operation goes through a
//! single [`StoreSession`]. Writes become visible to other sessions only
//! after [`StoreSession::commit`]; a session that is rolled back or dropped
//! leaves no trace.

use async_trait::async_trait;

use dynastore_core::StoreResult;

/// Durable key-value store partitioned into named tables.
///
/// Used as `Arc<dyn DurableStore>`.
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Opens a new session. Sessions are independent; concurrent commits
    /// resolve last-committed-wins per key.
    async fn begin_session(&self) -> StoreResult<Box<dyn StoreSession>>;
}

/// Unit of work against a [`DurableStore`].
///
/// Reads observe the committed state plus this session's own uncommitted
/// writes.
#[async_trait]
pub trait StoreSession: Send {
    async fn get(&mut self, table: &str, key: &str) -> StoreResult<Option<Vec<u8>>>;

    async fn put(&mut self, table: &str, key: &str, value: Vec<u8>) -> StoreResult<()>;

    async fn delete(&mut self, table: &str, key: &str) -> StoreResult<()>;

    /// All entries of `table` whose key starts with `prefix`, in key order.
    async fn scan_prefix(
        &mut self,
        table: &str,
        prefix: &str,
    ) -> StoreResult<Vec<(String, Vec<u8>)>>;

    /// Keys of `table` that start with `prefix`, in key order. Values are
    /// not read.
    async fn scan_keys(&mut self, table: &str, prefix: &str) -> StoreResult<Vec<String>>;

    /// Applies every buffered write atomically.
    ///
    /// # Errors
    ///
    /// Returns [`dynastore_core::StoreError::Io`] if the backend rejects the
    /// commit; nothing is applied in that case.
    async fn commit(self: Box<Self>) -> StoreResult<()>;

    /// Discards every buffered write.
    async fn rollback(self: Box<Self>);
}

/// Commits `session` if `result` is `Ok`, rolls it back otherwise.
///
/// Lets an operation written against `&mut dyn StoreSession` run inside its
/// own session:
///
/// ```ignore
/// let mut session = store.begin_session().await?;
/// let result = do_work(session.as_mut()).await;
/// finish(session, result).await
/// ```
///
/// # Errors
///
/// Returns the operation's error, or the commit error if the operation
/// succeeded but the commit failed.
pub async fn finish<T>(session: Box<dyn StoreSession>, result: StoreResult<T>) -> StoreResult<T> {
    match result {
        Ok(value) => {
            session.commit().await?;
            Ok(value)
        }
        Err(err) => {
            session.rollback().await;
            Err(err)
        }
    }
}
