//! Concrete [`DurableStore`](super::DurableStore) implementations.

pub mod memory;
#[cfg(feature = "redb")]
pub mod redb_store;

pub use memory::MemoryStore;
#[cfg(feature = "redb")]
pub use redb_store::RedbStore;
