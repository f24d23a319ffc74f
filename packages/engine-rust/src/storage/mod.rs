//! Durable storage layer for the engine.
//!
//! - [`DurableStore`] / [`StoreSession`]: transactional key-value surface
//!   every higher layer talks to, keyed by `(table, key)`
//! - [`WriteSet`]: per-session overlay of buffered writes, applied atomically
//!   on commit
//! - [`engines`]: the in-memory and `redb`-backed implementations
//! - [`record`]: table names and the `MsgPack` codec for stored records

pub mod engines;
pub mod record;
pub mod session;
pub mod write_set;

pub use record::*;
pub use session::*;
pub use write_set::*;
