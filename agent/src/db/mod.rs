//! SQLite persistence for the operation queue, conflict history and local entities.
//!
//! All stores share one pool. Gateway writes go through [`SqliteWriteThrough`]
//! so an entity and its queued operation commit in the same transaction.

mod conflicts;
mod entities;
mod operations;
mod pool;
mod write_through;

pub use conflicts::SqliteConflictLog;
pub use entities::SqliteLocalStore;
pub use operations::SqliteOperationStore;
pub use pool::*;
pub use write_through::SqliteWriteThrough;
