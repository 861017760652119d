//! Store implementations.
//!
//! - in-memory (always available)
//! - SQLite (feature `sqlite`, on by default)

mod inmem_projection;
mod inmem_store;

pub use inmem_projection::InMemoryProjectionStore;
pub use inmem_store::InMemoryStore;

#[cfg(feature = "sqlite")]
mod sqlite_db;
#[cfg(feature = "sqlite")]
mod sqlite_projection;
#[cfg(feature = "sqlite")]
mod sqlite_store;

#[cfg(feature = "sqlite")]
pub use sqlite_projection::SqliteProjectionStore;
#[cfg(feature = "sqlite")]
pub use sqlite_store::SqliteStore;
