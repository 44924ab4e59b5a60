//! nearindex-storage — metadata storage backends for NearIndex.
//!
//! Backends:
//! - [`memory`] — in-memory, shared between indexers (dev/testing, no persistence)
//! - [`sqlite`] — SQLite via `sqlx` (embedded, single-file persistence)
//!
//! Every backend scopes its rows by indexer id, so several indexers can share
//! one database.

pub mod memory;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use memory::InMemoryStorage;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStorage;
