//! SQLite-backed `GraphStore` (spec §4.1, §6): the production storage
//! backend for `graph-core`, grounded on the teacher's
//! `storage/sqlite/src/lib.rs` crate-root shape (connection manager +
//! engine + error module, re-exported flat).

pub mod connection;
pub mod engine;
pub mod error;

pub use connection::{SqliteConfig, SqliteConnectionManager};
pub use engine::SqliteGraphStore;
pub use error::SqliteError;
