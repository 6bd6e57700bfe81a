//! Error types for the SQLite-backed `GraphStore`, mirroring the
//! teacher's `storage/sqlite/src/error.rs` split and feeding into
//! `graph_core::error::StoreError` at the trait boundary.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SqliteError {
    #[error("SQLite error: {0}")]
    Rusqlite(#[from] rusqlite::Error),

    #[error("connection pool error: {0}")]
    Pool(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("DDL error: {0}")]
    Ddl(String),

    #[error("task join error: {0}")]
    TaskJoin(String),

    #[error("node id decode error: {0}")]
    InvalidNodeId(String),
}

impl From<SqliteError> for graph_core::error::StoreError {
    fn from(e: SqliteError) -> Self { graph_core::error::StoreError::Backend(anyhow::anyhow!(e.to_string())) }
}
