//! Storage layer for fretsearch
//!
//! Persists voicing documents and their embeddings so the persistent-store
//! strategy can run similarity queries inside the database.

pub mod database;

pub use database::{DbPool, SqliteVectorStore, StoreStats};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Store unreachable: {0}")]
    Unreachable(String),

    #[error("Query failed: {0}")]
    Query(#[from] rusqlite::Error),

    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("Corrupt row: {0}")]
    Codec(String),

    #[error("Store task failed: {0}")]
    Task(String),
}
