// SOD Engine - Ingest pipeline and durable storage
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Durable storage over an embedded transactional key/value engine.
//!
//! The engine is `redb`: byte-string keys and values in named tables,
//! serialised write transactions, concurrent readers. Metrics and alerts
//! each get one table per entity plus an index table enumerating the
//! entity tables, so recovery never scans the whole database blindly:
//!
//! ```text
//! "metric:<entity>"   uuid bytes -> JSON metric
//! "entity:keys:"      "metric:<entity>" -> 0x00
//! "alert:<entity>"    uuid bytes -> JSON alert
//! "alert:keys:"       "alert:<entity>" -> 0x00
//! ```

mod alerts;
mod metrics;

pub use alerts::AlertStore;
pub use metrics::{
    EntityLister, MetricFilter, MetricReader, MetricRemover, MetricStore, MetricWriter,
};

use redb::Database;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

/// Errors from the durable store.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Transaction, table or I/O failure in the underlying engine.
    #[error("storage error: {0}")]
    Storage(String),

    /// A stored value failed to decode (or a metric failed to encode).
    #[error("encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

impl From<redb::DatabaseError> for StoreError {
    fn from(e: redb::DatabaseError) -> Self {
        StoreError::Storage(e.to_string())
    }
}
impl From<redb::TransactionError> for StoreError {
    fn from(e: redb::TransactionError) -> Self {
        StoreError::Storage(e.to_string())
    }
}
impl From<redb::TableError> for StoreError {
    fn from(e: redb::TableError) -> Self {
        StoreError::Storage(e.to_string())
    }
}
impl From<redb::StorageError> for StoreError {
    fn from(e: redb::StorageError) -> Self {
        StoreError::Storage(e.to_string())
    }
}
impl From<redb::CommitError> for StoreError {
    fn from(e: redb::CommitError) -> Self {
        StoreError::Storage(e.to_string())
    }
}

/// Shared handle to the embedded database.
#[derive(Clone)]
pub struct Store {
    db: Arc<Database>,
}

impl Store {
    /// Open (or create) the database file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        info!(path = %path.as_ref().display(), "opening database");
        let db = Database::create(path)?;
        Ok(Self { db: Arc::new(db) })
    }

    /// Metric-facing view of the store.
    pub fn metrics(&self) -> MetricStore {
        MetricStore::new(self.db.clone())
    }

    /// Alert-facing view of the store.
    pub fn alerts(&self) -> AlertStore {
        AlertStore::new(self.db.clone())
    }
}
