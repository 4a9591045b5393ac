// SOD Engine - Ingest pipeline and durable storage
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Metric buckets: one table per entity plus the entity-key index.

use super::StoreError;
use crate::metric::Metric;
use redb::{
    Database, ReadableTable, ReadableTableMetadata, TableDefinition, TableError,
};
use std::collections::BTreeMap;
use std::sync::Arc;

const METRIC_PREFIX: &str = "metric:";
const ENTITY_KEYS: TableDefinition<&str, &[u8]> = TableDefinition::new("entity:keys:");

/// Optional predicate applied while scanning.
pub type MetricFilter<'a> = &'a (dyn Fn(&Metric) -> bool + Send + Sync);

/// Enumerate entities without scanning metric tables.
pub trait EntityLister: Send + Sync {
    fn keys(&self) -> Result<Vec<String>, StoreError>;
    fn count(&self, entity_id: &str) -> Result<usize, StoreError>;
}

/// Read metrics back out of the store.
pub trait MetricReader: Send + Sync {
    fn find_all(&self, filter: Option<MetricFilter>) -> Result<Vec<Metric>, StoreError>;
    fn find_by_entity(
        &self,
        entity_id: &str,
        filter: Option<MetricFilter>,
    ) -> Result<Vec<Metric>, StoreError>;
}

/// Persist metrics.
pub trait MetricWriter: Send + Sync {
    fn append_many(&self, metrics: &[Metric]) -> Result<(), StoreError>;
}

/// Remove metrics.
pub trait MetricRemover: Send + Sync {
    fn delete(&self, metric: &Metric) -> Result<(), StoreError>;
    fn delete_many(&self, metrics: &[Metric]) -> Result<(), StoreError>;
}

/// Metric-facing store handle.
#[derive(Clone)]
pub struct MetricStore {
    db: Arc<Database>,
}

impl MetricStore {
    pub(super) fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    fn bucket_name(entity_id: &str) -> String {
        format!("{}{}", METRIC_PREFIX, entity_id)
    }

    fn read_bucket(
        &self,
        txn: &redb::ReadTransaction,
        bucket: &str,
        filter: Option<MetricFilter>,
        out: &mut Vec<Metric>,
    ) -> Result<(), StoreError> {
        let def: TableDefinition<&[u8], &[u8]> = TableDefinition::new(bucket);
        let table = match txn.open_table(def) {
            Ok(table) => table,
            Err(TableError::TableDoesNotExist(_)) => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        for entry in table.iter()? {
            let (_, value) = entry?;
            let metric: Metric = serde_json::from_slice(value.value())?;
            if filter.map_or(true, |f| f(&metric)) {
                out.push(metric);
            }
        }
        Ok(())
    }
}

impl EntityLister for MetricStore {
    fn keys(&self) -> Result<Vec<String>, StoreError> {
        let txn = self.db.begin_read()?;
        let table = match txn.open_table(ENTITY_KEYS) {
            Ok(table) => table,
            Err(TableError::TableDoesNotExist(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut keys = Vec::new();
        for entry in table.iter()? {
            let (key, _) = entry?;
            let bucket = key.value();
            keys.push(bucket.trim_start_matches(METRIC_PREFIX).to_string());
        }
        Ok(keys)
    }

    fn count(&self, entity_id: &str) -> Result<usize, StoreError> {
        let txn = self.db.begin_read()?;
        let name = Self::bucket_name(entity_id);
        let def: TableDefinition<&[u8], &[u8]> = TableDefinition::new(&name);
        match txn.open_table(def) {
            Ok(table) => Ok(table.len()? as usize),
            Err(TableError::TableDoesNotExist(_)) => Ok(0),
            Err(e) => Err(e.into()),
        }
    }
}

impl MetricReader for MetricStore {
    fn find_all(&self, filter: Option<MetricFilter>) -> Result<Vec<Metric>, StoreError> {
        let keys = self.keys()?;
        let txn = self.db.begin_read()?;
        let mut metrics = Vec::new();
        for entity_id in &keys {
            self.read_bucket(&txn, &Self::bucket_name(entity_id), filter, &mut metrics)?;
        }
        Ok(metrics)
    }

    fn find_by_entity(
        &self,
        entity_id: &str,
        filter: Option<MetricFilter>,
    ) -> Result<Vec<Metric>, StoreError> {
        let txn = self.db.begin_read()?;
        let mut metrics = Vec::new();
        self.read_bucket(&txn, &Self::bucket_name(entity_id), filter, &mut metrics)?;
        Ok(metrics)
    }
}

impl MetricWriter for MetricStore {
    /// One batch transaction; records overwrite by id (last write wins) and
    /// the entity-key index entry is added on first write.
    fn append_many(&self, metrics: &[Metric]) -> Result<(), StoreError> {
        if metrics.is_empty() {
            return Ok(());
        }

        // Group per entity so each table opens exactly once per transaction.
        let mut by_entity: BTreeMap<&str, Vec<&Metric>> = BTreeMap::new();
        for metric in metrics {
            by_entity.entry(&metric.entity_id).or_default().push(metric);
        }

        let txn = self.db.begin_write()?;
        {
            for (entity_id, batch) in &by_entity {
                let name = Self::bucket_name(entity_id);
                let def: TableDefinition<&[u8], &[u8]> = TableDefinition::new(&name);
                let mut table = txn.open_table(def)?;
                for metric in batch {
                    let encoded = serde_json::to_vec(metric)?;
                    table.insert(metric.id.as_bytes().as_slice(), encoded.as_slice())?;
                }
            }
            let mut index = txn.open_table(ENTITY_KEYS)?;
            for entity_id in by_entity.keys() {
                index.insert(Self::bucket_name(entity_id).as_str(), [0u8].as_slice())?;
            }
        }
        txn.commit()?;
        Ok(())
    }
}

impl MetricRemover for MetricStore {
    fn delete(&self, metric: &Metric) -> Result<(), StoreError> {
        self.delete_many(std::slice::from_ref(metric))
    }

    fn delete_many(&self, metrics: &[Metric]) -> Result<(), StoreError> {
        if metrics.is_empty() {
            return Ok(());
        }

        let mut by_entity: BTreeMap<&str, Vec<&Metric>> = BTreeMap::new();
        for metric in metrics {
            by_entity.entry(&metric.entity_id).or_default().push(metric);
        }

        let txn = self.db.begin_write()?;
        {
            for (entity_id, batch) in &by_entity {
                let name = Self::bucket_name(entity_id);
                let def: TableDefinition<&[u8], &[u8]> = TableDefinition::new(&name);
                let mut table = match txn.open_table(def) {
                    Ok(table) => table,
                    Err(TableError::TableDoesNotExist(_)) => continue,
                    Err(e) => return Err(e.into()),
                };
                for metric in batch {
                    table.remove(metric.id.as_bytes().as_slice())?;
                }
            }
        }
        txn.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metric::Status;
    use crate::store::Store;
    use chrono::{TimeZone, Utc};

    fn open_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("sod.redb")).unwrap();
        (dir, store)
    }

    fn metric(entity: &str, secs: i64) -> Metric {
        Metric::new(
            entity,
            vec![secs as f64, 1.0],
            Utc.timestamp_opt(secs, 0).unwrap(),
            serde_json::Value::Null,
        )
    }

    #[test]
    fn test_append_and_find_by_entity() {
        let (_dir, store) = open_store();
        let metrics = store.metrics();
        metrics
            .append_many(&[metric("cpu", 1), metric("cpu", 2), metric("mem", 3)])
            .unwrap();

        let cpu = metrics.find_by_entity("cpu", None).unwrap();
        assert_eq!(cpu.len(), 2);
        assert_eq!(metrics.count("cpu").unwrap(), 2);
        assert_eq!(metrics.count("mem").unwrap(), 1);
        assert_eq!(metrics.count("absent").unwrap(), 0);
    }

    #[test]
    fn test_keys_lists_entities() {
        let (_dir, store) = open_store();
        let metrics = store.metrics();
        metrics
            .append_many(&[metric("cpu", 1), metric("mem", 2)])
            .unwrap();
        let mut keys = metrics.keys().unwrap();
        keys.sort();
        assert_eq!(keys, vec!["cpu", "mem"]);
    }

    #[test]
    fn test_find_all_with_filter() {
        let (_dir, store) = open_store();
        let metrics = store.metrics();
        let mut processed = metric("cpu", 1);
        processed.status = Status::Processed;
        metrics
            .append_many(&[processed, metric("cpu", 2), metric("mem", 3)])
            .unwrap();

        let found = metrics
            .find_all(Some(&|m: &Metric| m.is_processed()))
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].entity_id, "cpu");
    }

    #[test]
    fn test_last_write_wins_per_id() {
        let (_dir, store) = open_store();
        let metrics = store.metrics();
        let mut m = metric("cpu", 1);
        metrics.append_many(std::slice::from_ref(&m)).unwrap();
        m.status = Status::Processed;
        m.outlier = true;
        metrics.append_many(std::slice::from_ref(&m)).unwrap();

        let found = metrics.find_by_entity("cpu", None).unwrap();
        assert_eq!(found.len(), 1);
        assert!(found[0].is_processed());
        assert!(found[0].outlier);
    }

    #[test]
    fn test_delete_many() {
        let (_dir, store) = open_store();
        let metrics = store.metrics();
        let batch: Vec<Metric> = (0..5).map(|i| metric("cpu", i)).collect();
        metrics.append_many(&batch).unwrap();
        metrics.delete_many(&batch[..3]).unwrap();
        assert_eq!(metrics.count("cpu").unwrap(), 2);
    }

    #[test]
    fn test_delete_missing_entity_is_noop() {
        let (_dir, store) = open_store();
        store.metrics().delete(&metric("ghost", 1)).unwrap();
    }

    #[test]
    fn test_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sod.redb");
        {
            let store = Store::open(&path).unwrap();
            store.metrics().append_many(&[metric("cpu", 1)]).unwrap();
        }
        let store = Store::open(&path).unwrap();
        assert_eq!(store.metrics().count("cpu").unwrap(), 1);
    }
}
