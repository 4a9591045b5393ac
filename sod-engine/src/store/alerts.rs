// SOD Engine - Ingest pipeline and durable storage
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Alert buckets, mirroring the metric layout.
//!
//! Persisted alerts are the crash-recovery half of at-least-once delivery:
//! an alert is written before its HTTP dispatch and deleted only after a
//! 2xx response, so anything still here at startup is replayed.

use super::StoreError;
use crate::metric::Alert;
use redb::{Database, ReadableTable, TableDefinition, TableError};
use std::sync::Arc;

const ALERT_PREFIX: &str = "alert:";
const ALERT_KEYS: TableDefinition<&str, &[u8]> = TableDefinition::new("alert:keys:");

/// Alert-facing store handle.
#[derive(Clone)]
pub struct AlertStore {
    db: Arc<Database>,
}

impl AlertStore {
    pub(super) fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    fn bucket_name(entity_id: &str) -> String {
        format!("{}{}", ALERT_PREFIX, entity_id)
    }

    /// Persist an alert, indexing its entity bucket on first write.
    pub fn store(&self, alert: &Alert) -> Result<(), StoreError> {
        let encoded = serde_json::to_vec(alert)?;
        let name = Self::bucket_name(&alert.entity_id);
        let txn = self.db.begin_write()?;
        {
            let def: TableDefinition<&[u8], &[u8]> = TableDefinition::new(&name);
            let mut table = txn.open_table(def)?;
            table.insert(alert.id.as_bytes().as_slice(), encoded.as_slice())?;
            let mut index = txn.open_table(ALERT_KEYS)?;
            index.insert(name.as_str(), [0u8].as_slice())?;
        }
        txn.commit()?;
        Ok(())
    }

    /// Remove a delivered alert.
    pub fn delete(&self, alert: &Alert) -> Result<(), StoreError> {
        let name = Self::bucket_name(&alert.entity_id);
        let txn = self.db.begin_write()?;
        {
            let def: TableDefinition<&[u8], &[u8]> = TableDefinition::new(&name);
            let mut table = match txn.open_table(def) {
                Ok(table) => table,
                Err(TableError::TableDoesNotExist(_)) => {
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            };
            table.remove(alert.id.as_bytes().as_slice())?;
        }
        txn.commit()?;
        Ok(())
    }

    /// Every persisted alert, across all entities.
    pub fn find_all(&self) -> Result<Vec<Alert>, StoreError> {
        let txn = self.db.begin_read()?;
        let index = match txn.open_table(ALERT_KEYS) {
            Ok(table) => table,
            Err(TableError::TableDoesNotExist(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut buckets = Vec::new();
        for entry in index.iter()? {
            let (key, _) = entry?;
            buckets.push(key.value().to_string());
        }

        let mut alerts = Vec::new();
        for bucket in &buckets {
            let def: TableDefinition<&[u8], &[u8]> = TableDefinition::new(bucket);
            let table = match txn.open_table(def) {
                Ok(table) => table,
                Err(TableError::TableDoesNotExist(_)) => continue,
                Err(e) => return Err(e.into()),
            };
            for entry in table.iter()? {
                let (_, value) = entry?;
                alerts.push(serde_json::from_slice(value.value())?);
            }
        }
        Ok(alerts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metric::Metric;
    use crate::store::Store;
    use chrono::Utc;

    fn alert(entity: &str) -> Alert {
        Alert::new(
            entity,
            vec![Metric::new(
                entity,
                vec![1.0],
                Utc::now(),
                serde_json::Value::Null,
            )],
        )
    }

    #[test]
    fn test_store_find_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("sod.redb")).unwrap();
        let alerts = store.alerts();

        let a = alert("cpu");
        let b = alert("mem");
        alerts.store(&a).unwrap();
        alerts.store(&b).unwrap();

        let found = alerts.find_all().unwrap();
        assert_eq!(found.len(), 2);

        alerts.delete(&a).unwrap();
        let found = alerts.find_all().unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, b.id);
    }

    #[test]
    fn test_persisted_alert_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sod.redb");
        let stored = alert("cpu");
        {
            let store = Store::open(&path).unwrap();
            store.alerts().store(&stored).unwrap();
        }
        let store = Store::open(&path).unwrap();
        let found = store.alerts().find_all().unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, stored.id);
        assert_eq!(found[0].metrics.len(), 1);
    }

    #[test]
    fn test_delete_unknown_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("sod.redb")).unwrap();
        store.alerts().delete(&alert("ghost")).unwrap();
    }
}
