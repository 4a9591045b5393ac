// SOD Engine - Ingest pipeline and durable storage
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Metric and alert models.
//!
//! A [`Metric`] is one submitted point in context — the unit of persistence
//! and of queue delivery. Its JSON field names are part of the on-disk
//! format and must stay stable across versions; `metric_schema_is_stable`
//! below pins them.

use chrono::{DateTime, Utc};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sod::knn::DataPoint;
use sod::Point;
use uuid::Uuid;

/// Metric lifecycle state, stored as an integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Written before its first prediction attempt completed.
    New = 0,
    /// Successfully scored (or accepted during warm-up).
    Processed = 1,
}

impl Serialize for Status {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(*self as u8)
    }
}

impl<'de> Deserialize<'de> for Status {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match u8::deserialize(deserializer)? {
            0 => Ok(Status::New),
            1 => Ok(Status::Processed),
            other => Err(D::Error::custom(format!("unknown metric status: {}", other))),
        }
    }
}

/// A point in context: the unit of persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metric {
    pub id: Uuid,
    pub entity_id: String,
    /// Most recent non-outlier point for the entity; set only on outliers.
    pub norm_vec: Option<Vec<f64>>,
    pub checked_vec: Vec<f64>,
    pub outlier: bool,
    pub status: Status,
    pub created_at: DateTime<Utc>,
    /// Opaque user payload, preserved end-to-end.
    pub extra: serde_json::Value,
}

impl Metric {
    pub fn new(
        entity_id: impl Into<String>,
        checked_vec: Vec<f64>,
        created_at: DateTime<Utc>,
        extra: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            entity_id: entity_id.into(),
            norm_vec: None,
            checked_vec,
            outlier: false,
            status: Status::New,
            created_at,
            extra,
        }
    }

    pub fn is_processed(&self) -> bool {
        self.status == Status::Processed
    }

    pub fn is_new(&self) -> bool {
        self.status == Status::New
    }

    pub fn point(&self) -> Point {
        Point::from(self.checked_vec.as_slice())
    }

    /// The metric as an index entry, keeping its identity and timestamp.
    pub fn data_point(&self) -> DataPoint {
        DataPoint::with_id(self.id, self.point(), self.created_at)
    }
}

/// A batch of metrics pending delivery to one target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub id: Uuid,
    pub entity_id: String,
    pub metrics: Vec<Metric>,
    pub created_at: DateTime<Utc>,
}

impl Alert {
    pub fn new(entity_id: impl Into<String>, metrics: Vec<Metric>) -> Self {
        Self {
            id: Uuid::new_v4(),
            entity_id: entity_id.into(),
            metrics,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample() -> Metric {
        let mut m = Metric::new(
            "cpu-load",
            vec![1.0, 2.5],
            Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
            serde_json::json!({"host": "node-1"}),
        );
        m.id = Uuid::nil();
        m
    }

    #[test]
    fn test_json_round_trip() {
        let mut m = sample();
        m.status = Status::Processed;
        m.outlier = true;
        m.norm_vec = Some(vec![0.9, 2.4]);
        let encoded = serde_json::to_string(&m).unwrap();
        let decoded: Metric = serde_json::from_str(&encoded).unwrap();
        assert_eq!(m, decoded);
    }

    #[test]
    fn metric_schema_is_stable() {
        // The persisted field names are a compatibility contract.
        let encoded = serde_json::to_value(sample()).unwrap();
        let obj = encoded.as_object().unwrap();
        for field in [
            "id",
            "entityId",
            "normVec",
            "checkedVec",
            "outlier",
            "status",
            "createdAt",
            "extra",
        ] {
            assert!(obj.contains_key(field), "missing field {}", field);
        }
        assert_eq!(obj["status"], serde_json::json!(0));
        assert_eq!(obj["normVec"], serde_json::Value::Null);
        assert_eq!(
            obj["createdAt"].as_str().unwrap(),
            "2024-05-01T12:00:00Z"
        );
    }

    #[test]
    fn test_decodes_known_blob() {
        let blob = r#"{
            "id": "67e55044-10b1-426f-9247-bb680e5fe0c8",
            "entityId": "requests",
            "normVec": [1.0, 1.0],
            "checkedVec": [40.0, 40.0],
            "outlier": true,
            "status": 1,
            "createdAt": "2024-05-01T12:00:00Z",
            "extra": null
        }"#;
        let m: Metric = serde_json::from_str(blob).unwrap();
        assert!(m.outlier);
        assert_eq!(m.status, Status::Processed);
        assert_eq!(m.norm_vec, Some(vec![1.0, 1.0]));
        assert_eq!(m.entity_id, "requests");
    }

    #[test]
    fn test_status_rejects_unknown() {
        assert!(serde_json::from_str::<Status>("7").is_err());
    }

    #[test]
    fn test_alert_shares_encoding() {
        let alert = Alert::new("requests", vec![sample()]);
        let encoded = serde_json::to_value(&alert).unwrap();
        let obj = encoded.as_object().unwrap();
        for field in ["id", "entityId", "metrics", "createdAt"] {
            assert!(obj.contains_key(field), "missing field {}", field);
        }
        let decoded: Alert = serde_json::from_value(encoded).unwrap();
        assert_eq!(alert, decoded);
    }

    #[test]
    fn test_data_point_keeps_identity() {
        let m = sample();
        let dp = m.data_point();
        assert_eq!(dp.id, m.id);
        assert_eq!(dp.time, m.created_at);
        assert_eq!(dp.point.as_slice(), &[1.0, 2.5]);
    }
}
