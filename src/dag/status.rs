//! Per-resource validity status produced by each build pass.

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::FullName;

const VALID_DESCRIPTION: &str = "valid routing resource";
const ORPHANED_DESCRIPTION: &str =
    "this routing resource is not part of a delegation chain from a root routing resource";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "lowercase")]
pub enum Status {
    Valid,
    Invalid(String),
    Orphaned,
}

impl Status {
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid)
    }

    pub fn is_invalid(&self) -> bool {
        matches!(self, Self::Invalid(_))
    }

    /// Short status name as written back to the resource.
    pub fn current_status(&self) -> &'static str {
        match self {
            Self::Valid => "valid",
            Self::Invalid(_) => "invalid",
            Self::Orphaned => "orphaned",
        }
    }

    pub fn description(&self) -> &str {
        match self {
            Self::Valid => VALID_DESCRIPTION,
            Self::Invalid(reason) => reason,
            Self::Orphaned => ORPHANED_DESCRIPTION,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.current_status(), self.description())
    }
}

/// Outcome for one routing resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusRecord {
    pub object: FullName,
    pub status: Status,
    /// FQDN the resource was evaluated under, when known.
    pub vhost: Option<String>,
}

/// Sink for status records. Writes overwrite any earlier record for the same
/// object and must be idempotent.
pub trait StatusWriter: Send + Sync {
    fn set_status(&self, record: &StatusRecord);
}

/// Status writer that keeps the latest record per object and counts writes
/// that actually changed something.
#[derive(Debug, Default)]
pub struct InMemoryStatusWriter {
    records: Mutex<HashMap<FullName, StatusRecord>>,
    changes: Mutex<u64>,
}

impl InMemoryStatusWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, object: &FullName) -> Option<StatusRecord> {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        records.get(object).cloned()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of writes that replaced a different record.
    pub fn changes(&self) -> u64 {
        *self.changes.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl StatusWriter for InMemoryStatusWriter {
    fn set_status(&self, record: &StatusRecord) {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        if records.get(&record.object) == Some(record) {
            return;
        }

        debug!(
            object = %record.object,
            status = record.status.current_status(),
            description = record.status.description(),
            "Recorded routing resource status"
        );
        records.insert(record.object.clone(), record.clone());
        *self.changes.lock().unwrap_or_else(|e| e.into_inner()) += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(status: Status) -> StatusRecord {
        StatusRecord {
            object: FullName::new("default", "test"),
            status,
            vhost: Some("example.com".into()),
        }
    }

    #[test]
    fn unchanged_record_is_not_rewritten() {
        let writer = InMemoryStatusWriter::new();
        writer.set_status(&record(Status::Valid));
        writer.set_status(&record(Status::Valid));
        assert_eq!(writer.changes(), 1);
    }

    #[test]
    fn new_record_replaces_existing() {
        let writer = InMemoryStatusWriter::new();
        writer.set_status(&record(Status::Invalid("boo hiss".into())));
        writer.set_status(&record(Status::Valid));

        let stored = writer.get(&FullName::new("default", "test")).expect("record");
        assert_eq!(stored.status, Status::Valid);
        assert_eq!(stored.status.description(), "valid routing resource");
        assert_eq!(writer.changes(), 2);
    }

    #[test]
    fn status_serializes_with_reason() {
        let json = serde_json::to_string(&Status::Invalid("bad".into())).expect("serialize");
        assert_eq!(json, r#"{"status":"invalid","reason":"bad"}"#);
    }
}
