//! Append-only deployment audit trail.

use crate::deploy::ValidationResult;
use crate::error::Result;
use crate::persistence;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, error, info};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentAction {
    Promote,
    Rollback,
    Archive,
    Stage,
}

impl DeploymentAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Promote => "promote",
            Self::Rollback => "rollback",
            Self::Archive => "archive",
            Self::Stage => "stage",
        }
    }
}

impl std::fmt::Display for DeploymentAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of the audit trail. Never edited once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentRecord {
    pub id: Uuid,
    /// Commit order across the whole trail, starting at 1.
    pub sequence: u64,
    pub model_name: String,
    pub model_version: Option<u32>,
    pub previous_version: Option<u32>,
    pub action: DeploymentAction,
    pub triggered_by: String,
    pub validation: Option<ValidationResult>,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Fields of a record before it is sequenced.
#[derive(Debug, Clone)]
pub struct NewRecord {
    pub model_name: String,
    pub model_version: Option<u32>,
    pub previous_version: Option<u32>,
    pub action: DeploymentAction,
    pub triggered_by: String,
    pub validation: Option<ValidationResult>,
    pub success: bool,
    pub error: Option<String>,
}

struct Trail {
    records: Vec<DeploymentRecord>,
    next_sequence: u64,
}

impl Trail {
    fn sequence(&self, new: NewRecord) -> DeploymentRecord {
        DeploymentRecord {
            id: Uuid::new_v4(),
            sequence: self.next_sequence,
            model_name: new.model_name,
            model_version: new.model_version,
            previous_version: new.previous_version,
            action: new.action,
            triggered_by: new.triggered_by,
            validation: new.validation,
            timestamp: Utc::now(),
            success: new.success,
            error: new.error,
        }
    }

    fn keep(&mut self, record: DeploymentRecord) -> DeploymentRecord {
        self.next_sequence += 1;
        self.records.push(record.clone());
        info!(
            sequence = record.sequence,
            model = %record.model_name,
            version = ?record.model_version,
            action = %record.action,
            success = record.success,
            "Deployment recorded"
        );
        record
    }
}

/// In-memory trail, mirrored to a JSON-lines file when opened on a path.
pub struct AuditTrail {
    inner: Mutex<Trail>,
    path: Option<PathBuf>,
}

impl AuditTrail {
    pub fn in_memory() -> Self {
        Self {
            inner: Mutex::new(Trail {
                records: Vec::new(),
                next_sequence: 1,
            }),
            path: None,
        }
    }

    /// Open the trail at `path`, loading prior history.
    pub fn open(path: &Path) -> Result<Self> {
        let records: Vec<DeploymentRecord> = persistence::load_jsonl(path)?;
        let next_sequence = records.iter().map(|r| r.sequence).max().unwrap_or(0) + 1;
        debug!(path = %path.display(), records = records.len(), "Audit trail loaded");
        Ok(Self {
            inner: Mutex::new(Trail {
                records,
                next_sequence,
            }),
            path: Some(path.to_path_buf()),
        })
    }

    /// Sequence, persist and keep one record. The file is written before the
    /// in-memory copy so the two never diverge on an I/O error.
    pub fn append(&self, new: NewRecord) -> Result<DeploymentRecord> {
        let mut trail = self.inner.lock();
        let record = trail.sequence(new);
        if let Some(path) = &self.path {
            persistence::append_jsonl(path, &record)?;
        }
        Ok(trail.keep(record))
    }

    /// Like [`append`](Self::append), for a change that has already been
    /// applied: a failed write is logged and the record is kept in memory
    /// anyway, so callers can still report what happened.
    pub fn record(&self, new: NewRecord) -> DeploymentRecord {
        let mut trail = self.inner.lock();
        let record = trail.sequence(new);
        if let Some(path) = &self.path
            && let Err(e) = persistence::append_jsonl(path, &record)
        {
            error!(
                path = %path.display(),
                sequence = record.sequence,
                error = %e,
                "Audit write failed, record kept in memory only"
            );
        }
        trail.keep(record)
    }

    /// Records for `name` (all when `None`), in commit order.
    pub fn history(&self, name: Option<&str>) -> Vec<DeploymentRecord> {
        self.inner
            .lock()
            .records
            .iter()
            .filter(|r| name.is_none_or(|n| r.model_name == n))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for AuditTrail {
    fn default() -> Self {
        Self::in_memory()
    }
}
