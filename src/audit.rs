//! Audit trail of every state change attempt

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of entity an audit record refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Chunk,
    Job,
    Credential,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKind::Chunk => f.write_str("chunk"),
            EntityKind::Job => f.write_str("job"),
            EntityKind::Credential => f.write_str("credential"),
        }
    }
}

/// One attempted operation: who tried what, from which state to which, and whether it took
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditRecord {
    /// Assigned by the store, strictly increasing
    #[serde(default)]
    pub sequence: u64,
    pub entity: EntityKind,
    pub entity_id: String,
    pub operation: String,
    pub previous: Option<String>,
    pub new: Option<String>,
    pub executor: String,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    pub detail: Option<String>,
}

impl AuditRecord {
    pub fn new(
        entity: EntityKind,
        entity_id: impl ToString,
        operation: &str,
        executor: &str,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            sequence: 0,
            entity,
            entity_id: entity_id.to_string(),
            operation: operation.to_string(),
            previous: None,
            new: None,
            executor: executor.to_string(),
            timestamp,
            success: true,
            detail: None,
        }
    }

    pub fn states(mut self, previous: Option<impl ToString>, new: Option<impl ToString>) -> Self {
        self.previous = previous.map(|p| p.to_string());
        self.new = new.map(|n| n.to_string());
        self
    }

    pub fn failed(mut self, detail: impl Into<String>) -> Self {
        self.success = false;
        self.detail = Some(detail.into());
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

impl fmt::Display for AuditRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#{} {} {} {} {} -> {} by {} [{}]",
            self.sequence,
            self.timestamp.format("%Y-%m-%d %H:%M:%S"),
            self.entity,
            self.operation,
            self.previous.as_deref().unwrap_or("-"),
            self.new.as_deref().unwrap_or("-"),
            self.executor,
            if self.success { "ok" } else { "rejected" }
        )?;
        if let Some(detail) = &self.detail {
            write!(f, " {}", detail)?;
        }
        Ok(())
    }
}
