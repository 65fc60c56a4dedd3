//! Durable queue of decisions deferred to a human.
//!
//! A workflow step that cannot proceed with enough confidence files an
//! [`EscalationRecord`] and the workflow pauses. A human answers it with
//! [`EscalationQueue::respond`], which wakes any in-process waiter; an
//! out-of-process responder (the `waypoint escalations respond` command) is
//! picked up by polling the record file.
//!
//! Records are never deleted. A record changes exactly once, from `pending`
//! to `resolved`.

pub mod queue;

pub use queue::EscalationQueue;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EscalationStatus {
    Pending,
    Resolved,
}

impl fmt::Display for EscalationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Resolved => "resolved",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for EscalationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "resolved" => Ok(Self::Resolved),
            other => Err(format!(
                "unknown escalation status '{}' (expected pending or resolved)",
                other
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationRecord {
    pub id: String,
    pub workflow_id: String,
    pub step_index: usize,
    pub question: String,
    #[serde(default)]
    pub context: serde_json::Value,
    pub status: EscalationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
}

impl EscalationRecord {
    pub fn new(
        workflow_id: impl Into<String>,
        step_index: usize,
        question: impl Into<String>,
        context: serde_json::Value,
    ) -> Self {
        Self {
            id: new_escalation_id(),
            workflow_id: workflow_id.into(),
            step_index,
            question: question.into(),
            context,
            status: EscalationStatus::Pending,
            response: None,
            created_at: Utc::now(),
            resolved_at: None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == EscalationStatus::Pending
    }

    pub fn is_resolved(&self) -> bool {
        self.status == EscalationStatus::Resolved
    }

    pub fn resolve(&mut self, response: impl Into<String>) {
        self.status = EscalationStatus::Resolved;
        self.response = Some(response.into());
        self.resolved_at = Some(Utc::now());
    }

    /// Time from creation to resolution, for resolved records.
    pub fn resolution_time(&self) -> Option<chrono::Duration> {
        self.resolved_at.map(|at| at - self.created_at)
    }
}

/// `esc-` followed by the first 8 hex digits of a v4 UUID.
pub fn new_escalation_id() -> String {
    format!("esc-{}", &uuid::Uuid::new_v4().simple().to_string()[..8])
}

/// Selects records in [`EscalationQueue::list`]. Empty fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EscalationFilter {
    pub status: Option<EscalationStatus>,
    pub workflow_id: Option<String>,
}

impl EscalationFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn pending() -> Self {
        Self {
            status: Some(EscalationStatus::Pending),
            workflow_id: None,
        }
    }

    pub fn with_status(mut self, status: EscalationStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn for_workflow(mut self, workflow_id: impl Into<String>) -> Self {
        self.workflow_id = Some(workflow_id.into());
        self
    }

    pub fn matches(&self, record: &EscalationRecord) -> bool {
        self.status.is_none_or(|s| s == record.status)
            && self
                .workflow_id
                .as_deref()
                .is_none_or(|w| w == record.workflow_id)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EscalationMetrics {
    pub pending_count: usize,
    pub resolved_count: usize,
    /// Mean creation-to-resolution time of resolved records.
    pub avg_resolution_time_ms: Option<f64>,
}

impl EscalationMetrics {
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a EscalationRecord>) -> Self {
        let mut metrics = Self::default();
        let mut total_ms = 0i64;
        for record in records {
            match record.status {
                EscalationStatus::Pending => metrics.pending_count += 1,
                EscalationStatus::Resolved => {
                    metrics.resolved_count += 1;
                    if let Some(elapsed) = record.resolution_time() {
                        total_ms += elapsed.num_milliseconds().max(0);
                    }
                }
            }
        }
        if metrics.resolved_count > 0 {
            metrics.avg_resolution_time_ms =
                Some(total_ms as f64 / metrics.resolved_count as f64);
        }
        metrics
    }
}
