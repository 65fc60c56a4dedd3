//! Append-only decision audit trail.
//!
//! Every [`Decision`] made for a workflow is appended as one JSON line to
//! `decisions/{workflow_id}.jsonl` under the storage root. Records are never
//! rewritten or removed.

pub mod logger;

pub use logger::AuditLogger;

use serde::{Deserialize, Serialize};

use crate::decision::{Decision, DecisionSource};

/// All decisions recorded for one workflow, oldest first.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DecisionAuditTrail {
    pub workflow_id: String,
    pub decisions: Vec<Decision>,
}

impl DecisionAuditTrail {
    pub fn new(workflow_id: impl Into<String>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            decisions: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.decisions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.decisions.is_empty()
    }

    pub fn last(&self) -> Option<&Decision> {
        self.decisions.last()
    }

    /// Decisions answering `question`, oldest first.
    pub fn for_question<'a>(&'a self, question: &'a str) -> impl Iterator<Item = &'a Decision> {
        self.decisions.iter().filter(move |d| d.question == question)
    }

    pub fn count_by_source(&self, source: DecisionSource) -> usize {
        self.decisions.iter().filter(|d| d.source == source).count()
    }

    /// Mean confidence across all decisions, or `None` for an empty trail.
    pub fn average_confidence(&self) -> Option<f64> {
        if self.decisions.is_empty() {
            return None;
        }
        let sum: f64 = self.decisions.iter().map(|d| d.confidence).sum();
        Some(sum / self.decisions.len() as f64)
    }
}
