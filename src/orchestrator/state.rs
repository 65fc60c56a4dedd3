//! Persistent workflow state.
//!
//! A [`WorkflowState`] is everything needed to resume a workflow after a
//! process restart: which step runs next, the variables earlier steps wrote,
//! the step log, and the status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Lifecycle of a workflow.
///
/// `Initialized → Running → {Paused, Completed, Failed}` and `Paused → Running`.
/// `Completed` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    #[default]
    Initialized,
    Running,
    Paused,
    Completed,
    Failed,
}

impl WorkflowStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(&self, next: WorkflowStatus) -> bool {
        use WorkflowStatus::*;
        matches!(
            (self, next),
            (Initialized, Running)
                | (Running, Paused)
                | (Running, Completed)
                | (Running, Failed)
                | (Paused, Running)
                | (Paused, Failed)
                | (Initialized, Failed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initialized => "initialized",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How a step attempt ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepOutcome {
    Completed,
    /// Completed using a human response to an escalation.
    Resolved { escalation_id: String },
    /// Paused waiting on an escalation.
    Escalated { escalation_id: String },
    Failed { error: String },
}

impl StepOutcome {
    /// Whether the step is done and the workflow may move past it.
    pub fn is_done(&self) -> bool {
        matches!(self, Self::Completed | Self::Resolved { .. })
    }
}

impl fmt::Display for StepOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => write!(f, "completed"),
            Self::Resolved { escalation_id } => write!(f, "resolved ({})", escalation_id),
            Self::Escalated { escalation_id } => write!(f, "escalated ({})", escalation_id),
            Self::Failed { error } => write!(f, "failed: {}", error),
        }
    }
}

/// One entry in the step log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepLogEntry {
    pub step_index: usize,
    pub step_name: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub outcome: StepOutcome,
    /// Handler invocations made, including the first.
    pub attempts: u32,
    /// Attempts after the first.
    pub retries: u32,
    /// Error message of each failed attempt, in order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
    pub duration_ms: u64,
}

/// The last user-visible error of a failed workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowFailure {
    pub step_index: usize,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    pub id: String,
    /// Index of the next step to run. Only moves backwards on an explicit restart.
    pub current_step_index: usize,
    /// Variables supplied by the caller at creation. Reseeded on restart.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub inputs: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub variables: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub step_log: Vec<StepLogEntry>,
    pub status: WorkflowStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Escalation the workflow is paused on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_escalation: Option<String>,
    /// Answered escalation being applied to the step at `current_step_index`.
    /// Kept until that step's outcome is saved, so a crash mid-step does not
    /// lose the human's answer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_escalation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<WorkflowFailure>,
    #[serde(default)]
    pub restarts: u32,
}

impl WorkflowState {
    pub fn new(id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            current_step_index: 0,
            inputs: HashMap::new(),
            variables: HashMap::new(),
            step_log: Vec::new(),
            status: WorkflowStatus::Initialized,
            created_at: now,
            updated_at: now,
            pending_escalation: None,
            resolved_escalation: None,
            failure: None,
            restarts: 0,
        }
    }

    pub fn with_variable(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.variables.insert(key.into(), value);
        self
    }

    /// Seed caller inputs; they also become the initial variables.
    pub fn with_inputs(mut self, inputs: HashMap<String, serde_json::Value>) -> Self {
        self.variables.extend(inputs.clone());
        self.inputs = inputs;
        self
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn mark_running(&mut self) {
        self.status = WorkflowStatus::Running;
        self.pending_escalation = None;
        self.touch();
    }

    /// Back to running on an answered escalation. The answer stays recorded
    /// until the paused step completes, fails or pauses again.
    pub fn mark_resolving(&mut self, escalation_id: impl Into<String>) {
        self.mark_running();
        self.resolved_escalation = Some(escalation_id.into());
    }

    pub fn mark_paused(&mut self, escalation_id: impl Into<String>) {
        self.status = WorkflowStatus::Paused;
        self.pending_escalation = Some(escalation_id.into());
        self.resolved_escalation = None;
        self.touch();
    }

    pub fn mark_completed(&mut self) {
        self.status = WorkflowStatus::Completed;
        self.pending_escalation = None;
        self.resolved_escalation = None;
        self.touch();
    }

    pub fn mark_failed(&mut self, step_index: usize, message: impl Into<String>) {
        self.status = WorkflowStatus::Failed;
        self.resolved_escalation = None;
        self.failure = Some(WorkflowFailure {
            step_index,
            message: message.into(),
        });
        self.touch();
    }

    /// Move past a completed step. Never moves the index backwards.
    pub fn advance_past(&mut self, step_index: usize) {
        self.current_step_index = self.current_step_index.max(step_index + 1);
        self.resolved_escalation = None;
        self.touch();
    }

    pub fn record_step(&mut self, entry: StepLogEntry) {
        self.step_log.push(entry);
        self.touch();
    }

    pub fn last_entry_for(&self, step_index: usize) -> Option<&StepLogEntry> {
        self.step_log.iter().rev().find(|e| e.step_index == step_index)
    }

    /// Number of log entries for `step_index` that completed it.
    pub fn completions_of(&self, step_index: usize) -> usize {
        self.step_log
            .iter()
            .filter(|e| e.step_index == step_index && e.outcome.is_done())
            .count()
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}
