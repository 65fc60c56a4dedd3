//! Typed error hierarchy for the Waypoint orchestrator.
//!
//! One enum per subsystem:
//! - `HandlerError`: what a step handler reports back to the executor
//! - `StateError`: workflow state persistence
//! - `EscalationError`: escalation queue API and storage
//! - `DecisionError`: decision engine failures
//! - `ReviewError`: dual review failures
//! - `WorkflowError`: everything the executor surfaces to its caller

use std::path::PathBuf;
use thiserror::Error;
use waypoint_common::AgentError;

/// Outcome of a failed step handler invocation.
#[derive(Debug, Clone, Error)]
pub enum HandlerError {
    /// Timeout, rate limit, network trouble. Retried with backoff.
    #[error("Transient failure: {message}")]
    Transient {
        message: String,
        /// Output produced before the failure, if any is usable.
        partial: Option<serde_json::Value>,
    },

    /// Missing input or invalid configuration. Never retried.
    #[error("Fatal input error: {message}")]
    FatalInput { message: String },
}

impl HandlerError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
            partial: None,
        }
    }

    pub fn transient_with_partial(message: impl Into<String>, partial: serde_json::Value) -> Self {
        Self::Transient {
            message: message.into(),
            partial: Some(partial),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::FatalInput {
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Transient { message, .. } | Self::FatalInput { message } => message,
        }
    }

    pub fn partial(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Transient { partial, .. } => partial.as_ref(),
            Self::FatalInput { .. } => None,
        }
    }
}

impl From<AgentError> for HandlerError {
    fn from(err: AgentError) -> Self {
        if err.is_transient() {
            Self::transient(err.to_string())
        } else {
            Self::fatal(err.to_string())
        }
    }
}

impl From<DecisionError> for HandlerError {
    fn from(err: DecisionError) -> Self {
        match err {
            DecisionError::Agent(agent_err) => agent_err.into(),
            other => Self::fatal(other.to_string()),
        }
    }
}

impl From<ReviewError> for HandlerError {
    fn from(err: ReviewError) -> Self {
        match err {
            ReviewError::Agent { source, .. } if source.is_transient() => {
                Self::transient(source.to_string())
            }
            other => Self::fatal(other.to_string()),
        }
    }
}

/// Errors from workflow state persistence.
#[derive(Debug, Error)]
pub enum StateError {
    /// State file exists but fails validation. Must reach an operator.
    #[error("Corrupt workflow state at {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("State I/O failed at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize workflow state: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error("Workflow {id} is locked by another executor")]
    Locked { id: String },

    #[error("Invalid workflow id '{id}': must be non-empty and contain only [A-Za-z0-9._-]")]
    InvalidId { id: String },
}

/// Errors from the escalation queue.
#[derive(Debug, Error)]
pub enum EscalationError {
    #[error("Escalation {id} not found")]
    NotFound { id: String },

    #[error("Escalation {id} is already resolved")]
    AlreadyResolved { id: String },

    #[error("Corrupt escalation record at {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("Escalation I/O failed at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Wait for escalation {id} was cancelled")]
    Cancelled { id: String },
}

/// Errors from the decision engine.
#[derive(Debug, Error)]
pub enum DecisionError {
    #[error("Reasoning agent failed: {0}")]
    Agent(#[from] AgentError),

    #[error("No deterministic answer and no reasoning agent for question: {question}")]
    NoReasoningAgent { question: String },

    #[error("Failed to append decision to audit trail: {0}")]
    Audit(#[source] anyhow::Error),
}

/// Errors from the dual review aggregator.
#[derive(Debug, Error)]
pub enum ReviewError {
    #[error("{phase} agent call failed: {source}")]
    Agent {
        phase: String,
        #[source]
        source: AgentError,
    },

    #[error("{phase} output is malformed: {message}")]
    MalformedOutput { phase: String, message: String },

    #[error("Independent reviewer {identity} is the same agent as the producer")]
    SameReviewer { identity: String },

    #[error(transparent)]
    Escalation(#[from] EscalationError),
}

/// Errors surfaced by the workflow executor.
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("No such workflow: {id}")]
    NotFound { id: String },

    #[error("Workflow {id} is not resumable (status: {status})")]
    NotResumable { id: String, status: String },

    #[error("Start index {index} is out of range for a workflow of {len} steps")]
    InvalidStartIndex { index: usize, len: usize },

    #[error("Step {step_index} failed: {message}")]
    StepFailed { step_index: usize, message: String },

    #[error("Workflow {id} aborted at step {step_index}: {reason}")]
    Aborted {
        id: String,
        step_index: usize,
        reason: String,
    },

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Escalation(#[from] EscalationError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl WorkflowError {
    /// Step index at which the workflow stopped, when known.
    pub fn step_index(&self) -> Option<usize> {
        match self {
            Self::StepFailed { step_index, .. } | Self::Aborted { step_index, .. } => {
                Some(*step_index)
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn handler_error_from_transient_agent_error_is_retryable() {
        let err: HandlerError = AgentError::Timeout(Duration::from_secs(120)).into();
        assert!(err.is_transient());
        assert!(err.message().contains("timed out"));
    }

    #[test]
    fn handler_error_from_malformed_output_is_fatal() {
        let err: HandlerError = AgentError::MalformedOutput("not json".into()).into();
        assert!(matches!(err, HandlerError::FatalInput { .. }));
        assert!(err.partial().is_none());
    }

    #[test]
    fn handler_error_keeps_partial_output() {
        let err = HandlerError::transient_with_partial("rate limited", serde_json::json!("draft"));
        assert_eq!(err.partial(), Some(&serde_json::json!("draft")));
    }

    #[test]
    fn decision_error_converts_by_agent_transience() {
        let transient: HandlerError =
            DecisionError::Agent(AgentError::Network("reset".into())).into();
        assert!(transient.is_transient());

        let fatal: HandlerError = DecisionError::NoReasoningAgent {
            question: "which db?".into(),
        }
        .into();
        assert!(!fatal.is_transient());
    }

    #[test]
    fn review_error_converts_by_agent_transience() {
        let transient: HandlerError = ReviewError::Agent {
            phase: "security".into(),
            source: AgentError::RateLimited("429".into()),
        }
        .into();
        assert!(transient.is_transient());

        let fatal: HandlerError = ReviewError::SameReviewer {
            identity: "coder (m1)".into(),
        }
        .into();
        assert!(!fatal.is_transient());
    }

    #[test]
    fn workflow_error_step_failed_carries_index() {
        let err = WorkflowError::StepFailed {
            step_index: 4,
            message: "missing input".into(),
        };
        assert_eq!(err.step_index(), Some(4));
        assert!(err.to_string().contains("Step 4"));
    }

    #[test]
    fn escalation_errors_are_matchable() {
        let err = EscalationError::AlreadyResolved { id: "esc-1".into() };
        assert!(matches!(err, EscalationError::AlreadyResolved { .. }));
        assert!(err.to_string().contains("esc-1"));
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&HandlerError::fatal("x"));
        assert_std_error(&StateError::Locked { id: "wf".into() });
        assert_std_error(&EscalationError::NotFound { id: "x".into() });
        assert_std_error(&WorkflowError::NotFound { id: "wf".into() });
    }
}
