//! Events emitted during workflow execution.
//!
//! The orchestrator publishes these for an external observability
//! collaborator. Delivery is best effort: a dropped receiver never blocks or
//! fails a workflow.

use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::mpsc;

/// Verdict of a dual review.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReviewDecision {
    /// Artifact accepted.
    Pass,
    /// Fixable issues; return to the producer for another attempt.
    Fail,
    /// A human must decide.
    Escalate,
}

impl ReviewDecision {
    pub fn is_pass(&self) -> bool {
        matches!(self, Self::Pass)
    }

    pub fn requires_human(&self) -> bool {
        matches!(self, Self::Escalate)
    }
}

impl fmt::Display for ReviewDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pass => "pass",
            Self::Fail => "fail",
            Self::Escalate => "escalate",
        };
        write!(f, "{}", s)
    }
}

/// Lifecycle events of workflows, escalations and reviews.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WorkflowEvent {
    #[serde(rename = "workflow.started")]
    WorkflowStarted { workflow_id: String },

    #[serde(rename = "step.completed")]
    StepCompleted {
        workflow_id: String,
        index: usize,
        duration_ms: u64,
    },

    #[serde(rename = "workflow.paused")]
    WorkflowPaused {
        workflow_id: String,
        step_index: usize,
        escalation_id: String,
    },

    #[serde(rename = "workflow.completed")]
    WorkflowCompleted { workflow_id: String },

    #[serde(rename = "workflow.failed")]
    WorkflowFailed {
        workflow_id: String,
        step_index: usize,
        error: String,
    },

    #[serde(rename = "escalation.created")]
    EscalationCreated {
        id: String,
        workflow_id: String,
        step_index: usize,
    },

    #[serde(rename = "escalation.resolved")]
    EscalationResolved { id: String, workflow_id: String },

    #[serde(rename = "review.completed")]
    ReviewCompleted {
        decision: ReviewDecision,
        overall_score: f64,
        confidence: f64,
    },
}

impl WorkflowEvent {
    /// Dotted event name, matching the serialized `type` tag.
    pub fn name(&self) -> &'static str {
        match self {
            Self::WorkflowStarted { .. } => "workflow.started",
            Self::StepCompleted { .. } => "step.completed",
            Self::WorkflowPaused { .. } => "workflow.paused",
            Self::WorkflowCompleted { .. } => "workflow.completed",
            Self::WorkflowFailed { .. } => "workflow.failed",
            Self::EscalationCreated { .. } => "escalation.created",
            Self::EscalationResolved { .. } => "escalation.resolved",
            Self::ReviewCompleted { .. } => "review.completed",
        }
    }
}

/// Cloneable handle for publishing [`WorkflowEvent`]s.
///
/// A default sink discards everything.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<mpsc::UnboundedSender<WorkflowEvent>>,
}

impl EventSink {
    pub fn new(tx: mpsc::UnboundedSender<WorkflowEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    /// Create a sink together with the receiving end.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<WorkflowEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn emit(&self, event: WorkflowEvent) {
        tracing::debug!(event = event.name(), "emit");
        if let Some(ref tx) = self.tx
            && tx.send(event).is_err()
        {
            tracing::trace!("event receiver dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serializes_with_dotted_tag() {
        let event = WorkflowEvent::StepCompleted {
            workflow_id: "wf-1".into(),
            index: 2,
            duration_ms: 15,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "step.completed");
        assert_eq!(value["index"], 2);
        assert_eq!(event.name(), "step.completed");
    }

    #[test]
    fn test_review_completed_roundtrip() {
        let event = WorkflowEvent::ReviewCompleted {
            decision: ReviewDecision::Escalate,
            overall_score: 71.5,
            confidence: 0.6,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"decision\":\"escalate\""));
        let back: WorkflowEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_sink_delivers_events() {
        let (sink, mut rx) = EventSink::channel();
        sink.emit(WorkflowEvent::WorkflowStarted {
            workflow_id: "wf".into(),
        });
        let event = rx.try_recv().unwrap();
        assert_eq!(event.name(), "workflow.started");
    }

    #[test]
    fn test_sink_survives_dropped_receiver() {
        let (sink, rx) = EventSink::channel();
        drop(rx);
        sink.emit(WorkflowEvent::WorkflowCompleted {
            workflow_id: "wf".into(),
        });
        EventSink::disabled().emit(WorkflowEvent::WorkflowCompleted {
            workflow_id: "wf".into(),
        });
    }

    #[test]
    fn test_review_decision_helpers() {
        assert!(ReviewDecision::Pass.is_pass());
        assert!(ReviewDecision::Escalate.requires_human());
        assert!(!ReviewDecision::Fail.requires_human());
        assert_eq!(ReviewDecision::Fail.to_string(), "fail");
    }
}
