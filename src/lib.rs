//! Waypoint: a resumable workflow orchestrator.
//!
//! Workflows are ordered lists of [`orchestrator::Step`]s run by a
//! [`orchestrator::WorkflowExecutor`]. State is persisted after every step so
//! a crashed process picks up where it stopped. Decisions the system is not
//! confident about are escalated to a human through the durable
//! [`escalation::EscalationQueue`], and produced artifacts can be gated by a
//! [`review::DualReviewAggregator`] that combines a self review with an
//! independent one.

use std::time::Duration;

pub mod audit;
pub mod config;
pub mod decision;
pub mod errors;
pub mod escalation;
pub mod metrics;
pub mod orchestrator;
pub mod review;
pub mod testing;
pub mod util;

/// Bound on a single agent call unless configured otherwise.
pub const DEFAULT_AGENT_TIMEOUT: Duration = Duration::from_secs(120);

pub use config::{WaypointConfig, WaypointToml};
pub use decision::{Decision, DecisionConfig, DecisionEngine, DecisionSource};
pub use errors::{
    DecisionError, EscalationError, HandlerError, ReviewError, StateError, WorkflowError,
};
pub use escalation::{EscalationFilter, EscalationQueue, EscalationRecord, EscalationStatus};
pub use metrics::MetricsTracker;
pub use orchestrator::{ExecutionOutcome, Step, StepSignal, WorkflowExecutor, WorkflowState};
pub use waypoint_common::{
    Agent, AgentError, AgentIdentity, AgentRequest, AgentResponse, Capability, EventSink,
    ReviewDecision, WorkflowEvent,
};
