//! Shared domain types for the Waypoint orchestrator.
//!
//! This crate holds the types that sit on the boundary between the
//! orchestration core and its collaborators:
//!
//! - [`agent`]: the opaque `Agent` capability the core invokes for generation,
//!   reasoning and review
//! - [`events`]: the event stream emitted for an observability collaborator

pub mod agent;
pub mod events;

pub use agent::{
    Agent, AgentError, AgentIdentity, AgentRequest, AgentResponse, Capability, invoke_with_timeout,
};
pub use events::{EventSink, ReviewDecision, WorkflowEvent};
