//! Confidence-scored decisions.
//!
//! A [`Decision`] answers one question raised by a workflow step. It comes
//! either from a configured deterministic answer or from a reasoning agent,
//! always carries a confidence in `[0, 1]`, and is appended to the workflow's
//! decision audit trail as soon as it is made.
//!
//! ## Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use waypoint::audit::AuditLogger;
//! use waypoint::decision::{DecisionConfig, DecisionEngine};
//!
//! # async fn demo(agent: Arc<dyn waypoint_common::Agent>) -> anyhow::Result<()> {
//! let engine = DecisionEngine::new(DecisionConfig::default(), Arc::new(AuditLogger::ephemeral()))
//!     .with_reasoning_agent(agent);
//! let decision = engine
//!     .make_decision("wf-1", "Which database?", serde_json::json!({"scale": "small"}))
//!     .await?;
//! if engine.requires_escalation(&decision) {
//!     // hand the question to a human
//! }
//! # Ok(())
//! # }
//! ```

pub mod engine;

pub use engine::DecisionEngine;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

/// Default confidence below which a decision is escalated to a human.
pub const DEFAULT_ESCALATION_THRESHOLD: f64 = 0.75;

/// Confidence assigned to configured deterministic answers.
pub const DEFAULT_DETERMINISTIC_CONFIDENCE: f64 = 0.95;

/// Default number of specialist consultations allowed per workflow.
pub const DEFAULT_MAX_SPECIALIST_ESCALATIONS: u32 = 3;

/// Where a decision came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionSource {
    /// Looked up in configured answers.
    Deterministic,
    /// Produced by a reasoning agent. `Decision::agent` names which one.
    AgentReasoning,
}

impl fmt::Display for DecisionSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Deterministic => "deterministic",
            Self::AgentReasoning => "agent_reasoning",
        };
        write!(f, "{}", s)
    }
}

/// An immutable, ADR-style decision record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub question: String,
    pub source: DecisionSource,
    pub value: serde_json::Value,
    /// Always within `[0, 1]`.
    pub confidence: f64,
    pub rationale: String,
    pub timestamp: DateTime<Utc>,
    /// Context the question was asked in.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub context: serde_json::Value,
    /// Identity of the agent that answered, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
}

impl Decision {
    pub fn new(
        question: impl Into<String>,
        source: DecisionSource,
        value: serde_json::Value,
        confidence: f64,
        rationale: impl Into<String>,
    ) -> Self {
        Self {
            question: question.into(),
            source,
            value,
            confidence: clamp_confidence(confidence),
            rationale: rationale.into(),
            timestamp: Utc::now(),
            context: serde_json::Value::Null,
            agent: None,
        }
    }

    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = context;
        self
    }

    pub fn with_agent(mut self, agent: impl Into<String>) -> Self {
        self.agent = Some(agent.into());
        self
    }

    pub fn meets_confidence(&self, threshold: f64) -> bool {
        self.confidence >= threshold
    }
}

/// Clamp a confidence into `[0, 1]`. Non-finite values become 0.
///
/// # Examples
///
/// ```
/// use waypoint::decision::clamp_confidence;
///
/// assert_eq!(clamp_confidence(1.7), 1.0);
/// assert_eq!(clamp_confidence(-0.2), 0.0);
/// assert_eq!(clamp_confidence(f64::NAN), 0.0);
/// ```
pub fn clamp_confidence(confidence: f64) -> f64 {
    if confidence.is_finite() {
        confidence.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

/// Settings for the decision engine.
#[derive(Debug, Clone)]
pub struct DecisionConfig {
    pub escalation_threshold: f64,
    pub deterministic_confidence: f64,
    pub max_specialist_escalations: u32,
    /// Exact-match question → answer lookup.
    pub answers: HashMap<String, serde_json::Value>,
    pub agent_timeout: Duration,
}

impl Default for DecisionConfig {
    fn default() -> Self {
        Self {
            escalation_threshold: DEFAULT_ESCALATION_THRESHOLD,
            deterministic_confidence: DEFAULT_DETERMINISTIC_CONFIDENCE,
            max_specialist_escalations: DEFAULT_MAX_SPECIALIST_ESCALATIONS,
            answers: HashMap::new(),
            agent_timeout: crate::DEFAULT_AGENT_TIMEOUT,
        }
    }
}

impl DecisionConfig {
    pub fn with_answer(mut self, question: impl Into<String>, value: serde_json::Value) -> Self {
        self.answers.insert(question.into(), value);
        self
    }

    pub fn with_escalation_threshold(mut self, threshold: f64) -> Self {
        self.escalation_threshold = threshold;
        self
    }

    pub fn with_agent_timeout(mut self, timeout: Duration) -> Self {
        self.agent_timeout = timeout;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decision_new_clamps_confidence() {
        let decision = Decision::new("q", DecisionSource::AgentReasoning, json!(1), 3.0, "r");
        assert_eq!(decision.confidence, 1.0);
    }

    #[test]
    fn test_decision_serialization_skips_empty_optionals() {
        let decision = Decision::new("q", DecisionSource::Deterministic, json!("pg"), 0.95, "");
        let value = serde_json::to_value(&decision).unwrap();
        assert_eq!(value["source"], "deterministic");
        assert!(value.get("context").is_none());
        assert!(value.get("agent").is_none());

        let back: Decision = serde_json::from_value(value).unwrap();
        assert_eq!(back, decision);
    }

    #[test]
    fn test_meets_confidence_is_inclusive() {
        let decision = Decision::new("q", DecisionSource::AgentReasoning, json!(1), 0.75, "r");
        assert!(decision.meets_confidence(DEFAULT_ESCALATION_THRESHOLD));
    }

    #[test]
    fn test_config_builder() {
        let config = DecisionConfig::default()
            .with_answer("Which database?", json!("postgres"))
            .with_escalation_threshold(0.8);
        assert_eq!(config.answers["Which database?"], json!("postgres"));
        assert_eq!(config.escalation_threshold, 0.8);
        assert_eq!(config.max_specialist_escalations, 3);
    }
}
