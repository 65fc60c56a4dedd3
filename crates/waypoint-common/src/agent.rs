//! The `Agent` capability boundary.
//!
//! An agent is whatever performs the actual generative or reasoning call:
//! a CLI subprocess, an HTTP model client, or a scripted fake in tests. The
//! orchestrator only sees a single `invoke` entry point tagged with the
//! [`Capability`] it needs. Prompt construction and output parsing belong to
//! the agent implementation; by the time a response crosses this boundary its
//! `content` is already structured JSON.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// What the orchestrator is asking an agent to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Produce step content.
    Generate,
    /// Answer a question with a value, a confidence and a rationale.
    Reason,
    /// Review an artifact the agent itself produced.
    SelfReview,
    /// Repair critical issues found during self review.
    Fix,
    /// Revise an artifact after a failed review.
    Revise,
    /// Independent security assessment.
    SecurityReview,
    /// Independent code-quality assessment.
    QualityReview,
    /// Independent test-adequacy assessment.
    TestReview,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Generate => "generate",
            Self::Reason => "reason",
            Self::SelfReview => "self_review",
            Self::Fix => "fix",
            Self::Revise => "revise",
            Self::SecurityReview => "security_review",
            Self::QualityReview => "quality_review",
            Self::TestReview => "test_review",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Identity of an agent: a name plus the model backing it.
///
/// Two agents with the same identity are treated as correlated reviewers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AgentIdentity {
    pub name: String,
    pub model: String,
}

impl AgentIdentity {
    pub fn new(name: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            model: model.into(),
        }
    }
}

impl fmt::Display for AgentIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.model)
    }
}

/// A single request to an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRequest {
    pub capability: Capability,
    /// Structured prompt context; the agent turns this into a prompt.
    pub context: serde_json::Value,
}

impl AgentRequest {
    pub fn new(capability: Capability, context: serde_json::Value) -> Self {
        Self {
            capability,
            context,
        }
    }
}

/// An agent's answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentResponse {
    /// Parsed output.
    pub content: serde_json::Value,
    /// Self-reported confidence in [0, 1], if the agent gives one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence_hint: Option<f64>,
    /// Explanation accompanying the output, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
}

impl AgentResponse {
    pub fn new(content: serde_json::Value) -> Self {
        Self {
            content,
            confidence_hint: None,
            rationale: None,
        }
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence_hint = Some(confidence);
        self
    }

    pub fn with_rationale(mut self, rationale: impl Into<String>) -> Self {
        self.rationale = Some(rationale.into());
        self
    }
}

/// Errors an agent invocation can produce.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("Agent call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Agent rate limited: {0}")]
    RateLimited(String),

    #[error("Network error talking to agent: {0}")]
    Network(String),

    #[error("Agent unavailable: {0}")]
    Unavailable(String),

    #[error("Agent output could not be parsed: {0}")]
    MalformedOutput(String),

    #[error("Invalid agent request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl AgentError {
    /// Whether retrying the same request may succeed.
    ///
    /// # Examples
    ///
    /// ```
    /// use waypoint_common::AgentError;
    /// use std::time::Duration;
    ///
    /// assert!(AgentError::Timeout(Duration::from_secs(1)).is_transient());
    /// assert!(!AgentError::MalformedOutput("no json".into()).is_transient());
    /// ```
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_) | Self::RateLimited(_) | Self::Network(_) | Self::Unavailable(_)
        )
    }
}

/// The capability the orchestration core consumes.
#[async_trait]
pub trait Agent: Send + Sync {
    /// Who this agent is. Used to keep independent reviewers independent.
    fn identity(&self) -> AgentIdentity;

    /// Perform one request. May be slow and may fail.
    async fn invoke(&self, request: AgentRequest) -> Result<AgentResponse, AgentError>;
}

/// Invoke an agent, converting an elapsed deadline into [`AgentError::Timeout`].
pub async fn invoke_with_timeout(
    agent: &dyn Agent,
    request: AgentRequest,
    timeout: Duration,
) -> Result<AgentResponse, AgentError> {
    let capability = request.capability;
    match tokio::time::timeout(timeout, agent.invoke(request)).await {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!(
                agent = %agent.identity(),
                capability = %capability,
                timeout_ms = timeout.as_millis() as u64,
                "agent call timed out"
            );
            Err(AgentError::Timeout(timeout))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct SlowAgent;

    #[async_trait]
    impl Agent for SlowAgent {
        fn identity(&self) -> AgentIdentity {
            AgentIdentity::new("slow", "test-model")
        }

        async fn invoke(&self, _request: AgentRequest) -> Result<AgentResponse, AgentError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(AgentResponse::new(json!("late")))
        }
    }

    struct EchoAgent;

    #[async_trait]
    impl Agent for EchoAgent {
        fn identity(&self) -> AgentIdentity {
            AgentIdentity::new("echo", "test-model")
        }

        async fn invoke(&self, request: AgentRequest) -> Result<AgentResponse, AgentError> {
            Ok(AgentResponse::new(request.context).with_confidence(0.8))
        }
    }

    #[tokio::test]
    async fn test_invoke_with_timeout_elapsed_is_timeout_error() {
        let request = AgentRequest::new(Capability::Generate, json!({}));
        let err = invoke_with_timeout(&SlowAgent, request, Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Timeout(_)));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_invoke_with_timeout_passes_response_through() {
        let request = AgentRequest::new(Capability::Reason, json!({"q": 1}));
        let response = invoke_with_timeout(&EchoAgent, request, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(response.content, json!({"q": 1}));
        assert_eq!(response.confidence_hint, Some(0.8));
    }

    #[test]
    fn test_transient_classification() {
        assert!(AgentError::RateLimited("429".into()).is_transient());
        assert!(AgentError::Network("reset".into()).is_transient());
        assert!(AgentError::Unavailable("503".into()).is_transient());
        assert!(!AgentError::InvalidRequest("empty".into()).is_transient());
        assert!(!AgentError::Other(anyhow::anyhow!("boom")).is_transient());
    }

    #[test]
    fn test_capability_serializes_snake_case() {
        let json = serde_json::to_string(&Capability::SelfReview).unwrap();
        assert_eq!(json, "\"self_review\"");
        assert_eq!(Capability::TestReview.to_string(), "test_review");
    }

    #[test]
    fn test_agent_response_optional_fields_default() {
        let response: AgentResponse = serde_json::from_str(r#"{"content": "ok"}"#).unwrap();
        assert_eq!(response.content, json!("ok"));
        assert!(response.confidence_hint.is_none());
        assert!(response.rationale.is_none());
    }
}
