//! Workflow steps and their handlers.
//!
//! A step is a name, a [`StepHandler`] and its retry settings. Handlers are
//! a closed set of kinds plus [`StepHandler::Custom`] for anything else:
//!
//! - `Agent`: one agent call; the response content is stored under `output_key`
//! - `Decision`: asks the executor's `DecisionEngine`; escalates when the
//!   decision's confidence is below the engine threshold
//! - `Review`: dual review of the artifact under `artifact_key`, with a
//!   bounded fail → revise loop
//! - `Custom`: any [`StepAction`]

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use waypoint_common::{Agent, Capability};

use super::retry::{HandlerClass, OnExhausted, RetryPolicy};
use crate::errors::HandlerError;
use crate::escalation::EscalationRecord;
use crate::review::DualReviewAggregator;

/// Variables written by a step.
pub type StepOutputs = HashMap<String, serde_json::Value>;

/// What a handler wants the executor to do next.
#[derive(Debug, Clone, PartialEq)]
pub enum StepSignal {
    /// Step done; merge these outputs into the workflow variables.
    Continue(StepOutputs),
    /// Ask a human. The executor files the escalation and pauses.
    Escalate(EscalationRequest),
    /// The handler already filed an escalation; pause on it.
    Escalated(EscalationRecord),
}

impl StepSignal {
    /// Continue without outputs.
    pub fn done() -> Self {
        Self::Continue(StepOutputs::new())
    }

    /// Continue with a single output.
    pub fn output(key: impl Into<String>, value: serde_json::Value) -> Self {
        let mut outputs = StepOutputs::new();
        outputs.insert(key.into(), value);
        Self::Continue(outputs)
    }

    pub fn escalate(question: impl Into<String>, context: serde_json::Value) -> Self {
        Self::Escalate(EscalationRequest {
            question: question.into(),
            context,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationRequest {
    pub question: String,
    #[serde(default)]
    pub context: serde_json::Value,
}

/// What a handler sees when it runs.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub workflow_id: String,
    pub step_index: usize,
    pub step_name: String,
    /// One-based attempt number within the current retry loop.
    pub attempt: u32,
    /// Snapshot of the workflow variables when the step started.
    pub variables: HashMap<String, serde_json::Value>,
    /// The answered escalation, when the step is re-entered after a human
    /// responded.
    pub resolution: Option<EscalationRecord>,
}

impl StepContext {
    pub fn variable(&self, key: &str) -> Option<&serde_json::Value> {
        self.variables.get(key)
    }

    /// Look up a variable, failing the step with a fatal input error when it
    /// is missing.
    pub fn require(&self, key: &str) -> Result<&serde_json::Value, HandlerError> {
        self.variables.get(key).ok_or_else(|| {
            HandlerError::fatal(format!(
                "step '{}' requires variable '{}' which is not set",
                self.step_name, key
            ))
        })
    }

    /// The human's answer, if this is a re-entry after resolution.
    pub fn human_response(&self) -> Option<&str> {
        self.resolution.as_ref().and_then(|r| r.response.as_deref())
    }
}

/// A user-defined step.
#[async_trait]
pub trait StepAction: Send + Sync {
    async fn run(&self, ctx: &StepContext) -> Result<StepSignal, HandlerError>;
}

pub enum StepHandler {
    Agent {
        agent: Arc<dyn Agent>,
        capability: Capability,
        output_key: String,
    },
    Decision {
        question: String,
        /// Variable passed as decision context; all variables when `None`.
        context_key: Option<String>,
        output_key: String,
    },
    Review {
        aggregator: Arc<DualReviewAggregator>,
        artifact_key: String,
        test_results_key: Option<String>,
        /// Receives the serialized `CombinedReviewResult` on pass.
        output_key: String,
    },
    Custom(Arc<dyn StepAction>),
}

impl StepHandler {
    pub fn class(&self) -> HandlerClass {
        match self {
            Self::Agent { .. } => HandlerClass::Agent,
            Self::Decision { .. } => HandlerClass::Decision,
            Self::Review { .. } => HandlerClass::Review,
            Self::Custom(_) => HandlerClass::Custom,
        }
    }

    /// Variables a built-in handler writes when a human answers its
    /// escalation instead of the handler running again.
    ///
    /// The response takes the place of the handler's result under
    /// `output_key`. A review that escalated with an artifact (possibly fixed
    /// by the self review) also writes that artifact back. `Custom` handlers
    /// see the answer through [`StepContext::resolution`] and write nothing here.
    pub fn resolution_outputs(&self, resolution: &EscalationRecord, response: &str) -> StepOutputs {
        let mut outputs = StepOutputs::new();
        match self {
            Self::Agent { output_key, .. } | Self::Decision { output_key, .. } => {
                outputs.insert(output_key.clone(), serde_json::json!(response));
            }
            Self::Review {
                artifact_key,
                output_key,
                ..
            } => {
                outputs.insert(output_key.clone(), serde_json::json!(response));
                if let Some(artifact) = resolution.context.get("artifact")
                    && !artifact.is_null()
                {
                    outputs.insert(artifact_key.clone(), artifact.clone());
                }
            }
            Self::Custom(_) => {}
        }
        outputs
    }
}

impl fmt::Debug for StepHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Agent {
                agent,
                capability,
                output_key,
            } => f
                .debug_struct("Agent")
                .field("agent", &agent.identity().to_string())
                .field("capability", capability)
                .field("output_key", output_key)
                .finish(),
            Self::Decision {
                question,
                context_key,
                output_key,
            } => f
                .debug_struct("Decision")
                .field("question", question)
                .field("context_key", context_key)
                .field("output_key", output_key)
                .finish(),
            Self::Review {
                artifact_key,
                test_results_key,
                output_key,
                ..
            } => f
                .debug_struct("Review")
                .field("artifact_key", artifact_key)
                .field("test_results_key", test_results_key)
                .field("output_key", output_key)
                .finish(),
            Self::Custom(_) => f.write_str("Custom"),
        }
    }
}

#[derive(Debug)]
pub struct Step {
    pub name: String,
    pub handler: StepHandler,
    /// Overrides the executor's policy for this handler class.
    pub retry: Option<RetryPolicy>,
    pub on_exhausted: OnExhausted,
}

impl Step {
    pub fn new(name: impl Into<String>, handler: StepHandler) -> Self {
        Self {
            name: name.into(),
            handler,
            retry: None,
            on_exhausted: OnExhausted::default(),
        }
    }

    pub fn agent(
        name: impl Into<String>,
        agent: Arc<dyn Agent>,
        capability: Capability,
        output_key: impl Into<String>,
    ) -> Self {
        Self::new(
            name,
            StepHandler::Agent {
                agent,
                capability,
                output_key: output_key.into(),
            },
        )
    }

    pub fn decision(
        name: impl Into<String>,
        question: impl Into<String>,
        output_key: impl Into<String>,
    ) -> Self {
        Self::new(
            name,
            StepHandler::Decision {
                question: question.into(),
                context_key: None,
                output_key: output_key.into(),
            },
        )
    }

    pub fn review(
        name: impl Into<String>,
        aggregator: Arc<DualReviewAggregator>,
        artifact_key: impl Into<String>,
        output_key: impl Into<String>,
    ) -> Self {
        Self::new(
            name,
            StepHandler::Review {
                aggregator,
                artifact_key: artifact_key.into(),
                test_results_key: None,
                output_key: output_key.into(),
            },
        )
    }

    pub fn custom(name: impl Into<String>, action: Arc<dyn StepAction>) -> Self {
        Self::new(name, StepHandler::Custom(action))
    }

    /// Set the context variable of a `Decision` step or the test-results
    /// variable of a `Review` step. No effect on other kinds.
    pub fn with_input_key(mut self, key: impl Into<String>) -> Self {
        match &mut self.handler {
            StepHandler::Decision { context_key, .. } => *context_key = Some(key.into()),
            StepHandler::Review {
                test_results_key, ..
            } => *test_results_key = Some(key.into()),
            _ => {}
        }
        self
    }

    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    pub fn with_on_exhausted(mut self, on_exhausted: OnExhausted) -> Self {
        self.on_exhausted = on_exhausted;
        self
    }

    pub fn class(&self) -> HandlerClass {
        self.handler.class()
    }
}
