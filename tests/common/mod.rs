//! Shared helpers for integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tempfile::TempDir;
use waypoint::audit::AuditLogger;
use waypoint::decision::{DecisionConfig, DecisionEngine};
use waypoint::errors::HandlerError;
use waypoint::escalation::EscalationQueue;
use waypoint::metrics::MetricsTracker;
use waypoint::orchestrator::{
    ExecutorConfig, RetryConfig, StateStore, StepAction, StepContext, StepSignal, WorkflowExecutor,
};
use waypoint_common::{AgentResponse, Capability};

pub use waypoint::testing::ScriptedAgent;

/// A step that fails with transient errors a fixed number of times, then
/// writes `output`.
pub struct FlakyStep {
    failures: u32,
    calls: AtomicU32,
    output: Option<(String, serde_json::Value)>,
}

impl FlakyStep {
    pub fn succeeding() -> Arc<Self> {
        Self::failing(0)
    }

    pub fn failing(failures: u32) -> Arc<Self> {
        Arc::new(Self {
            failures,
            calls: AtomicU32::new(0),
            output: None,
        })
    }

    pub fn producing(key: &str, value: serde_json::Value) -> Arc<Self> {
        Arc::new(Self {
            failures: 0,
            calls: AtomicU32::new(0),
            output: Some((key.to_string(), value)),
        })
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StepAction for FlakyStep {
    async fn run(&self, ctx: &StepContext) -> Result<StepSignal, HandlerError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.failures {
            return Err(HandlerError::transient(format!(
                "{} unavailable (call {})",
                ctx.step_name, call
            )));
        }
        Ok(match &self.output {
            Some((key, value)) => StepSignal::output(key.clone(), value.clone()),
            None => StepSignal::done(),
        })
    }
}

/// A reasoning agent that always answers `value` with `confidence`.
pub fn reasoner(value: &str, confidence: f64) -> Arc<ScriptedAgent> {
    Arc::new(ScriptedAgent::new("reasoner").always(
        Capability::Reason,
        AgentResponse::new(serde_json::json!(value))
            .with_confidence(confidence)
            .with_rationale("scripted"),
    ))
}

/// Executor over a temporary storage root, with zero retry delays.
pub struct Harness {
    pub dir: TempDir,
    pub executor: Arc<WorkflowExecutor>,
}

impl Harness {
    pub fn new(config: DecisionConfig, reasoning: Option<Arc<ScriptedAgent>>) -> Self {
        let dir = TempDir::new().unwrap();
        let executor = Self::executor_at(&dir, config, reasoning);
        Self {
            dir,
            executor: Arc::new(executor),
        }
    }

    /// A second executor over the same files, as a restarted process would have.
    pub fn reopen(&self, config: DecisionConfig, reasoning: Option<Arc<ScriptedAgent>>) -> WorkflowExecutor {
        Self::executor_at(&self.dir, config, reasoning)
    }

    fn executor_at(
        dir: &TempDir,
        config: DecisionConfig,
        reasoning: Option<Arc<ScriptedAgent>>,
    ) -> WorkflowExecutor {
        let audit = Arc::new(AuditLogger::new(&dir.path().join("decisions")));
        let mut engine = DecisionEngine::new(config, audit);
        if let Some(agent) = reasoning {
            engine = engine.with_reasoning_agent(agent);
        }
        WorkflowExecutor::new(
            Arc::new(StateStore::new(dir.path().join("workflow-state"))),
            Arc::new(engine),
            Arc::new(
                EscalationQueue::new(dir.path().join("escalations"))
                    .with_poll_interval(Duration::from_millis(10)),
            ),
            Arc::new(MetricsTracker::default()),
        )
        .with_config(ExecutorConfig::default().with_retry(RetryConfig::immediate()))
    }
}
