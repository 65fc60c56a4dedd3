//! Workflow executor.
//!
//! Runs a workflow's steps in order on the calling task. After every step the
//! state is persisted before the next step starts, so a crash loses at most
//! the step that was in flight.
//!
//! ## Lifecycle
//!
//! - [`execute`](WorkflowExecutor::execute) starts (or continues) a workflow
//! - a step that escalates files an [`EscalationRecord`], the workflow is
//!   persisted as `Paused` and the call returns [`ExecutionOutcome::Paused`]
//! - once the escalation is answered, [`resume`](WorkflowExecutor::resume)
//!   re-enters the paused step with the human response and continues
//! - [`run`](WorkflowExecutor::run) does all of the above, waiting on the
//!   escalation queue in between
//!
//! ## Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use waypoint::audit::AuditLogger;
//! use waypoint::decision::{DecisionConfig, DecisionEngine};
//! use waypoint::escalation::EscalationQueue;
//! use waypoint::metrics::MetricsTracker;
//! use waypoint::orchestrator::{StateStore, Step, WorkflowExecutor};
//!
//! # async fn demo(root: &std::path::Path) -> Result<(), waypoint::errors::WorkflowError> {
//! let audit = Arc::new(AuditLogger::new(&root.join("decisions")));
//! let executor = WorkflowExecutor::new(
//!     Arc::new(StateStore::new(root.join("workflow-state"))),
//!     Arc::new(DecisionEngine::new(DecisionConfig::default(), audit)),
//!     Arc::new(EscalationQueue::new(root.join("escalations"))),
//!     Arc::new(MetricsTracker::default()),
//! );
//! let steps = vec![Step::decision("pick-db", "Which database?", "database")];
//! let state = executor.run("wf-1", &steps).await?;
//! println!("database: {}", state.variables["database"]);
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use waypoint_common::{AgentRequest, EventSink, ReviewDecision, WorkflowEvent, invoke_with_timeout};

use super::retry::{OnExhausted, RetryConfig, RetryOutcome, run_with_retry};
use super::state::{StepLogEntry, StepOutcome, WorkflowState, WorkflowStatus};
use super::step::{EscalationRequest, Step, StepContext, StepHandler, StepOutputs, StepSignal};
use super::store::StateStore;
use crate::decision::DecisionEngine;
use crate::errors::{EscalationError, HandlerError, StateError, WorkflowError};
use crate::escalation::{EscalationQueue, EscalationRecord};
use crate::metrics::MetricsTracker;
use crate::review::DualReviewAggregator;
use crate::review::aggregator::{ReviewRequest, escalation_context, escalation_question};

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub retry: RetryConfig,
    /// Bound on each `Agent` step call.
    pub agent_timeout: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            agent_timeout: crate::DEFAULT_AGENT_TIMEOUT,
        }
    }
}

impl ExecutorConfig {
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_agent_timeout(mut self, timeout: Duration) -> Self {
        self.agent_timeout = timeout;
        self
    }
}

/// Handle to a workflow paused on an escalation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingWorkflow {
    pub workflow_id: String,
    pub escalation_id: String,
    pub step_index: usize,
}

#[derive(Debug, Clone)]
pub enum ExecutionOutcome {
    Completed(WorkflowState),
    Paused(PendingWorkflow),
}

impl ExecutionOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed(_))
    }

    pub fn is_paused(&self) -> bool {
        matches!(self, Self::Paused(_))
    }

    pub fn state(&self) -> Option<&WorkflowState> {
        match self {
            Self::Completed(state) => Some(state),
            Self::Paused(_) => None,
        }
    }

    pub fn pending(&self) -> Option<&PendingWorkflow> {
        match self {
            Self::Paused(pending) => Some(pending),
            Self::Completed(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeChoice {
    Resume,
    Restart,
}

/// Chooses between resuming an interrupted workflow and starting it over.
#[async_trait]
pub trait ResumeDecider: Send + Sync {
    async fn choose(&self, state: &WorkflowState) -> ResumeChoice;
}

/// Removes a workflow's cancellation token when the call that registered it
/// returns.
struct ActiveGuard<'a> {
    active: &'a Mutex<HashMap<String, CancellationToken>>,
    id: String,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.id);
    }
}

/// Per-step bookkeeping for the step log.
struct StepRecord<'a> {
    index: usize,
    name: &'a str,
    started_at: DateTime<Utc>,
    timer: Instant,
    attempts: u32,
    errors: Vec<String>,
}

impl StepRecord<'_> {
    fn entry(&self, outcome: StepOutcome) -> StepLogEntry {
        StepLogEntry {
            step_index: self.index,
            step_name: self.name.to_string(),
            started_at: self.started_at,
            completed_at: Utc::now(),
            outcome,
            attempts: self.attempts,
            retries: self.attempts.saturating_sub(1),
            errors: self.errors.clone(),
            duration_ms: self.timer.elapsed().as_millis() as u64,
        }
    }
}

pub struct WorkflowExecutor {
    store: Arc<StateStore>,
    decisions: Arc<DecisionEngine>,
    escalations: Arc<EscalationQueue>,
    metrics: Arc<MetricsTracker>,
    config: ExecutorConfig,
    events: EventSink,
    resume_decider: Option<Arc<dyn ResumeDecider>>,
    active: Mutex<HashMap<String, CancellationToken>>,
    abort_reasons: Mutex<HashMap<String, String>>,
}

impl WorkflowExecutor {
    pub fn new(
        store: Arc<StateStore>,
        decisions: Arc<DecisionEngine>,
        escalations: Arc<EscalationQueue>,
        metrics: Arc<MetricsTracker>,
    ) -> Self {
        Self {
            store,
            decisions,
            escalations,
            metrics,
            config: ExecutorConfig::default(),
            events: EventSink::disabled(),
            resume_decider: None,
            active: Mutex::new(HashMap::new()),
            abort_reasons: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_config(mut self, config: ExecutorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    pub fn with_resume_decider(mut self, decider: Arc<dyn ResumeDecider>) -> Self {
        self.resume_decider = Some(decider);
        self
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn escalations(&self) -> &EscalationQueue {
        &self.escalations
    }

    pub fn decisions(&self) -> &DecisionEngine {
        &self.decisions
    }

    pub fn metrics(&self) -> &MetricsTracker {
        &self.metrics
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Whether a call on this executor is currently driving the workflow.
    pub fn is_running(&self, workflow_id: &str) -> bool {
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(workflow_id)
    }

    fn activate(&self, workflow_id: &str) -> (CancellationToken, Option<ActiveGuard<'_>>) {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(token) = active.get(workflow_id) {
            return (token.clone(), None);
        }
        let token = CancellationToken::new();
        active.insert(workflow_id.to_string(), token.clone());
        (
            token,
            Some(ActiveGuard {
                active: &self.active,
                id: workflow_id.to_string(),
            }),
        )
    }

    fn take_abort_reason(&self, workflow_id: &str) -> String {
        self.abort_reasons
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(workflow_id)
            .unwrap_or_else(|| "aborted".to_string())
    }

    /// Run steps `start_from..` of a workflow, creating its state if needed.
    ///
    /// An existing workflow continues from where it is: a completed one is
    /// returned as is, a paused one stays paused until its escalation is
    /// answered, and steps before its `current_step_index` never run again.
    pub async fn execute(
        &self,
        workflow_id: &str,
        steps: &[Step],
        start_from: usize,
    ) -> Result<ExecutionOutcome, WorkflowError> {
        self.execute_with_inputs(workflow_id, steps, start_from, StepOutputs::new())
            .await
    }

    /// Like [`execute`](Self::execute), seeding a new workflow's variables
    /// with `inputs`. Inputs are ignored for an existing workflow.
    pub async fn execute_with_inputs(
        &self,
        workflow_id: &str,
        steps: &[Step],
        start_from: usize,
        inputs: StepOutputs,
    ) -> Result<ExecutionOutcome, WorkflowError> {
        if start_from > steps.len() {
            return Err(WorkflowError::InvalidStartIndex {
                index: start_from,
                len: steps.len(),
            });
        }
        let _lease = self.store.acquire_lease(workflow_id)?;
        let (token, _guard) = self.activate(workflow_id);

        let state = match self.store.load(workflow_id)? {
            Some(state) => state,
            None => WorkflowState::new(workflow_id).with_inputs(inputs),
        };
        self.continue_existing(state, steps, start_from, &token).await
    }

    /// Continue a persisted workflow from its `current_step_index`.
    pub async fn resume(
        &self,
        workflow_id: &str,
        steps: &[Step],
    ) -> Result<ExecutionOutcome, WorkflowError> {
        self.resume_with(workflow_id, steps, true).await
    }

    async fn resume_with(
        &self,
        workflow_id: &str,
        steps: &[Step],
        consult_decider: bool,
    ) -> Result<ExecutionOutcome, WorkflowError> {
        let _lease = self.store.acquire_lease(workflow_id)?;
        let (token, _guard) = self.activate(workflow_id);

        let state = self
            .store
            .load(workflow_id)?
            .ok_or_else(|| WorkflowError::NotFound {
                id: workflow_id.to_string(),
            })?;

        if consult_decider
            && let Some(decider) = &self.resume_decider
            && self.can_continue(&state)?
            && decider.choose(&state).await == ResumeChoice::Restart
        {
            tracing::info!(workflow_id, "resume decider chose restart");
            return self.restart_locked(workflow_id, Some(state), steps, &token).await;
        }

        let start = state.current_step_index;
        self.continue_existing(state, steps, start, &token).await
    }

    /// Discard persisted state and run the workflow from step 0.
    ///
    /// Caller inputs of the previous run are kept. A corrupt state file is
    /// discarded too.
    pub async fn restart(
        &self,
        workflow_id: &str,
        steps: &[Step],
    ) -> Result<ExecutionOutcome, WorkflowError> {
        let _lease = self.store.acquire_lease(workflow_id)?;
        let (token, _guard) = self.activate(workflow_id);

        let previous = match self.store.load(workflow_id) {
            Ok(state) => state,
            Err(StateError::Corrupt { path, reason }) => {
                tracing::warn!(
                    workflow_id,
                    path = %path.display(),
                    reason = %reason,
                    "discarding corrupt state on restart"
                );
                None
            }
            Err(e) => return Err(e.into()),
        };
        self.restart_locked(workflow_id, previous, steps, &token).await
    }

    /// Drive a workflow to completion, waiting on escalations as they come up.
    pub async fn run(&self, workflow_id: &str, steps: &[Step]) -> Result<WorkflowState, WorkflowError> {
        self.run_with_inputs(workflow_id, steps, StepOutputs::new())
            .await
    }

    pub async fn run_with_inputs(
        &self,
        workflow_id: &str,
        steps: &[Step],
        inputs: StepOutputs,
    ) -> Result<WorkflowState, WorkflowError> {
        let (token, _guard) = self.activate(workflow_id);

        // The resume decider is consulted at most once per call.
        let mut outcome = if self.store.load(workflow_id)?.is_some() {
            self.resume_with(workflow_id, steps, true).await?
        } else {
            self.execute_with_inputs(workflow_id, steps, 0, inputs)
                .await?
        };
        loop {
            let pending = match outcome {
                ExecutionOutcome::Completed(state) => return Ok(state),
                ExecutionOutcome::Paused(pending) => pending,
            };
            tracing::info!(
                workflow_id,
                escalation_id = %pending.escalation_id,
                step_index = pending.step_index,
                "waiting for escalation response"
            );
            match self
                .escalations
                .wait_for_resolution(&pending.escalation_id, &token)
                .await
            {
                Ok(_) => {}
                Err(EscalationError::Cancelled { .. }) => {
                    return Err(self.abort_idle(workflow_id)?);
                }
                Err(e) => return Err(e.into()),
            }
            outcome = self.resume_with(workflow_id, steps, false).await?;
        }
    }

    /// Stop a workflow.
    ///
    /// A run in progress on this executor is cancelled and fails itself at the
    /// next cancellation point. An idle workflow is marked failed directly.
    pub fn abort(&self, workflow_id: &str, reason: &str) -> Result<(), WorkflowError> {
        let token = self
            .active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(workflow_id)
            .cloned();
        if let Some(token) = token {
            self.abort_reasons
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(workflow_id.to_string(), reason.to_string());
            tracing::info!(workflow_id, reason, "cancelling workflow");
            token.cancel();
            return Ok(());
        }

        self.abort_reasons
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(workflow_id.to_string(), reason.to_string());
        match self.abort_idle(workflow_id)? {
            WorkflowError::Aborted { .. } => Ok(()),
            other => Err(other),
        }
    }

    /// Fail an idle workflow. Returns the error a caller driving it should see.
    fn abort_idle(&self, workflow_id: &str) -> Result<WorkflowError, WorkflowError> {
        let reason = self.take_abort_reason(workflow_id);
        let _lease = self.store.acquire_lease(workflow_id)?;
        let mut state = self
            .store
            .load(workflow_id)?
            .ok_or_else(|| WorkflowError::NotFound {
                id: workflow_id.to_string(),
            })?;
        if state.is_terminal() {
            return Ok(WorkflowError::NotResumable {
                id: workflow_id.to_string(),
                status: state.status.to_string(),
            });
        }
        let step_index = state.current_step_index;
        self.mark_aborted(&mut state, step_index, reason)
    }

    fn mark_aborted(
        &self,
        state: &mut WorkflowState,
        step_index: usize,
        reason: String,
    ) -> Result<WorkflowError, WorkflowError> {
        state.mark_failed(step_index, format!("aborted: {}", reason));
        self.store.save(state)?;
        tracing::warn!(workflow_id = %state.id, step_index, reason = %reason, "workflow aborted");
        self.metrics.increment("workflows.aborted");
        self.events.emit(WorkflowEvent::WorkflowFailed {
            workflow_id: state.id.clone(),
            step_index,
            error: format!("aborted: {}", reason),
        });
        Ok(WorkflowError::Aborted {
            id: state.id.clone(),
            step_index,
            reason,
        })
    }

    /// Whether a resume would actually run steps.
    fn can_continue(&self, state: &WorkflowState) -> Result<bool, WorkflowError> {
        Ok(match state.status {
            WorkflowStatus::Initialized | WorkflowStatus::Running => true,
            WorkflowStatus::Paused => match &state.pending_escalation {
                Some(id) => self.escalations.get(id)?.is_resolved(),
                None => true,
            },
            WorkflowStatus::Completed | WorkflowStatus::Failed => false,
        })
    }

    async fn restart_locked(
        &self,
        workflow_id: &str,
        previous: Option<WorkflowState>,
        steps: &[Step],
        token: &CancellationToken,
    ) -> Result<ExecutionOutcome, WorkflowError> {
        self.store.delete(workflow_id)?;
        let (restarts, inputs) = match previous {
            Some(previous) => (previous.restarts + 1, previous.inputs),
            None => (1, HashMap::new()),
        };
        let mut state = WorkflowState::new(workflow_id).with_inputs(inputs);
        state.restarts = restarts;
        tracing::info!(workflow_id, restarts, "restarting workflow from step 0");
        self.metrics.increment("workflows.restarted");
        self.drive(state, steps, 0, None, token).await
    }

    async fn continue_existing(
        &self,
        state: WorkflowState,
        steps: &[Step],
        start_from: usize,
        token: &CancellationToken,
    ) -> Result<ExecutionOutcome, WorkflowError> {
        if state.current_step_index > steps.len() {
            return Err(WorkflowError::InvalidStartIndex {
                index: state.current_step_index,
                len: steps.len(),
            });
        }
        match state.status {
            WorkflowStatus::Completed => {
                tracing::info!(workflow_id = %state.id, "workflow already completed");
                Ok(ExecutionOutcome::Completed(state))
            }
            WorkflowStatus::Failed => Err(WorkflowError::NotResumable {
                id: state.id.clone(),
                status: state.status.to_string(),
            }),
            WorkflowStatus::Paused => {
                let Some(escalation_id) = state.pending_escalation.clone() else {
                    let start = state.current_step_index;
                    return self.drive(state, steps, start, None, token).await;
                };
                let record = self.escalations.get(&escalation_id)?;
                if record.is_pending() {
                    return Ok(ExecutionOutcome::Paused(PendingWorkflow {
                        workflow_id: state.id.clone(),
                        escalation_id,
                        step_index: state.current_step_index,
                    }));
                }
                let start = state.current_step_index;
                self.drive(state, steps, start, Some(record), token).await
            }
            WorkflowStatus::Initialized | WorkflowStatus::Running => {
                let start = start_from.max(state.current_step_index);
                let resolution = self.interrupted_resolution(&state, start)?;
                self.drive(state, steps, start, resolution, token).await
            }
        }
    }

    /// The answered escalation an interrupted run was applying to step
    /// `start`, if any.
    fn interrupted_resolution(
        &self,
        state: &WorkflowState,
        start: usize,
    ) -> Result<Option<EscalationRecord>, WorkflowError> {
        let Some(id) = &state.resolved_escalation else {
            return Ok(None);
        };
        let record = self.escalations.get(id)?;
        if !record.is_resolved() || record.step_index != start {
            return Ok(None);
        }
        tracing::info!(
            workflow_id = %state.id,
            escalation_id = %id,
            step_index = start,
            "re-applying escalation response after interruption"
        );
        Ok(Some(record))
    }

    /// Run steps `start..` against `state`. `resolution` is handed to the
    /// first step only.
    async fn drive(
        &self,
        mut state: WorkflowState,
        steps: &[Step],
        start: usize,
        mut resolution: Option<EscalationRecord>,
        token: &CancellationToken,
    ) -> Result<ExecutionOutcome, WorkflowError> {
        if start > steps.len() {
            return Err(WorkflowError::InvalidStartIndex {
                index: start,
                len: steps.len(),
            });
        }
        let fresh = state.status == WorkflowStatus::Initialized;
        match &resolution {
            Some(record) => state.mark_resolving(&record.id),
            None => state.mark_running(),
        }
        state.current_step_index = state.current_step_index.max(start);
        self.store.save(&state)?;
        if fresh {
            tracing::info!(workflow_id = %state.id, steps = steps.len(), "workflow started");
            self.events.emit(WorkflowEvent::WorkflowStarted {
                workflow_id: state.id.clone(),
            });
        } else {
            tracing::info!(workflow_id = %state.id, step_index = start, "workflow resumed");
        }

        for (index, step) in steps.iter().enumerate().skip(start) {
            if token.is_cancelled() {
                let reason = self.take_abort_reason(&state.id);
                return Err(self.mark_aborted(&mut state, index, reason)?);
            }

            let resolution = resolution.take();
            let mut record = StepRecord {
                index,
                name: &step.name,
                started_at: Utc::now(),
                timer: Instant::now(),
                attempts: 0,
                errors: Vec::new(),
            };
            tracing::debug!(workflow_id = %state.id, step_index = index, step = %step.name, "step started");

            let ctx = StepContext {
                workflow_id: state.id.clone(),
                step_index: index,
                step_name: step.name.clone(),
                attempt: 1,
                variables: state.variables.clone(),
                resolution: resolution.clone(),
            };
            let RetryOutcome {
                result,
                attempts,
                errors,
            } = self.run_step(step, ctx, token).await;
            record.attempts = attempts;
            record.errors = errors;

            let Some(result) = result else {
                let reason = self.take_abort_reason(&state.id);
                state.record_step(record.entry(StepOutcome::Failed {
                    error: format!("aborted: {}", reason),
                }));
                return Err(self.mark_aborted(&mut state, index, reason)?);
            };

            let signal = match result {
                Ok(signal) => signal,
                Err(err) => {
                    let escalate = err.is_transient()
                        && match step.on_exhausted {
                            OnExhausted::Escalate => true,
                            OnExhausted::EscalateIfPartial => err.partial().is_some(),
                            OnExhausted::Fail => false,
                        };
                    if !escalate {
                        return Err(self.fail_step(state, record, err.message().to_string())?);
                    }
                    StepSignal::Escalate(exhaustion_escalation(step, index, &err, &record))
                }
            };

            match signal {
                StepSignal::Continue(outputs) => {
                    state.variables.extend(outputs);
                    let outcome = match &resolution {
                        Some(resolved) => {
                            state.variables.insert(
                                format!("{}.resolution", step.name),
                                json!(resolved.response),
                            );
                            StepOutcome::Resolved {
                                escalation_id: resolved.id.clone(),
                            }
                        }
                        None => StepOutcome::Completed,
                    };
                    let entry = record.entry(outcome);
                    let duration_ms = entry.duration_ms;
                    let retries = entry.retries;
                    state.record_step(entry);
                    state.advance_past(index);
                    self.store.save(&state)?;

                    self.metrics
                        .record_phase(&format!("step.{}", step.name), record.timer.elapsed());
                    self.metrics.increment("steps.completed");
                    self.metrics.add("steps.retries", retries as u64);
                    tracing::info!(
                        workflow_id = %state.id,
                        step_index = index,
                        step = %step.name,
                        duration_ms,
                        retries,
                        "step completed"
                    );
                    self.events.emit(WorkflowEvent::StepCompleted {
                        workflow_id: state.id.clone(),
                        index,
                        duration_ms,
                    });
                }
                StepSignal::Escalate(request) => {
                    let escalation = self
                        .escalations
                        .add(&state.id, index, &request.question, request.context)
                        .await?;
                    return self.pause(state, record, escalation);
                }
                StepSignal::Escalated(escalation) => {
                    return self.pause(state, record, escalation);
                }
            }
        }

        state.mark_completed();
        self.store.save(&state)?;
        tracing::info!(workflow_id = %state.id, "workflow completed");
        self.metrics.increment("workflows.completed");
        self.events.emit(WorkflowEvent::WorkflowCompleted {
            workflow_id: state.id.clone(),
        });
        Ok(ExecutionOutcome::Completed(state))
    }

    fn pause(
        &self,
        mut state: WorkflowState,
        record: StepRecord<'_>,
        escalation: EscalationRecord,
    ) -> Result<ExecutionOutcome, WorkflowError> {
        let step_index = record.index;
        state.record_step(record.entry(StepOutcome::Escalated {
            escalation_id: escalation.id.clone(),
        }));
        state.mark_paused(&escalation.id);
        self.store.save(&state)?;

        tracing::info!(
            workflow_id = %state.id,
            step_index,
            escalation_id = %escalation.id,
            "workflow paused on escalation"
        );
        self.metrics.increment("workflows.paused");
        self.events.emit(WorkflowEvent::WorkflowPaused {
            workflow_id: state.id.clone(),
            step_index,
            escalation_id: escalation.id.clone(),
        });
        Ok(ExecutionOutcome::Paused(PendingWorkflow {
            workflow_id: state.id,
            escalation_id: escalation.id,
            step_index,
        }))
    }

    fn fail_step(
        &self,
        mut state: WorkflowState,
        record: StepRecord<'_>,
        message: String,
    ) -> Result<WorkflowError, WorkflowError> {
        let step_index = record.index;
        state.record_step(record.entry(StepOutcome::Failed {
            error: message.clone(),
        }));
        state.mark_failed(step_index, &message);
        self.store.save(&state)?;

        tracing::error!(workflow_id = %state.id, step_index, error = %message, "workflow failed");
        self.metrics.increment("workflows.failed");
        self.events.emit(WorkflowEvent::WorkflowFailed {
            workflow_id: state.id.clone(),
            step_index,
            error: message.clone(),
        });
        Ok(WorkflowError::StepFailed {
            step_index,
            message,
        })
    }

    /// Invoke a step's handler under its retry policy.
    ///
    /// Built-in handlers re-entered after a resolved escalation do not call
    /// out again; the human response completes them. See
    /// [`StepHandler::resolution_outputs`].
    async fn run_step(
        &self,
        step: &Step,
        ctx: StepContext,
        token: &CancellationToken,
    ) -> RetryOutcome<StepSignal> {
        if let Some(resolution) = &ctx.resolution
            && let Some(response) = resolution.response.as_deref()
            && !matches!(step.handler, StepHandler::Custom(_))
        {
            let outputs = step.handler.resolution_outputs(resolution, response);
            return RetryOutcome {
                result: Some(Ok(StepSignal::Continue(outputs))),
                attempts: 0,
                errors: Vec::new(),
            };
        }

        let policy = step
            .retry
            .clone()
            .unwrap_or_else(|| self.config.retry.policy_for(step.class()));
        run_with_retry(&policy, token, |attempt| {
            let mut ctx = ctx.clone();
            ctx.attempt = attempt;
            async move { self.invoke(step, &ctx).await }
        })
        .await
    }

    async fn invoke(&self, step: &Step, ctx: &StepContext) -> Result<StepSignal, HandlerError> {
        match &step.handler {
            StepHandler::Agent {
                agent,
                capability,
                output_key,
            } => {
                let request = AgentRequest::new(
                    *capability,
                    json!({
                        "workflow_id": ctx.workflow_id,
                        "step_index": ctx.step_index,
                        "step": ctx.step_name,
                        "attempt": ctx.attempt,
                        "variables": ctx.variables,
                    }),
                );
                let response =
                    invoke_with_timeout(agent.as_ref(), request, self.config.agent_timeout).await?;
                Ok(StepSignal::output(output_key.clone(), response.content))
            }
            StepHandler::Decision {
                question,
                context_key,
                output_key,
            } => {
                let context = match context_key {
                    Some(key) => ctx.require(key)?.clone(),
                    None => json!(ctx.variables),
                };
                let decision = self
                    .decisions
                    .make_decision(&ctx.workflow_id, question, context)
                    .await?;
                if self.decisions.requires_escalation(&decision) {
                    return Ok(StepSignal::escalate(
                        question.clone(),
                        json!({
                            "proposed_value": decision.value,
                            "confidence": decision.confidence,
                            "threshold": self.decisions.config().escalation_threshold,
                            "rationale": decision.rationale,
                            "source": decision.source,
                        }),
                    ));
                }
                Ok(StepSignal::output(output_key.clone(), decision.value))
            }
            StepHandler::Review {
                aggregator,
                artifact_key,
                test_results_key,
                output_key,
            } => {
                self.review(ctx, aggregator, artifact_key, test_results_key.as_deref(), output_key)
                    .await
            }
            StepHandler::Custom(action) => action.run(ctx).await,
        }
    }

    /// Dual review with revisions until pass or escalate. The aggregator only
    /// returns `fail` while iterations remain, so the loop is bounded by its
    /// `max_iterations`.
    async fn review(
        &self,
        ctx: &StepContext,
        aggregator: &DualReviewAggregator,
        artifact_key: &str,
        test_results_key: Option<&str>,
        output_key: &str,
    ) -> Result<StepSignal, HandlerError> {
        let mut artifact = ctx.require(artifact_key)?.clone();
        let test_results = test_results_key
            .and_then(|key| ctx.variable(key))
            .cloned()
            .unwrap_or(serde_json::Value::Null);

        let mut iteration = 1;
        loop {
            let request = ReviewRequest::new(&ctx.workflow_id, ctx.step_index, artifact)
                .with_test_results(test_results.clone())
                .with_iteration(iteration);
            let result = aggregator.perform_dual_review(&request).await?;

            match result.decision {
                ReviewDecision::Pass => {
                    let mut outputs = StepOutputs::new();
                    outputs.insert(artifact_key.to_string(), result.artifact.clone());
                    let value = serde_json::to_value(&result).map_err(|e| {
                        HandlerError::fatal(format!("failed to serialize review result: {}", e))
                    })?;
                    outputs.insert(output_key.to_string(), value);
                    return Ok(StepSignal::Continue(outputs));
                }
                ReviewDecision::Fail => {
                    tracing::info!(
                        workflow_id = %ctx.workflow_id,
                        step_index = ctx.step_index,
                        iteration,
                        findings = result.findings.len(),
                        "review failed, requesting revision"
                    );
                    artifact = aggregator.request_revision(&result.artifact, &result).await?;
                    iteration += 1;
                }
                ReviewDecision::Escalate => {
                    if let Some(id) = &result.escalation_id {
                        let record = self
                            .escalations
                            .get(id)
                            .map_err(|e| HandlerError::fatal(e.to_string()))?;
                        return Ok(StepSignal::Escalated(record));
                    }
                    return Ok(StepSignal::Escalate(EscalationRequest {
                        question: escalation_question(&request),
                        context: escalation_context(&result),
                    }));
                }
            }
        }
    }
}

/// Escalation filed when a step runs out of retries.
fn exhaustion_escalation(
    step: &Step,
    index: usize,
    err: &HandlerError,
    record: &StepRecord<'_>,
) -> EscalationRequest {
    EscalationRequest {
        question: format!(
            "Step '{}' failed after {} attempt(s): {}",
            step.name,
            record.attempts,
            err.message()
        ),
        context: json!({
            "step": step.name,
            "step_index": index,
            "error": err.message(),
            "attempts": record.attempts,
            "errors": record.errors,
            "partial": err.partial(),
        }),
    }
}
