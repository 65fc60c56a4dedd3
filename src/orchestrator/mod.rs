//! Step-sequenced workflow execution with durable state.
//!
//! - [`state`]: the persisted `WorkflowState` and its step log
//! - [`store`]: crash-safe persistence with backups and leases
//! - [`step`]: steps, handler kinds and the `StepAction` extension point
//! - [`retry`]: per-handler retry policy with exponential backoff
//! - [`executor`]: runs, pauses, resumes, restarts and aborts workflows

pub mod executor;
pub mod retry;
pub mod state;
pub mod step;
pub mod store;

pub use executor::{
    ExecutionOutcome, ExecutorConfig, PendingWorkflow, ResumeChoice, ResumeDecider,
    WorkflowExecutor,
};
pub use retry::{HandlerClass, OnExhausted, RetryConfig, RetryPolicy};
pub use state::{StepLogEntry, StepOutcome, WorkflowFailure, WorkflowState, WorkflowStatus};
pub use step::{
    EscalationRequest, Step, StepAction, StepContext, StepHandler, StepOutputs, StepSignal,
};
pub use store::{StateStore, WorkflowLease};
