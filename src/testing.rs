//! Scripted agents for tests and local dry runs.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use waypoint_common::{Agent, AgentError, AgentIdentity, AgentRequest, AgentResponse, Capability};

type Scripted = Result<AgentResponse, AgentError>;

/// An agent that replays queued responses per capability.
///
/// Queued responses are consumed in order; once a capability's queue is
/// empty its `always` response (if any) is returned on every call.
pub struct ScriptedAgent {
    identity: AgentIdentity,
    queued: Mutex<HashMap<Capability, VecDeque<Scripted>>>,
    always: HashMap<Capability, AgentResponse>,
    calls: Mutex<Vec<AgentRequest>>,
    delay: Option<Duration>,
}

impl ScriptedAgent {
    pub fn new(name: &str) -> Self {
        Self {
            identity: AgentIdentity::new(name, "scripted"),
            queued: Mutex::new(HashMap::new()),
            always: HashMap::new(),
            calls: Mutex::new(Vec::new()),
            delay: None,
        }
    }

    pub fn with_model(mut self, model: &str) -> Self {
        self.identity.model = model.to_string();
        self
    }

    pub fn then(self, capability: Capability, result: Scripted) -> Self {
        self.queued
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(capability)
            .or_default()
            .push_back(result);
        self
    }

    pub fn then_ok(self, capability: Capability, response: AgentResponse) -> Self {
        self.then(capability, Ok(response))
    }

    pub fn always(mut self, capability: Capability, response: AgentResponse) -> Self {
        self.always.insert(capability, response);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> Vec<AgentRequest> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn calls_for(&self, capability: Capability) -> usize {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|r| r.capability == capability)
            .count()
    }
}

#[async_trait]
impl Agent for ScriptedAgent {
    fn identity(&self) -> AgentIdentity {
        self.identity.clone()
    }

    async fn invoke(&self, request: AgentRequest) -> Result<AgentResponse, AgentError> {
        let capability = request.capability;
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).push(request);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let next = self
            .queued
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get_mut(&capability)
            .and_then(|q| q.pop_front());
        match next {
            Some(result) => result,
            None => self.always.get(&capability).cloned().ok_or_else(|| {
                AgentError::InvalidRequest(format!("no scripted response for {}", capability))
            }),
        }
    }
}
