use serde_json::json;
use std::sync::Arc;
use waypoint_common::{Agent, AgentRequest, AgentResponse, Capability, invoke_with_timeout};

use super::{Decision, DecisionConfig, DecisionSource};
use crate::audit::{AuditLogger, DecisionAuditTrail};
use crate::errors::DecisionError;
use crate::metrics::MetricsTracker;

/// Makes confidence-scored decisions and records them.
pub struct DecisionEngine {
    config: DecisionConfig,
    audit: Arc<AuditLogger>,
    reasoning: Option<Arc<dyn Agent>>,
    specialist: Option<Arc<dyn Agent>>,
    metrics: Option<Arc<MetricsTracker>>,
}

impl DecisionEngine {
    pub fn new(config: DecisionConfig, audit: Arc<AuditLogger>) -> Self {
        Self {
            config,
            audit,
            reasoning: None,
            specialist: None,
            metrics: None,
        }
    }

    pub fn with_reasoning_agent(mut self, agent: Arc<dyn Agent>) -> Self {
        self.reasoning = Some(agent);
        self
    }

    /// Agent consulted for a second opinion on low-confidence decisions.
    pub fn with_specialist(mut self, agent: Arc<dyn Agent>) -> Self {
        self.specialist = Some(agent);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsTracker>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &DecisionConfig {
        &self.config
    }

    /// Answer `question` for `workflow_id`.
    ///
    /// Configured answers win. Otherwise the reasoning agent answers; when its
    /// confidence is below the escalation threshold a specialist (if
    /// configured, and within the per-workflow budget) is asked as well and
    /// the more confident of the two is returned. Every decision made along
    /// the way is appended to the audit trail.
    pub async fn make_decision(
        &self,
        workflow_id: &str,
        question: &str,
        context: serde_json::Value,
    ) -> Result<Decision, DecisionError> {
        if let Some(answer) = self.config.answers.get(question) {
            let decision = Decision::new(
                question,
                DecisionSource::Deterministic,
                answer.clone(),
                self.config.deterministic_confidence,
                "Configured deterministic answer",
            )
            .with_context(context);
            self.record(workflow_id, &decision)?;
            return Ok(decision);
        }

        let agent = self
            .reasoning
            .as_ref()
            .ok_or_else(|| DecisionError::NoReasoningAgent {
                question: question.to_string(),
            })?;

        let request = AgentRequest::new(
            Capability::Reason,
            json!({ "question": question, "context": context }),
        );
        let response =
            invoke_with_timeout(agent.as_ref(), request, self.config.agent_timeout).await?;
        let primary = Self::from_response(
            question,
            DecisionSource::AgentReasoning,
            response,
            agent.as_ref(),
            &context,
        );
        self.record(workflow_id, &primary)?;

        if self.requires_escalation(&primary)
            && let Some(second) = self.second_opinion(workflow_id, &primary).await?
            && second.confidence > primary.confidence
        {
            return Ok(second);
        }
        Ok(primary)
    }

    /// Whether a decision is too uncertain to act on without a human.
    pub fn requires_escalation(&self, decision: &Decision) -> bool {
        decision.confidence < self.config.escalation_threshold
    }

    pub fn audit_trail(&self, workflow_id: &str) -> Result<DecisionAuditTrail, DecisionError> {
        self.audit.trail(workflow_id).map_err(DecisionError::Audit)
    }

    /// Specialist consultations already spent for a workflow, counted from
    /// its audit trail so the budget survives restarts.
    pub fn specialist_consultations(&self, workflow_id: &str) -> Result<u32, DecisionError> {
        let Some(specialist) = self.specialist.as_ref() else {
            return Ok(0);
        };
        let identity = specialist.identity().to_string();
        let trail = self.audit_trail(workflow_id)?;
        Ok(trail
            .decisions
            .iter()
            .filter(|d| d.agent.as_deref() == Some(identity.as_str()))
            .count() as u32)
    }

    fn from_response(
        question: &str,
        source: DecisionSource,
        response: AgentResponse,
        agent: &dyn Agent,
        context: &serde_json::Value,
    ) -> Decision {
        // A missing self-report counts as no confidence at all.
        let confidence = response.confidence_hint.unwrap_or(0.0);
        Decision::new(
            question,
            source,
            response.content,
            confidence,
            response.rationale.unwrap_or_default(),
        )
        .with_context(context.clone())
        .with_agent(agent.identity().to_string())
    }

    async fn second_opinion(
        &self,
        workflow_id: &str,
        primary: &Decision,
    ) -> Result<Option<Decision>, DecisionError> {
        let Some(specialist) = self.specialist.as_ref() else {
            return Ok(None);
        };
        if self.specialist_consultations(workflow_id)? >= self.config.max_specialist_escalations {
            tracing::debug!(
                workflow_id,
                limit = self.config.max_specialist_escalations,
                "specialist budget spent"
            );
            return Ok(None);
        }
        if let Some(ref metrics) = self.metrics {
            metrics.increment("decisions.specialist_consultations");
        }

        let request = AgentRequest::new(
            Capability::Reason,
            json!({
                "question": primary.question,
                "context": primary.context,
                "primary_answer": primary.value,
                "primary_confidence": primary.confidence,
                "primary_rationale": primary.rationale,
            }),
        );
        match invoke_with_timeout(specialist.as_ref(), request, self.config.agent_timeout).await {
            Ok(response) => {
                let decision = Self::from_response(
                    &primary.question,
                    DecisionSource::AgentReasoning,
                    response,
                    specialist.as_ref(),
                    &primary.context,
                );
                self.record(workflow_id, &decision)?;
                Ok(Some(decision))
            }
            Err(e) => {
                tracing::warn!(workflow_id, error = %e, "specialist consultation failed");
                Ok(None)
            }
        }
    }

    fn record(&self, workflow_id: &str, decision: &Decision) -> Result<(), DecisionError> {
        self.audit
            .append(workflow_id, decision)
            .map_err(DecisionError::Audit)?;
        if let Some(ref metrics) = self.metrics {
            metrics.increment(&format!("decisions.{}", decision.source));
        }
        tracing::debug!(
            workflow_id,
            question = %decision.question,
            source = %decision.source,
            confidence = decision.confidence,
            "decision made"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedAgent;
    use std::time::Duration;
    use waypoint_common::AgentError;

    fn engine(config: DecisionConfig) -> DecisionEngine {
        DecisionEngine::new(config, Arc::new(AuditLogger::ephemeral()))
    }

    fn reasoning(confidence: Option<f64>) -> Arc<ScriptedAgent> {
        let mut response = AgentResponse::new(json!("redis")).with_rationale("fast");
        response.confidence_hint = confidence;
        Arc::new(ScriptedAgent::new("reasoner").always(Capability::Reason, response))
    }

    #[tokio::test]
    async fn test_deterministic_answer_skips_agent() {
        let agent = reasoning(Some(0.1));
        let engine = engine(DecisionConfig::default().with_answer("Which database?", json!("postgres")))
            .with_reasoning_agent(agent.clone());

        let decision = engine
            .make_decision("wf", "Which database?", json!({}))
            .await
            .unwrap();
        assert_eq!(decision.source, DecisionSource::Deterministic);
        assert_eq!(decision.value, json!("postgres"));
        assert_eq!(decision.confidence, 0.95);
        assert!(!engine.requires_escalation(&decision));
        assert!(agent.calls().is_empty());
    }

    #[tokio::test]
    async fn test_agent_decision_is_recorded() {
        let engine = engine(DecisionConfig::default()).with_reasoning_agent(reasoning(Some(0.9)));
        let decision = engine.make_decision("wf", "Which cache?", json!({})).await.unwrap();

        assert_eq!(decision.source, DecisionSource::AgentReasoning);
        assert_eq!(decision.rationale, "fast");
        assert_eq!(decision.agent.as_deref(), Some("reasoner (scripted)"));
        let trail = engine.audit_trail("wf").unwrap();
        assert_eq!(trail.len(), 1);
        assert_eq!(trail.decisions[0], decision);
    }

    #[tokio::test]
    async fn test_missing_confidence_is_zero_and_escalates() {
        let engine = engine(DecisionConfig::default()).with_reasoning_agent(reasoning(None));
        let decision = engine.make_decision("wf", "q", json!(null)).await.unwrap();
        assert_eq!(decision.confidence, 0.0);
        assert!(engine.requires_escalation(&decision));
    }

    #[tokio::test]
    async fn test_out_of_range_confidence_is_clamped() {
        let engine = engine(DecisionConfig::default()).with_reasoning_agent(reasoning(Some(1.4)));
        let decision = engine.make_decision("wf", "q", json!(null)).await.unwrap();
        assert_eq!(decision.confidence, 1.0);
    }

    #[tokio::test]
    async fn test_escalation_threshold_boundary() {
        let engine = engine(DecisionConfig::default());
        let at = Decision::new("q", DecisionSource::AgentReasoning, json!(1), 0.75, "");
        let below = Decision::new("q", DecisionSource::AgentReasoning, json!(1), 0.7499, "");
        assert!(!engine.requires_escalation(&at));
        assert!(engine.requires_escalation(&below));
    }

    #[tokio::test]
    async fn test_no_agent_and_no_answer_is_error() {
        let engine = engine(DecisionConfig::default());
        let err = engine.make_decision("wf", "q", json!(null)).await.unwrap_err();
        assert!(matches!(err, DecisionError::NoReasoningAgent { .. }));
    }

    #[tokio::test]
    async fn test_agent_timeout_is_transient_error() {
        let agent = Arc::new(
            ScriptedAgent::new("slow")
                .always(Capability::Reason, AgentResponse::new(json!(1)))
                .with_delay(Duration::from_millis(200)),
        );
        let engine = engine(DecisionConfig::default().with_agent_timeout(Duration::from_millis(10)))
            .with_reasoning_agent(agent);
        let err = engine.make_decision("wf", "q", json!(null)).await.unwrap_err();
        assert!(matches!(err, DecisionError::Agent(AgentError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_specialist_replaces_low_confidence_primary() {
        let specialist = Arc::new(ScriptedAgent::new("specialist").always(
            Capability::Reason,
            AgentResponse::new(json!("memcached")).with_confidence(0.9),
        ));
        let engine = engine(DecisionConfig::default())
            .with_reasoning_agent(reasoning(Some(0.5)))
            .with_specialist(specialist.clone());

        let decision = engine.make_decision("wf", "Which cache?", json!({})).await.unwrap();
        assert_eq!(decision.source, DecisionSource::AgentReasoning);
        assert_eq!(decision.agent.as_deref(), Some("specialist (scripted)"));
        assert_eq!(decision.value, json!("memcached"));
        assert_eq!(engine.audit_trail("wf").unwrap().len(), 2);
        assert_eq!(specialist.calls()[0].context["primary_answer"], json!("redis"));
    }

    #[tokio::test]
    async fn test_specialist_budget_is_per_workflow() {
        let specialist = Arc::new(ScriptedAgent::new("specialist").always(
            Capability::Reason,
            AgentResponse::new(json!("x")).with_confidence(0.6),
        ));
        let engine = engine(DecisionConfig::default())
            .with_reasoning_agent(reasoning(Some(0.5)))
            .with_specialist(specialist.clone());

        for _ in 0..5 {
            engine.make_decision("wf-a", "q", json!(null)).await.unwrap();
        }
        engine.make_decision("wf-b", "q", json!(null)).await.unwrap();

        assert_eq!(engine.specialist_consultations("wf-a").unwrap(), 3);
        assert_eq!(engine.specialist_consultations("wf-b").unwrap(), 1);
        assert_eq!(specialist.calls().len(), 4);
    }

    #[tokio::test]
    async fn test_specialist_budget_survives_restart() {
        let dir = tempfile::TempDir::new().unwrap();
        let specialist = || {
            Arc::new(ScriptedAgent::new("specialist").always(
                Capability::Reason,
                AgentResponse::new(json!("x")).with_confidence(0.6),
            ))
        };
        let engine_at = |agent: Arc<ScriptedAgent>| {
            DecisionEngine::new(
                DecisionConfig::default(),
                Arc::new(AuditLogger::new(&dir.path().join("decisions"))),
            )
            .with_reasoning_agent(reasoning(Some(0.5)))
            .with_specialist(agent)
        };

        let before = engine_at(specialist());
        for _ in 0..2 {
            before.make_decision("wf", "q", json!(null)).await.unwrap();
        }

        let restarted_specialist = specialist();
        let after = engine_at(restarted_specialist.clone());
        assert_eq!(after.specialist_consultations("wf").unwrap(), 2);
        for _ in 0..3 {
            after.make_decision("wf", "q", json!(null)).await.unwrap();
        }
        assert_eq!(restarted_specialist.calls().len(), 1);
        assert_eq!(after.specialist_consultations("wf").unwrap(), 3);
    }

    #[tokio::test]
    async fn test_specialist_failure_keeps_primary() {
        let specialist = Arc::new(ScriptedAgent::new("specialist").then(
            Capability::Reason,
            Err(AgentError::Network("reset".into())),
        ));
        let engine = engine(DecisionConfig::default())
            .with_reasoning_agent(reasoning(Some(0.4)))
            .with_specialist(specialist);

        let decision = engine.make_decision("wf", "q", json!(null)).await.unwrap();
        assert_eq!(decision.source, DecisionSource::AgentReasoning);
        assert_eq!(decision.confidence, 0.4);
    }
}
