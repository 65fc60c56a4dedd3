//! Dual review: the producer's self review plus an independent review.
//!
//! ## Flow
//!
//! 1. The producer reviews its own artifact. Critical issues trigger exactly
//!    one fix pass and one re-validation.
//! 2. A reviewer with a different identity runs the security, quality and
//!    test-adequacy checks concurrently.
//! 3. Scores, confidences and findings are merged into one
//!    [`CombinedReviewResult`] with a pass / fail / escalate verdict.
//!
//! A phase that cannot complete never yields `pass`; the verdict escalates.

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use waypoint_common::{
    Agent, AgentRequest, AgentResponse, Capability, EventSink, ReviewDecision, WorkflowEvent,
    invoke_with_timeout,
};

use super::findings::{Category, ReviewFinding, count_by_severity};
use super::report::{
    CombinedReviewResult, IndependentReviewSummary, ReviewMetrics, SelfReviewReport,
    SelfReviewSummary, SubReviewReport,
};
use crate::errors::ReviewError;
use crate::escalation::EscalationQueue;
use crate::metrics::MetricsTracker;

pub const DEFAULT_PASS_THRESHOLD: f64 = 0.85;
pub const DEFAULT_MIN_SUB_SCORE: f64 = 85.0;
pub const DEFAULT_MAX_ITERATIONS: u32 = 3;

/// How self-review and independent-review confidences are combined.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum ConfidenceMode {
    /// The lower of the two.
    #[default]
    Minimum,
    /// `self_weight * self + (1 - self_weight) * independent`.
    Weighted { self_weight: f64 },
}

impl ConfidenceMode {
    /// # Examples
    ///
    /// ```
    /// use waypoint::review::ConfidenceMode;
    ///
    /// assert_eq!(ConfidenceMode::Minimum.combine(0.9, 0.6), 0.6);
    /// let weighted = ConfidenceMode::Weighted { self_weight: 0.25 };
    /// assert!((weighted.combine(0.8, 0.4) - 0.5).abs() < 1e-9);
    /// ```
    pub fn combine(&self, self_confidence: f64, independent_confidence: f64) -> f64 {
        let combined = match *self {
            Self::Minimum => self_confidence.min(independent_confidence),
            Self::Weighted { self_weight } => {
                let w = self_weight.clamp(0.0, 1.0);
                w * self_confidence + (1.0 - w) * independent_confidence
            }
        };
        crate::decision::clamp_confidence(combined)
    }
}

#[derive(Debug, Clone)]
pub struct ReviewConfig {
    pub pass_threshold: f64,
    pub min_sub_score: f64,
    pub max_iterations: u32,
    pub confidence_mode: ConfidenceMode,
    pub agent_timeout: Duration,
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            pass_threshold: DEFAULT_PASS_THRESHOLD,
            min_sub_score: DEFAULT_MIN_SUB_SCORE,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            confidence_mode: ConfidenceMode::default(),
            agent_timeout: crate::DEFAULT_AGENT_TIMEOUT,
        }
    }
}

impl ReviewConfig {
    pub fn with_confidence_mode(mut self, mode: ConfidenceMode) -> Self {
        self.confidence_mode = mode;
        self
    }

    pub fn with_agent_timeout(mut self, timeout: Duration) -> Self {
        self.agent_timeout = timeout;
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = max_iterations;
        self
    }
}

/// What to review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewRequest {
    pub workflow_id: String,
    pub step_index: usize,
    pub artifact: serde_json::Value,
    #[serde(default)]
    pub test_results: serde_json::Value,
    #[serde(default)]
    pub context: serde_json::Value,
    /// One-based review iteration for this artifact.
    pub iteration: u32,
}

impl ReviewRequest {
    pub fn new(workflow_id: impl Into<String>, step_index: usize, artifact: serde_json::Value) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            step_index,
            artifact,
            test_results: serde_json::Value::Null,
            context: serde_json::Value::Null,
            iteration: 1,
        }
    }

    pub fn with_test_results(mut self, test_results: serde_json::Value) -> Self {
        self.test_results = test_results;
        self
    }

    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = context;
        self
    }

    pub fn with_iteration(mut self, iteration: u32) -> Self {
        self.iteration = iteration;
        self
    }
}

/// Inputs to the verdict rules, separated from the agent calls so the rules
/// can be checked on their own.
#[derive(Debug, Clone)]
pub struct VerdictInput<'a> {
    pub phase_errors: &'a [String],
    pub findings: &'a [ReviewFinding],
    pub self_passed: bool,
    pub independent_passed: bool,
    pub confidence: f64,
    pub iteration: u32,
}

/// Apply the verdict rules in order:
///
/// 1. a phase did not complete → escalate
/// 2. any critical or high finding → escalate
/// 3. both reviews passed and confidence meets the threshold → pass
/// 4. fixable findings remain and iterations are left → fail
/// 5. otherwise → escalate
pub fn decide_verdict(input: &VerdictInput<'_>, config: &ReviewConfig) -> (ReviewDecision, String) {
    if !input.phase_errors.is_empty() {
        return (
            ReviewDecision::Escalate,
            format!(
                "{} review phase(s) did not complete: {}",
                input.phase_errors.len(),
                input.phase_errors.join("; ")
            ),
        );
    }

    let blocking = input.findings.iter().filter(|f| f.is_blocking()).count();
    if blocking > 0 {
        return (
            ReviewDecision::Escalate,
            format!("{} critical/high finding(s) require human review", blocking),
        );
    }

    if input.self_passed && input.independent_passed && input.confidence >= config.pass_threshold {
        return (
            ReviewDecision::Pass,
            format!(
                "Self review and independent review passed with confidence {:.2}",
                input.confidence
            ),
        );
    }

    let fixable = input.findings.iter().filter(|f| f.is_fixable()).count();
    if fixable > 0 && input.iteration < config.max_iterations {
        return (
            ReviewDecision::Fail,
            format!(
                "{} fixable finding(s) remain (iteration {} of {})",
                fixable, input.iteration, config.max_iterations
            ),
        );
    }

    let reason = if fixable > 0 {
        format!(
            "{} finding(s) remain after {} iteration(s)",
            fixable, input.iteration
        )
    } else if !input.self_passed {
        "Self review did not pass and reported nothing fixable".to_string()
    } else if !input.independent_passed {
        format!(
            "Independent sub-scores below {} with nothing fixable",
            config.min_sub_score
        )
    } else {
        format!(
            "Confidence {:.2} below threshold {:.2} with no fixable cause",
            input.confidence, config.pass_threshold
        )
    };
    (ReviewDecision::Escalate, reason)
}

/// Runs dual reviews.
///
/// Phase durations go to the shared [`MetricsTracker`]; its bottleneck
/// threshold decides which phases are reported as bottlenecks.
pub struct DualReviewAggregator {
    producer: Arc<dyn Agent>,
    reviewer: Arc<dyn Agent>,
    config: ReviewConfig,
    metrics: Arc<MetricsTracker>,
    queue: Option<Arc<EscalationQueue>>,
    events: EventSink,
}

impl DualReviewAggregator {
    /// Fails with [`ReviewError::SameReviewer`] when both agents share an identity.
    pub fn new(
        producer: Arc<dyn Agent>,
        reviewer: Arc<dyn Agent>,
        config: ReviewConfig,
        metrics: Arc<MetricsTracker>,
    ) -> Result<Self, ReviewError> {
        let identity = reviewer.identity();
        if producer.identity() == identity {
            return Err(ReviewError::SameReviewer {
                identity: identity.to_string(),
            });
        }
        Ok(Self {
            producer,
            reviewer,
            config,
            metrics,
            queue: None,
            events: EventSink::disabled(),
        })
    }

    /// File escalations directly when the verdict is escalate.
    pub fn with_escalation_queue(mut self, queue: Arc<EscalationQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    pub fn config(&self) -> &ReviewConfig {
        &self.config
    }

    pub fn has_escalation_queue(&self) -> bool {
        self.queue.is_some()
    }

    async fn call(
        &self,
        agent: &dyn Agent,
        phase: &str,
        capability: Capability,
        context: serde_json::Value,
    ) -> Result<AgentResponse, ReviewError> {
        invoke_with_timeout(
            agent,
            AgentRequest::new(capability, context),
            self.config.agent_timeout,
        )
        .await
        .map_err(|source| ReviewError::Agent {
            phase: phase.to_string(),
            source,
        })
    }

    /// Self review, with one fix pass and one re-validation on critical issues.
    async fn run_self_review(
        &self,
        request: &ReviewRequest,
        artifact: &mut serde_json::Value,
    ) -> Result<(SelfReviewReport, bool), ReviewError> {
        let context = |artifact: &serde_json::Value| {
            json!({
                "artifact": artifact,
                "test_results": request.test_results,
                "context": request.context,
                "iteration": request.iteration,
            })
        };

        let response = self
            .call(self.producer.as_ref(), "self_review", Capability::SelfReview, context(&*artifact))
            .await?;
        let report = SelfReviewReport::from_response(&response)?;
        if !report.has_critical_issues() {
            return Ok((report, false));
        }

        tracing::info!(
            workflow_id = %request.workflow_id,
            step_index = request.step_index,
            critical = report.critical_issues().len(),
            "self review found critical issues, running fix pass"
        );
        let fix = self
            .call(
                self.producer.as_ref(),
                "fix",
                Capability::Fix,
                json!({
                    "artifact": artifact,
                    "issues": report.critical_issues(),
                    "context": request.context,
                }),
            )
            .await?;
        *artifact = fix.content;

        let revalidated = self
            .call(self.producer.as_ref(), "self_review", Capability::SelfReview, context(&*artifact))
            .await?;
        Ok((SelfReviewReport::from_response(&revalidated)?, true))
    }

    async fn run_sub_review(
        &self,
        phase: &'static str,
        capability: Capability,
        category: Category,
        context: &serde_json::Value,
    ) -> (Result<SubReviewReport, ReviewError>, Duration) {
        let start = Instant::now();
        let result = match self
            .call(self.reviewer.as_ref(), phase, capability, context.clone())
            .await
        {
            Ok(response) => SubReviewReport::from_response(phase, category, &response),
            Err(e) => Err(e),
        };
        (result, start.elapsed())
    }

    fn record_phase(
        &self,
        name: &str,
        elapsed: Duration,
        phase_ms: &mut BTreeMap<String, u64>,
        bottlenecks: &mut Vec<String>,
    ) {
        phase_ms.insert(name.to_string(), elapsed.as_millis() as u64);
        if self.metrics.record_phase(&format!("review.{}", name), elapsed) {
            bottlenecks.push(name.to_string());
        }
    }

    /// Review an artifact and produce the merged verdict.
    ///
    /// Agent failures inside a phase do not make this return `Err`; they make
    /// the verdict `escalate`. `Err` is only returned when filing the
    /// escalation itself fails.
    pub async fn perform_dual_review(
        &self,
        request: &ReviewRequest,
    ) -> Result<CombinedReviewResult, ReviewError> {
        let total = Instant::now();
        let mut phase_ms = BTreeMap::new();
        let mut bottlenecks = Vec::new();
        let mut phase_errors = Vec::new();
        let mut findings = Vec::new();
        let mut artifact = request.artifact.clone();

        // Phase 1: self review
        let start = Instant::now();
        let self_outcome = self.run_self_review(request, &mut artifact).await;
        self.record_phase("self_review", start.elapsed(), &mut phase_ms, &mut bottlenecks);
        let self_review = match self_outcome {
            Ok((report, fixed)) => {
                findings.extend(report.issues.iter().cloned());
                SelfReviewSummary {
                    passed: report.passed,
                    confidence: report.confidence,
                    issues_found: report.issues.len(),
                    fixed,
                    error: None,
                }
            }
            Err(e) => {
                tracing::warn!(
                    workflow_id = %request.workflow_id,
                    step_index = request.step_index,
                    error = %e,
                    "self review did not complete"
                );
                phase_errors.push(e.to_string());
                SelfReviewSummary {
                    passed: false,
                    confidence: 0.0,
                    issues_found: 0,
                    fixed: false,
                    error: Some(e.to_string()),
                }
            }
        };

        // Phase 2: independent review, sub-checks in parallel
        let context = json!({
            "artifact": artifact,
            "test_results": request.test_results,
            "context": request.context,
        });
        let (security, quality, test_adequacy) = futures::join!(
            self.run_sub_review("security", Capability::SecurityReview, Category::Security, &context),
            self.run_sub_review("quality", Capability::QualityReview, Category::Quality, &context),
            self.run_sub_review("test_adequacy", Capability::TestReview, Category::Testing, &context),
        );

        let mut independent = IndependentReviewSummary::default();
        for (name, (result, elapsed), slot) in [
            ("security", security, &mut independent.security),
            ("quality", quality, &mut independent.quality),
            ("test_adequacy", test_adequacy, &mut independent.test_adequacy),
        ] {
            self.record_phase(name, elapsed, &mut phase_ms, &mut bottlenecks);
            match result {
                Ok(report) => {
                    findings.extend(report.findings.iter().cloned());
                    *slot = Some(report);
                }
                Err(e) => {
                    tracing::warn!(
                        workflow_id = %request.workflow_id,
                        phase = name,
                        error = %e,
                        "independent review phase did not complete"
                    );
                    independent.errors.push(e.to_string());
                }
            }
        }
        phase_errors.extend(independent.errors.iter().cloned());

        // Phase 3: merge
        let decision_start = Instant::now();
        let scores: Vec<f64> = independent.reports().map(|r| r.score).collect();
        let overall_score = if scores.is_empty() {
            0.0
        } else {
            scores.iter().sum::<f64>() / scores.len() as f64
        };
        independent.confidence = independent
            .reports()
            .map(|r| r.effective_confidence())
            .reduce(f64::min)
            .unwrap_or(0.0);
        independent.passed = independent.is_complete()
            && independent
                .reports()
                .all(|r| r.score >= self.config.min_sub_score);
        let confidence = self
            .config
            .confidence_mode
            .combine(self_review.confidence, independent.confidence);

        findings.sort_by_key(|f| f.severity);
        let (decision, rationale) = decide_verdict(
            &VerdictInput {
                phase_errors: &phase_errors,
                findings: &findings,
                self_passed: self_review.passed,
                independent_passed: independent.passed,
                confidence,
                iteration: request.iteration,
            },
            &self.config,
        );
        self.record_phase("decision", decision_start.elapsed(), &mut phase_ms, &mut bottlenecks);

        self.metrics.record_findings(findings.iter().map(|f| f.severity));
        self.metrics.record_iteration(
            &format!("{}:{}", request.workflow_id, request.step_index),
            request.iteration,
        );
        self.metrics.increment(&format!("reviews.{}", decision));

        let findings_by_severity = count_by_severity(&findings);
        let mut result = CombinedReviewResult {
            overall_score,
            confidence,
            decision,
            findings,
            rationale,
            metrics: ReviewMetrics {
                total_ms: total.elapsed().as_millis() as u64,
                phase_ms,
                findings_by_severity,
                iteration: request.iteration,
                bottlenecks,
            },
            self_review,
            independent_review: independent,
            artifact,
            escalation_id: None,
        };

        if decision.requires_human()
            && let Some(ref queue) = self.queue
        {
            let record = queue
                .add(
                    &request.workflow_id,
                    request.step_index,
                    &escalation_question(request),
                    escalation_context(&result),
                )
                .await?;
            result.escalation_id = Some(record.id);
        }

        tracing::info!(
            workflow_id = %request.workflow_id,
            step_index = request.step_index,
            decision = %decision,
            overall_score,
            confidence,
            iteration = request.iteration,
            "dual review completed"
        );
        self.events.emit(WorkflowEvent::ReviewCompleted {
            decision,
            overall_score,
            confidence,
        });
        Ok(result)
    }

    /// Ask the producer to revise an artifact that failed review.
    pub async fn request_revision(
        &self,
        artifact: &serde_json::Value,
        result: &CombinedReviewResult,
    ) -> Result<serde_json::Value, ReviewError> {
        let response = self
            .call(
                self.producer.as_ref(),
                "revise",
                Capability::Revise,
                json!({
                    "artifact": artifact,
                    "findings": result.findings,
                    "rationale": result.rationale,
                }),
            )
            .await?;
        Ok(response.content)
    }
}

/// The question filed when a review needs a human.
pub fn escalation_question(request: &ReviewRequest) -> String {
    format!(
        "Review of step {} (iteration {}) needs a human decision",
        request.step_index, request.iteration
    )
}

/// Context attached to a review escalation.
pub fn escalation_context(result: &CombinedReviewResult) -> serde_json::Value {
    json!({
        "rationale": result.rationale,
        "overall_score": result.overall_score,
        "confidence": result.confidence,
        "findings": result.findings,
        "artifact": result.artifact,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::review::findings::Severity;
    use crate::testing::ScriptedAgent;
    use serde_json::Value;
    use tempfile::TempDir;
    use waypoint_common::AgentError;

    fn self_review(passed: bool, confidence: f64, issues: Value) -> AgentResponse {
        AgentResponse::new(json!({
            "passed": passed,
            "confidence": confidence,
            "checklist": [{"item": "compiles", "passed": passed}],
            "issues": issues,
        }))
    }

    fn sub_review(score: f64, findings: Value) -> AgentResponse {
        AgentResponse::new(json!({"score": score, "findings": findings})).with_confidence(0.9)
    }

    fn passing_producer() -> ScriptedAgent {
        ScriptedAgent::new("producer").always(Capability::SelfReview, self_review(true, 0.95, json!([])))
    }

    fn reviewer_with(security: AgentResponse, quality: AgentResponse, tests: AgentResponse) -> ScriptedAgent {
        ScriptedAgent::new("reviewer")
            .always(Capability::SecurityReview, security)
            .always(Capability::QualityReview, quality)
            .always(Capability::TestReview, tests)
    }

    fn passing_reviewer() -> ScriptedAgent {
        reviewer_with(
            sub_review(90.0, json!([])),
            sub_review(95.0, json!([])),
            sub_review(88.0, json!([])),
        )
    }

    fn aggregator(producer: ScriptedAgent, reviewer: ScriptedAgent) -> DualReviewAggregator {
        DualReviewAggregator::new(
            Arc::new(producer),
            Arc::new(reviewer),
            ReviewConfig::default(),
            Arc::new(MetricsTracker::default()),
        )
        .unwrap()
    }

    fn request() -> ReviewRequest {
        ReviewRequest::new("wf", 2, json!({"code": "fn main() {}"}))
            .with_test_results(json!({"passed": 12, "failed": 0}))
    }

    #[test]
    fn test_same_identity_is_rejected() {
        let err = DualReviewAggregator::new(
            Arc::new(ScriptedAgent::new("coder")),
            Arc::new(ScriptedAgent::new("coder")),
            ReviewConfig::default(),
            Arc::new(MetricsTracker::default()),
        )
        .err()
        .unwrap();
        assert!(matches!(err, ReviewError::SameReviewer { .. }));
    }

    #[test]
    fn test_same_name_different_model_is_independent() {
        let result = DualReviewAggregator::new(
            Arc::new(ScriptedAgent::new("coder").with_model("m1")),
            Arc::new(ScriptedAgent::new("coder").with_model("m2")),
            ReviewConfig::default(),
            Arc::new(MetricsTracker::default()),
        );
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_clean_review_passes() {
        let aggregator = aggregator(passing_producer(), passing_reviewer());
        let result = aggregator.perform_dual_review(&request()).await.unwrap();

        assert_eq!(result.decision, ReviewDecision::Pass);
        assert!((result.overall_score - 91.0).abs() < 1e-9);
        assert_eq!(result.confidence, 0.9);
        assert!(result.self_review.passed);
        assert!(result.independent_review.passed);
        assert!(result.escalation_id.is_none());
    }

    #[tokio::test]
    async fn test_pass_requires_every_sub_score_at_minimum() {
        let reviewer = reviewer_with(
            sub_review(100.0, json!([])),
            sub_review(100.0, json!([])),
            sub_review(84.0, json!([])),
        );
        let result = aggregator(passing_producer(), reviewer)
            .perform_dual_review(&request())
            .await
            .unwrap();
        assert_ne!(result.decision, ReviewDecision::Pass);
    }

    #[tokio::test]
    async fn test_critical_self_issue_runs_one_fix_and_revalidation() {
        let producer = ScriptedAgent::new("producer")
            .then_ok(
                Capability::SelfReview,
                self_review(false, 0.6, json!([{"severity": "critical", "message": "panics on empty input"}])),
            )
            .then_ok(Capability::SelfReview, self_review(true, 0.92, json!([])))
            .then_ok(Capability::Fix, AgentResponse::new(json!({"code": "fixed"})));
        let producer = Arc::new(producer);
        let aggregator = DualReviewAggregator::new(
            producer.clone(),
            Arc::new(passing_reviewer()),
            ReviewConfig::default(),
            Arc::new(MetricsTracker::default()),
        )
        .unwrap();

        let result = aggregator.perform_dual_review(&request()).await.unwrap();
        assert_eq!(producer.calls_for(Capability::Fix), 1);
        assert_eq!(producer.calls_for(Capability::SelfReview), 2);
        assert!(result.self_review.fixed);
        assert_eq!(result.artifact, json!({"code": "fixed"}));
        assert_eq!(result.decision, ReviewDecision::Pass);
    }

    #[tokio::test]
    async fn test_high_finding_escalates() {
        let reviewer = reviewer_with(
            sub_review(95.0, json!([{"severity": "high", "message": "secret in log"}])),
            sub_review(95.0, json!([])),
            sub_review(95.0, json!([])),
        );
        let result = aggregator(passing_producer(), reviewer)
            .perform_dual_review(&request())
            .await
            .unwrap();
        assert_eq!(result.decision, ReviewDecision::Escalate);
        assert_eq!(result.blocking_findings().len(), 1);
        assert_eq!(result.findings[0].category, Category::Security);
    }

    #[tokio::test]
    async fn test_failed_sub_review_escalates() {
        let reviewer = ScriptedAgent::new("reviewer")
            .then(Capability::SecurityReview, Err(AgentError::Unavailable("503".into())))
            .always(Capability::QualityReview, sub_review(99.0, json!([])))
            .always(Capability::TestReview, sub_review(99.0, json!([])));
        let result = aggregator(passing_producer(), reviewer)
            .perform_dual_review(&request())
            .await
            .unwrap();

        assert_eq!(result.decision, ReviewDecision::Escalate);
        assert!(result.independent_review.security.is_none());
        assert!(!result.independent_review.passed);
        assert!(result.rationale.contains("did not complete"));
    }

    #[tokio::test]
    async fn test_malformed_self_review_escalates() {
        let producer = ScriptedAgent::new("producer")
            .always(Capability::SelfReview, AgentResponse::new(json!("looks fine to me")));
        let result = aggregator(producer, passing_reviewer())
            .perform_dual_review(&request())
            .await
            .unwrap();
        assert_eq!(result.decision, ReviewDecision::Escalate);
        assert!(result.self_review.error.is_some());
    }

    #[tokio::test]
    async fn test_fixable_findings_fail_until_iterations_run_out() {
        let make = || {
            reviewer_with(
                sub_review(80.0, json!([{"severity": "medium", "message": "missing doc"}])),
                sub_review(90.0, json!([])),
                sub_review(90.0, json!([])),
            )
        };
        let first = aggregator(passing_producer(), make())
            .perform_dual_review(&request().with_iteration(1))
            .await
            .unwrap();
        assert_eq!(first.decision, ReviewDecision::Fail);

        let last = aggregator(passing_producer(), make())
            .perform_dual_review(&request().with_iteration(3))
            .await
            .unwrap();
        assert_eq!(last.decision, ReviewDecision::Escalate);
    }

    #[tokio::test]
    async fn test_escalation_is_filed_when_queue_attached() {
        let dir = TempDir::new().unwrap();
        let queue = Arc::new(EscalationQueue::new(dir.path()));
        let producer = ScriptedAgent::new("producer")
            .always(Capability::SelfReview, self_review(true, 0.5, json!([])));
        let aggregator = aggregator(producer, passing_reviewer()).with_escalation_queue(queue.clone());

        let result = aggregator.perform_dual_review(&request()).await.unwrap();
        assert_eq!(result.decision, ReviewDecision::Escalate);
        let id = result.escalation_id.expect("escalation filed");
        let record = queue.get(&id).unwrap();
        assert_eq!(record.workflow_id, "wf");
        assert_eq!(record.step_index, 2);
        assert!(record.is_pending());
    }

    #[tokio::test]
    async fn test_metrics_cover_every_phase() {
        let metrics = Arc::new(MetricsTracker::default());
        let aggregator = DualReviewAggregator::new(
            Arc::new(passing_producer()),
            Arc::new(passing_reviewer()),
            ReviewConfig::default(),
            metrics.clone(),
        )
        .unwrap();
        let result = aggregator.perform_dual_review(&request()).await.unwrap();

        for phase in ["self_review", "security", "quality", "test_adequacy", "decision"] {
            assert!(result.metrics.phase_ms.contains_key(phase), "missing {phase}");
        }
        assert_eq!(result.metrics.findings_by_severity[&Severity::High], 0);
        assert_eq!(metrics.snapshot().phases["review.security"].count, 1);
        assert!(result.metrics.bottlenecks.is_empty());
    }

    #[tokio::test]
    async fn test_review_completed_event() {
        let (sink, mut rx) = EventSink::channel();
        let aggregator = aggregator(passing_producer(), passing_reviewer()).with_events(sink);
        aggregator.perform_dual_review(&request()).await.unwrap();
        match rx.try_recv().unwrap() {
            WorkflowEvent::ReviewCompleted { decision, .. } => assert!(decision.is_pass()),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_request_revision_returns_new_artifact() {
        let producer = passing_producer().always(Capability::Revise, AgentResponse::new(json!("v2")));
        let aggregator = aggregator(producer, passing_reviewer());
        let result = aggregator.perform_dual_review(&request()).await.unwrap();
        let revised = aggregator.request_revision(&json!("v1"), &result).await.unwrap();
        assert_eq!(revised, json!("v2"));
    }

    #[test]
    fn test_verdict_low_confidence_without_findings_escalates() {
        let (decision, rationale) = decide_verdict(
            &VerdictInput {
                phase_errors: &[],
                findings: &[],
                self_passed: true,
                independent_passed: true,
                confidence: 0.6,
                iteration: 1,
            },
            &ReviewConfig::default(),
        );
        assert_eq!(decision, ReviewDecision::Escalate);
        assert!(rationale.contains("Confidence"));
    }

    #[test]
    fn test_verdict_low_confidence_with_fixable_findings_fails() {
        let findings = vec![ReviewFinding::new(Severity::Low, Category::Quality, "naming")];
        let (decision, _) = decide_verdict(
            &VerdictInput {
                phase_errors: &[],
                findings: &findings,
                self_passed: true,
                independent_passed: true,
                confidence: 0.3,
                iteration: 2,
            },
            &ReviewConfig::default(),
        );
        assert_eq!(decision, ReviewDecision::Fail);
    }
}
