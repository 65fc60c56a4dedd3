//! Reports produced by the individual review phases and the combined result.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use waypoint_common::{AgentResponse, ReviewDecision};

use super::findings::{Category, ReviewFinding, Severity};
use crate::errors::ReviewError;

/// One line of the producer's self-review checklist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChecklistItem {
    pub item: String,
    pub passed: bool,
}

/// The producer's review of its own artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelfReviewReport {
    pub passed: bool,
    #[serde(default)]
    pub checklist: Vec<ChecklistItem>,
    #[serde(default)]
    pub issues: Vec<ReviewFinding>,
    pub confidence: f64,
}

impl SelfReviewReport {
    /// Parse a self review from an agent response. The response's
    /// `confidence_hint` fills in a missing `confidence` field.
    pub fn from_response(response: &AgentResponse) -> Result<Self, ReviewError> {
        let mut content = response.content.clone();
        if let (Some(obj), Some(hint)) = (content.as_object_mut(), response.confidence_hint) {
            obj.entry("confidence").or_insert(serde_json::json!(hint));
        }
        let mut report: Self =
            serde_json::from_value(content).map_err(|e| ReviewError::MalformedOutput {
                phase: "self_review".to_string(),
                message: e.to_string(),
            })?;
        report.confidence = report.confidence.clamp(0.0, 1.0);
        Ok(report)
    }

    pub fn has_critical_issues(&self) -> bool {
        self.issues.iter().any(|i| i.severity == Severity::Critical)
    }

    pub fn critical_issues(&self) -> Vec<&ReviewFinding> {
        self.issues
            .iter()
            .filter(|i| i.severity == Severity::Critical)
            .collect()
    }
}

/// Output of one independent review sub-check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubReviewReport {
    /// Score in [0, 100].
    pub score: f64,
    #[serde(default)]
    pub findings: Vec<ReviewFinding>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

impl SubReviewReport {
    /// Parse a sub-review from an agent response, tagging uncategorised
    /// findings with `category`.
    pub fn from_response(
        phase: &str,
        category: Category,
        response: &AgentResponse,
    ) -> Result<Self, ReviewError> {
        let mut report: Self = serde_json::from_value(response.content.clone()).map_err(|e| {
            ReviewError::MalformedOutput {
                phase: phase.to_string(),
                message: e.to_string(),
            }
        })?;
        if !report.score.is_finite() {
            return Err(ReviewError::MalformedOutput {
                phase: phase.to_string(),
                message: format!("score is not a number: {}", report.score),
            });
        }
        report.score = report.score.clamp(0.0, 100.0);
        report.confidence = report
            .confidence
            .or(response.confidence_hint)
            .map(|c| c.clamp(0.0, 1.0));
        report.findings = report
            .findings
            .into_iter()
            .map(|f| f.or_category(category))
            .collect();
        Ok(report)
    }

    /// Confidence of this sub-review, falling back to the score when the
    /// reviewer did not report one.
    pub fn effective_confidence(&self) -> f64 {
        self.confidence.unwrap_or(self.score / 100.0)
    }
}

/// Summary of the self-review phase inside a combined result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelfReviewSummary {
    pub passed: bool,
    pub confidence: f64,
    pub issues_found: usize,
    /// Whether a fix pass ran because of critical issues.
    pub fixed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Summary of the independent review phase inside a combined result.
///
/// A `None` sub-report means that sub-check did not complete.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndependentReviewSummary {
    pub security: Option<SubReviewReport>,
    pub quality: Option<SubReviewReport>,
    pub test_adequacy: Option<SubReviewReport>,
    pub passed: bool,
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

impl IndependentReviewSummary {
    pub fn is_complete(&self) -> bool {
        self.security.is_some() && self.quality.is_some() && self.test_adequacy.is_some()
    }

    pub fn reports(&self) -> impl Iterator<Item = &SubReviewReport> {
        [&self.security, &self.quality, &self.test_adequacy]
            .into_iter()
            .flatten()
    }
}

/// Timings and counts collected during one dual review.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReviewMetrics {
    pub total_ms: u64,
    pub phase_ms: BTreeMap<String, u64>,
    pub findings_by_severity: BTreeMap<Severity, usize>,
    pub iteration: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bottlenecks: Vec<String>,
}

/// The merged verdict of a dual review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CombinedReviewResult {
    /// Mean of the three independent sub-scores, in [0, 100].
    pub overall_score: f64,
    pub confidence: f64,
    pub decision: ReviewDecision,
    pub findings: Vec<ReviewFinding>,
    pub rationale: String,
    pub metrics: ReviewMetrics,
    pub self_review: SelfReviewSummary,
    pub independent_review: IndependentReviewSummary,
    /// The artifact as reviewed, after any self-review fix.
    pub artifact: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalation_id: Option<String>,
}

impl CombinedReviewResult {
    pub fn blocking_findings(&self) -> Vec<&ReviewFinding> {
        self.findings.iter().filter(|f| f.is_blocking()).collect()
    }

    pub fn fixable_findings(&self) -> Vec<&ReviewFinding> {
        self.findings.iter().filter(|f| f.is_fixable()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_self_review_uses_confidence_hint() {
        let response = AgentResponse::new(json!({"passed": true})).with_confidence(0.9);
        let report = SelfReviewReport::from_response(&response).unwrap();
        assert!(report.passed);
        assert_eq!(report.confidence, 0.9);
        assert!(report.checklist.is_empty());
    }

    #[test]
    fn test_self_review_missing_confidence_is_malformed() {
        let response = AgentResponse::new(json!({"passed": true}));
        let err = SelfReviewReport::from_response(&response).unwrap_err();
        assert!(matches!(err, ReviewError::MalformedOutput { .. }));
    }

    #[test]
    fn test_self_review_critical_issues() {
        let response = AgentResponse::new(json!({
            "passed": false,
            "confidence": 0.7,
            "issues": [
                {"severity": "critical", "message": "null deref"},
                {"severity": "low", "message": "naming"}
            ]
        }));
        let report = SelfReviewReport::from_response(&response).unwrap();
        assert!(report.has_critical_issues());
        assert_eq!(report.critical_issues().len(), 1);
    }

    #[test]
    fn test_sub_review_tags_category_and_clamps_score() {
        let response = AgentResponse::new(json!({
            "score": 140,
            "findings": [{"severity": "medium", "message": "weak hash"}]
        }));
        let report =
            SubReviewReport::from_response("security", Category::Security, &response).unwrap();
        assert_eq!(report.score, 100.0);
        assert_eq!(report.findings[0].category, Category::Security);
        assert_eq!(report.effective_confidence(), 1.0);
    }

    #[test]
    fn test_sub_review_missing_score_is_malformed() {
        let response = AgentResponse::new(json!({"findings": []}));
        let err = SubReviewReport::from_response("quality", Category::Quality, &response)
            .unwrap_err();
        assert!(err.to_string().contains("quality"));
    }

    #[test]
    fn test_independent_summary_completeness() {
        let report = SubReviewReport {
            score: 90.0,
            findings: vec![],
            confidence: Some(0.9),
        };
        let mut summary = IndependentReviewSummary {
            security: Some(report.clone()),
            quality: Some(report.clone()),
            test_adequacy: None,
            ..Default::default()
        };
        assert!(!summary.is_complete());
        assert_eq!(summary.reports().count(), 2);
        summary.test_adequacy = Some(report);
        assert!(summary.is_complete());
    }
}
