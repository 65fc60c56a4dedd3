//! Dual review of step artifacts.
//!
//! ## Components
//!
//! - [`findings`]: severities, categories and individual findings
//! - [`report`]: per-phase reports and the combined result
//! - [`aggregator`]: the self review + independent review pipeline and its
//!   pass / fail / escalate rules
//!
//! ## Example
//!
//! ```
//! use waypoint::review::{ReviewFinding, Severity, Category};
//!
//! let finding = ReviewFinding::new(Severity::Medium, Category::Quality, "long function")
//!     .with_location("src/lib.rs", Some(40));
//! assert!(finding.is_fixable());
//! assert!(!finding.is_blocking());
//! ```

pub mod aggregator;
pub mod findings;
pub mod report;

pub use aggregator::{
    ConfidenceMode, DEFAULT_MAX_ITERATIONS, DEFAULT_MIN_SUB_SCORE, DEFAULT_PASS_THRESHOLD,
    DualReviewAggregator, ReviewConfig, ReviewRequest, VerdictInput, decide_verdict,
};
pub use findings::{Category, Location, ReviewFinding, Severity, count_by_severity};
pub use report::{
    ChecklistItem, CombinedReviewResult, IndependentReviewSummary, ReviewMetrics,
    SelfReviewReport, SelfReviewSummary, SubReviewReport,
};
