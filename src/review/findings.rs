//! Review finding types shared by self review and independent review.
//!
//! ## Example
//!
//! ```
//! use waypoint::review::findings::{Category, ReviewFinding, Severity};
//!
//! let finding = ReviewFinding::new(
//!     Severity::High,
//!     Category::Security,
//!     "SQL injection risk in query construction",
//! )
//! .with_location("src/auth.rs", Some(42))
//! .with_suggestion("Use parameterized queries");
//!
//! assert!(finding.is_blocking());
//! assert_eq!(finding.location_string().as_deref(), Some("src/auth.rs:42"));
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Severity of a review finding, ordered from most to least severe.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    High,
    #[default]
    Medium,
    Low,
    Info,
}

impl Severity {
    /// Critical and high findings force escalation.
    ///
    /// # Examples
    ///
    /// ```
    /// use waypoint::review::findings::Severity;
    ///
    /// assert!(Severity::Critical.is_blocking());
    /// assert!(Severity::High.is_blocking());
    /// assert!(!Severity::Medium.is_blocking());
    /// ```
    pub fn is_blocking(&self) -> bool {
        matches!(self, Self::Critical | Self::High)
    }

    /// Findings a producer is expected to be able to fix in another iteration.
    pub fn is_fixable(&self) -> bool {
        matches!(self, Self::Medium | Self::Low)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
            Self::Info => "info",
        }
    }

    pub const ALL: [Severity; 5] = [
        Severity::Critical,
        Severity::High,
        Severity::Medium,
        Severity::Low,
        Severity::Info,
    ];
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Area a finding belongs to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Security,
    Quality,
    Testing,
    #[default]
    Other,
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Security => "security",
            Self::Quality => "quality",
            Self::Testing => "testing",
            Self::Other => "other",
        };
        write!(f, "{}", s)
    }
}

/// Where in the artifact a finding applies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub file: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.line {
            Some(line) => write!(f, "{}:{}", self.file, line),
            None => write!(f, "{}", self.file),
        }
    }
}

/// A single issue found by a reviewer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewFinding {
    pub severity: Severity,
    #[serde(default)]
    pub category: Category,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

impl ReviewFinding {
    pub fn new(severity: Severity, category: Category, message: impl Into<String>) -> Self {
        Self {
            severity,
            category,
            message: message.into(),
            location: None,
            suggestion: None,
        }
    }

    pub fn with_location(mut self, file: impl Into<String>, line: Option<u32>) -> Self {
        self.location = Some(Location {
            file: file.into(),
            line,
        });
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    /// Set the category if the reviewer left it unspecified.
    pub fn or_category(mut self, category: Category) -> Self {
        if self.category == Category::Other {
            self.category = category;
        }
        self
    }

    pub fn is_blocking(&self) -> bool {
        self.severity.is_blocking()
    }

    pub fn is_fixable(&self) -> bool {
        self.severity.is_fixable()
    }

    pub fn location_string(&self) -> Option<String> {
        self.location.as_ref().map(|l| l.to_string())
    }
}

impl fmt::Display for ReviewFinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}/{}] {}", self.severity, self.category, self.message)?;
        if let Some(ref location) = self.location {
            write!(f, " ({})", location)?;
        }
        Ok(())
    }
}

/// Count findings per severity, including zero counts.
pub fn count_by_severity<'a>(
    findings: impl IntoIterator<Item = &'a ReviewFinding>,
) -> BTreeMap<Severity, usize> {
    let mut counts: BTreeMap<Severity, usize> = Severity::ALL.iter().map(|s| (*s, 0)).collect();
    for finding in findings {
        *counts.entry(finding.severity).or_default() += 1;
    }
    counts
}
