//! `waypoint.toml` configuration.
//!
//! The file lives in the Waypoint home directory, resolved in this order:
//!
//! 1. the `--home` command-line flag
//! 2. the `WAYPOINT_HOME` environment variable
//! 3. the platform data directory (`~/.local/share/waypoint` on Linux)
//!
//! Every section is optional; missing values fall back to the defaults the
//! core uses. Example:
//!
//! ```toml
//! [storage]
//! backups = 5
//!
//! [decisions]
//! escalation_threshold = 0.8
//!
//! [decisions.answers]
//! "Which database?" = "postgres"
//!
//! [reviews]
//! confidence_mode = "weighted"
//! self_weight = 0.3
//! ```

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::audit::AuditLogger;
use crate::decision::{
    DEFAULT_DETERMINISTIC_CONFIDENCE, DEFAULT_ESCALATION_THRESHOLD,
    DEFAULT_MAX_SPECIALIST_ESCALATIONS, DecisionConfig,
};
use crate::escalation::EscalationQueue;
use crate::escalation::queue::DEFAULT_POLL_INTERVAL;
use crate::metrics::{DEFAULT_BOTTLENECK_THRESHOLD, MetricsTracker};
use crate::orchestrator::retry::{
    DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY, DEFAULT_MULTIPLIER, HandlerClass, RetryConfig,
};
use crate::orchestrator::store::DEFAULT_BACKUPS;
use crate::orchestrator::{ExecutorConfig, StateStore};
use crate::review::{
    ConfidenceMode, DEFAULT_MAX_ITERATIONS, DEFAULT_MIN_SUB_SCORE, DEFAULT_PASS_THRESHOLD,
    ReviewConfig,
};

pub const CONFIG_FILE: &str = "waypoint.toml";
pub const HOME_ENV: &str = "WAYPOINT_HOME";

/// Where durable files are kept.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageSection {
    /// Storage root. Relative paths resolve against the home directory.
    /// Defaults to the home directory itself.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root: Option<PathBuf>,
    /// Number of state backups kept per workflow.
    #[serde(default = "default_backups")]
    pub backups: usize,
}

fn default_backups() -> usize {
    DEFAULT_BACKUPS
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            root: None,
            backups: default_backups(),
        }
    }
}

/// Retry budgets per handler kind and the shared backoff curve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrySection {
    #[serde(default = "default_agent_retries")]
    pub agent_retries: u32,
    #[serde(default = "default_decision_retries")]
    pub decision_retries: u32,
    #[serde(default = "default_review_retries")]
    pub review_retries: u32,
    #[serde(default = "default_custom_retries")]
    pub custom_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

fn default_agent_retries() -> u32 {
    HandlerClass::Agent.default_max_retries()
}

fn default_decision_retries() -> u32 {
    HandlerClass::Decision.default_max_retries()
}

fn default_review_retries() -> u32 {
    HandlerClass::Review.default_max_retries()
}

fn default_custom_retries() -> u32 {
    HandlerClass::Custom.default_max_retries()
}

fn default_base_delay_ms() -> u64 {
    DEFAULT_BASE_DELAY.as_millis() as u64
}

fn default_multiplier() -> f64 {
    DEFAULT_MULTIPLIER
}

fn default_max_delay_ms() -> u64 {
    DEFAULT_MAX_DELAY.as_millis() as u64
}

fn default_jitter() -> bool {
    true
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            agent_retries: default_agent_retries(),
            decision_retries: default_decision_retries(),
            review_retries: default_review_retries(),
            custom_retries: default_custom_retries(),
            base_delay_ms: default_base_delay_ms(),
            multiplier: default_multiplier(),
            max_delay_ms: default_max_delay_ms(),
            jitter: default_jitter(),
        }
    }
}

impl RetrySection {
    pub fn to_retry_config(&self) -> RetryConfig {
        RetryConfig {
            base_delay: Duration::from_millis(self.base_delay_ms),
            multiplier: self.multiplier,
            max_delay: Duration::from_millis(self.max_delay_ms),
            jitter: self.jitter,
            agent_retries: self.agent_retries,
            decision_retries: self.decision_retries,
            review_retries: self.review_retries,
            custom_retries: self.custom_retries,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentsSection {
    /// Bound on every agent call.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    crate::DEFAULT_AGENT_TIMEOUT.as_secs()
}

impl Default for AgentsSection {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl AgentsSection {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionsSection {
    #[serde(default = "default_escalation_threshold")]
    pub escalation_threshold: f64,
    #[serde(default = "default_deterministic_confidence")]
    pub deterministic_confidence: f64,
    #[serde(default = "default_max_specialist_escalations")]
    pub max_specialist_escalations: u32,
    /// Exact question → answer.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub answers: BTreeMap<String, serde_json::Value>,
}

fn default_escalation_threshold() -> f64 {
    DEFAULT_ESCALATION_THRESHOLD
}

fn default_deterministic_confidence() -> f64 {
    DEFAULT_DETERMINISTIC_CONFIDENCE
}

fn default_max_specialist_escalations() -> u32 {
    DEFAULT_MAX_SPECIALIST_ESCALATIONS
}

impl Default for DecisionsSection {
    fn default() -> Self {
        Self {
            escalation_threshold: default_escalation_threshold(),
            deterministic_confidence: default_deterministic_confidence(),
            max_specialist_escalations: default_max_specialist_escalations(),
            answers: BTreeMap::new(),
        }
    }
}

/// Name of a confidence combination mode in the config file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfidenceModeName {
    #[default]
    Minimum,
    Weighted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewsSection {
    #[serde(default = "default_pass_threshold")]
    pub pass_threshold: f64,
    #[serde(default = "default_min_sub_score")]
    pub min_sub_score: f64,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    #[serde(default = "default_bottleneck_threshold_secs")]
    pub bottleneck_threshold_secs: u64,
    #[serde(default)]
    pub confidence_mode: ConfidenceModeName,
    /// Weight of the self review when `confidence_mode = "weighted"`.
    #[serde(default = "default_self_weight")]
    pub self_weight: f64,
}

fn default_pass_threshold() -> f64 {
    DEFAULT_PASS_THRESHOLD
}

fn default_min_sub_score() -> f64 {
    DEFAULT_MIN_SUB_SCORE
}

fn default_max_iterations() -> u32 {
    DEFAULT_MAX_ITERATIONS
}

fn default_bottleneck_threshold_secs() -> u64 {
    DEFAULT_BOTTLENECK_THRESHOLD.as_secs()
}

fn default_self_weight() -> f64 {
    0.5
}

impl Default for ReviewsSection {
    fn default() -> Self {
        Self {
            pass_threshold: default_pass_threshold(),
            min_sub_score: default_min_sub_score(),
            max_iterations: default_max_iterations(),
            bottleneck_threshold_secs: default_bottleneck_threshold_secs(),
            confidence_mode: ConfidenceModeName::default(),
            self_weight: default_self_weight(),
        }
    }
}

impl ReviewsSection {
    pub fn confidence_mode(&self) -> ConfidenceMode {
        match self.confidence_mode {
            ConfidenceModeName::Minimum => ConfidenceMode::Minimum,
            ConfidenceModeName::Weighted => ConfidenceMode::Weighted {
                self_weight: self.self_weight,
            },
        }
    }

    pub fn bottleneck_threshold(&self) -> Duration {
        Duration::from_secs(self.bottleneck_threshold_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationsSection {
    /// How often a waiting workflow re-reads its escalation record.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL.as_millis() as u64
}

impl Default for EscalationsSection {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

/// The complete waypoint.toml structure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WaypointToml {
    #[serde(default)]
    pub storage: StorageSection,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub agents: AgentsSection,
    #[serde(default)]
    pub decisions: DecisionsSection,
    #[serde(default)]
    pub reviews: ReviewsSection,
    #[serde(default)]
    pub escalations: EscalationsSection,
}

impl WaypointToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse waypoint.toml")
    }

    /// Load `<home>/waypoint.toml`, or defaults when it does not exist.
    pub fn load_or_default(home: &Path) -> Result<Self> {
        let path = home.join(CONFIG_FILE);
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize waypoint.toml")?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Check value ranges and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        let unit = |name: &str, value: f64, warnings: &mut Vec<String>| {
            if !(0.0..=1.0).contains(&value) {
                warnings.push(format!("{} = {} is outside [0, 1]", name, value));
            }
        };

        if self.storage.backups == 0 {
            warnings.push("storage.backups = 0 leaves no backup to recover from".to_string());
        }

        if self.retry.multiplier < 1.0 {
            warnings.push(format!(
                "retry.multiplier = {} shrinks delays; use a value >= 1",
                self.retry.multiplier
            ));
        }
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            warnings.push(format!(
                "retry.max_delay_ms ({}) is below retry.base_delay_ms ({})",
                self.retry.max_delay_ms, self.retry.base_delay_ms
            ));
        }

        if self.agents.timeout_secs == 0 {
            warnings.push("agents.timeout_secs = 0 makes every agent call time out".to_string());
        }

        unit(
            "decisions.escalation_threshold",
            self.decisions.escalation_threshold,
            &mut warnings,
        );
        unit(
            "decisions.deterministic_confidence",
            self.decisions.deterministic_confidence,
            &mut warnings,
        );
        if self.decisions.deterministic_confidence < self.decisions.escalation_threshold {
            warnings.push(format!(
                "decisions.deterministic_confidence ({}) is below escalation_threshold ({}); configured answers will escalate",
                self.decisions.deterministic_confidence, self.decisions.escalation_threshold
            ));
        }

        unit("reviews.pass_threshold", self.reviews.pass_threshold, &mut warnings);
        if !(0.0..=100.0).contains(&self.reviews.min_sub_score) {
            warnings.push(format!(
                "reviews.min_sub_score = {} is outside [0, 100]",
                self.reviews.min_sub_score
            ));
        }
        if self.reviews.max_iterations == 0 {
            warnings.push("reviews.max_iterations = 0 means no review can ever fail".to_string());
        }
        if self.reviews.confidence_mode == ConfidenceModeName::Weighted {
            unit("reviews.self_weight", self.reviews.self_weight, &mut warnings);
        }

        if self.escalations.poll_interval_ms == 0 {
            warnings.push("escalations.poll_interval_ms = 0 busy-polls escalation records".to_string());
        }

        warnings
    }
}

/// Resolved configuration: the home directory plus the parsed file.
#[derive(Debug, Clone)]
pub struct WaypointConfig {
    pub home: PathBuf,
    pub toml: WaypointToml,
}

impl WaypointConfig {
    /// Resolve the home directory and load its config file.
    pub fn load(home_override: Option<PathBuf>) -> Result<Self> {
        let home = resolve_home(home_override)?;
        let toml = WaypointToml::load_or_default(&home)?;
        Ok(Self { home, toml })
    }

    pub fn config_path(&self) -> PathBuf {
        self.home.join(CONFIG_FILE)
    }

    pub fn storage_root(&self) -> PathBuf {
        match &self.toml.storage.root {
            Some(root) if root.is_absolute() => root.clone(),
            Some(root) => self.home.join(root),
            None => self.home.clone(),
        }
    }

    pub fn state_dir(&self) -> PathBuf {
        self.storage_root().join("workflow-state")
    }

    pub fn escalations_dir(&self) -> PathBuf {
        self.storage_root().join("escalations")
    }

    pub fn decisions_dir(&self) -> PathBuf {
        self.storage_root().join("decisions")
    }

    pub fn state_store(&self) -> StateStore {
        StateStore::new(self.state_dir()).with_backups(self.toml.storage.backups)
    }

    pub fn escalation_queue(&self) -> EscalationQueue {
        EscalationQueue::new(self.escalations_dir()).with_poll_interval(Duration::from_millis(
            self.toml.escalations.poll_interval_ms,
        ))
    }

    pub fn audit_logger(&self) -> AuditLogger {
        AuditLogger::new(&self.decisions_dir())
    }

    pub fn metrics_tracker(&self) -> MetricsTracker {
        MetricsTracker::new(self.toml.reviews.bottleneck_threshold())
    }

    pub fn decision_config(&self) -> DecisionConfig {
        let section = &self.toml.decisions;
        DecisionConfig {
            escalation_threshold: section.escalation_threshold,
            deterministic_confidence: section.deterministic_confidence,
            max_specialist_escalations: section.max_specialist_escalations,
            answers: section
                .answers
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            agent_timeout: self.toml.agents.timeout(),
        }
    }

    pub fn review_config(&self) -> ReviewConfig {
        let section = &self.toml.reviews;
        ReviewConfig {
            pass_threshold: section.pass_threshold,
            min_sub_score: section.min_sub_score,
            max_iterations: section.max_iterations,
            confidence_mode: section.confidence_mode(),
            agent_timeout: self.toml.agents.timeout(),
        }
    }

    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig::default()
            .with_retry(self.toml.retry.to_retry_config())
            .with_agent_timeout(self.toml.agents.timeout())
    }

    /// Shared handles for an embedding application to build a
    /// `WorkflowExecutor` from.
    pub fn shared_stores(&self) -> (Arc<StateStore>, Arc<EscalationQueue>, Arc<AuditLogger>) {
        (
            Arc::new(self.state_store()),
            Arc::new(self.escalation_queue()),
            Arc::new(self.audit_logger()),
        )
    }

    pub fn validate(&self) -> Vec<String> {
        self.toml.validate()
    }
}

/// `--home`, then `WAYPOINT_HOME`, then the platform data directory.
pub fn resolve_home(cli: Option<PathBuf>) -> Result<PathBuf> {
    if let Some(home) = cli {
        return Ok(home);
    }
    if let Ok(home) = std::env::var(HOME_ENV)
        && !home.is_empty()
    {
        return Ok(PathBuf::from(home));
    }
    dirs::data_dir()
        .map(|dir| dir.join("waypoint"))
        .ok_or_else(|| anyhow!("Cannot determine a home directory; pass --home or set {}", HOME_ENV))
}
