//! Thread-safe counters and phase timers.
//!
//! A single [`MetricsTracker`] is shared (behind an `Arc`) by every workflow
//! running in the process. Phase durations above the bottleneck threshold are
//! logged at `warn` level and kept for later inspection.
//!
//! ## Usage
//!
//! ```
//! use waypoint::metrics::MetricsTracker;
//! use std::time::Duration;
//!
//! let metrics = MetricsTracker::new(Duration::from_secs(300));
//! let timer = metrics.start_phase("security");
//! let (_elapsed, bottleneck) = timer.finish();
//! assert!(!bottleneck);
//! assert_eq!(metrics.snapshot().phases["security"].count, 1);
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::review::Severity;

/// Default duration above which a phase is reported as a bottleneck.
pub const DEFAULT_BOTTLENECK_THRESHOLD: Duration = Duration::from_secs(5 * 60);

/// Aggregated timings for one named phase.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseStats {
    pub count: u64,
    pub total_ms: u64,
    pub min_ms: u64,
    pub max_ms: u64,
}

impl PhaseStats {
    fn record(&mut self, ms: u64) {
        if self.count == 0 {
            self.min_ms = ms;
            self.max_ms = ms;
        } else {
            self.min_ms = self.min_ms.min(ms);
            self.max_ms = self.max_ms.max(ms);
        }
        self.count += 1;
        self.total_ms += ms;
    }

    pub fn avg_ms(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.total_ms as f64 / self.count as f64
        }
    }
}

/// A phase that ran longer than the bottleneck threshold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bottleneck {
    pub phase: String,
    pub duration_ms: u64,
}

/// Point-in-time copy of everything the tracker has recorded.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub phases: BTreeMap<String, PhaseStats>,
    pub counters: BTreeMap<String, u64>,
    pub findings_by_severity: BTreeMap<String, u64>,
    pub iterations: BTreeMap<String, u32>,
    pub bottlenecks: Vec<Bottleneck>,
}

pub struct MetricsTracker {
    bottleneck_threshold: Duration,
    inner: Mutex<MetricsSnapshot>,
}

impl Default for MetricsTracker {
    fn default() -> Self {
        Self::new(DEFAULT_BOTTLENECK_THRESHOLD)
    }
}

impl MetricsTracker {
    pub fn new(bottleneck_threshold: Duration) -> Self {
        Self {
            bottleneck_threshold,
            inner: Mutex::new(MetricsSnapshot::default()),
        }
    }

    pub fn bottleneck_threshold(&self) -> Duration {
        self.bottleneck_threshold
    }

    // A poisoned lock only means another thread panicked mid-update; the
    // counters are still usable.
    fn lock(&self) -> MutexGuard<'_, MetricsSnapshot> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record a completed phase. Returns `true` if it was a bottleneck.
    pub fn record_phase(&self, name: &str, duration: Duration) -> bool {
        let ms = duration.as_millis() as u64;
        let bottleneck = duration > self.bottleneck_threshold;
        let mut inner = self.lock();
        inner.phases.entry(name.to_string()).or_default().record(ms);
        if bottleneck {
            tracing::warn!(
                phase = name,
                duration_ms = ms,
                threshold_ms = self.bottleneck_threshold.as_millis() as u64,
                "phase exceeded bottleneck threshold"
            );
            inner.bottlenecks.push(Bottleneck {
                phase: name.to_string(),
                duration_ms: ms,
            });
        }
        bottleneck
    }

    /// Start timing a phase. The phase is recorded when the timer is finished
    /// or dropped.
    pub fn start_phase(&self, name: impl Into<String>) -> PhaseTimer<'_> {
        PhaseTimer {
            tracker: self,
            name: name.into(),
            start: Instant::now(),
            done: false,
        }
    }

    pub fn record_findings(&self, severities: impl IntoIterator<Item = Severity>) {
        let mut inner = self.lock();
        for severity in severities {
            *inner
                .findings_by_severity
                .entry(severity.to_string())
                .or_default() += 1;
        }
    }

    /// Record the iteration a keyed loop (e.g. a review of one step) reached.
    pub fn record_iteration(&self, key: &str, iteration: u32) {
        let mut inner = self.lock();
        let slot = inner.iterations.entry(key.to_string()).or_default();
        *slot = (*slot).max(iteration);
    }

    pub fn increment(&self, counter: &str) {
        self.add(counter, 1);
    }

    pub fn add(&self, counter: &str, amount: u64) {
        *self.lock().counters.entry(counter.to_string()).or_default() += amount;
    }

    pub fn counter(&self, counter: &str) -> u64 {
        self.lock().counters.get(counter).copied().unwrap_or(0)
    }

    pub fn bottlenecks(&self) -> Vec<Bottleneck> {
        self.lock().bottlenecks.clone()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.lock().clone()
    }
}

/// Timer returned by [`MetricsTracker::start_phase`].
pub struct PhaseTimer<'a> {
    tracker: &'a MetricsTracker,
    name: String,
    start: Instant,
    done: bool,
}

impl PhaseTimer<'_> {
    /// Stop the timer and record the phase. Returns the elapsed time and
    /// whether it was a bottleneck.
    pub fn finish(mut self) -> (Duration, bool) {
        self.done = true;
        let elapsed = self.start.elapsed();
        let bottleneck = self.tracker.record_phase(&self.name, elapsed);
        (elapsed, bottleneck)
    }
}

impl Drop for PhaseTimer<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.tracker.record_phase(&self.name, self.start.elapsed());
        }
    }
}
