//! Observability (C10): metrics ring buffer, deduplicated alerting, and a
//! component health registry.
//!
//! Like the teacher's `RetryExecutor`, each piece is a plain struct with
//! interior mutability behind `std::sync::Mutex` — constructed explicitly
//! and carried in the `Runtime` bundle, never a `static`/`OnceCell`
//! singleton (`spec.md` Design Notes, SPEC_FULL.md §9). `tracing`'s global
//! dispatcher is the one sanctioned exception, set up once in `main`.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::logging::{log_debug, log_warn};

/// One timestamped metric sample.
#[derive(Debug, Clone)]
pub struct MetricSample {
    pub name: String,
    pub value: f64,
    pub recorded_at: Instant,
}

/// Bounded ring buffer of recent metric samples.
pub struct MetricsCollector {
    capacity: usize,
    samples: Mutex<VecDeque<MetricSample>>,
}

impl MetricsCollector {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            samples: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn record(&self, name: impl Into<String>, value: f64) {
        let sample = MetricSample {
            name: name.into(),
            value,
            recorded_at: Instant::now(),
        };
        let mut samples = self.samples.lock().expect("metrics mutex poisoned");
        if samples.len() >= self.capacity {
            samples.pop_front();
        }
        samples.push_back(sample);
    }

    /// All recorded samples matching `name`, oldest first.
    pub fn samples_for(&self, name: &str) -> Vec<MetricSample> {
        self.samples
            .lock()
            .expect("metrics mutex poisoned")
            .iter()
            .filter(|s| s.name == name)
            .cloned()
            .collect()
    }

    /// Arithmetic mean over the retained samples for `name`, if any.
    pub fn mean(&self, name: &str) -> Option<f64> {
        let matching = self.samples_for(name);
        if matching.is_empty() {
            return None;
        }
        Some(matching.iter().map(|s| s.value).sum::<f64>() / matching.len() as f64)
    }

    pub fn len(&self) -> usize {
        self.samples.lock().expect("metrics mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Alert severity, ascending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

/// Deduplicates repeated alerts of the same `(source, kind)` within a
/// window, so a flapping collaborator doesn't spam the same page.
pub struct AlertManager {
    dedup_window: Duration,
    last_fired: Mutex<HashMap<(String, String), Instant>>,
}

impl AlertManager {
    pub fn new(dedup_window: Duration) -> Self {
        Self {
            dedup_window,
            last_fired: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_default_window() -> Self {
        Self::new(Duration::from_secs(5 * 60))
    }

    /// Fires an alert unless an identical `(source, kind)` pair fired
    /// within the dedup window. Returns whether it actually fired.
    pub fn fire(&self, source: &str, kind: &str, severity: Severity, message: &str) -> bool {
        let key = (source.to_string(), kind.to_string());
        let now = Instant::now();

        let mut last_fired = self.last_fired.lock().expect("alert mutex poisoned");
        if let Some(previous) = last_fired.get(&key) {
            if now.duration_since(*previous) < self.dedup_window {
                log_debug!(source = %source, kind = %kind, "alert suppressed: within dedup window");
                return false;
            }
        }
        last_fired.insert(key, now);
        drop(last_fired);

        match severity {
            Severity::Info | Severity::Warning => {
                log_warn!(source = %source, kind = %kind, severity = ?severity, "{message}")
            }
            Severity::Error | Severity::Critical => {
                log_warn!(source = %source, kind = %kind, severity = ?severity, "{message}")
            }
        }
        true
    }
}

/// A component's last-observed health.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Per-component health, keyed by component name (e.g. `"llm"`,
/// `"vector_store"`, `"document_store"`, `"embedding_cache"`).
pub struct HealthRegistry {
    statuses: Mutex<HashMap<String, HealthStatus>>,
}

impl Default for HealthRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self {
            statuses: Mutex::new(HashMap::new()),
        }
    }

    pub fn set(&self, component: impl Into<String>, status: HealthStatus) {
        self.statuses
            .lock()
            .expect("health mutex poisoned")
            .insert(component.into(), status);
    }

    pub fn get(&self, component: &str) -> Option<HealthStatus> {
        self.statuses
            .lock()
            .expect("health mutex poisoned")
            .get(component)
            .copied()
    }

    /// Unhealthy if any component is unhealthy, degraded if any is
    /// degraded (and none unhealthy), healthy otherwise — including when
    /// no components have reported yet.
    pub fn overall(&self) -> HealthStatus {
        let statuses = self.statuses.lock().expect("health mutex poisoned");
        if statuses.values().any(|s| *s == HealthStatus::Unhealthy) {
            HealthStatus::Unhealthy
        } else if statuses.values().any(|s| *s == HealthStatus::Degraded) {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }
}
