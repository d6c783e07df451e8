//! Metrics collection and reporting for the coordination core.
//!
//! The collector tracks what the coordinator actually does: batches
//! accepted and rejected, queries merged, amendments committed and failed,
//! optimistic-validation conflicts, and amendment runtimes. The update
//! phase and the amenders feed it through the shared
//! [`CoordinatorState`](crate::storage::CoordinatorState); nothing else in
//! the core depends on it, and the whole module sits behind the `metrics`
//! feature (on by default).
//!
//! # Example
//!
//! ```no_run
//! use fluxmesh::metrics::MetricsCollector;
//!
//! # fn main() -> anyhow::Result<()> {
//! let metrics = MetricsCollector::new();
//! metrics.increment("batches_accepted", 1);
//! metrics.print();
//! metrics.save_to_file("coordinator_metrics.json")?;
//! # Ok(())
//! # }
//! ```

use anyhow::Result;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::fs::File;
use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Aggregate statistics of a recorded duration series.
#[derive(Clone, Copy, Debug, Default)]
pub struct DurationStats {
    pub count: u64,
    pub total: Duration,
    pub max: Duration,
}

impl DurationStats {
    /// Mean duration, or zero when nothing was recorded.
    #[must_use]
    pub fn mean(&self) -> Duration {
        if self.count == 0 {
            Duration::ZERO
        } else {
            self.total / u32::try_from(self.count).unwrap_or(u32::MAX)
        }
    }
}

#[derive(Default)]
struct MetricsInner {
    counters: HashMap<String, u64>,
    gauges: HashMap<String, f64>,
    durations: HashMap<String, DurationStats>,
}

/// Thread-safe container for coordinator execution metrics.
///
/// Cheap to clone; all clones share the same underlying data.
#[derive(Clone, Default)]
pub struct MetricsCollector {
    inner: Arc<Mutex<MetricsInner>>,
}

impl MetricsCollector {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `value` to a counter, creating it at zero if absent.
    pub fn increment(&self, name: &str, value: u64) {
        let mut inner = self.inner.lock().unwrap();
        *inner.counters.entry(name.to_string()).or_insert(0) += value;
    }

    /// Current value of a counter (0 if never incremented).
    #[must_use]
    pub fn counter(&self, name: &str) -> u64 {
        self.inner
            .lock()
            .unwrap()
            .counters
            .get(name)
            .copied()
            .unwrap_or(0)
    }

    /// Set a gauge to an absolute value.
    pub fn set_gauge(&self, name: &str, value: f64) {
        self.inner
            .lock()
            .unwrap()
            .gauges
            .insert(name.to_string(), value);
    }

    /// Fold one sample into a duration series.
    pub fn record_duration(&self, name: &str, sample: Duration) {
        let mut inner = self.inner.lock().unwrap();
        let stats = inner.durations.entry(name.to_string()).or_default();
        stats.count += 1;
        stats.total += sample;
        stats.max = stats.max.max(sample);
    }

    /// Aggregates of a duration series, if any samples were recorded.
    #[must_use]
    pub fn duration_stats(&self, name: &str) -> Option<DurationStats> {
        self.inner.lock().unwrap().durations.get(name).copied()
    }

    /// Snapshot of all counters.
    #[must_use]
    pub fn snapshot(&self) -> HashMap<String, u64> {
        self.inner.lock().unwrap().counters.clone()
    }

    /// All metrics as a JSON object.
    #[must_use]
    pub fn to_json(&self) -> Value {
        let inner = self.inner.lock().unwrap();
        let mut counters: Vec<(&String, &u64)> = inner.counters.iter().collect();
        counters.sort_by_key(|(name, _)| *name);
        let mut out = serde_json::Map::new();
        for (name, value) in counters {
            out.insert(name.clone(), json!(value));
        }
        for (name, value) in &inner.gauges {
            out.insert(name.clone(), json!(value));
        }
        for (name, stats) in &inner.durations {
            out.insert(
                name.clone(),
                json!({
                    "count": stats.count,
                    "total_ms": stats.total.as_millis(),
                    "mean_ms": stats.mean().as_millis(),
                    "max_ms": stats.max.as_millis(),
                }),
            );
        }
        Value::Object(out)
    }

    /// Print all metrics to stdout in a human-readable format.
    pub fn print(&self) {
        println!("\n====== Coordinator Metrics ======");
        let inner = self.inner.lock().unwrap();
        let mut counters: Vec<(&String, &u64)> = inner.counters.iter().collect();
        counters.sort_by_key(|(name, _)| *name);
        for (name, value) in counters {
            println!("{name}: {value}");
        }
        for (name, value) in &inner.gauges {
            println!("{name}: {value}");
        }
        for (name, stats) in &inner.durations {
            println!(
                "{name}: n={} mean={:?} max={:?}",
                stats.count,
                stats.mean(),
                stats.max
            );
        }
        drop(inner);
        println!("=================================\n");
    }

    /// Save all metrics to a JSON file.
    ///
    /// # Errors
    ///
    /// Fails when the file cannot be created or written.
    pub fn save_to_file(&self, path: &str) -> Result<()> {
        let formatted = serde_json::to_string_pretty(&self.to_json())?;
        let mut file = File::create(path)?;
        file.write_all(formatted.as_bytes())?;
        Ok(())
    }
}
