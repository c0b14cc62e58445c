//! Telemetry for the calculators
//!
//! ## Table of Contents
//! - **TaskInfo**: per-task record of disaggregation tasks
//! - **ByTask**: per-task record of classical tasks
//! - **CalcMetrics**: Prometheus counters and histograms

use std::time::Duration;

use prometheus::{Counter, CounterVec, HistogramOpts, HistogramVec, Opts, Registry};
use serde::{Deserialize, Serialize};

use crate::error::{CalcError, Result};

/// Disaggregation task record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInfo {
    /// TRT index
    pub trti: usize,
    /// Magnitude of the ruptures
    pub mag: f64,
    /// Number of ruptures
    pub nrups: usize,
    /// Seconds spent
    pub dt: f64,
}

/// Classical task record
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ByTask {
    pub task_no: usize,
    /// Contexts that contributed
    pub eff_ruptures: u64,
    /// Sum over contexts of the affected sites
    pub eff_sites: u64,
    /// Source identifiers in the task
    pub srcids: Vec<String>,
}

/// Prometheus metrics of a calculation
pub struct CalcMetrics {
    registry: Registry,

    pub tasks: CounterVec,
    pub ruptures: Counter,
    pub eff_ruptures: Counter,
    pub task_duration: HistogramVec,
}

impl CalcMetrics {
    /// Create and register the metrics
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let tasks = CounterVec::new(
            Opts::new("seisma_tasks_total", "Total tasks completed"),
            &["calc"],
        )?;
        let ruptures = Counter::new("seisma_ruptures_total", "Ruptures generated")?;
        let eff_ruptures = Counter::new("seisma_effective_ruptures_total", "Ruptures affecting at least one site")?;
        let task_duration = HistogramVec::new(
            HistogramOpts::new("seisma_task_duration_seconds", "Task duration")
                .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 60.0, 300.0]),
            &["calc"],
        )?;

        registry.register(Box::new(tasks.clone()))?;
        registry.register(Box::new(ruptures.clone()))?;
        registry.register(Box::new(eff_ruptures.clone()))?;
        registry.register(Box::new(task_duration.clone()))?;

        Ok(Self {
            registry,
            tasks,
            ruptures,
            eff_ruptures,
            task_duration,
        })
    }

    /// Get the Prometheus registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Record a completed task
    pub fn record_task(&self, calc: &str, elapsed: Duration) {
        self.tasks.with_label_values(&[calc]).inc();
        self.task_duration
            .with_label_values(&[calc])
            .observe(elapsed.as_secs_f64());
    }

    /// Record generated and effective ruptures
    pub fn record_ruptures(&self, total: usize, effective: u64) {
        self.ruptures.inc_by(total as f64);
        self.eff_ruptures.inc_by(effective as f64);
    }

    /// Gather all metrics as text
    pub fn gather_text(&self) -> Result<String> {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| CalcError::metrics(format!("UTF8 error: {e}")))
    }
}
