//! Run ledger - bookkeeping for pipeline executions
//!
//! Each pipeline run gets a [`RunRecord`] holding the configuration it ran
//! with, its lifecycle timestamps and the summary numbers it produced.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Result;

/// Status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    /// Run is created but not yet started.
    Pending,
    /// Run is currently executing.
    Running,
    /// Run completed successfully.
    Success,
    /// Run stopped on an error; no results were kept.
    Failed,
}

/// One named summary number of a run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SummaryMetric {
    /// Metric key, e.g. `estimate_correlation`
    pub key: String,
    /// Value
    pub value: f64,
    /// Wall-clock time the value was logged
    pub timestamp: DateTime<Utc>,
}

/// A single pipeline execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunRecord {
    run_id: String,
    config: serde_json::Value,
    status: RunStatus,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    error: Option<String>,
    metrics: Vec<SummaryMetric>,
}

impl RunRecord {
    /// Create a new run record in Pending status.
    #[must_use]
    pub fn new(run_id: impl Into<String>, config: serde_json::Value) -> Self {
        Self {
            run_id: run_id.into(),
            config,
            status: RunStatus::Pending,
            started_at: None,
            ended_at: None,
            error: None,
            metrics: Vec::new(),
        }
    }

    /// Get the run ID.
    #[must_use]
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Configuration the run was started with.
    #[must_use]
    pub const fn config(&self) -> &serde_json::Value {
        &self.config
    }

    /// Get the current run status.
    #[must_use]
    pub const fn status(&self) -> RunStatus {
        self.status
    }

    /// Get the start timestamp, if the run has started.
    #[must_use]
    pub const fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    /// Get the end timestamp, if the run has completed.
    #[must_use]
    pub const fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.ended_at
    }

    /// Rendered error of a failed run.
    #[must_use]
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Summary metrics in logging order.
    #[must_use]
    pub fn metrics(&self) -> &[SummaryMetric] {
        &self.metrics
    }

    /// Latest value logged under `key`.
    #[must_use]
    pub fn metric(&self, key: &str) -> Option<f64> {
        self.metrics
            .iter()
            .rev()
            .find(|m| m.key == key)
            .map(|m| m.value)
    }

    /// Start the run, transitioning from Pending to Running.
    pub fn start(&mut self) {
        self.status = RunStatus::Running;
        self.started_at = Some(Utc::now());
    }

    /// Log a summary metric.
    pub fn log_metric(&mut self, key: impl Into<String>, value: f64) {
        self.metrics.push(SummaryMetric {
            key: key.into(),
            value,
            timestamp: Utc::now(),
        });
    }

    /// Complete the run with the given final status.
    pub fn complete(&mut self, status: RunStatus) {
        self.status = status;
        self.ended_at = Some(Utc::now());
    }

    /// Complete the run as Failed, keeping the error text.
    ///
    /// Metrics logged before the failure are dropped.
    pub fn fail(&mut self, error: &crate::Error) {
        self.metrics.clear();
        self.error = Some(error.to_string());
        self.complete(RunStatus::Failed);
    }

    /// Wall-clock duration of a completed run.
    #[must_use]
    pub fn duration(&self) -> Option<chrono::Duration> {
        Some(self.ended_at? - self.started_at?)
    }
}

/// In-memory ledger of runs, in insertion order.
#[derive(Debug, Default, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunLedger {
    runs: Vec<RunRecord>,
}

impl RunLedger {
    /// Create a new empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of recorded runs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.runs.len()
    }

    /// Check if no run was recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    /// Record a run, replacing an earlier record with the same ID.
    pub fn add_run(&mut self, run: RunRecord) {
        match self.runs.iter_mut().find(|r| r.run_id == run.run_id) {
            Some(existing) => *existing = run,
            None => self.runs.push(run),
        }
    }

    /// Get a run by ID.
    #[must_use]
    pub fn get_run(&self, run_id: &str) -> Option<&RunRecord> {
        self.runs.iter().find(|r| r.run_id == run_id)
    }

    /// All runs.
    #[must_use]
    pub fn runs(&self) -> &[RunRecord] {
        &self.runs
    }

    /// Runs with the given status.
    pub fn runs_with_status(&self, status: RunStatus) -> impl Iterator<Item = &RunRecord> {
        self.runs.iter().filter(move |r| r.status == status)
    }

    /// Serialize the ledger to JSON.
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Restore a ledger from JSON.
    ///
    /// # Errors
    ///
    /// Returns error if the JSON is not a ledger
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}
