use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::metrics::SampleCounts;
use crate::sampler::SamplerErrorKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    SamplerUnavailable,
    SamplerRejected,
    SandboxTimeout,
    SandboxCrash,
    /// The unit itself panicked before producing a verdict.
    UnitPanicked,
}

impl From<SamplerErrorKind> for FailureKind {
    fn from(kind: SamplerErrorKind) -> Self {
        match kind {
            SamplerErrorKind::Unavailable => Self::SamplerUnavailable,
            SamplerErrorKind::Rejected => Self::SamplerRejected,
        }
    }
}

/// Samples that never produced a clean verdict, by cause.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureCounts {
    pub sampler_unavailable: usize,
    pub sampler_rejected: usize,
    pub sandbox_timeout: usize,
    pub sandbox_crash: usize,
    #[serde(default)]
    pub unit_panicked: usize,
}

impl FailureCounts {
    pub fn record(&mut self, kind: FailureKind) {
        match kind {
            FailureKind::SamplerUnavailable => self.sampler_unavailable += 1,
            FailureKind::SamplerRejected => self.sampler_rejected += 1,
            FailureKind::SandboxTimeout => self.sandbox_timeout += 1,
            FailureKind::SandboxCrash => self.sandbox_crash += 1,
            FailureKind::UnitPanicked => self.unit_panicked += 1,
        }
    }

    pub fn merge(&mut self, other: &FailureCounts) {
        self.sampler_unavailable += other.sampler_unavailable;
        self.sampler_rejected += other.sampler_rejected;
        self.sandbox_timeout += other.sandbox_timeout;
        self.sandbox_crash += other.sandbox_crash;
        self.unit_panicked += other.unit_panicked;
    }

    pub fn total(&self) -> usize {
        self.sampler_unavailable
            + self.sampler_rejected
            + self.sandbox_timeout
            + self.sandbox_crash
            + self.unit_panicked
    }

    pub fn sampler_total(&self) -> usize {
        self.sampler_unavailable + self.sampler_rejected
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub task_id: String,
    pub n_samples: usize,
    pub n_correct: usize,
    pub failures: FailureCounts,
}

impl TaskOutcome {
    pub fn counts(&self) -> SampleCounts {
        SampleCounts {
            n_samples: self.n_samples,
            n_correct: self.n_correct,
        }
    }
}

/// One graded sample, kept for audit when sample logging is on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SampleRecord {
    pub task_id: String,
    pub sample_index: usize,
    pub completion: String,
    pub passed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_response: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalResult {
    pub per_task: HashMap<String, TaskOutcome>,
    pub metrics: BTreeMap<String, f64>,
    pub score: f64,
    pub score_std: f64,
    pub failures: FailureCounts,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub samples: Vec<SampleRecord>,
}

impl EvalResult {
    pub fn total_samples(&self) -> usize {
        self.per_task.values().map(|o| o.n_samples).sum()
    }
}
