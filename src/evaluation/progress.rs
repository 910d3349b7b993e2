use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

use super::result::FailureKind;

/// Lock-free counters shared by every sample unit of one run.
#[derive(Debug)]
pub struct EvaluationProgress {
    total: u64,
    log_every: u64,
    started_at: Instant,
    completed: AtomicU64,
    passed: AtomicU64,
    sampler_failures: AtomicU64,
    sandbox_failures: AtomicU64,
}

impl EvaluationProgress {
    pub fn new(total: usize) -> Self {
        let total = total as u64;
        Self {
            total,
            log_every: (total / 10).max(1),
            started_at: Instant::now(),
            completed: AtomicU64::new(0),
            passed: AtomicU64::new(0),
            sampler_failures: AtomicU64::new(0),
            sandbox_failures: AtomicU64::new(0),
        }
    }

    pub fn record(&self, passed: bool, failure: Option<FailureKind>) {
        if passed {
            self.passed.fetch_add(1, Ordering::Relaxed);
        }
        match failure {
            Some(FailureKind::SamplerUnavailable | FailureKind::SamplerRejected) => {
                self.sampler_failures.fetch_add(1, Ordering::Relaxed);
            }
            Some(
                FailureKind::SandboxTimeout | FailureKind::SandboxCrash | FailureKind::UnitPanicked,
            ) => {
                self.sandbox_failures.fetch_add(1, Ordering::Relaxed);
            }
            None => {}
        }

        let done = self.completed.fetch_add(1, Ordering::Relaxed) + 1;
        if done % self.log_every == 0 || done == self.total {
            info!(
                completed = done,
                total = self.total,
                passed = self.passed.load(Ordering::Relaxed),
                elapsed_ms = self.started_at.elapsed().as_millis() as u64,
                "Evaluation progress"
            );
        }
    }

    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    pub fn passed(&self) -> u64 {
        self.passed.load(Ordering::Relaxed)
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            return 1.0;
        }
        self.completed() as f64 / self.total as f64
    }

    pub fn log_summary(&self) {
        info!(
            completed = self.completed(),
            total = self.total,
            passed = self.passed(),
            sampler_failures = self.sampler_failures.load(Ordering::Relaxed),
            sandbox_failures = self.sandbox_failures.load(Ordering::Relaxed),
            elapsed_ms = self.started_at.elapsed().as_millis() as u64,
            "Evaluation finished"
        );
    }
}
