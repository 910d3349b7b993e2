use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::{Id as UnitId, JoinSet};
use tracing::{debug, error, info, warn};

use super::progress::EvaluationProgress;
use super::result::{EvalResult, FailureCounts, FailureKind, SampleRecord, TaskOutcome};
use crate::error::{HarnessError, Result};
use crate::metrics::{self, SampleCounts, DEFAULT_KS};
use crate::sampler::{Conversation, Sampler, SamplerErrorKind};
use crate::sandbox::ProgramChecker;
use crate::task::{TaskDefinition, TaskSet, TaskSpec};

#[derive(Debug, Clone)]
pub struct EvalConfig {
    pub samples_per_task: usize,
    pub concurrency: usize,
    pub requested_ks: Vec<usize>,
    pub max_output_tokens: u32,
    pub sandbox_timeout: Duration,
    pub keep_samples: bool,
}

impl Default for EvalConfig {
    fn default() -> Self {
        Self {
            samples_per_task: 5,
            concurrency: 16,
            requested_ks: DEFAULT_KS.to_vec(),
            max_output_tokens: 2048,
            sandbox_timeout: Duration::from_secs(10),
            keep_samples: false,
        }
    }
}

impl EvalConfig {
    pub fn with_samples_per_task(mut self, n: usize) -> Self {
        self.samples_per_task = n;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_ks(mut self, ks: Vec<usize>) -> Self {
        self.requested_ks = ks;
        self
    }

    pub fn with_sandbox_timeout(mut self, timeout: Duration) -> Self {
        self.sandbox_timeout = timeout;
        self
    }

    pub fn with_keep_samples(mut self, keep: bool) -> Self {
        self.keep_samples = keep;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.samples_per_task == 0 {
            return Err(HarnessError::InvalidConfig(
                "samples_per_task must be at least 1".into(),
            ));
        }
        if self.concurrency == 0 {
            return Err(HarnessError::InvalidConfig(
                "concurrency must be at least 1".into(),
            ));
        }
        if self.requested_ks.is_empty() || self.requested_ks.contains(&0) {
            return Err(HarnessError::InvalidConfig(
                "requested ks must be non-empty and positive".into(),
            ));
        }
        if self.sandbox_timeout.is_zero() {
            return Err(HarnessError::InvalidConfig(
                "sandbox timeout must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct TaskTally {
    n_samples: usize,
    n_correct: usize,
    failures: FailureCounts,
    last_rejection: Option<String>,
}

/// Outcome of one (task, sample index) unit before it is folded into a tally.
struct Graded {
    passed: bool,
    failure: Option<FailureKind>,
    detail: Option<String>,
    completion: String,
    raw_response: Option<serde_json::Value>,
}

impl Graded {
    fn panicked(detail: String) -> Self {
        Self {
            passed: false,
            failure: Some(FailureKind::UnitPanicked),
            detail: Some(detail),
            completion: String::new(),
            raw_response: None,
        }
    }
}

/// Shared sink every finished unit is folded into.
struct Fold {
    tallies: DashMap<String, TaskTally>,
    progress: EvaluationProgress,
    sample_log: Mutex<Vec<SampleRecord>>,
    keep_samples: bool,
}

impl Fold {
    fn record(&self, task_id: &str, sample_index: usize, graded: Graded) {
        if let Some(mut tally) = self.tallies.get_mut(task_id) {
            tally.n_samples += 1;
            if graded.passed {
                tally.n_correct += 1;
            }
            if let Some(kind) = graded.failure {
                tally.failures.record(kind);
                if kind == FailureKind::SamplerRejected {
                    tally.last_rejection = graded.detail.clone();
                }
            }
        }
        self.progress.record(graded.passed, graded.failure);

        if self.keep_samples {
            self.sample_log.lock().push(SampleRecord {
                task_id: task_id.to_string(),
                sample_index,
                completion: graded.completion,
                passed: graded.passed,
                failure: graded.failure,
                detail: graded.detail,
                raw_response: graded.raw_response,
            });
        }
    }
}

/// Everything a spawned unit needs, cloned out of the evaluator.
struct SampleUnit {
    task: Arc<TaskSpec>,
    sample_index: usize,
    conversation: Arc<Conversation>,
    sampler: Arc<dyn Sampler>,
    definition: Arc<dyn TaskDefinition>,
    checker: Arc<dyn ProgramChecker>,
    gate: Arc<Semaphore>,
    max_output_tokens: u32,
    sandbox_timeout: Duration,
}

impl SampleUnit {
    async fn run(self) -> Graded {
        // One permit covers both the model call and the sandbox run.
        let _permit = match self.gate.acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                return Graded {
                    passed: false,
                    failure: Some(FailureKind::SamplerUnavailable),
                    detail: Some("worker pool closed".into()),
                    completion: String::new(),
                    raw_response: None,
                }
            }
        };

        let sample = self
            .sampler
            .sample(&self.conversation, self.max_output_tokens)
            .await;

        if !sample.succeeded {
            let kind = sample.error.unwrap_or(SamplerErrorKind::Unavailable);
            let detail = sample.detail.unwrap_or_default();
            warn!(
                task_id = %self.task.task_id,
                sample = self.sample_index,
                kind = ?kind,
                attempts = sample.attempts,
                "Sampler failed: {}",
                detail
            );
            return Graded {
                passed: false,
                failure: Some(kind.into()),
                detail: Some(detail),
                completion: String::new(),
                raw_response: sample.raw_response,
            };
        }

        let completion = self.definition.extract_completion(&sample.text);
        let program = self.definition.assemble_program(&self.task, &completion);
        let verdict = self.checker.check(&program, self.sandbox_timeout).await;
        let passed = self.definition.score(&verdict);

        let failure = if verdict.timed_out {
            Some(FailureKind::SandboxTimeout)
        } else if verdict.crashed {
            Some(FailureKind::SandboxCrash)
        } else {
            None
        };
        debug!(
            task_id = %self.task.task_id,
            sample = self.sample_index,
            passed,
            duration_ms = verdict.duration_ms,
            "Sample graded"
        );

        Graded {
            passed,
            failure,
            detail: failure.map(|_| verdict.stderr.clone()).filter(|s| !s.is_empty()),
            completion,
            raw_response: sample.raw_response,
        }
    }
}

/// Fans every (task, sample) pair out over a bounded worker pool and reduces
/// the graded samples to pass@k.
pub struct Evaluator {
    config: EvalConfig,
    definition: Arc<dyn TaskDefinition>,
    checker: Arc<dyn ProgramChecker>,
}

impl Evaluator {
    pub fn new(
        config: EvalConfig,
        definition: Arc<dyn TaskDefinition>,
        checker: Arc<dyn ProgramChecker>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            definition,
            checker,
        })
    }

    pub async fn run(&self, tasks: &TaskSet, sampler: Arc<dyn Sampler>) -> Result<EvalResult> {
        let start = Instant::now();
        let per_task = self.config.samples_per_task;
        let total_units = tasks.len() * per_task;

        info!(
            eval = self.definition.name(),
            model = sampler.model(),
            tasks = tasks.len(),
            samples_per_task = per_task,
            concurrency = self.config.concurrency,
            "Starting evaluation"
        );

        // Conversations are built up front so a bad task fails before any sampling.
        let mut prepared = Vec::with_capacity(tasks.len());
        for task in tasks.iter() {
            let conversation = Arc::new(self.definition.build_conversation(task)?);
            prepared.push((Arc::clone(task), conversation));
        }

        let gate = Arc::new(Semaphore::new(self.config.concurrency));
        let fold = Arc::new(Fold {
            tallies: DashMap::new(),
            progress: EvaluationProgress::new(total_units),
            sample_log: Mutex::new(Vec::new()),
            keep_samples: self.config.keep_samples,
        });

        let mut units = JoinSet::new();
        let mut spawned: HashMap<UnitId, (String, usize)> = HashMap::with_capacity(total_units);
        for (task, conversation) in prepared {
            fold.tallies.insert(task.task_id.clone(), TaskTally::default());
            for sample_index in 0..per_task {
                let unit = SampleUnit {
                    task: Arc::clone(&task),
                    sample_index,
                    conversation: Arc::clone(&conversation),
                    sampler: Arc::clone(&sampler),
                    definition: Arc::clone(&self.definition),
                    checker: Arc::clone(&self.checker),
                    gate: Arc::clone(&gate),
                    max_output_tokens: self.config.max_output_tokens,
                    sandbox_timeout: self.config.sandbox_timeout,
                };
                let fold = Arc::clone(&fold);

                let handle = units.spawn(async move {
                    let task_id = unit.task.task_id.clone();
                    let graded = unit.run().await;
                    fold.record(&task_id, sample_index, graded);
                    task_id
                });
                spawned.insert(handle.id(), (task.task_id.clone(), sample_index));
            }
        }

        while let Some(joined) = units.join_next_with_id().await {
            let task_id = match joined {
                Ok((_, task_id)) => task_id,
                Err(e) if e.is_cancelled() => continue,
                Err(e) => {
                    // A panicking unit still counts as a failed sample.
                    let Some((task_id, sample_index)) = spawned.get(&e.id()).cloned() else {
                        warn!("Unknown sample unit panicked: {}", e);
                        continue;
                    };
                    warn!(task_id = %task_id, sample = sample_index, "Sample unit panicked: {}", e);
                    fold.record(&task_id, sample_index, Graded::panicked(e.to_string()));
                    task_id
                }
            };

            if let Some(reason) = fully_rejected(&fold.tallies, &task_id, per_task) {
                units.abort_all();
                error!(
                    task_id = %task_id,
                    "Every sample was rejected by the sampler, aborting run"
                );
                return Err(HarnessError::TaskRejected { task_id, reason });
            }
        }

        fold.progress.log_summary();

        let mut outcomes: Vec<TaskOutcome> = fold
            .tallies
            .iter()
            .map(|entry| TaskOutcome {
                task_id: entry.key().clone(),
                n_samples: entry.n_samples,
                n_correct: entry.n_correct,
                failures: entry.failures,
            })
            .collect();
        outcomes.sort_by(|a, b| a.task_id.cmp(&b.task_id));

        let counts: Vec<SampleCounts> = outcomes.iter().map(TaskOutcome::counts).collect();
        let aggregate = metrics::reduce(&counts, &self.config.requested_ks);

        let mut failures = FailureCounts::default();
        for outcome in &outcomes {
            failures.merge(&outcome.failures);
        }

        let mut samples = std::mem::take(&mut *fold.sample_log.lock());
        samples.sort_by(|a, b| {
            a.task_id
                .cmp(&b.task_id)
                .then(a.sample_index.cmp(&b.sample_index))
        });

        info!(
            eval = self.definition.name(),
            model = sampler.model(),
            score = aggregate.score,
            failures = failures.total(),
            duration_ms = start.elapsed().as_millis() as u64,
            "Evaluation complete"
        );

        Ok(EvalResult {
            metrics: aggregate.metrics(),
            score: aggregate.score,
            score_std: aggregate.score_std,
            per_task: outcomes
                .into_iter()
                .map(|o| (o.task_id.clone(), o))
                .collect::<HashMap<_, _>>(),
            failures,
            samples,
        })
    }
}

/// `Some(reason)` once every sample of the task has come back rejected.
fn fully_rejected(
    tallies: &DashMap<String, TaskTally>,
    task_id: &str,
    per_task: usize,
) -> Option<String> {
    let tally = tallies.get(task_id)?;
    if tally.n_samples == per_task && tally.failures.sampler_rejected == per_task {
        Some(
            tally
                .last_rejection
                .clone()
                .unwrap_or_else(|| "rejected by sampler".to_string()),
        )
    } else {
        None
    }
}
