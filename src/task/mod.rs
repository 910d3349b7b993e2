pub mod dataset;
pub mod humaneval;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::info;

use crate::error::{HarnessError, Result};
use crate::sampler::Conversation;
use crate::sandbox::ExecutionVerdict;

pub use dataset::{load_task_set, DatasetSource};
pub use humaneval::HumanEval;

const SUBSAMPLE_SEED: u64 = 0;

/// One benchmark problem, as stored in the dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub task_id: String,
    pub prompt: String,
    pub canonical_solution: String,
    pub test: String,
    pub entry_point: String,
}

/// Validated, read-only set of tasks. Specs are shared across workers.
#[derive(Debug, Clone)]
pub struct TaskSet {
    tasks: Vec<Arc<TaskSpec>>,
}

impl TaskSet {
    pub fn new(tasks: Vec<TaskSpec>) -> Result<Self> {
        if tasks.is_empty() {
            return Err(HarnessError::MalformedTaskSet("task set is empty".into()));
        }

        let mut seen = HashSet::with_capacity(tasks.len());
        for task in &tasks {
            if task.task_id.trim().is_empty() {
                return Err(HarnessError::MalformedTaskSet(
                    "task with empty task_id".into(),
                ));
            }
            if !seen.insert(task.task_id.as_str()) {
                return Err(HarnessError::MalformedTaskSet(format!(
                    "duplicate task_id {}",
                    task.task_id
                )));
            }
            if task.entry_point.trim().is_empty() {
                return Err(HarnessError::MalformedTaskSet(format!(
                    "task {} has no entry_point",
                    task.task_id
                )));
            }
            if task.test.trim().is_empty() {
                return Err(HarnessError::MalformedTaskSet(format!(
                    "task {} has no test code",
                    task.task_id
                )));
            }
        }

        Ok(Self {
            tasks: tasks.into_iter().map(Arc::new).collect(),
        })
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<TaskSpec>> {
        self.tasks.iter()
    }

    pub fn get(&self, task_id: &str) -> Option<&Arc<TaskSpec>> {
        self.tasks.iter().find(|t| t.task_id == task_id)
    }

    /// Keep `num_examples` tasks picked with a fixed seed, so debug runs see
    /// the same subset every time. `None` or a count covering the whole set
    /// keeps everything.
    pub fn subsample(self, num_examples: Option<usize>) -> Self {
        let Some(n) = num_examples else {
            return self;
        };
        if n >= self.tasks.len() {
            return self;
        }

        let mut rng = StdRng::seed_from_u64(SUBSAMPLE_SEED);
        let tasks: Vec<Arc<TaskSpec>> = self
            .tasks
            .choose_multiple(&mut rng, n.max(1))
            .cloned()
            .collect();
        info!(kept = tasks.len(), total = self.tasks.len(), "Subsampled task set");
        Self { tasks }
    }

    /// SHA-256 over ids, prompts and tests, in set order.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for task in &self.tasks {
            hasher.update(task.task_id.as_bytes());
            hasher.update([0u8]);
            hasher.update(task.prompt.as_bytes());
            hasher.update([0u8]);
            hasher.update(task.test.as_bytes());
            hasher.update([0u8]);
        }
        hex::encode(hasher.finalize())
    }
}

/// How one benchmark turns a task into a conversation, a runnable program and
/// a score.
pub trait TaskDefinition: Send + Sync {
    fn name(&self) -> &str;

    fn build_conversation(&self, task: &TaskSpec) -> Result<Conversation>;

    /// Pull the code out of a raw model answer.
    fn extract_completion(&self, raw: &str) -> String {
        raw.to_string()
    }

    fn assemble_program(&self, task: &TaskSpec, completion: &str) -> String;

    fn score(&self, verdict: &ExecutionVerdict) -> bool {
        verdict.passed
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::task;
    use super::*;

    fn set_of(n: usize) -> TaskSet {
        TaskSet::new((0..n).map(|i| task(&format!("HumanEval/{}", i))).collect()).unwrap()
    }

    #[test]
    fn test_task_set_rejects_empty() {
        let err = TaskSet::new(vec![]).unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_task_set_rejects_duplicates() {
        let err = TaskSet::new(vec![task("HumanEval/0"), task("HumanEval/0")]).unwrap_err();
        assert!(err.to_string().contains("duplicate task_id HumanEval/0"));
    }

    #[test]
    fn test_task_set_rejects_missing_entry_point() {
        let mut t = task("HumanEval/0");
        t.entry_point = String::new();
        let err = TaskSet::new(vec![t]).unwrap_err();
        assert!(err.to_string().contains("no entry_point"));
    }

    #[test]
    fn test_subsample_is_deterministic() {
        let a: Vec<String> = set_of(50)
            .subsample(Some(5))
            .iter()
            .map(|t| t.task_id.clone())
            .collect();
        let b: Vec<String> = set_of(50)
            .subsample(Some(5))
            .iter()
            .map(|t| t.task_id.clone())
            .collect();
        assert_eq!(a.len(), 5);
        assert_eq!(a, b);
    }

    #[test]
    fn test_subsample_larger_than_set_keeps_all() {
        assert_eq!(set_of(3).subsample(Some(10)).len(), 3);
        assert_eq!(set_of(3).subsample(None).len(), 3);
    }

    #[test]
    fn test_fingerprint_tracks_content() {
        let a = set_of(3).fingerprint();
        assert_eq!(a, set_of(3).fingerprint());
        assert_eq!(a.len(), 64);
        assert_ne!(a, set_of(4).fingerprint());
    }

    #[test]
    fn test_get_by_id() {
        let set = set_of(3);
        assert!(set.get("HumanEval/2").is_some());
        assert!(set.get("HumanEval/9").is_none());
    }
}
