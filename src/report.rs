use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use uuid::Uuid;

use crate::evaluation::{EvalResult, FailureCounts, SampleRecord};

pub const RESULTS_FILE: &str = "results.json";

/// Final, serializable summary of one (model, eval) run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub model: String,
    pub eval_name: String,
    pub metrics: BTreeMap<String, f64>,
    pub failures: FailureCounts,
    pub num_tasks: usize,
    pub samples_per_task: usize,
    pub dataset_fingerprint: String,
}

impl RunReport {
    pub fn new(
        model: impl Into<String>,
        eval_name: impl Into<String>,
        result: &EvalResult,
        samples_per_task: usize,
        dataset_fingerprint: impl Into<String>,
    ) -> Self {
        let mut metrics = result.metrics.clone();
        metrics.insert("score".to_string(), result.score);
        metrics.insert("score:std".to_string(), result.score_std);

        Self {
            run_id: Uuid::new_v4(),
            created_at: Utc::now(),
            model: model.into(),
            eval_name: eval_name.into(),
            metrics,
            failures: result.failures,
            num_tasks: result.per_task.len(),
            samples_per_task,
            dataset_fingerprint: dataset_fingerprint.into(),
        }
    }

    pub fn key(&self) -> String {
        format!("{}_{}", self.eval_name, self.model)
    }

    pub fn summary_line(&self) -> String {
        let metrics = self
            .metrics
            .iter()
            .filter(|(name, _)| !name.ends_with(":std"))
            .map(|(name, value)| format!("{}={:.4}", name, value))
            .collect::<Vec<_>>()
            .join(" ");
        format!(
            "{} [{}] {} | failures: unavailable={} rejected={} timeout={} crash={} panicked={}",
            self.eval_name,
            self.model,
            metrics,
            self.failures.sampler_unavailable,
            self.failures.sampler_rejected,
            self.failures.sandbox_timeout,
            self.failures.sandbox_crash,
            self.failures.unit_panicked,
        )
    }
}

/// Reports accumulated across every (model, eval) pair of one invocation.
#[derive(Debug, Default)]
pub struct ReportSet {
    reports: BTreeMap<String, RunReport>,
}

impl ReportSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// A later report for the same (model, eval) replaces the earlier one.
    pub fn push(&mut self, report: RunReport) {
        self.reports.insert(report.key(), report);
    }

    pub fn len(&self) -> usize {
        self.reports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reports.is_empty()
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!(self.reports)
    }

    pub fn write_to(&self, dir: &Path) -> Result<PathBuf> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create output dir {}", dir.display()))?;
        let path = dir.join(RESULTS_FILE);
        let body = serde_json::to_string_pretty(&self.reports).context("Failed to serialize reports")?;
        std::fs::write(&path, body)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        info!("Wrote {} report(s) to {}", self.reports.len(), path.display());
        Ok(path)
    }

    /// Write whatever was collected, then hand back the run's own error if it
    /// had one. Nothing is written when a failed run produced no reports.
    pub fn write_after<T>(&self, dir: &Path, outcome: Result<T>) -> Result<PathBuf> {
        let outcome = match outcome {
            Err(e) if self.is_empty() => return Err(e),
            other => other,
        };
        let path = self.write_to(dir)?;
        match outcome {
            Ok(_) => Ok(path),
            Err(e) => {
                warn!("Run failed, partial results written to {}", path.display());
                Err(e)
            }
        }
    }
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
        .collect()
}

/// Write one JSON object per sample to `samples_{eval}_{model}.jsonl`.
pub fn write_samples(
    dir: &Path,
    eval_name: &str,
    model: &str,
    samples: &[SampleRecord],
) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create output dir {}", dir.display()))?;
    let path = dir.join(format!("samples_{}_{}.jsonl", sanitize(eval_name), sanitize(model)));
    let file = std::fs::File::create(&path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    let mut out = std::io::BufWriter::new(file);
    for sample in samples {
        serde_json::to_writer(&mut out, sample).context("Failed to serialize sample")?;
        out.write_all(b"\n")?;
    }
    out.flush()
        .with_context(|| format!("Failed to write {}", path.display()))?;
    info!(samples = samples.len(), "Wrote sample log to {}", path.display());
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluation::{FailureKind, TaskOutcome};
    use std::collections::HashMap;

    fn result() -> EvalResult {
        let mut per_task = HashMap::new();
        per_task.insert(
            "HumanEval/0".to_string(),
            TaskOutcome {
                task_id: "HumanEval/0".into(),
                n_samples: 2,
                n_correct: 1,
                failures: FailureCounts::default(),
            },
        );
        let mut metrics = BTreeMap::new();
        metrics.insert("pass@1".to_string(), 0.5);
        metrics.insert("pass@1:std".to_string(), 0.0);
        EvalResult {
            per_task,
            metrics,
            score: 0.5,
            score_std: 0.0,
            failures: FailureCounts::default(),
            samples: vec![],
        }
    }

    #[test]
    fn test_report_merges_score() {
        let report = RunReport::new("gpt-4o-mini", "humaneval", &result(), 2, "abc");
        assert_eq!(report.metrics["score"], 0.5);
        assert_eq!(report.metrics["score:std"], 0.0);
        assert_eq!(report.metrics["pass@1"], 0.5);
        assert_eq!(report.num_tasks, 1);
    }

    #[test]
    fn test_report_set_accumulates_per_model_and_eval() {
        let mut set = ReportSet::new();
        set.push(RunReport::new("model-a", "humaneval", &result(), 2, "abc"));
        set.push(RunReport::new("model-b", "humaneval", &result(), 2, "abc"));
        set.push(RunReport::new("model-a", "humaneval", &result(), 2, "abc"));
        assert_eq!(set.len(), 2);

        let json = set.to_json();
        assert!(json.get("humaneval_model-a").is_some());
        assert!(json.get("humaneval_model-b").is_some());
    }

    #[test]
    fn test_write_results_json() {
        let tmp = tempfile::tempdir().unwrap();
        let mut set = ReportSet::new();
        set.push(RunReport::new("m", "humaneval", &result(), 2, "abc"));

        let path = set.write_to(&tmp.path().join("out")).unwrap();
        let parsed: BTreeMap<String, RunReport> =
            serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(parsed["humaneval_m"].dataset_fingerprint, "abc");
    }

    #[test]
    fn test_write_after_failure_keeps_finished_reports() {
        let tmp = tempfile::tempdir().unwrap();
        let mut set = ReportSet::new();
        set.push(RunReport::new("model-a", "humaneval", &result(), 2, "abc"));

        let err = set
            .write_after(tmp.path(), Err::<(), _>(anyhow::anyhow!("humaneval on model-b aborted")))
            .unwrap_err();
        assert!(err.to_string().contains("model-b aborted"));

        let written = std::fs::read_to_string(tmp.path().join(RESULTS_FILE)).unwrap();
        let parsed: BTreeMap<String, RunReport> = serde_json::from_str(&written).unwrap();
        assert!(parsed.contains_key("humaneval_model-a"));
    }

    #[test]
    fn test_write_after_failure_with_nothing_to_write() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("out");
        let set = ReportSet::new();

        assert!(set.write_after(&dir, Err::<(), _>(anyhow::anyhow!("boom"))).is_err());
        assert!(!dir.join(RESULTS_FILE).exists());
    }

    #[test]
    fn test_write_samples_jsonl() {
        let tmp = tempfile::tempdir().unwrap();
        let samples = vec![
            SampleRecord {
                task_id: "HumanEval/0".into(),
                sample_index: 0,
                completion: "    return a + b\n".into(),
                passed: true,
                failure: None,
                detail: None,
                raw_response: None,
            },
            SampleRecord {
                task_id: "HumanEval/0".into(),
                sample_index: 1,
                completion: String::new(),
                passed: false,
                failure: Some(FailureKind::SamplerUnavailable),
                detail: Some("HTTP 503".into()),
                raw_response: None,
            },
        ];

        let path = write_samples(tmp.path(), "humaneval", "org/model:latest", &samples).unwrap();
        assert!(path.ends_with("samples_humaneval_org_model_latest.jsonl"));

        let text = std::fs::read_to_string(path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let second: SampleRecord = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second.failure, Some(FailureKind::SamplerUnavailable));
    }

    #[test]
    fn test_summary_line_hides_std() {
        let report = RunReport::new("m", "humaneval", &result(), 2, "abc");
        let line = report.summary_line();
        assert!(line.contains("pass@1=0.5000"));
        assert!(!line.contains(":std"));
    }
}
