use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info};

use super::{TaskSet, TaskSpec};
use crate::error::{HarnessError, Result};

pub const HUMANEVAL_URL: &str =
    "https://github.com/openai/human-eval/raw/master/data/HumanEval.jsonl.gz";
const DOWNLOAD_TIMEOUT_SECS: u64 = 120;
const MAX_DATASET_SIZE: usize = 64 * 1024 * 1024; // 64MB
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DatasetSource {
    Local { path: PathBuf },
    Remote { url: String },
}

impl Default for DatasetSource {
    fn default() -> Self {
        Self::Remote {
            url: HUMANEVAL_URL.to_string(),
        }
    }
}

impl DatasetSource {
    /// URLs become remote sources, anything else is a local path.
    pub fn parse(location: &str) -> Self {
        if location.starts_with("http://") || location.starts_with("https://") {
            Self::Remote {
                url: location.to_string(),
            }
        } else {
            Self::Local {
                path: PathBuf::from(location),
            }
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Self::Local { path } => path.display().to_string(),
            Self::Remote { url } => url.clone(),
        }
    }
}

pub async fn load_task_set(source: &DatasetSource) -> Result<TaskSet> {
    let bytes = match source {
        DatasetSource::Local { path } => tokio::fs::read(path)
            .await
            .map_err(|e| HarnessError::DatasetIo {
                path: path.display().to_string(),
                source: e,
            })?,
        DatasetSource::Remote { url } => download(url).await?,
    };

    let origin = source.describe();
    let set = parse_task_set(&bytes, &origin)?;
    info!(tasks = set.len(), source = %origin, "Loaded task set");
    Ok(set)
}

/// Parse JSON Lines, transparently gunzipping when the payload is gzip.
pub fn parse_task_set(bytes: &[u8], origin: &str) -> Result<TaskSet> {
    let text = decode(bytes).map_err(|e| HarnessError::DatasetIo {
        path: origin.to_string(),
        source: e,
    })?;

    let mut tasks = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let task: TaskSpec = serde_json::from_str(line).map_err(|e| {
            HarnessError::MalformedTaskSet(format!("{} line {}: {}", origin, idx + 1, e))
        })?;
        tasks.push(task);
    }
    debug!(rows = tasks.len(), origin, "Parsed dataset rows");

    TaskSet::new(tasks)
}

fn decode(bytes: &[u8]) -> std::io::Result<String> {
    if bytes.starts_with(&GZIP_MAGIC) {
        let mut text = String::new();
        GzDecoder::new(bytes).read_to_string(&mut text)?;
        Ok(text)
    } else {
        String::from_utf8(bytes.to_vec())
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }
}

async fn download(url: &str) -> Result<Vec<u8>> {
    info!("Downloading dataset from {}", url);
    let fail = |reason: String| HarnessError::DatasetDownload {
        url: url.to_string(),
        reason,
    };

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(DOWNLOAD_TIMEOUT_SECS))
        .build()
        .map_err(|e| fail(e.to_string()))?;

    let resp = client
        .get(url)
        .send()
        .await
        .map_err(|e| fail(e.to_string()))?;

    if !resp.status().is_success() {
        return Err(fail(format!("HTTP {}", resp.status().as_u16())));
    }

    let bytes = resp.bytes().await.map_err(|e| fail(e.to_string()))?;
    if bytes.len() > MAX_DATASET_SIZE {
        return Err(fail(format!(
            "dataset too large: {} bytes (max {})",
            bytes.len(),
            MAX_DATASET_SIZE
        )));
    }

    debug!("Downloaded {} bytes", bytes.len());
    Ok(bytes.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    fn row(id: &str) -> String {
        serde_json::json!({
            "task_id": id,
            "prompt": "def inc(x):\n    \"\"\"Add one.\"\"\"\n",
            "canonical_solution": "    return x + 1\n",
            "test": "def check(candidate):\n    assert candidate(1) == 2\n",
            "entry_point": "inc",
        })
        .to_string()
    }

    fn jsonl(ids: &[&str]) -> String {
        ids.iter().map(|id| row(id)).collect::<Vec<_>>().join("\n") + "\n"
    }

    #[test]
    fn test_parse_plain_jsonl() {
        let set = parse_task_set(jsonl(&["HumanEval/0", "HumanEval/1"]).as_bytes(), "mem").unwrap();
        assert_eq!(set.len(), 2);
        assert_eq!(set.get("HumanEval/1").unwrap().entry_point, "inc");
    }

    #[test]
    fn test_parse_gzipped_jsonl() {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(jsonl(&["HumanEval/0"]).as_bytes()).unwrap();
        let gz = enc.finish().unwrap();

        let set = parse_task_set(&gz, "mem.gz").unwrap();
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_parse_skips_blank_lines() {
        let text = format!("\n{}\n\n{}\n", row("a"), row("b"));
        assert_eq!(parse_task_set(text.as_bytes(), "mem").unwrap().len(), 2);
    }

    #[test]
    fn test_parse_reports_bad_line_number() {
        let text = format!("{}\n{{\"task_id\": \"broken\"}}\n", row("a"));
        let err = parse_task_set(text.as_bytes(), "HumanEval.jsonl").unwrap_err();
        assert!(err.is_configuration());
        assert!(err.to_string().contains("HumanEval.jsonl line 2"));
    }

    #[test]
    fn test_parse_empty_is_malformed() {
        let err = parse_task_set(b"\n\n", "mem").unwrap_err();
        assert!(matches!(err, HarnessError::MalformedTaskSet(_)));
    }

    #[test]
    fn test_dataset_source_parse() {
        assert_eq!(
            DatasetSource::parse("https://example.com/h.jsonl.gz"),
            DatasetSource::Remote {
                url: "https://example.com/h.jsonl.gz".into()
            }
        );
        assert_eq!(
            DatasetSource::parse("data/HumanEval.jsonl"),
            DatasetSource::Local {
                path: PathBuf::from("data/HumanEval.jsonl")
            }
        );
    }

    #[test]
    fn test_dataset_source_default_is_humaneval() {
        assert_eq!(DatasetSource::default().describe(), HUMANEVAL_URL);
    }

    #[tokio::test]
    async fn test_load_local_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("tasks.jsonl");
        std::fs::write(&path, jsonl(&["HumanEval/0", "HumanEval/1", "HumanEval/2"])).unwrap();

        let set = load_task_set(&DatasetSource::Local { path }).await.unwrap();
        assert_eq!(set.len(), 3);
    }

    #[tokio::test]
    async fn test_load_missing_file_is_configuration_error() {
        let source = DatasetSource::Local {
            path: PathBuf::from("/nonexistent/dir/HumanEval.jsonl"),
        };
        let err = load_task_set(&source).await.unwrap_err();
        assert!(matches!(err, HarnessError::DatasetIo { .. }));
        assert!(err.is_configuration());
    }
}
