use thiserror::Error;

pub type Result<T> = std::result::Result<T, HarnessError>;

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("unrecognized eval type: {0}")]
    UnknownEval(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("malformed task set: {0}")]
    MalformedTaskSet(String),

    #[error("failed to read dataset {path}: {source}")]
    DatasetIo {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to download dataset from {url}: {reason}")]
    DatasetDownload { url: String, reason: String },

    #[error("invalid conversation: {0}")]
    InvalidConversation(String),

    #[error("task {task_id}: every sample was rejected by the sampler ({reason})")]
    TaskRejected { task_id: String, reason: String },
}

impl HarnessError {
    /// Errors raised before any sampling starts.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::UnknownEval(_)
                | Self::InvalidConfig(_)
                | Self::MalformedTaskSet(_)
                | Self::DatasetIo { .. }
                | Self::DatasetDownload { .. }
        )
    }
}
