use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::error::{HarnessError, Result};
use crate::task::{DatasetSource, HumanEval, TaskDefinition};

/// Benchmarks the harness knows how to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EvalKind {
    HumanEval,
}

impl EvalKind {
    pub const ALL: [EvalKind; 1] = [EvalKind::HumanEval];

    pub fn name(&self) -> &'static str {
        match self {
            Self::HumanEval => "humaneval",
        }
    }

    pub fn task_definition(&self) -> Arc<dyn TaskDefinition> {
        match self {
            Self::HumanEval => Arc::new(HumanEval::new()),
        }
    }

    pub fn default_dataset(&self) -> DatasetSource {
        match self {
            Self::HumanEval => DatasetSource::default(),
        }
    }
}

impl fmt::Display for EvalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for EvalKind {
    type Err = HarnessError;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().to_ascii_lowercase();
        Self::ALL
            .iter()
            .copied()
            .find(|kind| kind.name() == wanted)
            .ok_or_else(|| HarnessError::UnknownEval(s.trim().to_string()))
    }
}

/// Resolve requested eval names, keeping first-seen order and dropping repeats.
pub fn resolve_evals<S: AsRef<str>>(names: &[S]) -> Result<Vec<EvalKind>> {
    if names.is_empty() {
        return Err(HarnessError::InvalidConfig("no evals requested".into()));
    }
    let mut kinds = Vec::with_capacity(names.len());
    for name in names {
        let kind: EvalKind = name.as_ref().parse()?;
        if !kinds.contains(&kind) {
            kinds.push(kind);
        }
    }
    Ok(kinds)
}
