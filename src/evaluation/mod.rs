pub mod evaluator;
pub mod progress;
pub mod registry;
pub mod result;

pub use evaluator::{EvalConfig, Evaluator};
pub use progress::EvaluationProgress;
pub use registry::{resolve_evals, EvalKind};
pub use result::{EvalResult, FailureCounts, FailureKind, SampleRecord, TaskOutcome};
