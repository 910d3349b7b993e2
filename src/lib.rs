pub mod config;
pub mod error;
pub mod evaluation;
pub mod metrics;
pub mod report;
pub mod sampler;
pub mod sandbox;
pub mod task;

pub use error::{HarnessError, Result};
