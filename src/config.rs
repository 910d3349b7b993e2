use std::path::PathBuf;
use std::time::Duration;

use crate::error::{HarnessError, Result};
use crate::evaluation::EvalConfig;
use crate::metrics::DEFAULT_KS;
use crate::sampler::RetryPolicy;
use crate::sandbox::SandboxConfig;

const DEFAULT_MODEL: &str = "gpt-4o-mini";
const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_API_KEY_ENV: &str = "OPENAI_API_KEY";
const DEFAULT_SAMPLES_PER_TASK: usize = 5;
const DEFAULT_CONCURRENCY: usize = 16;
const DEFAULT_MAX_OUTPUT_TOKENS: u32 = 2048;
const DEFAULT_SANDBOX_TIMEOUT: u64 = 10;
const DEFAULT_SANDBOX_NICE: i32 = 10;
const DEFAULT_SAMPLER_MAX_ATTEMPTS: u32 = 5;
const DEFAULT_SAMPLER_TIMEOUT: u64 = 120;
const DEFAULT_TEMPERATURE: f32 = 0.5;
const DEFAULT_PYTHON_BIN: &str = "python3";
const DEFAULT_OUTPUT_DIR: &str = "results";
pub const DEBUG_NUM_EXAMPLES: usize = 10;

#[derive(Debug, Clone)]
pub struct Config {
    pub model: String,
    pub base_url: String,
    pub api_key: Option<String>,
    pub temperature: f32,
    pub dataset: Option<String>,
    pub samples_per_task: usize,
    pub concurrency: usize,
    pub max_output_tokens: u32,
    pub sandbox_timeout_secs: u64,
    pub sandbox_memory_limit_mb: Option<u64>,
    pub sandbox_nice: i32,
    pub python_bin: String,
    pub sampler_max_attempts: u32,
    pub sampler_timeout_secs: u64,
    pub output_dir: PathBuf,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            model: std::env::var("EVAL_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.into()),
            base_url: std::env::var("OPENAI_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.into()),
            api_key: std::env::var(DEFAULT_API_KEY_ENV).ok(),
            temperature: env_parse("EVAL_TEMPERATURE", DEFAULT_TEMPERATURE),
            dataset: std::env::var("HUMANEVAL_DATASET").ok(),
            samples_per_task: env_parse("EVAL_SAMPLES_PER_TASK", DEFAULT_SAMPLES_PER_TASK),
            concurrency: env_parse("EVAL_CONCURRENCY", DEFAULT_CONCURRENCY),
            max_output_tokens: env_parse("EVAL_MAX_OUTPUT_TOKENS", DEFAULT_MAX_OUTPUT_TOKENS),
            sandbox_timeout_secs: env_parse("SANDBOX_TIMEOUT_SECS", DEFAULT_SANDBOX_TIMEOUT),
            sandbox_memory_limit_mb: std::env::var("SANDBOX_MEMORY_LIMIT_MB")
                .ok()
                .and_then(|v| v.parse().ok()),
            sandbox_nice: env_parse("SANDBOX_NICE", DEFAULT_SANDBOX_NICE),
            python_bin: std::env::var("PYTHON_BIN").unwrap_or_else(|_| DEFAULT_PYTHON_BIN.into()),
            sampler_max_attempts: env_parse("SAMPLER_MAX_ATTEMPTS", DEFAULT_SAMPLER_MAX_ATTEMPTS),
            sampler_timeout_secs: env_parse("SAMPLER_TIMEOUT_SECS", DEFAULT_SAMPLER_TIMEOUT),
            output_dir: PathBuf::from(
                std::env::var("EVAL_OUTPUT_DIR").unwrap_or_else(|_| DEFAULT_OUTPUT_DIR.into()),
            ),
        }
    }

    /// Read the API key from a named variable instead of `OPENAI_API_KEY`.
    pub fn with_api_key_env(mut self, var: &str) -> Self {
        self.api_key = std::env::var(var).ok();
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.model.trim().is_empty() {
            return Err(HarnessError::InvalidConfig("model name is empty".into()));
        }
        if !(self.base_url.starts_with("http://") || self.base_url.starts_with("https://")) {
            return Err(HarnessError::InvalidConfig(format!(
                "base url must be http(s): {}",
                self.base_url
            )));
        }
        if self.sandbox_timeout_secs == 0 {
            return Err(HarnessError::InvalidConfig(
                "sandbox timeout must be positive".into(),
            ));
        }
        if self.sampler_max_attempts == 0 {
            return Err(HarnessError::InvalidConfig(
                "sampler max attempts must be at least 1".into(),
            ));
        }
        self.eval_config(false).validate()
    }

    pub fn eval_config(&self, keep_samples: bool) -> EvalConfig {
        EvalConfig {
            samples_per_task: self.samples_per_task,
            concurrency: self.concurrency,
            requested_ks: DEFAULT_KS.to_vec(),
            max_output_tokens: self.max_output_tokens,
            sandbox_timeout: Duration::from_secs(self.sandbox_timeout_secs),
            keep_samples,
        }
    }

    pub fn sandbox_config(&self) -> SandboxConfig {
        SandboxConfig {
            interpreter: self.python_bin.clone(),
            memory_limit_mb: self.sandbox_memory_limit_mb,
            nice: (self.sandbox_nice > 0).then_some(self.sandbox_nice),
            ..SandboxConfig::default()
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::default().with_max_attempts(self.sampler_max_attempts)
    }

    pub fn sampler_timeout(&self) -> Duration {
        Duration::from_secs(self.sampler_timeout_secs)
    }

    pub fn print_banner(&self) {
        tracing::info!("╔══════════════════════════════════════════════════╗");
        tracing::info!("║           humaneval-harness v{:<20}║", env!("CARGO_PKG_VERSION"));
        tracing::info!("╠══════════════════════════════════════════════════╣");
        tracing::info!("║  Model:             {:<28}║", self.model);
        tracing::info!("║  Endpoint:          {:<28}║", self.base_url);
        tracing::info!("║  API key:           {:<28}║", if self.api_key.is_some() { "set" } else { "missing" });
        tracing::info!("║  Samples per task:  {:<28}║", self.samples_per_task);
        tracing::info!("║  Concurrency:       {:<28}║", self.concurrency);
        tracing::info!("║  Max output tokens: {:<28}║", self.max_output_tokens);
        tracing::info!("║  Sandbox timeout:   {:<25}s ║", self.sandbox_timeout_secs);
        tracing::info!("║  Interpreter:       {:<28}║", self.python_bin);
        tracing::info!("║  Retry attempts:    {:<28}║", self.sampler_max_attempts);
        tracing::info!("║  Output dir:        {:<28}║", self.output_dir.display());
        tracing::info!("╚══════════════════════════════════════════════════╝");

        if self.api_key.is_none() {
            tracing::warn!("No API key configured, requests will be sent unauthenticated");
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let cfg = Config::from_env();
        assert_eq!(cfg.samples_per_task, DEFAULT_SAMPLES_PER_TASK);
        assert_eq!(cfg.concurrency, DEFAULT_CONCURRENCY);
        assert_eq!(cfg.sandbox_timeout_secs, DEFAULT_SANDBOX_TIMEOUT);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_env_parse_fallback() {
        assert_eq!(env_parse::<u16>("NONEXISTENT_VAR_XYZ", 42), 42);
    }

    #[test]
    fn test_validate_rejects_zero_samples() {
        let mut cfg = Config::from_env();
        cfg.samples_per_task = 0;
        let err = cfg.validate().unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_validate_rejects_bad_base_url() {
        let mut cfg = Config::from_env();
        cfg.base_url = "api.openai.com".into();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_sandbox_config_mapping() {
        let mut cfg = Config::from_env();
        cfg.python_bin = "python3.11".into();
        cfg.sandbox_timeout_secs = 3;
        cfg.sandbox_nice = 0;
        cfg.sandbox_memory_limit_mb = Some(512);

        let sandbox = cfg.sandbox_config();
        assert_eq!(sandbox.interpreter, "python3.11");
        assert_eq!(cfg.eval_config(false).sandbox_timeout, Duration::from_secs(3));
        assert_eq!(sandbox.nice, None);
        assert_eq!(sandbox.memory_limit_mb, Some(512));
        assert_eq!(sandbox.program_file, "program.py");
    }

    #[test]
    fn test_eval_config_mapping() {
        let mut cfg = Config::from_env();
        cfg.samples_per_task = 3;
        let eval = cfg.eval_config(true);
        assert_eq!(eval.samples_per_task, 3);
        assert_eq!(eval.requested_ks, DEFAULT_KS.to_vec());
        assert!(eval.keep_samples);
    }

    #[test]
    fn test_retry_policy_attempts() {
        let mut cfg = Config::from_env();
        cfg.sampler_max_attempts = 2;
        assert_eq!(cfg.retry_policy().max_attempts, 2);
    }
}
