use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::process::{Output, Stdio};
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::{debug, warn};

const MAX_OUTPUT_DEFAULT: usize = 1024 * 1024; // 1MB
const ASSERTION_MARKER: &[u8] = b"AssertionError";
const FALLBACK_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// Outcome of running one program. Never mutated after creation.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionVerdict {
    pub passed: bool,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub crashed: bool,
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
}

impl ExecutionVerdict {
    fn timeout(duration_ms: u64) -> Self {
        Self {
            passed: false,
            stdout: String::new(),
            stderr: String::new(),
            timed_out: true,
            crashed: false,
            exit_code: None,
            duration_ms,
        }
    }

    fn crash(reason: String, duration_ms: u64) -> Self {
        Self {
            passed: false,
            stdout: String::new(),
            stderr: reason,
            timed_out: false,
            crashed: true,
            exit_code: None,
            duration_ms,
        }
    }

    fn from_output(output: &Output, max_output_bytes: usize, duration_ms: u64) -> Self {
        let stdout = truncate_output(&output.stdout, max_output_bytes);
        let stderr = truncate_output(&output.stderr, max_output_bytes);
        let exit_code = output.status.code();
        let passed = output.status.success();
        // A failing assertion is a wrong answer, not a crash. The traceback ends
        // the stream, so look at the untruncated bytes.
        let assertion_failure = exit_code.is_some()
            && output
                .stderr
                .windows(ASSERTION_MARKER.len())
                .any(|w| w == ASSERTION_MARKER);

        Self {
            passed,
            crashed: !passed && !assertion_failure,
            timed_out: false,
            stdout,
            stderr,
            exit_code,
            duration_ms,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub interpreter: String,
    pub program_file: String,
    pub max_output_bytes: usize,
    pub memory_limit_mb: Option<u64>,
    pub nice: Option<i32>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            interpreter: "python3".to_string(),
            program_file: "program.py".to_string(),
            max_output_bytes: MAX_OUTPUT_DEFAULT,
            memory_limit_mb: None,
            nice: Some(10),
        }
    }
}

fn truncate_output(s: &[u8], max: usize) -> String {
    if s.len() <= max {
        String::from_utf8_lossy(s).to_string()
    } else {
        let truncated = String::from_utf8_lossy(&s[..max]).to_string();
        format!("{}\n\n... [truncated at {} bytes, total {}]", truncated, max, s.len())
    }
}

/// Shell line that applies resource limits, then execs the interpreter so the
/// program itself becomes the direct child.
fn wrap_command(cfg: &SandboxConfig) -> String {
    let mut parts = Vec::new();

    if let Some(mem_mb) = cfg.memory_limit_mb {
        let kb = mem_mb * 1024;
        parts.push(format!("ulimit -v {} 2>/dev/null;", kb));
    }

    parts.push("exec".to_string());
    if let Some(nice) = cfg.nice {
        parts.push(format!("nice -n {}", nice));
    }
    parts.push(cfg.interpreter.clone());
    parts.push(cfg.program_file.clone());
    parts.join(" ")
}

/// Kill every process in a process group (best-effort).
async fn kill_process_group(pgid: u32) {
    let _ = Command::new("kill")
        .args(["-KILL", "--", &format!("-{}", pgid)])
        .output()
        .await;
}

/// Grades program text. The Evaluator only depends on this seam.
#[async_trait]
pub trait ProgramChecker: Send + Sync {
    async fn check(&self, program: &str, timeout: Duration) -> ExecutionVerdict;
}

/// Runs each program in a fresh temp directory as a separate process group.
pub struct Sandbox {
    config: SandboxConfig,
}

impl Sandbox {
    pub fn new(config: SandboxConfig) -> Self {
        Self { config }
    }

    async fn execute(&self, program: &str, timeout: Duration, start: Instant) -> Result<ExecutionVerdict> {
        let work_dir = tempfile::Builder::new()
            .prefix("sandbox-")
            .tempdir()
            .context("Failed to create sandbox directory")?;
        tokio::fs::write(work_dir.path().join(&self.config.program_file), program)
            .await
            .context("Failed to write program file")?;

        let path_env = std::env::var("PATH").unwrap_or_else(|_| FALLBACK_PATH.into());

        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(wrap_command(&self.config))
            .current_dir(work_dir.path())
            .env_clear()
            .env("PATH", path_env)
            .env("HOME", work_dir.path())
            .env("PYTHONHASHSEED", "0")
            .env("PYTHONDONTWRITEBYTECODE", "1")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // New process group so a timeout can take down anything the program forked.
        command.process_group(0);

        let child = command.spawn().context("Failed to spawn process")?;
        let pgid = child.id();

        let result = tokio::time::timeout(timeout, child.wait_with_output()).await;
        let duration_ms = start.elapsed().as_millis() as u64;

        match result {
            Ok(Ok(output)) => {
                let verdict =
                    ExecutionVerdict::from_output(&output, self.config.max_output_bytes, duration_ms);
                debug!(
                    passed = verdict.passed,
                    crashed = verdict.crashed,
                    exit_code = ?verdict.exit_code,
                    duration_ms,
                    "Program finished"
                );
                Ok(verdict)
            }
            Ok(Err(e)) => anyhow::bail!("Process error: {}", e),
            Err(_) => {
                if let Some(pgid) = pgid {
                    kill_process_group(pgid).await;
                }
                warn!(
                    timeout_ms = timeout.as_millis() as u64,
                    "Program timed out, process group killed"
                );
                Ok(ExecutionVerdict::timeout(duration_ms))
            }
        }
    }
}

impl Default for Sandbox {
    fn default() -> Self {
        Self::new(SandboxConfig::default())
    }
}

#[async_trait]
impl ProgramChecker for Sandbox {
    async fn check(&self, program: &str, timeout: Duration) -> ExecutionVerdict {
        let start = Instant::now();
        match self.execute(program, timeout, start).await {
            Ok(verdict) => verdict,
            Err(e) => {
                warn!(error = %format!("{:#}", e), "Sandbox execution failed");
                ExecutionVerdict::crash(format!("{:#}", e), start.elapsed().as_millis() as u64)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shell_sandbox() -> Sandbox {
        Sandbox::new(SandboxConfig {
            interpreter: "sh".to_string(),
            program_file: "program.sh".to_string(),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_check_pass() {
        let sandbox = shell_sandbox();
        let verdict = sandbox.check("echo hello\n", Duration::from_secs(5)).await;
        assert!(verdict.passed);
        assert!(!verdict.crashed);
        assert!(!verdict.timed_out);
        assert_eq!(verdict.exit_code, Some(0));
        assert!(verdict.stdout.contains("hello"));
    }

    #[tokio::test]
    async fn test_check_assertion_failure_is_not_crash() {
        let sandbox = shell_sandbox();
        let verdict = sandbox
            .check("echo 'AssertionError: expected 2' >&2\nexit 1\n", Duration::from_secs(5))
            .await;
        assert!(!verdict.passed);
        assert!(!verdict.crashed);
        assert_eq!(verdict.exit_code, Some(1));
    }

    #[tokio::test]
    async fn test_check_assertion_after_truncated_stderr_is_not_crash() {
        let sandbox = Sandbox::new(SandboxConfig {
            interpreter: "sh".to_string(),
            program_file: "program.sh".to_string(),
            max_output_bytes: 64,
            ..Default::default()
        });
        let program = "i=0\nwhile [ $i -lt 50 ]; do echo 'noisy diagnostic line' >&2; i=$((i+1)); done\necho 'AssertionError' >&2\nexit 1\n";

        let verdict = sandbox.check(program, Duration::from_secs(5)).await;

        assert!(!verdict.passed);
        assert!(!verdict.crashed);
        assert!(verdict.stderr.contains("truncated"));
        assert!(!verdict.stderr.contains("AssertionError"));
    }

    #[tokio::test]
    async fn test_check_unexpected_exit_is_crash() {
        let sandbox = shell_sandbox();
        let verdict = sandbox.check("exit 3\n", Duration::from_secs(5)).await;
        assert!(!verdict.passed);
        assert!(verdict.crashed);
        assert_eq!(verdict.exit_code, Some(3));
    }

    #[tokio::test]
    async fn test_check_signal_is_crash() {
        let sandbox = shell_sandbox();
        let verdict = sandbox.check("kill -SEGV $$\n", Duration::from_secs(5)).await;
        assert!(!verdict.passed);
        assert!(verdict.crashed);
        assert!(verdict.exit_code.is_none());
    }

    #[tokio::test]
    async fn test_check_infinite_loop_times_out() {
        let sandbox = shell_sandbox();
        let timeout = Duration::from_millis(300);
        let start = Instant::now();

        let verdict = sandbox.check("while :; do :; done\n", timeout).await;

        assert!(verdict.timed_out);
        assert!(!verdict.passed);
        assert!(!verdict.crashed);
        assert!(start.elapsed() < timeout + Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_check_timeout_kills_background_children() {
        let sandbox = shell_sandbox();
        let start = Instant::now();

        let verdict = sandbox
            .check("sleep 30 &\nsleep 30\n", Duration::from_millis(200))
            .await;

        assert!(verdict.timed_out);
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_check_runs_in_fresh_directory() {
        let sandbox = shell_sandbox();
        let first = sandbox
            .check("echo leaked > state.txt\n", Duration::from_secs(5))
            .await;
        assert!(first.passed);

        let second = sandbox
            .check("test ! -e state.txt\n", Duration::from_secs(5))
            .await;
        assert!(second.passed);
    }

    #[tokio::test]
    async fn test_check_missing_interpreter_is_crash() {
        let sandbox = Sandbox::new(SandboxConfig {
            interpreter: "definitely-not-an-interpreter-xyz".to_string(),
            ..Default::default()
        });
        let verdict = sandbox.check("print(1)\n", Duration::from_secs(5)).await;
        assert!(!verdict.passed);
        assert!(verdict.crashed);
    }

    #[tokio::test]
    async fn test_check_is_deterministic() {
        let sandbox = shell_sandbox();
        let program = "test \"$(expr 6 \\* 7)\" = 42\n";
        let a = sandbox.check(program, Duration::from_secs(5)).await;
        let b = sandbox.check(program, Duration::from_secs(5)).await;
        assert!(a.passed);
        assert_eq!(a.passed, b.passed);
    }

    #[test]
    fn test_truncate_output() {
        let data = vec![b'A'; 2000];
        let result = truncate_output(&data, 100);
        assert!(result.contains("truncated"));
        assert!(result.len() < 2000);
    }

    #[test]
    fn test_wrap_command_nice() {
        let cfg = SandboxConfig {
            nice: Some(15),
            ..Default::default()
        };
        let wrapped = wrap_command(&cfg);
        assert_eq!(wrapped, "exec nice -n 15 python3 program.py");
    }

    #[test]
    fn test_wrap_command_memory_limit_comes_first() {
        let cfg = SandboxConfig {
            memory_limit_mb: Some(512),
            nice: None,
            ..Default::default()
        };
        let wrapped = wrap_command(&cfg);
        assert_eq!(wrapped, "ulimit -v 524288 2>/dev/null; exec python3 program.py");
    }
}
