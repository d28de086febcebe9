//! Public types for one code-action execution.
//!
//! - [`RunSettings`] — per-call limits (wall-clock budget, output cap)
//! - [`ExecutionResult`] — the structured outcome the orchestrator consumes
//! - [`ErrorKind`] — the closed set of non-runtime failure tags

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Limits applied to a single code-action execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSettings {
    /// Wall-clock budget for the fragment. When it expires the worker is
    /// abandoned and the result carries [`ErrorKind::Timeout`].
    pub timeout: Duration,

    /// Combined stdout + stderr byte cap. An over-limit write raises inside
    /// the fragment like any other runtime error.
    pub max_output_bytes: usize,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            max_output_bytes: 1_048_576,
        }
    }
}

/// Failure tag attached to an [`ExecutionResult`].
///
/// A result with `exit_code != 0` and no tag means the fragment itself raised
/// a runtime exception; the traceback is in `stderr`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// The fragment is not parseable Python.
    SyntaxError,
    /// A static import outside the allowlist, detected before execution.
    PolicyViolation,
    /// The fragment exceeded its wall-clock budget.
    Timeout,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::SyntaxError => "SYNTAX_ERROR",
            ErrorKind::PolicyViolation => "POLICY_VIOLATION",
            ErrorKind::Timeout => "TIMEOUT",
        };
        f.write_str(s)
    }
}

/// The outcome of executing one code action.
///
/// Every failure mode is encoded here; the runner never returns an error to
/// its caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// 0 on success, nonzero on any failure.
    pub exit_code: i32,

    /// Everything the fragment wrote to `sys.stdout`.
    pub stdout: String,

    /// Captured `sys.stderr` plus any traceback, policy message, or timeout
    /// note appended by the runner.
    pub stderr: String,

    /// Wall-clock time of the call, measured with a monotonic clock.
    pub elapsed_sec: f64,

    /// `None` for success and for runtime exceptions raised by the fragment.
    pub error_type: Option<ErrorKind>,
}

impl ExecutionResult {
    /// Render the observation string fed back to the agent.
    ///
    /// Layout is load-bearing: the orchestrator's prompts are written against
    /// this exact shape.
    pub fn to_observation(&self) -> String {
        let mut parts: Vec<String> = Vec::new();
        if !self.stdout.trim().is_empty() {
            parts.push(format!("stdout:\n{}", self.stdout.trim_end()));
        }
        if !self.stderr.trim().is_empty() {
            parts.push(format!("stderr:\n{}", self.stderr.trim_end()));
        }
        if parts.is_empty() {
            parts.push("(no output)".to_string());
        }
        parts.push(format!("exit_code: {}", self.exit_code));
        if let Some(kind) = self.error_type {
            parts.push(format!("error_type: {kind}"));
        }
        parts.join("\n\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(exit_code: i32, stdout: &str, stderr: &str, error_type: Option<ErrorKind>) -> ExecutionResult {
        ExecutionResult {
            exit_code,
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
            elapsed_sec: 0.01,
            error_type,
        }
    }

    #[test]
    fn test_error_kind_serializes_screaming_snake() {
        let json = serde_json::to_string(&ErrorKind::PolicyViolation).unwrap();
        assert_eq!(json, r#""POLICY_VIOLATION""#);
        let back: ErrorKind = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ErrorKind::PolicyViolation);
    }

    #[test]
    fn test_run_settings_defaults() {
        let settings = RunSettings::default();
        assert_eq!(settings.timeout, Duration::from_secs(60));
        assert_eq!(settings.max_output_bytes, 1_048_576);
    }

    #[test]
    fn test_observation_both_streams() {
        let obs = result(0, "out line\n", "err line\n", None).to_observation();
        assert_eq!(obs, "stdout:\nout line\n\nstderr:\nerr line\n\nexit_code: 0");
    }

    #[test]
    fn test_observation_no_output() {
        let obs = result(0, "", "", None).to_observation();
        assert_eq!(obs, "(no output)\n\nexit_code: 0");
    }

    #[test]
    fn test_observation_whitespace_only_streams_count_as_empty() {
        let obs = result(0, "   \n", "\t\n", None).to_observation();
        assert!(obs.starts_with("(no output)"));
    }

    #[test]
    fn test_observation_error_type_present_only_when_set() {
        let tagged = result(1, "", "Execution timed out after 1 seconds.\n", Some(ErrorKind::Timeout))
            .to_observation();
        assert!(tagged.ends_with("error_type: TIMEOUT"));

        let untagged = result(1, "", "Traceback ...\n", None).to_observation();
        assert!(!untagged.contains("error_type"));
    }

    #[test]
    fn test_execution_result_json_round_trip() {
        let r = result(1, "", "boom", Some(ErrorKind::SyntaxError));
        let json = serde_json::to_string(&r).unwrap();
        assert!(json.contains(r#""error_type":"SYNTAX_ERROR""#));
        let back: ExecutionResult = serde_json::from_str(&json).unwrap();
        assert_eq!(back.exit_code, 1);
        assert_eq!(back.error_type, Some(ErrorKind::SyntaxError));
    }
}
