//! One code action, end to end: static validation, sandboxed execution on a
//! background worker, bounded wait, structured result.
//!
//! The runner never returns an error to its caller; every failure mode is
//! encoded in the [`ExecutionResult`]. Elapsed time comes from a monotonic
//! clock.

use std::path::Path;
use std::sync::mpsc;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::output::OutputBuffer;
use crate::pool::{InterpreterPool, WorkItem};
use crate::timeout::run_with_timeout;
use crate::types::{ErrorKind, ExecutionResult, RunSettings};
use crate::validator::{self, ValidationError};
use crate::vm::{build_interpreter, run_code_in_vm, VmFailure, VmRunResult};

/// How long to wait for a warm pool slot before paying for a fresh
/// interpreter instead.
const POOL_CHECKOUT_TIMEOUT: Duration = Duration::from_secs(30);

/// Execute one code action against a workspace.
///
/// The sequence is: validate imports statically, then run the fragment in a
/// restricted interpreter on a background worker while this thread supervises
/// the wall-clock budget. On expiry the worker is abandoned (see
/// `timeout.rs`) and the partial output captured so far is returned with
/// [`ErrorKind::Timeout`].
pub fn run_code(code: &str, workspace_dir: &Path, settings: RunSettings) -> ExecutionResult {
    let start = Instant::now();

    if let Err(e) = validator::validate_imports(code) {
        let kind = match &e {
            ValidationError::Syntax(_) => ErrorKind::SyntaxError,
            ValidationError::ForbiddenImport { .. } => ErrorKind::PolicyViolation,
        };
        debug!(error = %e, "code action rejected statically");
        return ExecutionResult {
            exit_code: 1,
            stdout: String::new(),
            stderr: e.to_string(),
            elapsed_sec: round_elapsed(start.elapsed().as_secs_f64()),
            error_type: Some(kind),
        };
    }

    let output = OutputBuffer::new(settings.max_output_bytes);
    let (response_tx, response_rx) = mpsc::sync_channel::<VmRunResult>(1);

    let work = WorkItem {
        code: code.to_string(),
        workspace_dir: workspace_dir.to_path_buf(),
        output: output.clone(),
        response: response_tx,
    };

    let vm_result: Option<VmRunResult> =
        if InterpreterPool::global().dispatch_work(work, POOL_CHECKOUT_TIMEOUT) {
            // Warm path: a slot owns the work; supervise the budget from here.
            // A disconnect (slot died) is indistinguishable from a hang for
            // the caller and is reported as a timeout too.
            response_rx.recv_timeout(settings.timeout).ok()
        } else {
            // Every slot is busy or stranded: fall back to a throwaway
            // interpreter on a fresh worker thread.
            debug!("interpreter pool exhausted, falling back to fresh interpreter");
            let code_owned = code.to_string();
            let workspace = workspace_dir.to_path_buf();
            let worker_output = output.clone();
            run_with_timeout(
                move || {
                    let interp = build_interpreter();
                    run_code_in_vm(&interp, &code_owned, &workspace, worker_output)
                },
                settings.timeout,
            )
        };

    let elapsed_sec = round_elapsed(start.elapsed().as_secs_f64());
    let (stdout, mut stderr) = output.into_strings();

    match vm_result {
        Some(VmRunResult { error: None }) => ExecutionResult {
            exit_code: 0,
            stdout,
            stderr,
            elapsed_sec,
            error_type: None,
        },
        Some(VmRunResult {
            error: Some(VmFailure::Syntax { message }),
        }) => {
            stderr.push_str(&message);
            ExecutionResult {
                exit_code: 1,
                stdout,
                stderr,
                elapsed_sec,
                error_type: Some(ErrorKind::SyntaxError),
            }
        }
        Some(VmRunResult {
            error: Some(VmFailure::Exception { traceback }),
        }) => {
            stderr.push_str(&traceback);
            ExecutionResult {
                exit_code: 1,
                stdout,
                stderr,
                elapsed_sec,
                error_type: None,
            }
        }
        None => {
            stderr.push_str(&format!(
                "Execution timed out after {} seconds.\n",
                settings.timeout.as_secs()
            ));
            ExecutionResult {
                exit_code: 1,
                stdout,
                stderr,
                elapsed_sec,
                error_type: Some(ErrorKind::Timeout),
            }
        }
    }
}

fn round_elapsed(seconds: f64) -> f64 {
    (seconds * 1000.0).round() / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    // The static-rejection paths return before any interpreter is built, so
    // these run fast and unconditionally.

    #[test]
    fn test_policy_violation_is_immediate() {
        let dir = tempfile::TempDir::new().unwrap();
        let result = run_code("import socket", dir.path(), RunSettings::default());
        assert_eq!(result.exit_code, 1);
        assert_eq!(result.error_type, Some(ErrorKind::PolicyViolation));
        assert_eq!(result.stdout, "");
        assert!(result.stderr.contains("socket"));
        assert!(result.stderr.contains("not allowed"));
    }

    #[test]
    fn test_syntax_error_is_immediate() {
        let dir = tempfile::TempDir::new().unwrap();
        let result = run_code("def f(:", dir.path(), RunSettings::default());
        assert_eq!(result.exit_code, 1);
        assert_eq!(result.error_type, Some(ErrorKind::SyntaxError));
        assert!(result.stderr.starts_with("SyntaxError:"));
    }

    #[test]
    fn test_elapsed_is_rounded_to_millis() {
        assert_eq!(round_elapsed(1.23456), 1.235);
        assert_eq!(round_elapsed(0.0004), 0.0);
    }
}
