//! Subprocess execution with a hard deadline.
//!
//! Unlike the in-VM worker (which is abandoned on timeout), external
//! processes can be killed safely, so tool subprocesses and git operations
//! get real termination: spawn with piped streams, drain the pipes on helper
//! threads, bounded wait, kill on expiry.

use std::io::Read;
use std::path::Path;
use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;

use thiserror::Error;
use wait_timeout::ChildExt;

#[derive(Debug, Error)]
pub enum ProcError {
    /// The binary could not be spawned at all (missing, not executable).
    #[error("failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// The process outlived its deadline and was killed.
    #[error("'{command}' timed out after {} seconds", .deadline.as_secs())]
    TimedOut { command: String, deadline: Duration },

    #[error("I/O error while running '{command}': {source}")]
    Io {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

impl ProcError {
    /// True when the failure was "no such binary on PATH".
    pub fn is_missing_binary(&self) -> bool {
        matches!(
            self,
            ProcError::Spawn { source, .. } if source.kind() == std::io::ErrorKind::NotFound
        )
    }
}

/// Captured outcome of a finished subprocess.
#[derive(Debug, Clone)]
pub struct CmdOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CmdOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Run `argv` in `cwd`, kill it if it exceeds `deadline`, return the captured
/// streams. stdin is closed so nothing can block on interactive reads.
pub fn run_with_deadline(argv: &[String], cwd: &Path, deadline: Duration) -> Result<CmdOutput, ProcError> {
    let Some(command) = argv.first().cloned() else {
        return Err(ProcError::Spawn {
            command: String::new(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty argv"),
        });
    };

    let mut child = Command::new(&argv[0])
        .args(&argv[1..])
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|source| ProcError::Spawn {
            command: command.clone(),
            source,
        })?;

    // Drain both pipes off-thread so a chatty child cannot fill a pipe and
    // deadlock against our bounded wait.
    let stdout_reader = child.stdout.take().map(spawn_drain);
    let stderr_reader = child.stderr.take().map(spawn_drain);

    let status = child
        .wait_timeout(deadline)
        .map_err(|source| ProcError::Io {
            command: command.clone(),
            source,
        })?;

    let status = match status {
        Some(status) => status,
        None => {
            let _ = child.kill();
            let _ = child.wait();
            return Err(ProcError::TimedOut { command, deadline });
        }
    };

    let stdout = stdout_reader.map(join_drain).unwrap_or_default();
    let stderr = stderr_reader.map(join_drain).unwrap_or_default();

    Ok(CmdOutput {
        exit_code: status.code().unwrap_or(-1),
        stdout,
        stderr,
    })
}

fn spawn_drain<R: Read + Send + 'static>(mut pipe: R) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        buf
    })
}

fn join_drain(handle: thread::JoinHandle<Vec<u8>>) -> String {
    let bytes = handle.join().unwrap_or_default();
    String::from_utf8_lossy(&bytes).into_owned()
}
