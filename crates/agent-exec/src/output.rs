//! Thread-safe capture buffer for a fragment's stdout and stderr.
//!
//! One buffer is created per code action and shared between the supervising
//! runner thread and the VM worker via `Arc<Mutex<_>>`. Because the worker is
//! abandoned on timeout (never joined), the runner reads its copy of the data
//! with [`OutputBuffer::into_strings`], which falls back to lock-and-clone
//! when the worker still holds a handle.

use std::sync::{Arc, Mutex};

/// Error returned when a write would push the combined streams over the cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputLimitExceeded {
    pub limit_bytes: usize,
}

struct Streams {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    max_bytes: usize,
}

impl Streams {
    fn remaining(&self) -> usize {
        self.max_bytes.saturating_sub(self.stdout.len() + self.stderr.len())
    }
}

/// Shared stdout/stderr accumulator with a combined byte cap.
///
/// Cheap to clone; all clones share the same data.
#[derive(Clone)]
pub struct OutputBuffer {
    inner: Arc<Mutex<Streams>>,
}

impl OutputBuffer {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Streams {
                stdout: Vec::new(),
                stderr: Vec::new(),
                max_bytes,
            })),
        }
    }

    /// Append to the stdout stream. Rejects the whole write when it would
    /// exceed the cap, leaving the buffer unchanged.
    pub fn write_stdout(&self, data: &[u8]) -> Result<(), OutputLimitExceeded> {
        let mut streams = self.inner.lock().expect("output buffer mutex poisoned");
        if data.len() > streams.remaining() {
            return Err(OutputLimitExceeded {
                limit_bytes: streams.max_bytes,
            });
        }
        streams.stdout.extend_from_slice(data);
        Ok(())
    }

    /// Append to the stderr stream. Same cap semantics as stdout.
    pub fn write_stderr(&self, data: &[u8]) -> Result<(), OutputLimitExceeded> {
        let mut streams = self.inner.lock().expect("output buffer mutex poisoned");
        if data.len() > streams.remaining() {
            return Err(OutputLimitExceeded {
                limit_bytes: streams.max_bytes,
            });
        }
        streams.stderr.extend_from_slice(data);
        Ok(())
    }

    /// Consume this handle and return `(stdout, stderr)` as UTF-8 strings,
    /// replacing invalid sequences.
    ///
    /// When an abandoned worker still holds a clone, the data is cloned out
    /// under the lock instead of unwrapped, so partial output survives a
    /// timeout.
    pub fn into_strings(self) -> (String, String) {
        match Arc::try_unwrap(self.inner) {
            Ok(mutex) => {
                let streams = mutex.into_inner().expect("output buffer mutex poisoned");
                (
                    String::from_utf8_lossy(&streams.stdout).into_owned(),
                    String::from_utf8_lossy(&streams.stderr).into_owned(),
                )
            }
            Err(arc) => {
                let streams = arc.lock().expect("output buffer mutex poisoned");
                (
                    String::from_utf8_lossy(&streams.stdout).into_owned(),
                    String::from_utf8_lossy(&streams.stderr).into_owned(),
                )
            }
        }
    }
}
