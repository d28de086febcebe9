//! Pre-warmed interpreter pool.
//!
//! Building a RustPython interpreter is the expensive part of a code action,
//! so the service keeps a fixed set of warmed interpreters, one per dedicated
//! OS thread. An interpreter never crosses a thread boundary (it is not
//! `Send`); only the work channel's `Sender` does.
//!
//! A slot thread blocks on its work channel, executes one action at a time,
//! resets `sys.modules` back to the post-init baseline, and re-queues itself.
//! When the supervising caller gives up on a timed-out action, the slot is
//! still executing it; the eventual `send` of the result fails harmlessly and
//! the slot strands until the fragment ends on its own. Dispatch falls back
//! to a fresh throwaway interpreter when no slot frees up in time, so a few
//! stranded slots degrade capacity without blocking new work.

use std::collections::HashSet;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::time::Duration;

use crate::output::OutputBuffer;
use crate::vm::{build_interpreter, run_code_in_vm, PyInterp, VmRunResult};

/// A unit of work sent to a slot thread. Every field is `Send`.
pub(crate) struct WorkItem {
    /// The fragment source.
    pub code: String,
    /// Workspace the action's tools and scoped open are bound to.
    pub workspace_dir: PathBuf,
    /// Shared stream capture; the dispatching thread keeps its own clone.
    pub output: OutputBuffer,
    /// One-shot channel carrying the result back.
    pub response: std::sync::mpsc::SyncSender<VmRunResult>,
}

fn start_slot_thread(
    slot_id: usize,
    available: Arc<(Mutex<VecDeque<std::sync::mpsc::SyncSender<WorkItem>>>, Condvar)>,
) {
    // Capacity 1: a slot holds at most one in-flight action.
    let (tx, rx) = std::sync::mpsc::sync_channel::<WorkItem>(1);

    std::thread::Builder::new()
        .name(format!("code-action-slot-{slot_id}"))
        .spawn(move || {
            let interp = build_interpreter();
            let baseline_modules = capture_baseline_modules(&interp);

            {
                let (lock, cvar) = &*available;
                let mut queue = lock.lock().expect("pool slot queue poisoned");
                queue.push_back(tx.clone());
                cvar.notify_one();
            }

            loop {
                let item = match rx.recv() {
                    Ok(item) => item,
                    Err(_) => break,
                };

                let result = run_code_in_vm(&interp, &item.code, &item.workspace_dir, item.output);

                reset_sys_modules(&interp, &baseline_modules);

                // A failed send means the caller timed out and moved on.
                let _ = item.response.send(result);

                let (lock, cvar) = &*available;
                let mut queue = lock.lock().expect("pool slot queue poisoned");
                queue.push_back(tx.clone());
                cvar.notify_one();
            }
        })
        .expect("failed to spawn interpreter slot thread");
}

// ── sys.modules baseline capture and reset ──────────────────────────────────

/// Record the module names present right after interpreter init, before any
/// user code has run.
fn capture_baseline_modules(interp: &PyInterp) -> HashSet<String> {
    interp.with_vm(|vm| {
        let mut baseline = HashSet::new();
        let Ok(sys_modules) = vm.sys_module.get_attr("modules", vm) else {
            return baseline;
        };
        let Ok(keys) = vm.call_method(&sys_modules, "keys", ()) else {
            return baseline;
        };
        let Ok(iter) = vm.call_method(&keys, "__iter__", ()) else {
            return baseline;
        };
        while let Ok(key) = vm.call_method(&iter, "__next__", ()) {
            if let Ok(s) = key.str(vm) {
                baseline.insert(s.as_str().to_owned());
            }
        }
        baseline
    })
}

/// Drop every `sys.modules` entry that user code pulled in, so state from one
/// action cannot leak into the next on a reused slot.
fn reset_sys_modules(interp: &PyInterp, baseline: &HashSet<String>) {
    interp.with_vm(|vm| {
        let Ok(sys_modules) = vm.sys_module.get_attr("modules", vm) else {
            return;
        };
        let Ok(keys) = vm.call_method(&sys_modules, "keys", ()) else {
            return;
        };
        let Ok(iter) = vm.call_method(&keys, "__iter__", ()) else {
            return;
        };
        let mut to_remove: Vec<String> = Vec::new();
        while let Ok(key) = vm.call_method(&iter, "__next__", ()) {
            if let Ok(s) = key.str(vm) {
                let name = s.as_str().to_owned();
                if !baseline.contains(&name) {
                    to_remove.push(name);
                }
            }
        }
        for name in to_remove {
            let _ = vm.call_method(&sys_modules, "__delitem__", (vm.ctx.new_str(name),));
        }
    });
}

// ── InterpreterPool ──────────────────────────────────────────────────────────

/// Fixed-size pool of warmed interpreter slot threads.
pub(crate) struct InterpreterPool {
    available: Arc<(Mutex<VecDeque<std::sync::mpsc::SyncSender<WorkItem>>>, Condvar)>,
    target_size: usize,
}

impl InterpreterPool {
    /// Create and warm `size` slots (minimum 1). Blocks until every slot has
    /// built its interpreter and reported in.
    pub(crate) fn new(size: usize) -> Self {
        let target_size = size.max(1);
        let available = Arc::new((
            Mutex::new(VecDeque::with_capacity(target_size)),
            Condvar::new(),
        ));

        for slot_id in 0..target_size {
            start_slot_thread(slot_id, Arc::clone(&available));
        }

        {
            let (lock, cvar) = &*available;
            let mut queue = lock.lock().expect("pool queue poisoned");
            while queue.len() < target_size {
                queue = cvar.wait(queue).expect("pool condvar poisoned");
            }
        }

        InterpreterPool {
            available,
            target_size,
        }
    }

    /// The process-global pool. Size comes from `AGENT_EXEC_POOL_SIZE`, read
    /// once at first use (default 4).
    pub(crate) fn global() -> &'static InterpreterPool {
        static INSTANCE: OnceLock<InterpreterPool> = OnceLock::new();
        INSTANCE.get_or_init(|| {
            let size: usize = std::env::var("AGENT_EXEC_POOL_SIZE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(4);
            InterpreterPool::new(size)
        })
    }

    /// Hand a work item to an idle slot, waiting up to `checkout_timeout` for
    /// one to free up. Returns `false` (work item untouched by any slot) when
    /// none did; the caller falls back to a fresh interpreter.
    pub(crate) fn dispatch_work(&self, work: WorkItem, checkout_timeout: Duration) -> bool {
        let (lock, cvar) = &*self.available;
        let deadline = std::time::Instant::now() + checkout_timeout;

        let slot_tx = loop {
            let mut queue = lock.lock().expect("pool queue poisoned");
            if let Some(tx) = queue.pop_front() {
                break tx;
            }
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            if remaining.is_zero() {
                return false;
            }
            let (guard, _timeout) = cvar
                .wait_timeout(queue, remaining)
                .expect("pool condvar poisoned");
            drop(guard);
        };

        let _ = slot_tx.send(work);
        true
    }

    /// Number of slots currently idle.
    pub(crate) fn idle_count(&self) -> usize {
        let (lock, _) = &*self.available;
        lock.lock().expect("pool queue poisoned").len()
    }

    /// Configured slot count.
    #[allow(dead_code)]
    pub(crate) fn size(&self) -> usize {
        self.target_size
    }
}
