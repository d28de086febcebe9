//! Restricted RustPython interpreter for code actions.
//!
//! This module owns all RustPython API calls. For every execution it:
//! - strips the blocked intrinsics (`eval`, `exec`, `compile`, `input`,
//!   `memoryview`, `breakpoint`) from the builtins module;
//! - replaces `builtins.__import__` with a hook that consults the import
//!   allowlist for names imported by user code (stdlib-internal imports pass
//!   through, keyed off the caller's `__name__`);
//! - replaces `open` with a workspace-scoped wrapper, so the replacement is
//!   the only callable named "open" reachable from the fragment;
//! - replaces `sys.stdout` / `sys.stderr` with writer objects that feed the
//!   shared [`OutputBuffer`];
//! - injects the tool primitives into the execution scope, bound to the
//!   action's workspace.
//!
//! The true `__import__` and `open` are captured once at interpreter build
//! time and held on the Rust side, so reinstalling the hooks on a pooled
//! interpreter can never chain onto a stale hook and nothing reachable from
//! Python retains the raw intrinsics.
//!
//! Hook installation happens inside `enter()` at the start of every run
//! rather than in the `with_init` closure, because `builtins.__import__` only
//! exists after full VM initialization.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use rustpython_vm::{
    builtins::PyBaseExceptionRef, compiler::Mode, function::FuncArgs, scope::Scope, AsObject,
    Interpreter, PyObjectRef, PyResult, TryFromObject, VirtualMachine,
};

use crate::output::OutputBuffer;
use crate::paths::resolve_under;
use crate::policy;
use crate::tools::{Toolbox, ToolError};

/// Builtins removed from the sandbox. Anything that can execute arbitrary
/// code, read stdin, or poke raw memory. `__import__` and `open` are not
/// listed because they are replaced rather than removed.
const BLOCKED_BUILTINS: &[&str] = &["eval", "exec", "compile", "input", "memoryview", "breakpoint"];

/// Deadline handed to `run_command` when the fragment does not pass one.
const RUN_COMMAND_DEADLINE: Duration = Duration::from_secs(300);

// ── Crate-visible types ──────────────────────────────────────────────────────

/// How a VM execution failed, before the runner maps it onto an
/// `ExecutionResult`.
pub(crate) enum VmFailure {
    /// The fragment did not compile.
    Syntax { message: String },
    /// The fragment raised; carries the formatted Python traceback.
    Exception { traceback: String },
}

pub(crate) struct VmRunResult {
    pub error: Option<VmFailure>,
}

/// A built interpreter plus the captured raw intrinsics it needs to reinstall
/// its hooks on every run. Not `Send`: it lives and dies on one thread.
pub(crate) struct PyInterp {
    inner: Interpreter,
    original_import: Option<PyObjectRef>,
    original_open: Option<PyObjectRef>,
}

impl PyInterp {
    /// Execute a closure with access to the VirtualMachine. Used by the pool
    /// for `sys.modules` baseline capture and reset.
    pub(crate) fn with_vm<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&VirtualMachine) -> R,
    {
        self.inner.enter(f)
    }
}

// ── Interpreter construction ─────────────────────────────────────────────────

/// Candidate locations of a host Python standard library.
///
/// The freeze-stdlib feature embeds only the VM's core modules; pure-Python
/// stdlib packages (json, collections, textwrap, ...) come from a host
/// installation on the path list. Native modules registered from
/// `rustpython_stdlib` shadow any compiled extensions found there.
fn python_stdlib_paths() -> Vec<String> {
    let candidates = [
        "/usr/local/lib/python3.13",
        "/usr/local/lib/python3.12",
        "/usr/local/lib/python3.11",
        "/usr/local/lib/python3.10",
        "/usr/lib/python3",
        "/usr/lib/python3.13",
        "/usr/lib/python3.12",
        "/usr/lib/python3.11",
        "/usr/lib/python3.10",
    ];
    candidates
        .iter()
        .filter(|p| Path::new(p).is_dir())
        .map(|p| p.to_string())
        .collect()
}

/// Build a fresh interpreter with the stdlib registered and the raw
/// `__import__` / `open` intrinsics captured for later hook installation.
pub(crate) fn build_interpreter() -> PyInterp {
    let mut settings = rustpython_vm::Settings::default();
    for path in python_stdlib_paths() {
        settings.path_list.push(path);
    }

    let inner = Interpreter::with_init(settings, |vm| {
        vm.add_native_modules(rustpython_stdlib::get_module_inits());
    });

    let (original_import, original_open) = inner.enter(|vm| {
        (
            vm.builtins.get_attr("__import__", vm).ok(),
            vm.builtins.get_attr("open", vm).ok(),
        )
    });

    PyInterp {
        inner,
        original_import,
        original_open,
    }
}

// ── Execution ────────────────────────────────────────────────────────────────

/// Compile and run one fragment inside the restricted environment.
///
/// The fragment's stdout/stderr land in `output`; structured failure comes
/// back in the [`VmRunResult`].
pub(crate) fn run_code_in_vm(
    interp: &PyInterp,
    code: &str,
    workspace_dir: &Path,
    output: OutputBuffer,
) -> VmRunResult {
    let toolbox = match Toolbox::bind(workspace_dir) {
        Ok(toolbox) => Arc::new(toolbox),
        Err(e) => {
            return VmRunResult {
                error: Some(VmFailure::Exception {
                    traceback: format!("RuntimeError: workspace is unavailable: {e}\n"),
                }),
            }
        }
    };

    interp.inner.enter(|vm| {
        install_restrictions(vm);
        install_import_hook(vm, interp.original_import.clone());
        install_scoped_open(vm, interp.original_open.clone(), toolbox.root().to_path_buf());
        install_output_capture(vm, output);

        let code_obj = match vm.compile(code, Mode::Exec, "<code_action>".to_owned()) {
            Ok(code_obj) => code_obj,
            Err(e) => {
                return VmRunResult {
                    error: Some(VmFailure::Syntax {
                        message: e.to_string(),
                    }),
                }
            }
        };

        // User code runs as __main__; the import hook keys off this name to
        // tell fragment imports apart from stdlib-internal ones.
        let scope = vm.new_scope_with_builtins();
        let _ = scope
            .globals
            .set_item("__name__", vm.ctx.new_str("__main__").into(), vm);
        install_tools(vm, &scope, Arc::clone(&toolbox));

        match vm.run_code_obj(code_obj, scope) {
            Ok(_) => VmRunResult { error: None },
            Err(exc) => VmRunResult {
                error: Some(VmFailure::Exception {
                    traceback: format_exception(vm, exc),
                }),
            },
        }
    })
}

// ── Environment restriction ──────────────────────────────────────────────────

/// Delete the blocked intrinsics from the builtins module. Idempotent:
/// repeated deletion of an absent name is ignored.
fn install_restrictions(vm: &VirtualMachine) {
    for name in BLOCKED_BUILTINS {
        let _ = vm.call_method(
            vm.builtins.as_object(),
            "__delattr__",
            (vm.ctx.new_str(*name),),
        );
    }
}

/// Returns `true` when an `__import__` call originates from user code.
///
/// User fragments execute with `__name__ == "__main__"`; stdlib and frozen
/// modules carry their own module name, and their internal imports must not
/// be policed or the allowlisted packages could not load their own
/// dependencies.
fn is_user_code_import(args: &FuncArgs, vm: &VirtualMachine) -> bool {
    let Some(globals) = args.args.get(1) else {
        return true;
    };
    if vm.is_none(globals) {
        return true;
    }
    let Ok(name_val) = vm.call_method(globals, "get", (vm.ctx.new_str("__name__"),)) else {
        return true;
    };
    if vm.is_none(&name_val) {
        return true;
    }
    match name_val.str(vm) {
        Ok(name) => name.as_str() == "__main__",
        Err(_) => true,
    }
}

/// Replace `builtins.__import__` with the allowlist-enforcing hook.
///
/// Absolute imports from user code are checked on their root package;
/// relative imports (level > 0) are delegated untouched because a fragment
/// has no parent package and the real machinery rejects them with a clearer
/// error.
fn install_import_hook(vm: &VirtualMachine, original_import: Option<PyObjectRef>) {
    let hook = vm.new_function(
        "__import__",
        move |args: FuncArgs, vm: &VirtualMachine| -> PyResult<PyObjectRef> {
            let module_name: String = args
                .args
                .first()
                .and_then(|o| o.str(vm).ok())
                .map(|s| s.as_str().to_owned())
                .unwrap_or_default();

            let level: i64 = args
                .args
                .get(4)
                .and_then(|o| i64::try_from_object(vm, o.clone()).ok())
                .unwrap_or(0);

            if level == 0
                && is_user_code_import(&args, vm)
                && !policy::import_allowed(&module_name)
            {
                return Err(vm.new_exception_msg(
                    vm.ctx.exceptions.import_error.to_owned(),
                    format!(
                        "Import not allowed: '{module_name}'. Use only the provided tool functions and allowlisted modules."
                    ),
                ));
            }

            match &original_import {
                Some(original) => original.call(args, vm),
                None => Err(vm.new_exception_msg(
                    vm.ctx.exceptions.import_error.to_owned(),
                    "import machinery is unavailable in this sandbox".to_owned(),
                )),
            }
        },
    );
    let _ = vm.builtins.set_attr("__import__", hook, vm);
}

/// Replace `open` with a wrapper that refuses any path resolving outside the
/// workspace before delegating to the captured original.
fn install_scoped_open(vm: &VirtualMachine, original_open: Option<PyObjectRef>, workspace: PathBuf) {
    let hook = vm.new_function(
        "open",
        move |args: FuncArgs, vm: &VirtualMachine| -> PyResult<PyObjectRef> {
            let path: String = args
                .args
                .first()
                .and_then(|o| o.str(vm).ok())
                .map(|s| s.as_str().to_owned())
                .unwrap_or_default();

            if resolve_under(&workspace, Path::new(&path)).is_none() {
                return Err(vm.new_exception_msg(
                    vm.ctx.exceptions.permission_error.to_owned(),
                    format!(
                        "open() path '{path}' is outside the workspace. Use read_file() / write_file() for workspace files."
                    ),
                ));
            }

            match &original_open {
                Some(original) => original.call(args, vm),
                None => Err(vm.new_exception_msg(
                    vm.ctx.exceptions.os_error.to_owned(),
                    "file I/O is unavailable in this sandbox".to_owned(),
                )),
            }
        },
    );
    let _ = vm.builtins.set_attr("open", hook, vm);
}

// ── Output capture ───────────────────────────────────────────────────────────

/// Point `sys.stdout` / `sys.stderr` at the shared output buffer.
fn install_output_capture(vm: &VirtualMachine, output: OutputBuffer) {
    let stdout_obj = build_writer_object(vm, output.clone(), true);
    let stderr_obj = build_writer_object(vm, output, false);
    let _ = vm.sys_module.set_attr("stdout", stdout_obj, vm);
    let _ = vm.sys_module.set_attr("stderr", stderr_obj, vm);
}

/// A minimal writer namespace: `write(s)` feeds the buffer, `flush()` is a
/// no-op, plus the `closed` / `encoding` attributes some stdlib code probes.
fn build_writer_object(vm: &VirtualMachine, output: OutputBuffer, is_stdout: bool) -> PyObjectRef {
    let write_fn = vm.new_function(
        "write",
        move |args: FuncArgs, vm: &VirtualMachine| -> PyResult<PyObjectRef> {
            let data: String = args
                .args
                .first()
                .and_then(|o| o.str(vm).ok())
                .map(|s| s.as_str().to_owned())
                .unwrap_or_default();

            let write_result = if is_stdout {
                output.write_stdout(data.as_bytes())
            } else {
                output.write_stderr(data.as_bytes())
            };

            match write_result {
                Ok(()) => Ok(vm.ctx.new_int(data.len()).into()),
                Err(limit) => Err(vm.new_exception_msg(
                    vm.ctx.exceptions.runtime_error.to_owned(),
                    format!("Output limit exceeded: {} bytes", limit.limit_bytes),
                )),
            }
        },
    );

    let flush_fn = vm.new_function(
        "flush",
        move |_args: FuncArgs, vm: &VirtualMachine| -> PyResult<PyObjectRef> {
            Ok(vm.ctx.none())
        },
    );

    let ns = vm.new_module("<writer>", vm.ctx.new_dict(), None);
    let _ = ns.set_attr("write", write_fn, vm);
    let _ = ns.set_attr("flush", flush_fn, vm);
    let _ = ns.set_attr("closed", vm.ctx.new_bool(false), vm);
    let _ = ns.set_attr("encoding", vm.ctx.new_str("utf-8"), vm);
    ns.into()
}

// ── Tool primitive bindings ──────────────────────────────────────────────────

/// Inject every tool primitive into the execution scope, bound to this
/// action's toolbox. The bindings live in the scope globals, not in builtins,
/// so they vanish with the scope when the action completes.
fn install_tools(vm: &VirtualMachine, scope: &Scope, toolbox: Arc<Toolbox>) {
    let tools: Vec<(&str, PyObjectRef)> = vec![
        ("read_file", make_read_file(vm, Arc::clone(&toolbox))),
        ("write_file", make_write_file(vm, Arc::clone(&toolbox))),
        ("list_files", make_list_files(vm, Arc::clone(&toolbox))),
        ("search_code", make_search_code(vm, Arc::clone(&toolbox))),
        ("git_status", make_git_status(vm, Arc::clone(&toolbox))),
        ("git_diff", make_git_diff(vm, Arc::clone(&toolbox))),
        ("apply_patch", make_apply_patch(vm, Arc::clone(&toolbox))),
        ("git_reset", make_git_reset(vm, Arc::clone(&toolbox))),
        ("run_command", make_run_command(vm, toolbox)),
    ];
    for (name, obj) in tools {
        let _ = scope.globals.set_item(name, obj, vm);
    }
}

/// Fetch a string argument by position, falling back to a keyword.
fn arg_str(args: &FuncArgs, idx: usize, name: &str, vm: &VirtualMachine) -> PyResult<Option<String>> {
    let obj = args
        .args
        .get(idx)
        .cloned()
        .or_else(|| args.kwargs.get(name).cloned());
    match obj {
        None => Ok(None),
        Some(obj) => obj.str(vm).map(|s| Some(s.as_str().to_owned())),
    }
}

/// Like [`arg_str`] but required; raises `TypeError` when absent.
fn required_arg_str(args: &FuncArgs, idx: usize, name: &str, vm: &VirtualMachine) -> PyResult<String> {
    arg_str(args, idx, name, vm)?.ok_or_else(|| {
        vm.new_exception_msg(
            vm.ctx.exceptions.type_error.to_owned(),
            format!("missing required argument: '{name}'"),
        )
    })
}

/// Map a [`ToolError`] onto the Python exception the fragment should see.
fn tool_error_to_py(vm: &VirtualMachine, err: ToolError) -> PyBaseExceptionRef {
    let message = err.to_string();
    let exc_type = match err {
        ToolError::Traversal { .. } | ToolError::CommandNotAllowed { .. } => {
            vm.ctx.exceptions.permission_error.to_owned()
        }
        ToolError::EmptyCommand | ToolError::Decode { .. } | ToolError::BadPattern { .. } => {
            vm.ctx.exceptions.value_error.to_owned()
        }
        ToolError::Io(_) => vm.ctx.exceptions.os_error.to_owned(),
        ToolError::Proc(_) | ToolError::CommandFailed { .. } => {
            vm.ctx.exceptions.runtime_error.to_owned()
        }
    };
    vm.new_exception_msg(exc_type, message)
}

/// Build the `{exit_code, stdout, stderr}` dict shape shared by
/// `apply_patch` and `run_command`.
fn cmd_output_dict(
    vm: &VirtualMachine,
    out: &crate::proc::CmdOutput,
    with_success: bool,
) -> PyResult<PyObjectRef> {
    let dict = vm.ctx.new_dict();
    dict.set_item("exit_code", vm.ctx.new_int(out.exit_code).into(), vm)?;
    dict.set_item("stdout", vm.ctx.new_str(out.stdout.as_str()).into(), vm)?;
    dict.set_item("stderr", vm.ctx.new_str(out.stderr.as_str()).into(), vm)?;
    if with_success {
        dict.set_item("success", vm.ctx.new_bool(out.success()).into(), vm)?;
    }
    Ok(dict.into())
}

fn make_read_file(vm: &VirtualMachine, toolbox: Arc<Toolbox>) -> PyObjectRef {
    vm.new_function(
        "read_file",
        move |args: FuncArgs, vm: &VirtualMachine| -> PyResult<PyObjectRef> {
            let path = required_arg_str(&args, 0, "path", vm)?;
            match toolbox.read_file(&path) {
                Ok(contents) => Ok(vm.ctx.new_str(contents).into()),
                Err(e) => Err(tool_error_to_py(vm, e)),
            }
        },
    )
    .into()
}

fn make_write_file(vm: &VirtualMachine, toolbox: Arc<Toolbox>) -> PyObjectRef {
    vm.new_function(
        "write_file",
        move |args: FuncArgs, vm: &VirtualMachine| -> PyResult<PyObjectRef> {
            let path = required_arg_str(&args, 0, "path", vm)?;
            let content = required_arg_str(&args, 1, "content", vm)?;
            match toolbox.write_file(&path, &content) {
                Ok(()) => Ok(vm.ctx.none()),
                Err(e) => Err(tool_error_to_py(vm, e)),
            }
        },
    )
    .into()
}

fn make_list_files(vm: &VirtualMachine, toolbox: Arc<Toolbox>) -> PyObjectRef {
    vm.new_function(
        "list_files",
        move |args: FuncArgs, vm: &VirtualMachine| -> PyResult<PyObjectRef> {
            let base = arg_str(&args, 0, "path", vm)?.unwrap_or_else(|| ".".to_string());
            let pattern = arg_str(&args, 1, "pattern", vm)?.unwrap_or_else(|| "**/*".to_string());
            match toolbox.list_files(&base, &pattern) {
                Ok(files) => {
                    let items: Vec<PyObjectRef> =
                        files.into_iter().map(|f| vm.ctx.new_str(f).into()).collect();
                    Ok(vm.ctx.new_list(items).into())
                }
                Err(e) => Err(tool_error_to_py(vm, e)),
            }
        },
    )
    .into()
}

fn make_search_code(vm: &VirtualMachine, toolbox: Arc<Toolbox>) -> PyObjectRef {
    vm.new_function(
        "search_code",
        move |args: FuncArgs, vm: &VirtualMachine| -> PyResult<PyObjectRef> {
            let pattern = required_arg_str(&args, 0, "pattern", vm)?;
            let base = arg_str(&args, 1, "path", vm)?.unwrap_or_else(|| ".".to_string());
            match toolbox.search_code(&pattern, &base) {
                Ok(matches) => {
                    let mut items: Vec<PyObjectRef> = Vec::with_capacity(matches.len());
                    for m in matches {
                        let dict = vm.ctx.new_dict();
                        dict.set_item("file", vm.ctx.new_str(m.file).into(), vm)?;
                        dict.set_item("line", vm.ctx.new_int(m.line).into(), vm)?;
                        dict.set_item("text", vm.ctx.new_str(m.text).into(), vm)?;
                        items.push(dict.into());
                    }
                    Ok(vm.ctx.new_list(items).into())
                }
                Err(e) => Err(tool_error_to_py(vm, e)),
            }
        },
    )
    .into()
}

fn make_git_status(vm: &VirtualMachine, toolbox: Arc<Toolbox>) -> PyObjectRef {
    vm.new_function(
        "git_status",
        move |_args: FuncArgs, vm: &VirtualMachine| -> PyResult<PyObjectRef> {
            match toolbox.git_status() {
                Ok(text) => Ok(vm.ctx.new_str(text).into()),
                Err(e) => Err(tool_error_to_py(vm, e)),
            }
        },
    )
    .into()
}

fn make_git_diff(vm: &VirtualMachine, toolbox: Arc<Toolbox>) -> PyObjectRef {
    vm.new_function(
        "git_diff",
        move |args: FuncArgs, vm: &VirtualMachine| -> PyResult<PyObjectRef> {
            let base = arg_str(&args, 0, "base", vm)?.unwrap_or_else(|| "HEAD".to_string());
            match toolbox.git_diff(&base) {
                Ok(text) => Ok(vm.ctx.new_str(text).into()),
                Err(e) => Err(tool_error_to_py(vm, e)),
            }
        },
    )
    .into()
}

fn make_apply_patch(vm: &VirtualMachine, toolbox: Arc<Toolbox>) -> PyObjectRef {
    vm.new_function(
        "apply_patch",
        move |args: FuncArgs, vm: &VirtualMachine| -> PyResult<PyObjectRef> {
            let diff = required_arg_str(&args, 0, "diff", vm)?;
            match toolbox.apply_patch(&diff) {
                Ok(out) => cmd_output_dict(vm, &out, true),
                Err(e) => Err(tool_error_to_py(vm, e)),
            }
        },
    )
    .into()
}

fn make_git_reset(vm: &VirtualMachine, toolbox: Arc<Toolbox>) -> PyObjectRef {
    vm.new_function(
        "git_reset",
        move |args: FuncArgs, vm: &VirtualMachine| -> PyResult<PyObjectRef> {
            let to_ref = arg_str(&args, 0, "to_ref", vm)?.unwrap_or_else(|| "HEAD".to_string());
            match toolbox.git_reset(&to_ref) {
                Ok(()) => Ok(vm.ctx.none()),
                Err(e) => Err(tool_error_to_py(vm, e)),
            }
        },
    )
    .into()
}

fn make_run_command(vm: &VirtualMachine, toolbox: Arc<Toolbox>) -> PyObjectRef {
    vm.new_function(
        "run_command",
        move |args: FuncArgs, vm: &VirtualMachine| -> PyResult<PyObjectRef> {
            let argv: Vec<String> = match args.args.first() {
                Some(obj) => vm.extract_elements_with(obj, |o| String::try_from_object(vm, o))?,
                None => Vec::new(),
            };
            let timeout = args
                .args
                .get(1)
                .cloned()
                .or_else(|| args.kwargs.get("timeout").cloned())
                .and_then(|o| u64::try_from_object(vm, o).ok())
                .map(Duration::from_secs)
                .unwrap_or(RUN_COMMAND_DEADLINE);
            match toolbox.run_command(&argv, timeout) {
                Ok(out) => cmd_output_dict(vm, &out, false),
                Err(e) => Err(tool_error_to_py(vm, e)),
            }
        },
    )
    .into()
}

// ── Failure extraction ───────────────────────────────────────────────────────

/// Format a raised exception as a full Python traceback string. This is what
/// the agent reads to self-correct on its next turn.
fn format_exception(vm: &VirtualMachine, exc: PyBaseExceptionRef) -> String {
    let mut traceback = String::new();
    if vm.write_exception(&mut traceback, &exc).is_err() {
        traceback = exc
            .as_object()
            .str(vm)
            .map(|s| s.as_str().to_owned())
            .unwrap_or_else(|_| "unknown runtime error".to_owned());
        traceback.push('\n');
    }
    traceback
}

// ── Tests ────────────────────────────────────────────────────────────────────
