//! Tool primitives bound to a single workspace root.
//!
//! A [`Toolbox`] is the only legitimate route from a code fragment to the
//! world outside the interpreter: file I/O scoped to the workspace, code
//! search, repository introspection, patch application, and allowlisted
//! command execution. One toolbox is bound per code action and dropped when
//! the action completes.
//!
//! All methods are plain Rust and independently testable; `vm.rs` wraps them
//! as Python callables and maps [`ToolError`] onto Python exception types.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tracing::warn;

use crate::paths::resolve_under;
use crate::policy;
use crate::proc::{run_with_deadline, CmdOutput, ProcError};

/// Deadline for quick repository introspection (status, diff, reset).
const GIT_DEADLINE: Duration = Duration::from_secs(15);
/// Deadline for code search and patch application.
const PATCH_DEADLINE: Duration = Duration::from_secs(30);
const SEARCH_DEADLINE: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("path '{path}' resolves outside the workspace; path traversal is not allowed")]
    Traversal { path: String },

    #[error("Command not allowed: '{command}'. Only the allowlisted build and VCS tools may run.")]
    CommandNotAllowed { command: String },

    #[error("command list cannot be empty")]
    EmptyCommand,

    #[error("file '{path}' is not valid UTF-8")]
    Decode { path: String },

    #[error("invalid glob pattern '{pattern}': {source}")]
    BadPattern {
        pattern: String,
        #[source]
        source: glob::PatternError,
    },

    #[error("'{command}' exited with status {code}: {stderr}")]
    CommandFailed {
        command: String,
        code: i32,
        stderr: String,
    },

    #[error(transparent)]
    Proc(#[from] ProcError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// One `(file, line, text)` record from `search_code`.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SearchMatch {
    pub file: String,
    pub line: u64,
    pub text: String,
}

/// The tool primitives for one workspace, rooted at a canonical directory.
pub struct Toolbox {
    root: PathBuf,
}

impl Toolbox {
    /// Bind to `workspace_dir`, canonicalizing it once. Every subsequent path
    /// argument is resolved against this root and prefix-checked.
    pub fn bind(workspace_dir: &Path) -> Result<Self, ToolError> {
        Ok(Self {
            root: workspace_dir.canonicalize()?,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a caller-supplied path inside the workspace or fail with a
    /// traversal error before any I/O happens.
    pub fn resolve(&self, path: &str) -> Result<PathBuf, ToolError> {
        resolve_under(&self.root, Path::new(path)).ok_or_else(|| ToolError::Traversal {
            path: path.to_string(),
        })
    }

    /// Read a UTF-8 text file, path relative to the workspace root.
    pub fn read_file(&self, path: &str) -> Result<String, ToolError> {
        let target = self.resolve(path)?;
        let bytes = fs::read(&target)?;
        String::from_utf8(bytes).map_err(|_| ToolError::Decode {
            path: path.to_string(),
        })
    }

    /// Write text to a workspace file, creating parent directories and
    /// replacing any existing content.
    pub fn write_file(&self, path: &str, content: &str) -> Result<(), ToolError> {
        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&target, content)?;
        Ok(())
    }

    /// List regular files under `base` matching `pattern`, as paths relative
    /// to the workspace root, sorted.
    ///
    /// Pattern semantics follow per-segment globbing: `*` does not cross
    /// directory separators, `**` does.
    pub fn list_files(&self, base: &str, pattern: &str) -> Result<Vec<String>, ToolError> {
        let base_dir = self.resolve(base)?;
        let matcher = glob::Pattern::new(pattern).map_err(|source| ToolError::BadPattern {
            pattern: pattern.to_string(),
            source,
        })?;
        let options = glob::MatchOptions {
            require_literal_separator: true,
            ..glob::MatchOptions::new()
        };

        let mut files = Vec::new();
        for entry in walkdir::WalkDir::new(&base_dir).into_iter().filter_map(Result::ok) {
            if !entry.file_type().is_file() {
                continue;
            }
            let rel_to_base = match entry.path().strip_prefix(&base_dir) {
                Ok(rel) => rel,
                Err(_) => continue,
            };
            if matcher.matches_path_with(rel_to_base, options) {
                if let Ok(rel_to_root) = entry.path().strip_prefix(&self.root) {
                    files.push(rel_to_root.to_string_lossy().into_owned());
                }
            }
        }
        files.sort();
        Ok(files)
    }

    /// Search the workspace with ripgrep. Returns an empty list when the
    /// binary is not installed, with a warning in the service log.
    pub fn search_code(&self, pattern: &str, base: &str) -> Result<Vec<SearchMatch>, ToolError> {
        let base_dir = self.resolve(base)?;
        let argv = vec![
            "rg".to_string(),
            "--json".to_string(),
            pattern.to_string(),
            base_dir.to_string_lossy().into_owned(),
        ];
        let out = match run_with_deadline(&argv, &self.root, SEARCH_DEADLINE) {
            Ok(out) => out,
            Err(e) if e.is_missing_binary() => {
                warn!("rg is not installed; search_code returns no matches");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };

        let mut matches = Vec::new();
        for line in out.stdout.lines() {
            let Ok(record) = serde_json::from_str::<serde_json::Value>(line) else {
                continue;
            };
            if record.get("type").and_then(|t| t.as_str()) != Some("match") {
                continue;
            }
            let data = &record["data"];
            let (Some(file), Some(line_number), Some(text)) = (
                data["path"]["text"].as_str(),
                data["line_number"].as_u64(),
                data["lines"]["text"].as_str(),
            ) else {
                continue;
            };
            matches.push(SearchMatch {
                file: file.to_string(),
                line: line_number,
                text: text.trim().to_string(),
            });
        }
        Ok(matches)
    }

    /// `git status` in the workspace. Failures come back in the body text
    /// rather than as errors, so the agent can read them.
    pub fn git_status(&self) -> Result<String, ToolError> {
        self.git_readback(&["status"])
    }

    /// Unified diff of the working tree against `base` (typically `HEAD`).
    pub fn git_diff(&self, base: &str) -> Result<String, ToolError> {
        self.git_readback(&["diff", base])
    }

    fn git_readback(&self, args: &[&str]) -> Result<String, ToolError> {
        let mut argv = vec!["git".to_string()];
        argv.extend(args.iter().map(|s| s.to_string()));
        let out = run_with_deadline(&argv, &self.root, GIT_DEADLINE)?;
        if out.success() {
            Ok(out.stdout)
        } else {
            Ok(format!("{}{}", out.stdout, out.stderr))
        }
    }

    /// Apply a unified diff via `git apply --whitespace=fix`, staging the
    /// diff in a scratch file that is removed when this call returns.
    pub fn apply_patch(&self, diff: &str) -> Result<CmdOutput, ToolError> {
        let mut scratch = tempfile::Builder::new()
            .prefix("code-action-")
            .suffix(".patch")
            .tempfile()?;
        scratch.write_all(diff.as_bytes())?;
        scratch.flush()?;

        let argv = vec![
            "git".to_string(),
            "apply".to_string(),
            "--whitespace=fix".to_string(),
            scratch.path().to_string_lossy().into_owned(),
        ];
        // Scratch file lives until after the subprocess finishes; Drop then
        // removes it even on the error paths.
        Ok(run_with_deadline(&argv, &self.root, PATCH_DEADLINE)?)
    }

    /// Hard-reset the repository to `to_ref`, discarding uncommitted changes.
    /// Unlike status/diff this raises on a non-zero exit.
    pub fn git_reset(&self, to_ref: &str) -> Result<(), ToolError> {
        let argv = vec![
            "git".to_string(),
            "reset".to_string(),
            "--hard".to_string(),
            to_ref.to_string(),
        ];
        let out = run_with_deadline(&argv, &self.root, GIT_DEADLINE)?;
        if out.success() {
            Ok(())
        } else {
            Err(ToolError::CommandFailed {
                command: "git reset".to_string(),
                code: out.exit_code,
                stderr: out.stderr,
            })
        }
    }

    /// Run an allowlisted command in the workspace with a hard deadline.
    pub fn run_command(&self, argv: &[String], timeout: Duration) -> Result<CmdOutput, ToolError> {
        let Some(executable) = argv.first() else {
            return Err(ToolError::EmptyCommand);
        };
        if !policy::command_allowed(executable) {
            return Err(ToolError::CommandNotAllowed {
                command: executable.clone(),
            });
        }
        Ok(run_with_deadline(argv, &self.root, timeout)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toolbox() -> (tempfile::TempDir, Toolbox) {
        let dir = tempfile::TempDir::new().unwrap();
        let tb = Toolbox::bind(dir.path()).unwrap();
        (dir, tb)
    }

    fn git(args: &[&str], cwd: &Path) {
        let argv: Vec<String> = std::iter::once("git".to_string())
            .chain(args.iter().map(|s| s.to_string()))
            .collect();
        let out = run_with_deadline(&argv, cwd, Duration::from_secs(30)).unwrap();
        assert!(out.success(), "git {args:?} failed: {}", out.stderr);
    }

    fn git_toolbox() -> (tempfile::TempDir, Toolbox) {
        let (dir, tb) = toolbox();
        let root = tb.root().to_path_buf();
        git(&["init"], &root);
        git(&["config", "user.email", "test@test.com"], &root);
        git(&["config", "user.name", "Test"], &root);
        tb.write_file("README.md", "hello\n").unwrap();
        git(&["add", "."], &root);
        git(&["commit", "-m", "init"], &root);
        (dir, tb)
    }

    #[test]
    fn test_write_then_read_round_trip() {
        let (_dir, tb) = toolbox();
        tb.write_file("notes/deep/file.txt", "payload").unwrap();
        assert_eq!(tb.read_file("notes/deep/file.txt").unwrap(), "payload");
    }

    #[test]
    fn test_read_missing_file_is_io_error() {
        let (_dir, tb) = toolbox();
        assert!(matches!(tb.read_file("nope.txt"), Err(ToolError::Io(_))));
    }

    #[test]
    fn test_read_invalid_utf8_is_decode_error() {
        let (_dir, tb) = toolbox();
        fs::write(tb.root().join("bin.dat"), [0xFF, 0xFE, 0x00]).unwrap();
        assert!(matches!(tb.read_file("bin.dat"), Err(ToolError::Decode { .. })));
    }

    #[test]
    fn test_traversal_rejected_before_io() {
        let (_dir, tb) = toolbox();
        assert!(matches!(
            tb.read_file("../../etc/passwd"),
            Err(ToolError::Traversal { .. })
        ));
        assert!(matches!(
            tb.write_file("../escape.txt", "x"),
            Err(ToolError::Traversal { .. })
        ));
        assert!(matches!(
            tb.list_files("..", "*"),
            Err(ToolError::Traversal { .. })
        ));
    }

    #[test]
    fn test_absolute_path_outside_workspace_rejected() {
        let (_dir, tb) = toolbox();
        assert!(matches!(
            tb.read_file("/etc/passwd"),
            Err(ToolError::Traversal { .. })
        ));
    }

    #[test]
    fn test_list_files_recursive_and_relative_to_root() {
        let (_dir, tb) = toolbox();
        tb.write_file("a.txt", "1").unwrap();
        tb.write_file("sub/b.txt", "2").unwrap();
        tb.write_file("sub/deeper/c.md", "3").unwrap();

        let all = tb.list_files(".", "**/*").unwrap();
        assert_eq!(all, vec!["a.txt", "sub/b.txt", "sub/deeper/c.md"]);

        let txt = tb.list_files(".", "**/*.txt").unwrap();
        assert_eq!(txt, vec!["a.txt", "sub/b.txt"]);
    }

    #[test]
    fn test_list_files_star_is_top_level_only() {
        let (_dir, tb) = toolbox();
        tb.write_file("top.txt", "1").unwrap();
        tb.write_file("sub/nested.txt", "2").unwrap();
        assert_eq!(tb.list_files(".", "*").unwrap(), vec!["top.txt"]);
    }

    #[test]
    fn test_list_files_under_base_keeps_root_relative_paths() {
        let (_dir, tb) = toolbox();
        tb.write_file("sub/b.txt", "2").unwrap();
        assert_eq!(tb.list_files("sub", "*").unwrap(), vec!["sub/b.txt"]);
    }

    #[test]
    fn test_list_files_excludes_directories() {
        let (_dir, tb) = toolbox();
        fs::create_dir_all(tb.root().join("only-a-dir")).unwrap();
        assert!(tb.list_files(".", "**/*").unwrap().is_empty());
    }

    #[test]
    fn test_run_command_empty_argv() {
        let (_dir, tb) = toolbox();
        assert!(matches!(
            tb.run_command(&[], Duration::from_secs(1)),
            Err(ToolError::EmptyCommand)
        ));
    }

    #[test]
    fn test_run_command_disallowed_binary() {
        let (_dir, tb) = toolbox();
        let argv = vec!["bash".to_string(), "-c".to_string(), "true".to_string()];
        let err = tb.run_command(&argv, Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, ToolError::CommandNotAllowed { command } if command == "bash"));
    }

    #[test]
    fn test_run_command_allowed_binary() {
        let (_dir, tb) = git_toolbox();
        let argv = vec!["git".to_string(), "rev-parse".to_string(), "--is-inside-work-tree".to_string()];
        let out = tb.run_command(&argv, Duration::from_secs(15)).unwrap();
        assert_eq!(out.exit_code, 0);
        assert_eq!(out.stdout.trim(), "true");
    }

    #[test]
    fn test_git_status_mentions_untracked_file() {
        let (_dir, tb) = git_toolbox();
        tb.write_file("new_file.txt", "x").unwrap();
        let status = tb.git_status().unwrap();
        assert!(status.contains("new_file.txt"), "status was: {status}");
    }

    #[test]
    fn test_git_diff_shows_modification() {
        let (_dir, tb) = git_toolbox();
        tb.write_file("README.md", "changed\n").unwrap();
        let diff = tb.git_diff("HEAD").unwrap();
        assert!(diff.contains("-hello"), "diff was: {diff}");
        assert!(diff.contains("+changed"), "diff was: {diff}");
    }

    #[test]
    fn test_git_reset_discards_changes() {
        let (_dir, tb) = git_toolbox();
        tb.write_file("README.md", "broken\n").unwrap();
        tb.git_reset("HEAD").unwrap();
        assert_eq!(tb.read_file("README.md").unwrap(), "hello\n");
    }

    #[test]
    fn test_apply_patch_success_and_failure() {
        let (_dir, tb) = git_toolbox();
        let patch = "\
--- a/README.md
+++ b/README.md
@@ -1 +1 @@
-hello
+patched
";
        let out = tb.apply_patch(patch).unwrap();
        assert!(out.success(), "apply failed: {}", out.stderr);
        assert_eq!(tb.read_file("README.md").unwrap(), "patched\n");

        // The same patch no longer applies; failure is data, not an error.
        let out = tb.apply_patch(patch).unwrap();
        assert!(!out.success());
        assert!(!out.stderr.is_empty());
    }

    #[test]
    fn test_search_code_missing_binary_or_matches() {
        let (_dir, tb) = git_toolbox();
        tb.write_file("src/needle.txt", "haystack with NEEDLE inside\n").unwrap();
        // Passes whether or not rg is installed: absence degrades to empty.
        let matches = tb.search_code("NEEDLE", ".").unwrap();
        for m in &matches {
            assert!(m.text.contains("NEEDLE"));
            assert!(m.line >= 1);
        }
    }
}
