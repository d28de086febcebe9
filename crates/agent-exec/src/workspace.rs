//! Workspace lifecycle: create, delete, snapshot, restore.
//!
//! A workspace is a directory under the manager's base holding a cloned
//! repository; a snapshot is a gzipped tar of that directory, stored under
//! `{base}/snapshots/` and keyed by `{ref}-{unix_seconds}`. The filesystem is
//! the source of truth: there is no in-memory registry, and the manager is an
//! explicit context passed to every caller (tests bind one to a tempdir).
//!
//! Every caller-supplied name is resolved through the traversal guard before
//! any I/O. Failed operations clean up after themselves: a failed clone
//! removes the partial directory so the ref can be retried, a failed snapshot
//! leaves no partial archive, and a failed restore leaves the target absent
//! rather than half-populated.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use thiserror::Error;
use tracing::info;

use crate::paths::resolve_under;
use crate::proc::run_with_deadline;

const SNAPSHOTS_DIR_NAME: &str = "snapshots";

/// Clones block on the network; archives block on local disk.
const CLONE_DEADLINE: Duration = Duration::from_secs(600);
const CHECKOUT_DEADLINE: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("'{name}' resolves outside the workspace base; path traversal is not allowed")]
    Traversal { name: String },

    #[error("workspace '{reference}' not found")]
    WorkspaceNotFound { reference: String },

    #[error("snapshot '{key}' not found; the key may have expired or been deleted")]
    SnapshotNotFound { key: String },

    #[error("workspace '{reference}' already exists; delete it before re-creating")]
    Exists { reference: String },

    #[error("clone failed: {detail}")]
    CloneFailed { detail: String },

    #[error("archive operation failed: {detail}")]
    ArchiveFailed { detail: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Owner of the on-disk hierarchy for workspaces and snapshots.
pub struct WorkspaceManager {
    base: PathBuf,
}

impl WorkspaceManager {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn snapshots_dir(&self) -> PathBuf {
        self.base.join(SNAPSHOTS_DIR_NAME)
    }

    /// Canonical base directory, created on first use (`mkdir -p` semantics).
    fn canonical_base(&self) -> Result<PathBuf, WorkspaceError> {
        fs::create_dir_all(&self.base)?;
        Ok(self.base.canonicalize()?)
    }

    /// Resolve `reference` to its directory under the base, or fail with a
    /// traversal error before touching anything.
    pub fn workspace_path(&self, reference: &str) -> Result<PathBuf, WorkspaceError> {
        let base = self.canonical_base()?;
        resolve_under(&base, Path::new(reference)).ok_or_else(|| WorkspaceError::Traversal {
            name: reference.to_string(),
        })
    }

    /// Resolve and create the workspace directory. Used by the code-action
    /// route, which tolerates a not-yet-cloned workspace for local testing.
    pub fn ensure_workspace_dir(&self, reference: &str) -> Result<PathBuf, WorkspaceError> {
        let dir = self.workspace_path(reference)?;
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Clone `repo_url` at `git_ref` into a fresh workspace.
    ///
    /// A 40-hex `git_ref` is treated as a commit hash: full clone then
    /// checkout, because shallow fetches of arbitrary hashes need server
    /// support that is not universal. Branch and tag names take the fast
    /// path, a depth-1 clone of that ref. Any failure removes the partial
    /// directory so the ref is immediately free to retry.
    pub fn create(&self, reference: &str, repo_url: &str, git_ref: &str) -> Result<(), WorkspaceError> {
        let workspace_dir = self.workspace_path(reference)?;
        if workspace_dir.exists() {
            return Err(WorkspaceError::Exists {
                reference: reference.to_string(),
            });
        }

        let base = self.canonical_base()?;
        if let Err(e) = self.clone_into(&base, &workspace_dir, repo_url, git_ref) {
            let _ = fs::remove_dir_all(&workspace_dir);
            return Err(e);
        }

        info!(workspace = reference, repo = repo_url, git_ref, "workspace created");
        Ok(())
    }

    fn clone_into(
        &self,
        base: &Path,
        workspace_dir: &Path,
        repo_url: &str,
        git_ref: &str,
    ) -> Result<(), WorkspaceError> {
        let target = workspace_dir.to_string_lossy().into_owned();
        let looks_like_commit =
            git_ref.len() == 40 && git_ref.chars().all(|c| c.is_ascii_hexdigit());

        if looks_like_commit {
            // Full clone then explicit checkout: the only portable way to
            // land on an arbitrary commit.
            git_step(
                &["clone", repo_url, &target],
                base,
                CLONE_DEADLINE,
            )?;
            git_step(&["checkout", git_ref], workspace_dir, CHECKOUT_DEADLINE)?;
        } else if git_ref == "HEAD" {
            // The remote default branch; --branch does not accept HEAD.
            git_step(
                &["clone", "--depth", "1", repo_url, &target],
                base,
                CLONE_DEADLINE,
            )?;
        } else {
            git_step(
                &["clone", "--depth", "1", "--branch", git_ref, repo_url, &target],
                base,
                CLONE_DEADLINE,
            )?;
        }
        Ok(())
    }

    /// Remove a workspace directory permanently.
    pub fn delete(&self, reference: &str) -> Result<(), WorkspaceError> {
        let workspace_dir = self.workspace_path(reference)?;
        if !workspace_dir.exists() {
            return Err(WorkspaceError::WorkspaceNotFound {
                reference: reference.to_string(),
            });
        }
        fs::remove_dir_all(&workspace_dir)?;
        info!(workspace = reference, "workspace deleted");
        Ok(())
    }

    /// Archive the full workspace subtree (repository metadata, untracked
    /// files, everything) and return `(snapshot_key, archive_size_bytes)`.
    ///
    /// Archive entries are rooted at the workspace name, so extraction into
    /// the base recreates the workspace directory in place. Keys have
    /// one-second resolution; two snapshots of one workspace within the same
    /// second collide, and callers are expected to tolerate that or wait.
    pub fn snapshot(&self, reference: &str) -> Result<(String, u64), WorkspaceError> {
        let workspace_dir = self.workspace_path(reference)?;
        if !workspace_dir.exists() {
            return Err(WorkspaceError::WorkspaceNotFound {
                reference: reference.to_string(),
            });
        }

        let snapshots = self.snapshots_dir();
        fs::create_dir_all(&snapshots)?;

        let unix_seconds = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let snapshot_key = format!("{reference}-{unix_seconds}");
        let archive_path = snapshots.join(format!("{snapshot_key}.tar.gz"));

        if let Err(e) = write_archive(&archive_path, reference, &workspace_dir) {
            let _ = fs::remove_file(&archive_path);
            return Err(e);
        }

        let size_bytes = fs::metadata(&archive_path)?.len();
        info!(workspace = reference, key = %snapshot_key, size_bytes, "snapshot written");
        Ok((snapshot_key, size_bytes))
    }

    /// Replace the workspace with a previously taken snapshot.
    ///
    /// Destructive-then-create: whatever currently occupies the workspace
    /// path is removed before extraction, and a mid-extract failure removes
    /// the partial tree again, so the target is either complete or absent.
    /// Works even when the workspace was deleted after the snapshot.
    pub fn restore(&self, reference: &str, snapshot_key: &str) -> Result<(), WorkspaceError> {
        let snapshots = self.snapshots_dir();
        fs::create_dir_all(&snapshots)?;
        let snapshots = snapshots.canonicalize()?;
        let archive_path = resolve_under(&snapshots, Path::new(&format!("{snapshot_key}.tar.gz")))
            .ok_or_else(|| WorkspaceError::Traversal {
                name: snapshot_key.to_string(),
            })?;
        if !archive_path.exists() {
            return Err(WorkspaceError::SnapshotNotFound {
                key: snapshot_key.to_string(),
            });
        }

        let workspace_dir = self.workspace_path(reference)?;
        if workspace_dir.exists() {
            fs::remove_dir_all(&workspace_dir)?;
        }

        let base = self.canonical_base()?;
        if let Err(e) = extract_archive(&archive_path, &base) {
            let _ = fs::remove_dir_all(&workspace_dir);
            return Err(e);
        }

        info!(workspace = reference, key = snapshot_key, "workspace restored");
        Ok(())
    }
}

/// Run one git command, folding every failure mode into `CloneFailed` with
/// the captured stderr.
fn git_step(args: &[&str], cwd: &Path, deadline: Duration) -> Result<(), WorkspaceError> {
    let argv: Vec<String> = std::iter::once("git".to_string())
        .chain(args.iter().map(|s| s.to_string()))
        .collect();
    let out = run_with_deadline(&argv, cwd, deadline).map_err(|e| WorkspaceError::CloneFailed {
        detail: e.to_string(),
    })?;
    if out.success() {
        Ok(())
    } else {
        Err(WorkspaceError::CloneFailed {
            detail: format!("git {} (exit {}): {}", args[0], out.exit_code, out.stderr.trim()),
        })
    }
}

fn write_archive(archive_path: &Path, entry_root: &str, src: &Path) -> Result<(), WorkspaceError> {
    let archive = || -> std::io::Result<()> {
        let file = File::create(archive_path)?;
        let encoder = GzEncoder::new(file, Compression::default());
        let mut builder = tar::Builder::new(encoder);
        builder.append_dir_all(entry_root, src)?;
        let encoder = builder.into_inner()?;
        encoder.finish()?;
        Ok(())
    };
    archive().map_err(|e| WorkspaceError::ArchiveFailed {
        detail: e.to_string(),
    })
}

fn extract_archive(archive_path: &Path, into: &Path) -> Result<(), WorkspaceError> {
    let extract = || -> std::io::Result<()> {
        let file = File::open(archive_path)?;
        let decoder = GzDecoder::new(file);
        let mut archive = tar::Archive::new(decoder);
        archive.unpack(into)?;
        Ok(())
    };
    extract().map_err(|e| WorkspaceError::ArchiveFailed {
        detail: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proc::run_with_deadline;

    fn git(args: &[&str], cwd: &Path) {
        let argv: Vec<String> = std::iter::once("git".to_string())
            .chain(args.iter().map(|s| s.to_string()))
            .collect();
        let out = run_with_deadline(&argv, cwd, Duration::from_secs(30)).unwrap();
        assert!(out.success(), "git {args:?} failed: {}", out.stderr);
    }

    /// A local repository with one commit, cloneable via `file://`.
    /// Returns `(tempdir_guard, file_url, branch_name)`.
    fn local_repo() -> (tempfile::TempDir, String, String) {
        let dir = tempfile::TempDir::new().unwrap();
        let repo = dir.path().join("source-repo");
        fs::create_dir(&repo).unwrap();
        git(&["init"], &repo);
        git(&["config", "user.email", "test@test.com"], &repo);
        git(&["config", "user.name", "Test"], &repo);
        fs::write(repo.join("README.md"), "hello").unwrap();
        git(&["add", "."], &repo);
        git(&["commit", "-m", "init"], &repo);

        let branch = {
            let argv: Vec<String> = ["git", "rev-parse", "--abbrev-ref", "HEAD"]
                .iter()
                .map(|s| s.to_string())
                .collect();
            let out = run_with_deadline(&argv, &repo, Duration::from_secs(15)).unwrap();
            out.stdout.trim().to_string()
        };
        let url = format!("file://{}", repo.display());
        (dir, url, branch)
    }

    fn manager() -> (tempfile::TempDir, WorkspaceManager) {
        let dir = tempfile::TempDir::new().unwrap();
        let mgr = WorkspaceManager::new(dir.path().join("workspaces"));
        (dir, mgr)
    }

    #[test]
    fn test_create_clones_the_repo() {
        let (_repo_guard, url, branch) = local_repo();
        let (_base_guard, mgr) = manager();

        mgr.create("job-1", &url, &branch).unwrap();
        let ws = mgr.workspace_path("job-1").unwrap();
        assert!(ws.join(".git").is_dir());
        assert_eq!(fs::read_to_string(ws.join("README.md")).unwrap(), "hello");
    }

    #[test]
    fn test_create_with_head_default() {
        let (_repo_guard, url, _branch) = local_repo();
        let (_base_guard, mgr) = manager();
        mgr.create("job-head", &url, "HEAD").unwrap();
        assert!(mgr.workspace_path("job-head").unwrap().join("README.md").exists());
    }

    #[test]
    fn test_create_twice_fails_with_exists() {
        let (_repo_guard, url, branch) = local_repo();
        let (_base_guard, mgr) = manager();
        mgr.create("job-1", &url, &branch).unwrap();
        let err = mgr.create("job-1", &url, &branch).unwrap_err();
        assert!(matches!(err, WorkspaceError::Exists { .. }));
    }

    #[test]
    fn test_create_traversal_rejected() {
        let (_base_guard, mgr) = manager();
        let err = mgr.create("../../escape", "file:///nowhere", "main").unwrap_err();
        assert!(matches!(err, WorkspaceError::Traversal { .. }));
    }

    #[test]
    fn test_failed_clone_leaves_ref_reusable() {
        let (_base_guard, mgr) = manager();
        let err = mgr
            .create("job-bad", "file:///does/not/exist", "main")
            .unwrap_err();
        assert!(matches!(err, WorkspaceError::CloneFailed { .. }));
        // The partial directory is gone, so the same ref fails the same way
        // again instead of reporting Exists.
        let err = mgr
            .create("job-bad", "file:///does/not/exist", "main")
            .unwrap_err();
        assert!(matches!(err, WorkspaceError::CloneFailed { .. }));
    }

    #[test]
    fn test_delete_missing_is_not_found() {
        let (_base_guard, mgr) = manager();
        let err = mgr.delete("ghost").unwrap_err();
        assert!(matches!(err, WorkspaceError::WorkspaceNotFound { .. }));
    }

    #[test]
    fn test_delete_removes_directory() {
        let (_repo_guard, url, branch) = local_repo();
        let (_base_guard, mgr) = manager();
        mgr.create("job-1", &url, &branch).unwrap();
        mgr.delete("job-1").unwrap();
        assert!(!mgr.workspace_path("job-1").unwrap().exists());
    }

    #[test]
    fn test_snapshot_missing_workspace_is_not_found() {
        let (_base_guard, mgr) = manager();
        let err = mgr.snapshot("ghost").unwrap_err();
        assert!(matches!(err, WorkspaceError::WorkspaceNotFound { .. }));
    }

    #[test]
    fn test_snapshot_writes_keyed_archive() {
        let (_repo_guard, url, branch) = local_repo();
        let (_base_guard, mgr) = manager();
        mgr.create("job-1", &url, &branch).unwrap();

        let (key, size) = mgr.snapshot("job-1").unwrap();
        assert!(key.starts_with("job-1-"), "unexpected key: {key}");
        assert!(size > 0);
        assert!(mgr.snapshots_dir().join(format!("{key}.tar.gz")).is_file());
    }

    #[test]
    fn test_restore_unknown_key_is_not_found() {
        let (_base_guard, mgr) = manager();
        let err = mgr.restore("job-1", "job-1-123456").unwrap_err();
        assert!(matches!(err, WorkspaceError::SnapshotNotFound { .. }));
    }

    #[test]
    fn test_restore_key_traversal_rejected() {
        let (_base_guard, mgr) = manager();
        let err = mgr.restore("job-1", "../../../etc/evil").unwrap_err();
        assert!(matches!(err, WorkspaceError::Traversal { .. }));
    }

    #[test]
    fn test_restore_discards_mutations() {
        let (_repo_guard, url, branch) = local_repo();
        let (_base_guard, mgr) = manager();
        mgr.create("job-1", &url, &branch).unwrap();
        let ws = mgr.workspace_path("job-1").unwrap();

        let (key, _) = mgr.snapshot("job-1").unwrap();

        fs::write(ws.join("DAMAGE.txt"), "oops").unwrap();
        fs::remove_file(ws.join("README.md")).unwrap();

        mgr.restore("job-1", &key).unwrap();
        assert!(!ws.join("DAMAGE.txt").exists());
        assert_eq!(fs::read_to_string(ws.join("README.md")).unwrap(), "hello");
    }

    #[test]
    fn test_restore_after_delete() {
        let (_repo_guard, url, branch) = local_repo();
        let (_base_guard, mgr) = manager();
        mgr.create("job-3", &url, &branch).unwrap();
        let (key, _) = mgr.snapshot("job-3").unwrap();

        mgr.delete("job-3").unwrap();
        assert!(!mgr.workspace_path("job-3").unwrap().exists());

        mgr.restore("job-3", &key).unwrap();
        let ws = mgr.workspace_path("job-3").unwrap();
        assert!(ws.join(".git").is_dir());
        assert_eq!(fs::read_to_string(ws.join("README.md")).unwrap(), "hello");
    }

    #[test]
    fn test_snapshots_a_second_apart_get_distinct_keys() {
        let (_repo_guard, url, branch) = local_repo();
        let (_base_guard, mgr) = manager();
        mgr.create("job-1", &url, &branch).unwrap();

        let (key_a, _) = mgr.snapshot("job-1").unwrap();
        std::thread::sleep(Duration::from_millis(1100));
        let (key_b, _) = mgr.snapshot("job-1").unwrap();
        assert_ne!(key_a, key_b);
    }
}
