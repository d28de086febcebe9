//! Canonical-prefix traversal guard.
//!
//! Every path computed from caller input, whether a `workspace_ref` arriving
//! over HTTP or a relative path passed to a tool primitive, goes through
//! [`resolve_under`] before any I/O. The check has to work for paths that do
//! not exist yet (`write_file` targets, workspaces about to be cloned), so it
//! canonicalizes the deepest existing ancestor and normalizes the remainder
//! lexically.

use std::path::{Component, Path, PathBuf};

/// Resolve `candidate` against `root` and prove the result stays inside.
///
/// `root` must already be canonical (see [`std::fs::canonicalize`]); callers
/// canonicalize it once when they bind to it. A relative `candidate` is
/// joined onto `root`; an absolute one is taken as-is, which lets fragments
/// pass absolute workspace paths and still be checked.
///
/// Returns the resolved path, or `None` when it escapes `root`.
pub(crate) fn resolve_under(root: &Path, candidate: &Path) -> Option<PathBuf> {
    let joined = if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        root.join(candidate)
    };

    let resolved = canonicalize_existing_prefix(&joined);
    if resolved.starts_with(root) {
        Some(resolved)
    } else {
        None
    }
}

/// Canonicalize the deepest existing ancestor of `path`, then re-append the
/// non-existing tail (normalized lexically, so `..` in the tail cannot sneak
/// past the prefix check).
fn canonicalize_existing_prefix(path: &Path) -> PathBuf {
    let normalized = normalize_lexically(path);
    let mut existing = normalized.as_path();
    let mut tail = Vec::new();
    loop {
        if let Ok(canonical) = existing.canonicalize() {
            let mut out = canonical;
            for part in tail.iter().rev() {
                out.push(part);
            }
            return out;
        }
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                tail.push(name.to_os_string());
                existing = parent;
            }
            // Ran out of parents without hitting an existing directory;
            // fall back to the lexical form.
            _ => return normalized,
        }
    }
}

/// Collapse `.` and `..` components without touching the filesystem.
///
/// A `..` that would climb above the first component is kept, so the caller's
/// prefix check still rejects it.
fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}
