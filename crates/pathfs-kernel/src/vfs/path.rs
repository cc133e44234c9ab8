//! Path notation and normalization.
//!
//! Every path starts with a namespace root followed by `/`-separated
//! segments:
//!
//! - `~`: the virtual namespace, served by the in-memory [`FileTree`](super::FileTree)
//! - `.`: the local namespace, served by a [`LocalBackend`](super::LocalBackend)
//!
//! `.` and `..` segments are operators, not names. `\` is rejected
//! anywhere, as are empty segments. Normalization never touches the OS.

use serde::{Deserialize, Serialize};

use super::error::{VfsError, VfsResult};

/// Root of the virtual namespace.
pub const VIRTUAL_ROOT: &str = "~";

/// Root of the local namespace.
pub const LOCAL_ROOT: &str = ".";

/// Which backend a resolved path belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Namespace {
    /// In-memory tree rooted at `~`.
    Virtual,
    /// Physical files rooted at `.`.
    Local,
}

impl Namespace {
    /// Namespace of an already resolved path.
    pub fn of(resolved: &str) -> Self {
        if resolved.starts_with('~') {
            Namespace::Virtual
        } else {
            Namespace::Local
        }
    }

    /// Root path string for this namespace.
    pub fn root(&self) -> &'static str {
        match self {
            Namespace::Virtual => VIRTUAL_ROOT,
            Namespace::Local => LOCAL_ROOT,
        }
    }

    pub fn is_virtual(&self) -> bool {
        matches!(self, Namespace::Virtual)
    }
}

/// Normalize a path, collapsing `.` and `..` segments.
///
/// Inputs without operator segments are returned unchanged after
/// validation; the result is byte-identical to what the segment walk
/// would produce.
pub fn resolve(path: &str) -> VfsResult<String> {
    if path.is_empty() || path.contains('\\') {
        return Err(VfsError::invalid_path(path));
    }

    let mut segments = path.split('/');
    match segments.next() {
        Some(VIRTUAL_ROOT) | Some(LOCAL_ROOT) => {}
        _ => return Err(VfsError::invalid_path(path)),
    }

    if segments
        .clone()
        .all(|s| !s.is_empty() && s != "." && s != "..")
    {
        return Ok(path.to_string());
    }

    let mut stack: Vec<&str> = Vec::new();
    for segment in segments {
        match segment {
            "" => return Err(VfsError::invalid_path(path)),
            "." => {}
            ".." => {
                if stack.pop().is_none() {
                    return Err(VfsError::invalid_path(path));
                }
            }
            name => stack.push(name),
        }
    }

    let mut out = String::with_capacity(path.len());
    out.push_str(&path[..1]);
    for segment in stack {
        out.push('/');
        out.push_str(segment);
    }
    Ok(out)
}

/// Split a resolved path into its parent path and last segment.
///
/// Returns `None` for a namespace root.
pub fn split_parent(resolved: &str) -> Option<(&str, &str)> {
    if resolved.len() <= 1 {
        return None;
    }
    resolved
        .rfind('/')
        .map(|idx| (&resolved[..idx], &resolved[idx + 1..]))
}

/// Whether `path` is `dir` itself or lies underneath it.
pub fn is_within(path: &str, dir: &str) -> bool {
    path == dir
        || (path.len() > dir.len() && path.starts_with(dir) && path.as_bytes()[dir.len()] == b'/')
}

/// Join a resolved directory path and a child name.
pub fn join(dir: &str, name: &str) -> String {
    let mut out = String::with_capacity(dir.len() + name.len() + 1);
    out.push_str(dir);
    out.push('/');
    out.push_str(name);
    out
}
