//! File change callbacks and the view they see.
//!
//! Handlers run synchronously while the file system lock is held. They are
//! handed an [`FsView`] instead of the [`FileSystem`](super::FileSystem)
//! itself, so a handler has no way to call back into a locking operation.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use super::backends::LocalBackend;
use super::error::{VfsError, VfsResult};
use super::path::{is_within, Namespace};
use super::tree::FileTree;
use super::types::{ChangeKind, FileHandle, FileRecord};

/// Receives change notifications for a registered directory.
///
/// Any state the handler needs (the "user data") lives in the handler.
pub trait FileChangeHandler: Send + Sync {
    fn on_change(&self, fs: &FsView<'_>, record: &FileRecord, kind: ChangeKind);
}

impl<F> FileChangeHandler for F
where
    F: Fn(&FsView<'_>, &FileRecord, ChangeKind) + Send + Sync,
{
    fn on_change(&self, fs: &FsView<'_>, record: &FileRecord, kind: ChangeKind) {
        self(fs, record, kind)
    }
}

/// Which registrations receive an event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallbackScope {
    /// Every registration sees every change.
    #[default]
    All,
    /// A registration only sees changes at or below its directory.
    Subtree,
}

/// Read-only access to the file system from inside a callback or an
/// enumeration. Valid only for the duration of that call.
pub struct FsView<'a> {
    tree: &'a FileTree,
    local: Option<&'a dyn LocalBackend>,
}

impl<'a> FsView<'a> {
    pub(crate) fn new(tree: &'a FileTree, local: Option<&'a dyn LocalBackend>) -> Self {
        Self { tree, local }
    }

    /// The virtual tree as it stands right now.
    pub fn tree(&self) -> &FileTree {
        self.tree
    }

    /// Current record for a virtual handle.
    pub fn get_handle(&self, handle: FileHandle) -> Option<&FileRecord> {
        self.tree.get(handle)
    }

    /// Current record for a resolved path. Local paths are re-stated.
    pub fn get(&self, path: &str) -> VfsResult<FileRecord> {
        match Namespace::of(path) {
            Namespace::Virtual => self.tree.get_path(path).cloned(),
            Namespace::Local => {
                let local = self
                    .local
                    .ok_or_else(|| VfsError::not_supported("local files are disabled"))?;
                let stat = local.stat(path)?;
                if !stat.exists {
                    return Err(VfsError::not_found(path));
                }
                Ok(FileRecord::local(path, &stat))
            }
        }
    }

    /// Whether a resolved path exists.
    pub fn exists(&self, path: &str) -> bool {
        match Namespace::of(path) {
            Namespace::Virtual => self.tree.lookup(path).is_some(),
            Namespace::Local => self
                .local
                .and_then(|l| l.stat(path).ok())
                .is_some_and(|s| s.exists),
        }
    }
}

/// Registered handlers, one per directory.
#[derive(Default)]
pub(crate) struct CallbackTable {
    entries: BTreeMap<String, Arc<dyn FileChangeHandler>>,
}

impl CallbackTable {
    /// Register a handler; false if the directory already has one.
    pub fn insert(&mut self, dir: String, handler: Arc<dyn FileChangeHandler>) -> bool {
        if self.entries.contains_key(&dir) {
            return false;
        }
        self.entries.insert(dir, handler);
        true
    }

    pub fn remove(&mut self, dir: &str) -> bool {
        self.entries.remove(dir).is_some()
    }

    pub fn contains(&self, dir: &str) -> bool {
        self.entries.contains_key(dir)
    }

    pub fn dirs(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Deliver one change to every registration in scope.
    pub fn fan_out(&self, view: &FsView<'_>, record: &FileRecord, kind: ChangeKind, scope: CallbackScope) {
        for (dir, handler) in &self.entries {
            if scope == CallbackScope::Subtree && !is_within(&record.path, dir) {
                continue;
            }
            tracing::trace!(dir = %dir, path = %record.path, %kind, "delivering file change");
            handler.on_change(view, record, kind);
        }
    }
}

impl std::fmt::Debug for CallbackTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackTable")
            .field("dirs", &self.entries.keys().collect::<Vec<_>>())
            .finish()
    }
}
