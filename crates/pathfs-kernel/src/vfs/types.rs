//! Core VFS types.
//!
//! Records are plain data: callbacks receive snapshots, never references
//! into the tree, so a record stays readable after the tree has moved on.

use serde::{Deserialize, Serialize};
use std::any::Any;
use std::sync::Arc;
use std::time::SystemTime;
use strum::{Display, EnumString};

use super::path::{split_parent, Namespace};

/// Index of a record in the virtual tree. Handle `0` is the virtual root.
///
/// Stable until the next add or remove; renames never change it.
pub type FileHandle = u32;

/// Handle of the virtual root.
pub const ROOT_HANDLE: FileHandle = 0;

/// `file_offset` sentinel for [`write`](super::FileSystem::write): append at the end.
pub const APPEND: u64 = u64::MAX;

/// Opaque data a backend or importer attaches to a record. The seed
/// importer stores the source `PathBuf`; records made through `add` carry
/// none.
pub type Payload = Arc<dyn Any + Send + Sync>;

/// Read/write capability bits of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileAccess {
    /// Data can be read and the folder enumerated.
    pub read: bool,
    /// Data can be written and children added or removed.
    pub write: bool,
}

impl Default for FileAccess {
    fn default() -> Self {
        Self::read_write()
    }
}

impl FileAccess {
    pub const fn read_only() -> Self {
        Self {
            read: true,
            write: false,
        }
    }

    pub const fn read_write() -> Self {
        Self {
            read: true,
            write: true,
        }
    }

    pub const fn none() -> Self {
        Self {
            read: false,
            write: false,
        }
    }

    /// True when every capability in `required` is granted.
    pub fn allows(&self, required: FileAccess) -> bool {
        (self.read || !required.read) && (self.write || !required.write)
    }
}

/// Kind of change delivered to file change callbacks.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[strum(serialize_all = "UPPERCASE")]
pub enum ChangeKind {
    /// A file or folder was created.
    Add,
    /// A file or folder was removed. Fired once per node, children first.
    Del,
    /// Contents or metadata changed.
    Update,
    /// Renamed within its parent folder.
    Move,
}

/// How a local file is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    ReadWrite,
}

/// Result of a local `stat`. Never cached beyond the call that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalStat {
    pub exists: bool,
    pub is_folder: bool,
    pub size: u64,
    pub mtime: SystemTime,
    pub read_only: bool,
}

impl LocalStat {
    /// Stat result for a path that doesn't exist.
    pub fn missing() -> Self {
        Self {
            exists: false,
            is_folder: false,
            size: 0,
            mtime: SystemTime::UNIX_EPOCH,
            read_only: false,
        }
    }
}

/// A file or folder in either namespace.
///
/// For a virtual folder, its depth-1 children occupy the handle range
/// `[folder_start, file_end)`: sub-folders in `[folder_start, file_start)`
/// followed by files in `[file_start, file_end)`. Files keep an empty
/// range. Local records are built per call and leave all handle fields
/// at zero.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    /// Canonical path in `~`/`.` notation.
    pub path: String,
    /// Last path segment (the root's name is its own path).
    pub name: String,
    /// Size in bytes, 0 for folders.
    pub size: u64,
    /// Last modification time.
    pub modification_time: SystemTime,
    /// Own index in the virtual tree.
    pub handle: FileHandle,
    /// Parent folder's handle (the root is its own parent).
    pub parent: FileHandle,
    pub folder_start: FileHandle,
    pub file_start: FileHandle,
    pub file_end: FileHandle,
    pub access: FileAccess,
    pub is_folder: bool,
    pub namespace: Namespace,
    /// Attached data, see [`Payload`].
    #[serde(skip)]
    pub payload: Option<Payload>,
}

impl FileRecord {
    /// A fresh virtual record with an empty child range at `range_at`.
    pub(crate) fn new_virtual(
        path: String,
        name: String,
        parent: FileHandle,
        range_at: FileHandle,
        access: FileAccess,
        is_folder: bool,
        now: SystemTime,
    ) -> Self {
        Self {
            path,
            name,
            size: 0,
            modification_time: now,
            handle: 0,
            parent,
            folder_start: range_at,
            file_start: range_at,
            file_end: range_at,
            access,
            is_folder,
            namespace: Namespace::Virtual,
            payload: None,
        }
    }

    /// Build a transient record for a local path from a fresh stat.
    pub fn local(path: &str, stat: &LocalStat) -> Self {
        let name = split_parent(path)
            .map(|(_, name)| name.to_string())
            .unwrap_or_else(|| path.to_string());
        Self {
            path: path.to_string(),
            name,
            size: if stat.is_folder { 0 } else { stat.size },
            modification_time: stat.mtime,
            handle: 0,
            parent: 0,
            folder_start: 0,
            file_start: 0,
            file_end: 0,
            access: if stat.read_only {
                FileAccess::read_only()
            } else {
                FileAccess::read_write()
            },
            is_folder: stat.is_folder,
            namespace: Namespace::Local,
            payload: None,
        }
    }

    /// Number of direct sub-folders.
    pub fn folder_count(&self) -> u32 {
        self.file_start - self.folder_start
    }

    /// Number of direct files.
    pub fn file_count(&self) -> u32 {
        self.file_end - self.file_start
    }

    /// Number of direct children.
    pub fn child_count(&self) -> u32 {
        self.file_end - self.folder_start
    }

    pub fn has_access(&self, required: FileAccess) -> bool {
        self.access.allows(required)
    }

    pub fn is_virtual(&self) -> bool {
        self.namespace.is_virtual()
    }

    /// The payload, if present and of type `T`.
    pub fn payload_as<T: Any>(&self) -> Option<&T> {
        self.payload.as_deref()?.downcast_ref()
    }

    pub fn has_data(&self) -> bool {
        self.size != 0
    }

    /// Whether `[offset, offset + size)` lies inside the file.
    pub fn has_region(&self, size: u64, offset: u64) -> bool {
        offset
            .checked_add(size)
            .is_some_and(|end| end <= self.size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_access_allows() {
        assert!(FileAccess::read_write().allows(FileAccess::read_only()));
        assert!(!FileAccess::read_only().allows(FileAccess::read_write()));
        assert!(FileAccess::none().allows(FileAccess::none()));
    }

    #[test]
    fn test_change_kind_strings() {
        assert_eq!(ChangeKind::Del.to_string(), "DEL");
        assert_eq!("UPDATE".parse::<ChangeKind>().unwrap(), ChangeKind::Update);
    }

    #[test]
    fn test_region() {
        let mut rec = FileRecord::local("./a.txt", &LocalStat::missing());
        rec.size = 11;
        assert!(rec.has_region(11, 0));
        assert!(rec.has_region(0, 11));
        assert!(!rec.has_region(1, 11));
        assert!(!rec.has_region(u64::MAX, 1));
    }

    #[test]
    fn test_local_record() {
        let stat = LocalStat {
            exists: true,
            is_folder: false,
            size: 42,
            mtime: SystemTime::UNIX_EPOCH,
            read_only: true,
        };
        let rec = FileRecord::local("./src/lib.rs", &stat);
        assert_eq!(rec.name, "lib.rs");
        assert_eq!(rec.size, 42);
        assert!(!rec.is_virtual());
        assert!(!rec.has_access(FileAccess::read_write()));
    }
}
