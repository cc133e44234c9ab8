//! Unified file system over two namespaces.
//!
//! Key components:
//!
//! - [`resolve`] - Path normalization, no OS calls
//! - [`FileTree`] - Flat-array tree backing the `~` namespace
//! - [`LocalBackend`] - OS hooks for the `.` namespace ([`DiskBackend`] on disk)
//! - [`FileSystem`] - Routes by namespace, serializes mutations, fans out changes
//!
//! ## Design Decisions
//!
//! - **Handles, not references**: virtual records are addressed by index.
//!   A handle is stable until the next add or remove; renames keep it.
//! - **Local files are never cached**: every `.` operation re-queries the OS.
//! - **One coarse lock**: tree mutations and callback delivery happen under
//!   the same mutex, watcher-driven changes included.
//! - **Callbacks can't re-enter**: handlers get an [`FsView`], not the
//!   [`FileSystem`].

pub mod backends;
mod callback;
mod clock;
mod core;
mod error;
mod path;
mod seed;
mod tree;
mod types;

pub use backends::{ChangeSink, DiskBackend, ExternalChange, LocalBackend, LocalFile};
pub use callback::{CallbackScope, FileChangeHandler, FsView};
pub use clock::{Clock, ManualClock, SystemClock};
pub use self::core::{FileSystem, FsGuard};
pub use error::{fatal, VfsError, VfsResult};
pub use path::{is_within, join, resolve, split_parent, Namespace, LOCAL_ROOT, VIRTUAL_ROOT};
pub use tree::FileTree;
pub use types::{
    ChangeKind, FileAccess, FileHandle, FileRecord, LocalStat, OpenMode, Payload, APPEND,
    ROOT_HANDLE,
};
