//! # pathfs-kernel
//!
//! One path grammar over two file namespaces:
//!
//! - `~/...` lives in memory, in a pointer-free tree addressed by handles
//! - `./...` is a directory on disk, queried live on every call
//!
//! Both support the same operations (`add`, `remove`, `read`, `write`,
//! `move_to`, enumeration) and the same change notifications. Local
//! directories with a registered callback are watched, and changes made
//! by other processes arrive through the same callbacks.
//!
//! ```no_run
//! use pathfs_kernel::{ChangeKind, FileRecord, FileSystem, FsConfig, FsView, APPEND};
//!
//! let fs = FileSystem::open_default(FsConfig::default())?;
//! fs.on_change("~", |_: &FsView<'_>, rec: &FileRecord, kind: ChangeKind| {
//!     println!("{kind} {}", rec.path);
//! })?;
//! fs.add("~/docs/readme.txt", false)?;
//! fs.write("~/docs/readme.txt", b"hello world", 0, 0, APPEND)?;
//! # Ok::<(), pathfs_kernel::VfsError>(())
//! ```

pub mod config;
pub mod vfs;

pub use config::{ConfigError, FsConfig};
pub use vfs::{
    resolve, ChangeKind, DiskBackend, FileAccess, FileChangeHandler, FileHandle, FileRecord,
    FileSystem, FileTree, FsGuard, FsView, LocalBackend, Namespace, VfsError, VfsResult, APPEND,
};
