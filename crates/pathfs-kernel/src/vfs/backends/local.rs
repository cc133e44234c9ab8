//! Local filesystem backend.
//!
//! Serves the `.` namespace from a directory on disk. Nothing is cached:
//! every call goes back to the OS.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Weak;
use std::thread;
use std::time::{Duration, Instant};

use super::watcher::{ChangeSink, DirWatcher};
use crate::vfs::error::{VfsError, VfsResult};
use crate::vfs::path::LOCAL_ROOT;
use crate::vfs::types::{LocalStat, OpenMode};

/// An open local file.
pub trait LocalFile: Send {
    /// Current size in bytes.
    fn size(&self) -> VfsResult<u64>;

    /// Fill `buf` from `offset`. Short files are an error.
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> VfsResult<()>;

    /// Write all of `data` at `offset`, growing the file if needed.
    fn write_at(&mut self, offset: u64, data: &[u8]) -> VfsResult<()>;

    /// Write all of `data` at the current end of the file.
    fn append(&mut self, data: &[u8]) -> VfsResult<()>;
}

/// OS hooks for the `.` namespace.
///
/// Paths are resolved `.`-notation strings.
pub trait LocalBackend: Send + Sync {
    /// Stat a path. A missing path is `exists == false`, not an error.
    fn stat(&self, path: &str) -> VfsResult<LocalStat>;

    /// Names of the direct children: folders, then files, each sorted.
    fn list_children(&self, path: &str) -> VfsResult<(Vec<String>, Vec<String>)>;

    /// Create a file or folder. The parent must exist.
    fn create(&self, path: &str, is_folder: bool) -> VfsResult<()>;

    /// Delete a file or an empty folder.
    fn delete(&self, path: &str) -> VfsResult<()>;

    /// Rename a file or folder.
    fn rename(&self, from: &str, to: &str) -> VfsResult<()>;

    /// Open a file, retrying every `retry_interval` while the OS denies
    /// access, for at most `max_timeout`.
    fn open(
        &self,
        path: &str,
        mode: OpenMode,
        max_timeout: Duration,
        retry_interval: Duration,
    ) -> VfsResult<Box<dyn LocalFile>>;

    /// Start delivering native change events for `dir` to `sink`.
    fn start_watch(&self, dir: &str, sink: Weak<dyn ChangeSink>) -> VfsResult<()>;

    /// Stop watching `dir`. Returns false if it wasn't watched.
    fn stop_watch(&self, dir: &str) -> bool;
}

/// [`LocalBackend`] on top of `std::fs` and `notify`.
///
/// All paths are relative to `root`. For example, if `root` is
/// `/home/amy/project`, then `./src/main.rs` is
/// `/home/amy/project/src/main.rs`.
pub struct DiskBackend {
    root: PathBuf,
    watch_wait: Duration,
    watchers: Mutex<HashMap<String, DirWatcher>>,
}

impl DiskBackend {
    /// Create a backend rooted at an existing directory.
    ///
    /// The root is canonicalized so watcher paths can be mapped back
    /// (e.g. macOS `/tmp` → `/private/tmp`).
    pub fn new(root: impl AsRef<Path>) -> VfsResult<Self> {
        let root = root.as_ref();
        let root = dunce::canonicalize(root)
            .map_err(|e| VfsError::from_io(e, &root.display().to_string()))?;
        if !root.is_dir() {
            return Err(VfsError::illegal(format!(
                "local root {} is not a directory",
                root.display()
            )));
        }
        Ok(Self {
            root,
            watch_wait: Duration::from_millis(1000),
            watchers: Mutex::new(HashMap::new()),
        })
    }

    /// How long a watcher thread blocks before re-checking its stop flag.
    pub fn with_watch_wait(mut self, wait: Duration) -> Self {
        self.watch_wait = wait;
        self
    }

    /// Get the root path.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directories currently being watched.
    pub fn watched(&self) -> Vec<String> {
        let mut dirs: Vec<_> = self.watchers.lock().keys().cloned().collect();
        dirs.sort();
        dirs
    }

    /// OS path for a resolved `.` path.
    pub fn full_path(&self, path: &str) -> VfsResult<PathBuf> {
        if path == LOCAL_ROOT {
            return Ok(self.root.clone());
        }
        match path.strip_prefix("./") {
            Some(rel) if !rel.is_empty() => Ok(self.root.join(rel)),
            _ => Err(VfsError::invalid_path(path)),
        }
    }
}

impl std::fmt::Debug for DiskBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskBackend")
            .field("root", &self.root)
            .field("watch_wait", &self.watch_wait)
            .field("watched", &self.watched())
            .finish()
    }
}

impl LocalBackend for DiskBackend {
    fn stat(&self, path: &str) -> VfsResult<LocalStat> {
        let full = self.full_path(path)?;
        match fs::metadata(&full) {
            Ok(meta) => Ok(LocalStat {
                exists: true,
                is_folder: meta.is_dir(),
                size: if meta.is_dir() { 0 } else { meta.len() },
                mtime: meta.modified().unwrap_or(std::time::SystemTime::UNIX_EPOCH),
                read_only: meta.permissions().readonly(),
            }),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(LocalStat::missing()),
            Err(e) => Err(VfsError::from_io(e, path)),
        }
    }

    fn list_children(&self, path: &str) -> VfsResult<(Vec<String>, Vec<String>)> {
        let full = self.full_path(path)?;
        let mut folders = Vec::new();
        let mut files = Vec::new();

        for entry in fs::read_dir(&full).map_err(|e| VfsError::from_io(e, path))? {
            let entry = entry.map_err(|e| VfsError::from_io(e, path))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let is_dir = entry
                .file_type()
                .map_err(|e| VfsError::from_io(e, path))?
                .is_dir();
            if is_dir {
                folders.push(name);
            } else {
                files.push(name);
            }
        }

        folders.sort();
        files.sort();
        Ok((folders, files))
    }

    fn create(&self, path: &str, is_folder: bool) -> VfsResult<()> {
        let full = self.full_path(path)?;
        let result = if is_folder {
            fs::create_dir(&full)
        } else {
            OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&full)
                .map(drop)
        };
        result.map_err(|e| VfsError::from_io(e, path))
    }

    fn delete(&self, path: &str) -> VfsResult<()> {
        let full = self.full_path(path)?;
        let meta = fs::symlink_metadata(&full).map_err(|e| VfsError::from_io(e, path))?;
        let result = if meta.is_dir() {
            fs::remove_dir(&full)
        } else {
            fs::remove_file(&full)
        };
        result.map_err(|e| VfsError::from_io(e, path))
    }

    fn rename(&self, from: &str, to: &str) -> VfsResult<()> {
        let from_full = self.full_path(from)?;
        let to_full = self.full_path(to)?;
        fs::rename(&from_full, &to_full).map_err(|e| VfsError::from_io(e, from))
    }

    fn open(
        &self,
        path: &str,
        mode: OpenMode,
        max_timeout: Duration,
        retry_interval: Duration,
    ) -> VfsResult<Box<dyn LocalFile>> {
        let full = self.full_path(path)?;
        let mut options = OpenOptions::new();
        options.read(true);
        if mode == OpenMode::ReadWrite {
            options.write(true);
        }

        let file = retry_open(path, || options.open(&full), max_timeout, retry_interval)?;
        Ok(Box::new(DiskFile { file }))
    }

    fn start_watch(&self, dir: &str, sink: Weak<dyn ChangeSink>) -> VfsResult<()> {
        let mut watchers = self.watchers.lock();
        if watchers.contains_key(dir) {
            return Ok(());
        }
        let os_dir = self.full_path(dir)?;
        let watcher = DirWatcher::spawn(
            self.root.clone(),
            dir.to_string(),
            &os_dir,
            sink,
            self.watch_wait,
        )?;
        watchers.insert(dir.to_string(), watcher);
        Ok(())
    }

    fn stop_watch(&self, dir: &str) -> bool {
        // Joining happens in DirWatcher::drop, after the map lock is released.
        let watcher = self.watchers.lock().remove(dir);
        watcher.is_some()
    }
}

/// Call `open` until it succeeds, fails for good, or `max_timeout` passes
/// with the file still held elsewhere.
fn retry_open<T>(
    path: &str,
    mut open: impl FnMut() -> io::Result<T>,
    max_timeout: Duration,
    retry_interval: Duration,
) -> VfsResult<T> {
    let deadline = Instant::now() + max_timeout;
    loop {
        match open() {
            Ok(file) => return Ok(file),
            Err(e) if is_sharing_denial(&e) => {
                let now = Instant::now();
                if now >= deadline {
                    tracing::debug!(path = %path, "open timed out");
                    return Err(VfsError::permission_denied(path));
                }
                thread::sleep(retry_interval.min(deadline - now));
            }
            Err(e) => return Err(VfsError::from_io(e, path)),
        }
    }
}

/// Access denials the OS may lift on its own. On Windows that is another
/// process holding the file (sharing or lock violation). Elsewhere a
/// permission error comes from mode bits and is final.
fn is_sharing_denial(err: &io::Error) -> bool {
    if err.kind() == io::ErrorKind::WouldBlock {
        return true;
    }
    cfg!(windows)
        && (err.kind() == io::ErrorKind::PermissionDenied
            || matches!(err.raw_os_error(), Some(32 | 33)))
}

struct DiskFile {
    file: File,
}

impl LocalFile for DiskFile {
    fn size(&self) -> VfsResult<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> VfsResult<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(buf).map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                VfsError::out_of_bounds(format!("{} bytes at offset {offset}", buf.len()))
            } else {
                e.into()
            }
        })
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> VfsResult<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(data)?;
        self.file.flush()?;
        Ok(())
    }

    fn append(&mut self, data: &[u8]) -> VfsResult<()> {
        self.file.seek(SeekFrom::End(0))?;
        self.file.write_all(data)?;
        self.file.flush()?;
        Ok(())
    }
}
