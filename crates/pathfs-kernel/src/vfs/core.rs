//! The file system: one entry point for both namespaces.
//!
//! Every path is resolved first, then routed by its root: `~` goes to the
//! in-memory [`FileTree`], `.` to the [`LocalBackend`]. All tree mutations
//! and all change notifications happen under a single mutex, so an
//! observer never sees an index shift half applied.
//!
//! ```text
//!   caller ──► FileSystem::op ──► lock ──► FsGuard::op ──► tree / backend
//!                                               │
//!   watcher thread ──► apply_external ──► lock ─┘──► callbacks (FsView)
//! ```

use parking_lot::{Mutex, MutexGuard};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};

use super::backends::{ChangeSink, DiskBackend, EchoFilter, ExternalChange, LocalBackend, LocalFile};
use super::callback::{CallbackTable, FileChangeHandler, FsView};
use super::clock::{Clock, SystemClock};
use super::error::{fatal, VfsError, VfsResult};
use super::path::{join, resolve, split_parent, Namespace};
use super::seed;
use super::tree::FileTree;
use super::types::{ChangeKind, FileHandle, FileRecord, LocalStat, OpenMode, APPEND};
use crate::config::FsConfig;

struct State {
    tree: FileTree,
    callbacks: CallbackTable,
    echo: EchoFilter,
}

/// Unified file system over the `~` and `.` namespaces.
///
/// Every operation takes the lock for its whole duration, including local
/// I/O. Use [`lock`](Self::lock) to run several operations as one unit.
pub struct FileSystem {
    state: Mutex<State>,
    /// Thread currently holding `state`, to catch re-entry from a callback.
    holder: Mutex<Option<ThreadId>>,
    local: Arc<dyn LocalBackend>,
    clock: Arc<dyn Clock>,
    config: FsConfig,
    me: Weak<FileSystem>,
}

impl std::fmt::Debug for FileSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileSystem")
            .field("config", &self.config)
            .field("state", &"<locked>")
            .finish()
    }
}

impl FileSystem {
    /// Create a file system from its collaborators.
    ///
    /// If `config.virtual_seed` is set, that directory is imported into `~`
    /// before anything can observe the tree; no notifications are fired.
    pub fn new(
        config: FsConfig,
        local: Arc<dyn LocalBackend>,
        clock: Arc<dyn Clock>,
    ) -> VfsResult<Arc<Self>> {
        let mut tree = FileTree::new(config.virtual_access, clock.now());
        if let Some(source) = &config.virtual_seed {
            let added = seed::import(&mut tree, source)?;
            tracing::info!(source = %source.display(), records = added, "seeded virtual namespace");
        }

        let echo = EchoFilter::new(config.echo_window());
        Ok(Arc::new_cyclic(|me| Self {
            state: Mutex::new(State {
                tree,
                callbacks: CallbackTable::default(),
                echo,
            }),
            holder: Mutex::new(None),
            local,
            clock,
            config,
            me: me.clone(),
        }))
    }

    /// File system with `.` on disk at `config.local_root` and the wall clock.
    pub fn open_default(config: FsConfig) -> VfsResult<Arc<Self>> {
        let local = DiskBackend::new(&config.local_root)?.with_watch_wait(config.watch_wait());
        Self::new(config, Arc::new(local), Arc::new(SystemClock))
    }

    pub fn config(&self) -> &FsConfig {
        &self.config
    }

    /// Take the lock. Operations on the guard don't lock again; dropping
    /// it unlocks.
    ///
    /// Locking twice on one thread is a fatal error, not a deadlock.
    pub fn lock(&self) -> FsGuard<'_> {
        let current = thread::current().id();
        if *self.holder.lock() == Some(current) {
            fatal("file system lock re-entered on the thread that holds it");
        }
        let state = self.state.lock();
        *self.holder.lock() = Some(current);
        FsGuard { fs: self, state }
    }

    pub fn exists(&self, path: &str) -> bool {
        self.lock().exists(path)
    }

    pub fn get(&self, path: &str) -> VfsResult<FileRecord> {
        self.lock().get(path)
    }

    pub fn get_handle(&self, handle: FileHandle) -> VfsResult<FileRecord> {
        self.lock().get_handle(handle)
    }

    pub fn handle_of(&self, path: &str) -> VfsResult<FileHandle> {
        self.lock().handle_of(path)
    }

    pub fn region_exists(&self, path: &str, size: u64, offset: u64) -> bool {
        self.lock().region_exists(path, size, offset)
    }

    pub fn read(&self, path: &str, buffer: &mut Vec<u8>, size: u64, offset: u64) -> VfsResult<()> {
        self.lock().read(path, buffer, size, offset)
    }

    pub fn write(
        &self,
        path: &str,
        buffer: &[u8],
        size: u64,
        buffer_offset: usize,
        file_offset: u64,
    ) -> VfsResult<()> {
        self.lock().write(path, buffer, size, buffer_offset, file_offset)
    }

    pub fn add(&self, path: &str, is_folder: bool) -> VfsResult<()> {
        self.lock().add(path, is_folder)
    }

    pub fn remove(&self, path: &str) -> VfsResult<()> {
        self.lock().remove(path)
    }

    pub fn update(&self, path: &str) -> VfsResult<()> {
        self.lock().update(path)
    }

    pub fn move_to(&self, from: &str, to: &str) -> VfsResult<()> {
        self.lock().move_to(from, to)
    }

    pub fn for_each_file<F>(&self, path: &str, recurse: bool, f: F) -> VfsResult<()>
    where
        F: FnMut(&FsView<'_>, &FileRecord),
    {
        self.lock().for_each_file(path, recurse, f)
    }

    pub fn list(&self, path: &str, recurse: bool) -> VfsResult<Vec<FileRecord>> {
        self.lock().list(path, recurse)
    }

    /// Number of records in the virtual tree, root included.
    pub fn virtual_len(&self) -> usize {
        self.lock().virtual_len()
    }

    /// Register `handler` for changes reported for `dir`.
    ///
    /// One registration per directory. The directory must exist and be a
    /// folder. For a local directory this also starts its watcher.
    pub fn add_file_change_callback(
        &self,
        dir: &str,
        handler: Arc<dyn FileChangeHandler>,
    ) -> VfsResult<()> {
        let (dir, ns) = self.route(dir)?;
        let mut guard = self.lock();

        let record = guard.get(&dir)?;
        if !record.is_folder {
            return Err(VfsError::illegal(format!("{dir} is not a folder")));
        }
        if !guard.state.callbacks.insert(dir.clone(), handler) {
            return Err(VfsError::illegal(format!("{dir} already has a change callback")));
        }

        if ns == Namespace::Local {
            let sink: Weak<dyn ChangeSink> = self.me.clone();
            if let Err(e) = self.local.start_watch(&dir, sink) {
                guard.state.callbacks.remove(&dir);
                return Err(e);
            }
        }

        tracing::debug!(dir = %dir, registrations = guard.state.callbacks.len(), "change callback added");
        Ok(())
    }

    /// [`add_file_change_callback`](Self::add_file_change_callback) for a closure.
    pub fn on_change<F>(&self, dir: &str, handler: F) -> VfsResult<()>
    where
        F: Fn(&FsView<'_>, &FileRecord, ChangeKind) + Send + Sync + 'static,
    {
        self.add_file_change_callback(dir, Arc::new(handler))
    }

    /// Drop the registration for `dir`, stopping its watcher. Returns false
    /// if nothing was registered.
    pub fn remove_file_change_callback(&self, dir: &str) -> VfsResult<bool> {
        let (dir, ns) = self.route(dir)?;
        let removed = self.lock().state.callbacks.remove(&dir);
        // The watcher thread may be waiting for the lock; join it after
        // the guard is gone.
        if removed && ns == Namespace::Local {
            self.local.stop_watch(&dir);
        }
        if removed {
            tracing::debug!(dir = %dir, "change callback removed");
        }
        Ok(removed)
    }

    /// Directories that currently have a change callback.
    pub fn callback_dirs(&self) -> Vec<String> {
        self.lock().state.callbacks.dirs().map(str::to_string).collect()
    }

    pub fn has_change_callback(&self, dir: &str) -> bool {
        match self.route(dir) {
            Ok((dir, _)) => self.lock().state.callbacks.contains(&dir),
            Err(_) => false,
        }
    }

    fn route(&self, path: &str) -> VfsResult<(String, Namespace)> {
        let resolved = resolve(path)?;
        let ns = Namespace::of(&resolved);
        if ns == Namespace::Local && !self.config.allow_local {
            return Err(VfsError::not_supported(format!(
                "local files are disabled: {resolved}"
            )));
        }
        Ok((resolved, ns))
    }

    fn local_view(&self) -> Option<&dyn LocalBackend> {
        self.config.allow_local.then_some(&*self.local)
    }

    fn local_record(&self, path: &str) -> VfsResult<FileRecord> {
        let stat = self.local.stat(path)?;
        if !stat.exists {
            return Err(VfsError::not_found(path));
        }
        Ok(FileRecord::local(path, &stat))
    }

    fn open_local(&self, path: &str, mode: OpenMode) -> VfsResult<Box<dyn LocalFile>> {
        self.local
            .open(path, mode, self.config.open_timeout(), self.config.open_retry())
    }
}

impl ChangeSink for FileSystem {
    fn apply_external(&self, change: ExternalChange) -> VfsResult<()> {
        self.lock().apply_external(change)
    }
}

impl Drop for FileSystem {
    fn drop(&mut self) {
        let local_dirs: Vec<String> = self
            .state
            .get_mut()
            .callbacks
            .dirs()
            .filter(|dir| !Namespace::of(dir).is_virtual())
            .map(str::to_string)
            .collect();
        for dir in local_dirs {
            self.local.stop_watch(&dir);
        }
    }
}

/// The file system with its lock held.
///
/// Exposes the same data operations as [`FileSystem`]. Callback
/// registration stays on `FileSystem`, since removing one joins a watcher
/// thread that may be waiting for this very lock.
pub struct FsGuard<'a> {
    fs: &'a FileSystem,
    state: MutexGuard<'a, State>,
}

impl Drop for FsGuard<'_> {
    fn drop(&mut self) {
        *self.fs.holder.lock() = None;
    }
}

impl FsGuard<'_> {
    /// The virtual tree as it stands.
    pub fn tree(&self) -> &FileTree {
        &self.state.tree
    }

    pub fn virtual_len(&self) -> usize {
        self.state.tree.len()
    }

    /// Whether the path resolves and exists. Invalid paths don't exist.
    pub fn exists(&self, path: &str) -> bool {
        match self.fs.route(path) {
            Ok((path, ns)) => self.exists_resolved(&path, ns).unwrap_or(false),
            Err(_) => false,
        }
    }

    pub fn get(&self, path: &str) -> VfsResult<FileRecord> {
        let (path, ns) = self.fs.route(path)?;
        match ns {
            Namespace::Virtual => self.state.tree.get_path(&path).cloned(),
            Namespace::Local => self.fs.local_record(&path),
        }
    }

    pub fn get_handle(&self, handle: FileHandle) -> VfsResult<FileRecord> {
        self.state
            .tree
            .get(handle)
            .cloned()
            .ok_or_else(|| VfsError::not_found(format!("handle {handle}")))
    }

    /// Handle of a virtual path. Local files have none.
    pub fn handle_of(&self, path: &str) -> VfsResult<FileHandle> {
        let (path, ns) = self.fs.route(path)?;
        match ns {
            Namespace::Virtual => self
                .state
                .tree
                .lookup(&path)
                .ok_or_else(|| VfsError::not_found(path)),
            Namespace::Local => Err(VfsError::not_supported(format!(
                "local files have no handle: {path}"
            ))),
        }
    }

    /// Whether `[offset, offset + size)` lies inside an existing file.
    pub fn region_exists(&self, path: &str, size: u64, offset: u64) -> bool {
        self.get(path)
            .is_ok_and(|r| !r.is_folder && r.has_region(size, offset))
    }

    /// Read `size` bytes at `offset` into `buffer`, replacing its contents.
    ///
    /// `size == 0` reads everything from `offset` to the end.
    pub fn read(&self, path: &str, buffer: &mut Vec<u8>, size: u64, offset: u64) -> VfsResult<()> {
        let (path, ns) = self.fs.route(path)?;
        match ns {
            Namespace::Virtual => {
                let tree = &self.state.tree;
                let record = tree.get_path(&path)?;
                check_file(record)?;
                if !record.access.read {
                    return Err(VfsError::permission_denied(path));
                }
                let (start, len) = read_span(&path, record.size, size, offset)?;
                let data = tree
                    .data(record.handle)
                    .ok_or_else(|| VfsError::not_found(path.as_str()))?;
                buffer.clear();
                buffer.extend_from_slice(&data[start as usize..(start + len) as usize]);
            }
            Namespace::Local => {
                check_file(&self.fs.local_record(&path)?)?;
                let mut file = self.fs.open_local(&path, OpenMode::Read)?;
                let (start, len) = read_span(&path, file.size()?, size, offset)?;
                buffer.clear();
                buffer.resize(len as usize, 0);
                file.read_at(start, buffer)?;
            }
        }
        Ok(())
    }

    /// Write `size` bytes of `buffer`, starting at `buffer_offset`, to the
    /// file at `file_offset` ([`APPEND`] for the end). Fires `UPDATE`.
    ///
    /// `size == 0` writes the rest of the buffer.
    pub fn write(
        &mut self,
        path: &str,
        buffer: &[u8],
        size: u64,
        buffer_offset: usize,
        file_offset: u64,
    ) -> VfsResult<()> {
        let (path, ns) = self.fs.route(path)?;
        let data = buffer_span(buffer, size, buffer_offset)?;

        let record = match ns {
            Namespace::Virtual => {
                let now = self.fs.clock.now();
                let tree = &mut self.state.tree;
                let handle = tree.lookup(&path).ok_or_else(|| VfsError::not_found(path.as_str()))?;
                let (record, bytes) = tree
                    .data_mut(handle)
                    .ok_or_else(|| VfsError::not_found(path.as_str()))?;
                check_file(record)?;
                if !record.access.write {
                    return Err(VfsError::permission_denied(path));
                }

                let at = write_offset(&path, record.size, file_offset)?;
                let at = usize::try_from(at)
                    .map_err(|_| VfsError::out_of_bounds(format!("{path}: offset {at}")))?;
                let end = at + data.len();
                if bytes.len() < end {
                    bytes.resize(end, 0);
                }
                bytes[at..end].copy_from_slice(data);
                record.size = bytes.len() as u64;
                record.modification_time = now;
                record.clone()
            }
            Namespace::Local => {
                let record = self.fs.local_record(&path)?;
                check_file(&record)?;
                if !record.access.write {
                    return Err(VfsError::permission_denied(path));
                }

                let mut file = self.fs.open_local(&path, OpenMode::ReadWrite)?;
                if file_offset == APPEND {
                    file.append(data)?;
                } else {
                    let at = write_offset(&path, file.size()?, file_offset)?;
                    file.write_at(at, data)?;
                }
                drop(file);

                self.state.echo.mark(&path);
                self.fs.local_record(&path)?
            }
        };

        tracing::debug!(path = %record.path, bytes = data.len(), size = record.size, "wrote file");
        self.notify(&record, ChangeKind::Update);
        Ok(())
    }

    /// Create a file or folder, creating missing ancestor folders first.
    /// Fires `ADD` for everything created. Adding an existing path is a
    /// no-op.
    pub fn add(&mut self, path: &str, is_folder: bool) -> VfsResult<()> {
        let (path, ns) = self.fs.route(path)?;
        self.add_resolved(&path, ns, is_folder)
    }

    /// Remove a file or a folder with everything under it. Fires `DEL`
    /// once per removed record, children before their parent.
    pub fn remove(&mut self, path: &str) -> VfsResult<()> {
        let (path, ns) = self.fs.route(path)?;
        if split_parent(&path).is_none() {
            return Err(VfsError::illegal(format!("cannot remove the namespace root {path}")));
        }

        match ns {
            Namespace::Virtual => {
                let fs = self.fs;
                let State { tree, callbacks, .. } = &mut *self.state;
                let record = tree.get_path(&path)?;
                if !record.access.write {
                    return Err(VfsError::illegal(format!("{path} is not writable")));
                }
                let handle = record.handle;
                let local = fs.local_view();
                let scope = fs.config.callback_scope;
                tree.remove_with(handle, |tree, removed| {
                    tracing::debug!(path = %removed.path, "removed");
                    callbacks.fan_out(&FsView::new(tree, local), removed, ChangeKind::Del, scope);
                })
            }
            Namespace::Local => {
                let record = self.fs.local_record(&path)?;
                if !record.access.write {
                    return Err(VfsError::illegal(format!("{path} is not writable")));
                }
                self.remove_local(record)
            }
        }
    }

    /// Refresh a record and fire `UPDATE` for it.
    ///
    /// Virtual records get a new modification time; local ones are re-stated.
    pub fn update(&mut self, path: &str) -> VfsResult<()> {
        let (path, ns) = self.fs.route(path)?;
        let record = match ns {
            Namespace::Virtual => {
                let now = self.fs.clock.now();
                let tree = &mut self.state.tree;
                let handle = tree.lookup(&path).ok_or_else(|| VfsError::not_found(path.as_str()))?;
                let record = tree
                    .get_mut(handle)
                    .ok_or_else(|| VfsError::not_found(path.as_str()))?;
                record.modification_time = now;
                record.clone()
            }
            Namespace::Local => self.fs.local_record(&path)?,
        };
        tracing::debug!(path = %record.path, "updated");
        self.notify(&record, ChangeKind::Update);
        Ok(())
    }

    /// Rename within the same folder. Fires `MOVE` with the renamed record.
    ///
    /// Moving to another folder or namespace is `NotSupported`; moving onto
    /// an existing path is `Illegal`.
    pub fn move_to(&mut self, from: &str, to: &str) -> VfsResult<()> {
        let (from, ns) = self.fs.route(from)?;
        let (to, to_ns) = self.fs.route(to)?;
        if ns != to_ns {
            return Err(VfsError::not_supported(format!(
                "cannot move {from} to another namespace"
            )));
        }
        let (Some((from_parent, _)), Some((to_parent, _))) = (split_parent(&from), split_parent(&to))
        else {
            return Err(VfsError::illegal("cannot move a namespace root"));
        };
        if from_parent != to_parent {
            return Err(VfsError::not_supported(format!(
                "cannot move {from} to a different folder"
            )));
        }
        if !self.exists_resolved(&from, ns)? {
            return Err(VfsError::not_found(from));
        }
        if from == to {
            return Ok(());
        }
        if self.exists_resolved(&to, ns)? {
            return Err(VfsError::illegal(format!("{to} already exists")));
        }

        let record = match ns {
            Namespace::Virtual => {
                let tree = &mut self.state.tree;
                let record = tree.get_path(&from)?;
                if !record.access.write {
                    return Err(VfsError::permission_denied(from));
                }
                let handle = record.handle;
                tree.rename(handle, &to)?;
                tree.get(handle)
                    .cloned()
                    .ok_or_else(|| VfsError::not_found(to.as_str()))?
            }
            Namespace::Local => {
                let record = self.fs.local_record(&from)?;
                if !record.access.write {
                    return Err(VfsError::permission_denied(from));
                }
                self.fs.local.rename(&from, &to)?;
                self.state.echo.mark(&from);
                self.state.echo.mark(&to);
                self.fs.local_record(&to)?
            }
        };

        tracing::debug!(from = %from, to = %to, "moved");
        self.notify(&record, ChangeKind::Move);
        Ok(())
    }

    /// Call `f` for the children of the folder at `path`: folders, then
    /// files, a whole level before the next. Records without read access
    /// are skipped together with everything under them.
    pub fn for_each_file<F>(&self, path: &str, recurse: bool, mut f: F) -> VfsResult<()>
    where
        F: FnMut(&FsView<'_>, &FileRecord),
    {
        let (path, ns) = self.fs.route(path)?;
        let view = FsView::new(&self.state.tree, self.fs.local_view());
        match ns {
            Namespace::Virtual => {
                let record = self.state.tree.get_path(&path)?;
                if !record.is_folder {
                    return Err(VfsError::illegal(format!("{path} is not a folder")));
                }
                if record.access.read {
                    visit_virtual(&self.state.tree, &view, record.handle, recurse, &mut f);
                }
            }
            Namespace::Local => {
                let record = self.fs.local_record(&path)?;
                if !record.is_folder {
                    return Err(VfsError::illegal(format!("{path} is not a folder")));
                }
                visit_local(&*self.fs.local, &view, &path, recurse, &mut f)?;
            }
        }
        Ok(())
    }

    /// Snapshot of what [`for_each_file`](Self::for_each_file) would visit.
    pub fn list(&self, path: &str, recurse: bool) -> VfsResult<Vec<FileRecord>> {
        let mut out = Vec::new();
        self.for_each_file(path, recurse, |_, record| out.push(record.clone()))?;
        Ok(out)
    }

    /// Apply a change reported by a watcher.
    ///
    /// For local paths the OS has already made the change, so only the
    /// notification is fired. Virtual paths are mutated.
    pub fn apply_external(&mut self, change: ExternalChange) -> VfsResult<()> {
        let echo = &mut self.state.echo;
        let own = match &change {
            ExternalChange::Renamed { from, to } => echo.is_echo(from) || echo.is_echo(to),
            ExternalChange::Rescan { .. } => false,
            other => echo.is_echo(other.path()),
        };
        if own || echo.is_repeat(&change) {
            tracing::trace!(change = ?change, "skipping echoed change");
            return Ok(());
        }

        match change {
            ExternalChange::Added { path, is_folder } => {
                let (path, ns) = self.fs.route(&path)?;
                match ns {
                    Namespace::Virtual => self.add_resolved(&path, ns, is_folder),
                    Namespace::Local => match self.fs.local_record(&path) {
                        Ok(record) => {
                            self.notify(&record, ChangeKind::Add);
                            Ok(())
                        }
                        // Already gone again; its removal event follows.
                        Err(VfsError::NotFound(_)) => Ok(()),
                        Err(e) => Err(e),
                    },
                }
            }
            ExternalChange::Removed { path } => {
                let (path, ns) = self.fs.route(&path)?;
                match ns {
                    Namespace::Virtual => self.remove(&path),
                    Namespace::Local => {
                        self.notify(&FileRecord::local(&path, &LocalStat::missing()), ChangeKind::Del);
                        Ok(())
                    }
                }
            }
            ExternalChange::Modified { path } => {
                let (path, ns) = self.fs.route(&path)?;
                match ns {
                    Namespace::Virtual => self.update(&path),
                    Namespace::Local => match self.fs.local_record(&path) {
                        Ok(record) => {
                            self.notify(&record, ChangeKind::Update);
                            Ok(())
                        }
                        Err(VfsError::NotFound(_)) => Ok(()),
                        Err(e) => Err(e),
                    },
                }
            }
            ExternalChange::Renamed { from, to } => {
                let (to, ns) = self.fs.route(&to)?;
                match ns {
                    Namespace::Virtual => self.move_to(&from, &to),
                    Namespace::Local => match self.fs.local_record(&to) {
                        Ok(record) => {
                            self.notify(&record, ChangeKind::Move);
                            Ok(())
                        }
                        Err(VfsError::NotFound(_)) => Ok(()),
                        Err(e) => Err(e),
                    },
                }
            }
            ExternalChange::Rescan { dir } => self.rescan(&dir),
        }
    }

    /// Lost events can't be replayed, so fire `UPDATE` for the directory
    /// and everything under it.
    fn rescan(&mut self, dir: &str) -> VfsResult<()> {
        let mut records = vec![self.get(dir)?];
        if records[0].is_folder {
            records.extend(self.list(dir, true)?);
        }
        tracing::warn!(dir = %records[0].path, records = records.len(), "resyncing after lost events");
        for record in &records {
            self.notify(record, ChangeKind::Update);
        }
        Ok(())
    }

    fn exists_resolved(&self, path: &str, ns: Namespace) -> VfsResult<bool> {
        match ns {
            Namespace::Virtual => Ok(self.state.tree.lookup(path).is_some()),
            Namespace::Local => Ok(self.fs.local.stat(path)?.exists),
        }
    }

    fn add_resolved(&mut self, path: &str, ns: Namespace, is_folder: bool) -> VfsResult<()> {
        if self.exists_resolved(path, ns)? {
            return Ok(());
        }
        let Some((parent, name)) = split_parent(path) else {
            return Ok(());
        };
        if !self.exists_resolved(parent, ns)? {
            self.add_resolved(parent, ns, true)?;
        }

        let record = match ns {
            Namespace::Virtual => {
                let now = self.fs.clock.now();
                let tree = &mut self.state.tree;
                let parent_record = tree.get_path(parent)?;
                if !parent_record.access.write {
                    return Err(VfsError::permission_denied(path));
                }
                let parent_handle = parent_record.handle;
                let handle = tree.insert(parent_handle, name, is_folder, now)?;
                tree.get(handle)
                    .cloned()
                    .ok_or_else(|| VfsError::not_found(path))?
            }
            Namespace::Local => {
                let parent_record = self.fs.local_record(parent)?;
                if !parent_record.is_folder {
                    return Err(VfsError::illegal(format!("{parent} is not a folder")));
                }
                if !parent_record.access.write {
                    return Err(VfsError::permission_denied(path));
                }
                self.fs.local.create(path, is_folder)?;
                self.state.echo.mark(path);
                self.fs.local_record(path)?
            }
        };

        tracing::debug!(path = %record.path, is_folder, "added");
        self.notify(&record, ChangeKind::Add);
        Ok(())
    }

    fn remove_local(&mut self, record: FileRecord) -> VfsResult<()> {
        if record.is_folder {
            let (folders, files) = self.fs.local.list_children(&record.path)?;
            for name in folders.iter().rev().chain(files.iter().rev()) {
                let child = self.fs.local_record(&join(&record.path, name))?;
                self.remove_local(child)?;
            }
        }
        self.fs.local.delete(&record.path)?;
        self.state.echo.mark(&record.path);
        tracing::debug!(path = %record.path, "removed");
        self.notify(&record, ChangeKind::Del);
        Ok(())
    }

    fn notify(&self, record: &FileRecord, kind: ChangeKind) {
        let view = FsView::new(&self.state.tree, self.fs.local_view());
        self.state
            .callbacks
            .fan_out(&view, record, kind, self.fs.config.callback_scope);
    }
}

fn check_file(record: &FileRecord) -> VfsResult<()> {
    if record.is_folder {
        return Err(VfsError::illegal(format!("{} is a folder", record.path)));
    }
    Ok(())
}

/// Resolve `size == 0` and bounds-check a read. Returns `(offset, size)`.
fn read_span(path: &str, file_size: u64, size: u64, offset: u64) -> VfsResult<(u64, u64)> {
    let size = if size == 0 {
        file_size.saturating_sub(offset)
    } else {
        size
    };
    match offset.checked_add(size) {
        Some(end) if end <= file_size => Ok((offset, size)),
        _ => Err(VfsError::out_of_bounds(format!(
            "{path}: {size} bytes at offset {offset}, file has {file_size}"
        ))),
    }
}

/// Where a write lands. Writing may start at the end but not past it.
fn write_offset(path: &str, file_size: u64, file_offset: u64) -> VfsResult<u64> {
    if file_offset == APPEND {
        return Ok(file_size);
    }
    if file_offset > file_size {
        return Err(VfsError::out_of_bounds(format!(
            "{path}: offset {file_offset} is past the end ({file_size})"
        )));
    }
    Ok(file_offset)
}

fn buffer_span(buffer: &[u8], size: u64, buffer_offset: usize) -> VfsResult<&[u8]> {
    let out_of_bounds = || {
        VfsError::out_of_bounds(format!(
            "{size} bytes at buffer offset {buffer_offset}, buffer has {}",
            buffer.len()
        ))
    };
    let rest = buffer.len().checked_sub(buffer_offset).ok_or_else(out_of_bounds)?;
    let size = if size == 0 {
        rest
    } else {
        usize::try_from(size).map_err(|_| out_of_bounds())?
    };
    if size > rest {
        return Err(out_of_bounds());
    }
    Ok(&buffer[buffer_offset..buffer_offset + size])
}

fn visit_virtual<F>(tree: &FileTree, view: &FsView<'_>, handle: FileHandle, recurse: bool, f: &mut F)
where
    F: FnMut(&FsView<'_>, &FileRecord),
{
    let Some(dir) = tree.get(handle) else {
        return;
    };
    for child in dir.folder_start..dir.file_end {
        if let Some(record) = tree.get(child).filter(|r| r.access.read) {
            f(view, record);
        }
    }
    if recurse {
        for child in dir.folder_start..dir.file_start {
            if tree.get(child).is_some_and(|r| r.access.read) {
                visit_virtual(tree, view, child, true, f);
            }
        }
    }
}

fn visit_local<F>(
    local: &dyn LocalBackend,
    view: &FsView<'_>,
    dir: &str,
    recurse: bool,
    f: &mut F,
) -> VfsResult<()>
where
    F: FnMut(&FsView<'_>, &FileRecord),
{
    let (folders, files) = match local.list_children(dir) {
        Ok(children) => children,
        // Removed behind our back between listing and descending.
        Err(VfsError::NotFound(_)) => return Ok(()),
        Err(e) => return Err(e),
    };
    for name in folders.iter().chain(&files) {
        let path = join(dir, name);
        let stat = local.stat(&path)?;
        if stat.exists {
            f(view, &FileRecord::local(&path, &stat));
        }
    }
    if recurse {
        for name in &folders {
            visit_local(local, view, &join(dir, name), true, f)?;
        }
    }
    Ok(())
}
