//! Directory watcher threads.
//!
//! Each watched directory gets a `notify` watcher feeding a channel and a
//! dedicated thread draining it. The thread waits with a bounded timeout so
//! it notices a stop request within one wait period, translates native
//! events into [`ExternalChange`]s and hands them to the file system, which
//! applies them under its own lock.

use notify::event::{CreateKind, ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::vfs::error::{VfsError, VfsResult};
use crate::vfs::path::{join, LOCAL_ROOT};

/// A change observed by a watcher, in `.` notation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ExternalChange {
    Added { path: String, is_folder: bool },
    Removed { path: String },
    Modified { path: String },
    Renamed { from: String, to: String },
    /// Events were lost; the whole directory has to be resynced.
    Rescan { dir: String },
}

impl ExternalChange {
    /// Primary path the change refers to.
    pub fn path(&self) -> &str {
        match self {
            ExternalChange::Added { path, .. }
            | ExternalChange::Removed { path }
            | ExternalChange::Modified { path } => path,
            ExternalChange::Renamed { to, .. } => to,
            ExternalChange::Rescan { dir } => dir,
        }
    }
}

/// Mutation entry point the watcher threads call into.
pub trait ChangeSink: Send + Sync {
    fn apply_external(&self, change: ExternalChange) -> VfsResult<()>;
}

/// Remembers paths the file system itself just touched, so the watcher's
/// echo of that same change isn't delivered a second time.
///
/// Also drops a change that repeats the last change seen for its path,
/// which happens when recursive watchers overlap. Any other change to the
/// path replaces the entry, so an add, remove, add sequence is kept whole.
#[derive(Debug)]
pub(crate) struct EchoFilter {
    window: Duration,
    recent: HashMap<String, Instant>,
    last: HashMap<String, (ExternalChange, Instant)>,
}

impl EchoFilter {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            recent: HashMap::new(),
            last: HashMap::new(),
        }
    }

    pub fn mark(&mut self, path: &str) {
        let now = Instant::now();
        let window = self.window;
        self.recent.retain(|_, at| now.duration_since(*at) < window);
        self.recent.insert(path.to_string(), now);
        self.last.remove(path);
    }

    pub fn is_echo(&self, path: &str) -> bool {
        self.recent
            .get(path)
            .is_some_and(|at| at.elapsed() < self.window)
    }

    pub fn is_repeat(&mut self, change: &ExternalChange) -> bool {
        let now = Instant::now();
        let window = self.window;
        self.last
            .retain(|_, (_, at)| now.duration_since(*at) < window);

        let repeat = self
            .last
            .get(change.path())
            .is_some_and(|(previous, _)| previous == change);
        if let ExternalChange::Renamed { from, .. } = change {
            self.last.insert(from.clone(), (change.clone(), now));
        }
        self.last
            .insert(change.path().to_string(), (change.clone(), now));
        repeat
    }
}

/// A running watcher for one directory.
pub(crate) struct DirWatcher {
    dir: String,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
    _watcher: RecommendedWatcher,
}

impl DirWatcher {
    /// Start watching `os_dir` (the OS path of the resolved `dir`).
    pub fn spawn(
        root: PathBuf,
        dir: String,
        os_dir: &Path,
        sink: Weak<dyn ChangeSink>,
        wait: Duration,
    ) -> VfsResult<Self> {
        let (tx, rx) = mpsc::channel::<notify::Result<Event>>();

        let mut watcher = RecommendedWatcher::new(
            move |result: notify::Result<Event>| {
                let _ = tx.send(result);
            },
            notify::Config::default(),
        )
        .map_err(|e| VfsError::watch(format!("failed to create watcher: {e}")))?;

        watcher
            .watch(os_dir, RecursiveMode::Recursive)
            .map_err(|e| VfsError::watch(format!("failed to watch {}: {e}", os_dir.display())))?;

        let running = Arc::new(AtomicBool::new(true));
        let thread = thread::Builder::new()
            .name(format!("pathfs-watch:{dir}"))
            .spawn({
                let running = Arc::clone(&running);
                let dir = dir.clone();
                move || watch_loop(&root, &dir, &rx, &sink, &running, wait)
            })?;

        tracing::info!(dir = %dir, "watcher started");
        Ok(Self {
            dir,
            running,
            thread: Some(thread),
            _watcher: watcher,
        })
    }

    /// Signal the thread and wait for it to leave its loop.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            // The last file system reference can be dropped on the watcher
            // thread itself; joining there would never return.
            if thread.thread().id() == thread::current().id() {
                return;
            }
            if thread.join().is_err() {
                tracing::warn!(dir = %self.dir, "watcher thread panicked");
            }
            tracing::info!(dir = %self.dir, "watcher stopped");
        }
    }
}

impl Drop for DirWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

fn watch_loop(
    root: &Path,
    dir: &str,
    rx: &mpsc::Receiver<notify::Result<Event>>,
    sink: &Weak<dyn ChangeSink>,
    running: &AtomicBool,
    wait: Duration,
) {
    while running.load(Ordering::Acquire) {
        let changes = match rx.recv_timeout(wait) {
            Ok(Ok(event)) => translate(root, dir, &event),
            Ok(Err(e)) => {
                tracing::warn!(dir = %dir, error = %e, "watcher error, resyncing");
                vec![ExternalChange::Rescan {
                    dir: dir.to_string(),
                }]
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };

        if !running.load(Ordering::Acquire) {
            break;
        }
        let Some(sink) = sink.upgrade() else {
            break;
        };
        for change in changes {
            if let Err(e) = sink.apply_external(change.clone()) {
                tracing::warn!(change = ?change, error = %e, "failed to apply external change");
            }
        }
    }
}

/// Map an absolute OS path under `root` into `.` notation.
pub(crate) fn to_local_path(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let mut out = LOCAL_ROOT.to_string();
    for component in rel.components() {
        out = join(&out, &component.as_os_str().to_string_lossy());
    }
    Some(out)
}

/// Translate one native event into changes.
pub(crate) fn translate(root: &Path, dir: &str, event: &Event) -> Vec<ExternalChange> {
    if event.need_rescan() {
        return vec![ExternalChange::Rescan {
            dir: dir.to_string(),
        }];
    }

    let paths: Vec<(String, &PathBuf)> = event
        .paths
        .iter()
        .filter_map(|p| to_local_path(root, p).map(|local| (local, p)))
        .collect();

    match event.kind {
        EventKind::Create(kind) => paths
            .into_iter()
            .map(|(path, os)| ExternalChange::Added {
                path,
                is_folder: matches!(kind, CreateKind::Folder) || os.is_dir(),
            })
            .collect(),
        EventKind::Remove(_) => paths
            .into_iter()
            .map(|(path, _)| ExternalChange::Removed { path })
            .collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if paths.len() == 2 => {
            let mut it = paths.into_iter();
            match (it.next(), it.next()) {
                (Some((from, _)), Some((to, _))) => vec![ExternalChange::Renamed { from, to }],
                _ => Vec::new(),
            }
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => paths
            .into_iter()
            .map(|(path, _)| ExternalChange::Removed { path })
            .collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => paths
            .into_iter()
            .map(|(path, os)| ExternalChange::Added {
                path,
                is_folder: os.is_dir(),
            })
            .collect(),
        EventKind::Modify(_) => paths
            .into_iter()
            .map(|(path, _)| ExternalChange::Modified { path })
            .collect(),
        _ => Vec::new(),
    }
}
