//! The `.` namespace against a real directory.

use parking_lot::Mutex;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use pathfs_kernel::vfs::{DiskBackend, SystemClock};
use pathfs_kernel::{
    ChangeKind, FileAccess, FileRecord, FileSystem, FsConfig, FsView, VfsError, APPEND,
};
use tempfile::TempDir;

type Events = Arc<Mutex<Vec<(ChangeKind, String)>>>;

fn local_fs(config: FsConfig) -> (TempDir, Arc<FileSystem>) {
    // Watcher start/stop and skipped echoes show up with --nocapture.
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .with_test_writer()
        .try_init();

    let dir = TempDir::new().unwrap();
    let backend = DiskBackend::new(dir.path())
        .unwrap()
        .with_watch_wait(config.watch_wait());
    let fs = FileSystem::new(config, Arc::new(backend), Arc::new(SystemClock)).unwrap();
    (dir, fs)
}

fn fast_watch() -> FsConfig {
    FsConfig {
        watch_wait_ms: 50,
        echo_window_ms: 2000,
        ..FsConfig::default()
    }
}

fn watch(fs: &FileSystem, dir: &str) -> Events {
    let events: Events = Arc::default();
    let sink = Arc::clone(&events);
    fs.on_change(dir, move |_: &FsView<'_>, rec: &FileRecord, kind: ChangeKind| {
        sink.lock().push((kind, rec.path.clone()));
    })
    .unwrap();
    events
}

fn wait_for(events: &Events, what: impl Fn(&[(ChangeKind, String)]) -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if what(&events.lock()) {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    false
}

#[test]
fn add_write_read_roundtrip() {
    let (dir, fs) = local_fs(FsConfig::default());

    fs.add("./notes/today.txt", false).unwrap();
    assert!(dir.path().join("notes").is_dir());

    fs.write("./notes/today.txt", b"hello world", 0, 0, APPEND)
        .unwrap();
    fs.write("./notes/today.txt", b"W", 0, 0, 6).unwrap();
    assert_eq!(
        std::fs::read(dir.path().join("notes/today.txt")).unwrap(),
        b"hello World"
    );

    let mut buf = Vec::new();
    fs.read("./notes/today.txt", &mut buf, 5, 6).unwrap();
    assert_eq!(buf, b"World");
    assert!(matches!(
        fs.read("./notes/today.txt", &mut buf, 1, 11),
        Err(VfsError::OutOfBounds(_))
    ));
    assert!(matches!(
        fs.write("./notes/today.txt", b"x", 0, 0, 12),
        Err(VfsError::OutOfBounds(_))
    ));

    let rec = fs.get("./notes/today.txt").unwrap();
    assert_eq!(rec.size, 11);
    assert_eq!(rec.name, "today.txt");
    assert!(!rec.is_virtual());
    assert_eq!(rec.handle, 0);
    assert!(fs.region_exists("./notes/today.txt", 11, 0));
}

#[test]
fn local_records_are_not_cached() {
    let (dir, fs) = local_fs(FsConfig::default());
    std::fs::write(dir.path().join("a.txt"), b"12345").unwrap();
    assert_eq!(fs.get("./a.txt").unwrap().size, 5);

    std::fs::write(dir.path().join("a.txt"), b"1234567890").unwrap();
    assert_eq!(fs.get("./a.txt").unwrap().size, 10);

    std::fs::remove_file(dir.path().join("a.txt")).unwrap();
    assert!(!fs.exists("./a.txt"));
    assert!(matches!(fs.handle_of("./a.txt"), Err(VfsError::NotSupported(_))));
}

#[test]
fn remove_is_deepest_first() {
    let (dir, fs) = local_fs(FsConfig::default());
    std::fs::create_dir_all(dir.path().join("tree/sub")).unwrap();
    std::fs::write(dir.path().join("tree/sub/leaf.txt"), b"").unwrap();
    std::fs::write(dir.path().join("tree/top.txt"), b"").unwrap();

    let fs_events: Events = Arc::default();
    {
        // Virtual registration: no watcher, only the core's own notifications.
        let sink = Arc::clone(&fs_events);
        fs.on_change("~", move |_: &FsView<'_>, rec: &FileRecord, kind: ChangeKind| {
            sink.lock().push((kind, rec.path.clone()));
        })
        .unwrap();
    }

    fs.remove("./tree").unwrap();
    assert!(!dir.path().join("tree").exists());
    assert_eq!(
        *fs_events.lock(),
        [
            (ChangeKind::Del, "./tree/sub/leaf.txt".to_string()),
            (ChangeKind::Del, "./tree/sub".to_string()),
            (ChangeKind::Del, "./tree/top.txt".to_string()),
            (ChangeKind::Del, "./tree".to_string()),
        ]
    );
}

#[test]
fn listing_matches_virtual_order() {
    let (dir, fs) = local_fs(FsConfig::default());
    std::fs::write(dir.path().join("b.txt"), b"").unwrap();
    std::fs::create_dir(dir.path().join("zeta")).unwrap();
    std::fs::create_dir(dir.path().join("alpha")).unwrap();
    std::fs::write(dir.path().join("zeta/inner.txt"), b"").unwrap();

    let paths: Vec<_> = fs
        .list(".", true)
        .unwrap()
        .into_iter()
        .map(|r| r.path)
        .collect();
    assert_eq!(paths, ["./alpha", "./zeta", "./b.txt", "./zeta/inner.txt"]);
}

#[test]
fn move_within_folder_only() {
    let (dir, fs) = local_fs(FsConfig::default());
    fs.add("./d/old.txt", false).unwrap();
    fs.add("./e", true).unwrap();

    fs.move_to("./d/old.txt", "./d/new.txt").unwrap();
    assert!(dir.path().join("d/new.txt").exists());
    assert!(!dir.path().join("d/old.txt").exists());

    assert!(matches!(
        fs.move_to("./d/new.txt", "./e/new.txt"),
        Err(VfsError::NotSupported(_))
    ));
}

#[test]
fn read_only_files_reject_writes() {
    let (dir, fs) = local_fs(FsConfig::default());
    let path = dir.path().join("locked.txt");
    std::fs::write(&path, b"x").unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_readonly(true);
    std::fs::set_permissions(&path, perms).unwrap();

    let rec = fs.get("./locked.txt").unwrap();
    assert_eq!(rec.access, FileAccess::read_only());
    assert!(matches!(
        fs.write("./locked.txt", b"y", 0, 0, APPEND),
        Err(VfsError::PermissionDenied(_))
    ));
    assert!(matches!(fs.remove("./locked.txt"), Err(VfsError::Illegal(_))));
}

#[test]
fn watcher_reports_external_changes() {
    let (dir, fs) = local_fs(fast_watch());
    std::fs::create_dir(dir.path().join("watched")).unwrap();
    let events = watch(&fs, "./watched");

    std::fs::write(dir.path().join("watched/new.txt"), b"from outside").unwrap();
    assert!(wait_for(&events, |ev| ev
        .iter()
        .any(|(k, p)| *k == ChangeKind::Add && p == "./watched/new.txt")));

    std::fs::remove_file(dir.path().join("watched/new.txt")).unwrap();
    assert!(wait_for(&events, |ev| ev
        .iter()
        .any(|(k, p)| *k == ChangeKind::Del && p == "./watched/new.txt")));

    assert!(fs.remove_file_change_callback("./watched").unwrap());
}

#[test]
fn own_changes_are_not_echoed() {
    let (_dir, fs) = local_fs(fast_watch());
    fs.add("./w", true).unwrap();
    let events = watch(&fs, "./w");

    fs.add("./w/mine.txt", false).unwrap();
    // Give the watcher time to see the OS event.
    thread::sleep(Duration::from_millis(500));

    let adds = events
        .lock()
        .iter()
        .filter(|(k, p)| *k == ChangeKind::Add && p == "./w/mine.txt")
        .count();
    assert_eq!(adds, 1);
}

#[test]
fn dropping_the_file_system_stops_watchers() {
    let (dir, fs) = local_fs(fast_watch());
    std::fs::create_dir(dir.path().join("w")).unwrap();
    let events = watch(&fs, "./w");
    drop(fs);

    std::fs::write(dir.path().join("w/late.txt"), b"").unwrap();
    thread::sleep(Duration::from_millis(300));
    assert!(events.lock().is_empty());
}

#[test]
fn local_namespace_can_be_disabled() {
    let (_dir, fs) = local_fs(FsConfig {
        allow_local: false,
        ..FsConfig::default()
    });
    assert!(matches!(fs.add("./x", false), Err(VfsError::NotSupported(_))));
    assert!(matches!(fs.list(".", false), Err(VfsError::NotSupported(_))));
    fs.add("~/x", false).unwrap();
}
