//! Concurrent access and randomized mutation sequences.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::thread;

use pathfs_kernel::vfs::{DiskBackend, ManualClock};
use pathfs_kernel::{ChangeKind, FileRecord, FileSystem, FsConfig, FsView, VfsError};

fn fresh() -> Arc<FileSystem> {
    let dir = tempfile::tempdir().unwrap();
    let local = Arc::new(DiskBackend::new(dir.path()).unwrap());
    FileSystem::new(FsConfig::default(), local, Arc::new(ManualClock::default())).unwrap()
}

#[test]
fn concurrent_adds_under_unrelated_folders() {
    let fs = fresh();
    fs.add("~/left", true).unwrap();
    fs.add("~/right", true).unwrap();

    let workers: Vec<_> = ["~/left", "~/right"]
        .into_iter()
        .map(|dir| {
            let fs = Arc::clone(&fs);
            thread::spawn(move || {
                for i in 0..50 {
                    fs.add(&format!("{dir}/sub{i}"), i % 3 == 0).unwrap();
                    fs.add(&format!("{dir}/sub{}/nested", i - i % 3), false).unwrap();
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    let guard = fs.lock();
    guard.tree().check_layout().unwrap();
    for dir in ["~/left", "~/right"] {
        let rec = guard.get(dir).unwrap();
        assert_eq!(rec.child_count(), 50);
        assert_eq!(rec.folder_count(), 17);
    }
}

#[test]
fn callbacks_never_see_a_broken_tree() {
    let fs = fresh();
    fs.on_change("~", |view: &FsView<'_>, rec: &FileRecord, kind: ChangeKind| {
        view.tree().check_layout().unwrap();
        if kind != ChangeKind::Del {
            assert_eq!(view.get(&rec.path).unwrap().handle, rec.handle);
        }
    })
    .unwrap();

    let workers: Vec<_> = (0..4)
        .map(|t| {
            let fs = Arc::clone(&fs);
            thread::spawn(move || {
                for i in 0..25 {
                    let path = format!("~/t{t}/f{i}");
                    fs.add(&path, false).unwrap();
                    if i % 2 == 0 {
                        fs.remove(&path).unwrap();
                    }
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }
    assert_eq!(fs.list("~", true).unwrap().len(), 4 + 4 * 12);
}

#[test]
fn random_sequences_keep_the_layout() {
    for seed in 0..8u64 {
        let mut rng = StdRng::seed_from_u64(seed);
        let fs = fresh();
        let names = ["a", "b", "c", "d", "e"];

        for step in 0..300 {
            let mut folders: Vec<String> = fs
                .list("~", true)
                .unwrap()
                .into_iter()
                .filter(|r| r.is_folder)
                .map(|r| r.path)
                .collect();
            folders.push("~".to_string());
            let dir = folders.choose(&mut rng).unwrap().clone();
            let name = names.choose(&mut rng).unwrap();
            let path = format!("{dir}/{name}");

            let result = match rng.gen_range(0..10) {
                0..=4 => fs.add(&path, rng.gen_bool(0.4)),
                5..=7 => match fs.remove(&path) {
                    Err(VfsError::NotFound(_)) => Ok(()),
                    other => other,
                },
                _ => {
                    let to = format!("{dir}/{}", names.choose(&mut rng).unwrap());
                    match fs.move_to(&path, &to) {
                        Err(VfsError::NotFound(_)) | Err(VfsError::Illegal(_)) => Ok(()),
                        other => other,
                    }
                }
            };
            result.unwrap_or_else(|e| panic!("seed {seed} step {step}: {e}"));

            if let Err(broken) = fs.lock().tree().check_layout() {
                panic!("seed {seed} step {step} ({path}): {broken}");
            }
        }
    }
}
