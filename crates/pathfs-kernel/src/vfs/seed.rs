//! Import a directory on disk into the virtual tree.
//!
//! Used to populate `~` at construction (e.g. from an unpacked asset
//! archive). Each level is imported folders first, then files, before
//! descending, so handles come out in the same order the tree would
//! assign them through `add`. Every imported record carries its source
//! [`PathBuf`] as payload.

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::error::{VfsError, VfsResult};
use super::path::{join, VIRTUAL_ROOT};
use super::tree::FileTree;

/// Copy `source` into `tree` under `~`. Returns the number of records added.
pub(crate) fn import(tree: &mut FileTree, source: &Path) -> VfsResult<usize> {
    let mut added = 0;
    let mut queue: VecDeque<(String, PathBuf)> = VecDeque::new();
    queue.push_back((VIRTUAL_ROOT.to_string(), source.to_path_buf()));

    while let Some((dir, os_dir)) = queue.pop_front() {
        let shown = os_dir.display().to_string();
        let mut folders = Vec::new();
        let mut files = Vec::new();
        for entry in fs::read_dir(&os_dir).map_err(|e| VfsError::from_io(e, &shown))? {
            let entry = entry.map_err(|e| VfsError::from_io(e, &shown))?;
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                tracing::warn!(path = %entry.path().display(), "skipping non UTF-8 name");
                continue;
            };
            if entry.file_type()?.is_dir() {
                folders.push((name, entry.path()));
            } else {
                files.push((name, entry.path()));
            }
        }
        folders.sort();
        files.sort();

        for (name, os_path) in folders {
            let meta = fs::metadata(&os_path)?;
            let parent = tree.lookup(&dir).ok_or_else(|| VfsError::not_found(dir.as_str()))?;
            let handle = tree.insert(parent, &name, true, meta.modified()?)?;
            added += 1;
            let path = match tree.get_mut(handle) {
                Some(record) => {
                    record.payload = Some(Arc::new(os_path.clone()));
                    record.path.clone()
                }
                None => join(&dir, &name),
            };
            queue.push_back((path, os_path));
        }

        for (name, os_path) in files {
            let meta = fs::metadata(&os_path)?;
            let contents = fs::read(&os_path)?;
            let parent = tree.lookup(&dir).ok_or_else(|| VfsError::not_found(dir.as_str()))?;
            let handle = tree.insert(parent, &name, false, meta.modified()?)?;
            if let Some((record, data)) = tree.data_mut(handle) {
                record.size = contents.len() as u64;
                record.payload = Some(Arc::new(os_path));
                *data = contents;
            }
            added += 1;
        }
    }

    Ok(added)
}
