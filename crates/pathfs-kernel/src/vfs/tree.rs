//! The virtual namespace as a flat array of records.
//!
//! There are no pointers between records. A folder owns the contiguous
//! handle range `[folder_start, file_end)` holding its direct children,
//! sub-folders first. Adding or removing a record renumbers every index
//! at or past the edit point in one linear pass, and the path lookup
//! table is re-keyed in the same pass.
//!
//! An empty folder's range is a zero-width position in the array. It is
//! placed at the end of the array when the folder is created and is never
//! allowed to end up strictly inside another folder's range, so the first
//! child inserted there can't split a sibling range.

use std::collections::HashMap;
use std::time::SystemTime;

use super::error::{fatal, VfsError, VfsResult};
use super::path::{join, split_parent, VIRTUAL_ROOT};
use super::types::{FileAccess, FileHandle, FileRecord, ROOT_HANDLE};

/// Entry in the tree: the record plus the file's in-memory contents.
#[derive(Debug, Clone)]
struct Node {
    record: FileRecord,
    data: Vec<u8>,
}

/// Flat-array tree backing the `~` namespace.
#[derive(Debug)]
pub struct FileTree {
    nodes: Vec<Node>,
    lookup: HashMap<String, FileHandle>,
}

impl FileTree {
    /// Create a tree holding only the root folder.
    pub fn new(access: FileAccess, now: SystemTime) -> Self {
        let root = FileRecord::new_virtual(
            VIRTUAL_ROOT.to_string(),
            VIRTUAL_ROOT.to_string(),
            ROOT_HANDLE,
            1,
            access,
            true,
            now,
        );
        let mut lookup = HashMap::new();
        lookup.insert(VIRTUAL_ROOT.to_string(), ROOT_HANDLE);
        Self {
            nodes: vec![Node {
                record: root,
                data: Vec::new(),
            }],
            lookup,
        }
    }

    /// Number of records, root included.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Always false: the root is never removed.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, handle: FileHandle) -> Option<&FileRecord> {
        self.nodes.get(handle as usize).map(|n| &n.record)
    }

    pub(crate) fn get_mut(&mut self, handle: FileHandle) -> Option<&mut FileRecord> {
        self.nodes.get_mut(handle as usize).map(|n| &mut n.record)
    }

    /// Handle for a resolved path.
    pub fn lookup(&self, path: &str) -> Option<FileHandle> {
        self.lookup.get(path).copied()
    }

    /// Record for a resolved path.
    pub fn get_path(&self, path: &str) -> VfsResult<&FileRecord> {
        self.lookup(path)
            .and_then(|h| self.get(h))
            .ok_or_else(|| VfsError::not_found(path))
    }

    /// Contents of a virtual file.
    pub fn data(&self, handle: FileHandle) -> Option<&[u8]> {
        self.nodes.get(handle as usize).map(|n| n.data.as_slice())
    }

    /// Mutable contents and record of a virtual file, for writers that
    /// keep `size` in step with the data.
    pub(crate) fn data_mut(&mut self, handle: FileHandle) -> Option<(&mut FileRecord, &mut Vec<u8>)> {
        self.nodes
            .get_mut(handle as usize)
            .map(|n| (&mut n.record, &mut n.data))
    }

    /// All records in handle order.
    pub fn records(&self) -> impl Iterator<Item = &FileRecord> {
        self.nodes.iter().map(|n| &n.record)
    }

    /// Direct child of `parent` named `name`.
    pub fn find_child(&self, parent: FileHandle, name: &str) -> Option<FileHandle> {
        let p = self.get(parent)?;
        (p.folder_start..p.file_end).find(|&h| self.nodes[h as usize].record.name == name)
    }

    /// Children of `handle`: folders then files, each level listed in full
    /// before descending into its folders.
    pub fn children(&self, handle: FileHandle, recurse: bool) -> Vec<FileHandle> {
        let mut out = Vec::new();
        self.collect_children(handle, recurse, &mut out);
        out
    }

    fn collect_children(&self, handle: FileHandle, recurse: bool, out: &mut Vec<FileHandle>) {
        let Some(rec) = self.get(handle) else {
            return;
        };
        let (folder_start, file_start, file_end) = (rec.folder_start, rec.file_start, rec.file_end);
        out.extend(folder_start..file_end);
        if recurse {
            for folder in folder_start..file_start {
                self.collect_children(folder, true, out);
            }
        }
    }

    /// Insert a new child under `parent` and return its handle.
    ///
    /// Folders go right before the parent's files, files after them. Every
    /// index reference at or past the insertion point moves up by one.
    pub fn insert(
        &mut self,
        parent: FileHandle,
        name: &str,
        is_folder: bool,
        now: SystemTime,
    ) -> VfsResult<FileHandle> {
        if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\']) {
            return Err(VfsError::invalid_path(name));
        }

        let p = self
            .get(parent)
            .ok_or_else(|| VfsError::not_found(format!("handle {parent}")))?;
        if !p.is_folder {
            return Err(VfsError::illegal(format!("{} is not a folder", p.path)));
        }

        let path = join(&p.path, name);
        if self.lookup.contains_key(&path) {
            return Err(VfsError::already_exists(path));
        }

        let at = if is_folder { p.file_start } else { p.file_end };
        let parent_range_starts_here = p.folder_start == at;
        let access = p.access;

        let Self { nodes, lookup } = self;
        for (i, node) in nodes.iter_mut().enumerate() {
            let i = i as FileHandle;
            let r = &mut node.record;

            if i == parent {
                if is_folder {
                    r.file_start += 1;
                }
                r.file_end += 1;
            } else {
                // A range starting exactly at the insertion point lies after the
                // new record, except an empty one parked in front of the parent's
                // own range: moving that one would land it inside the parent.
                let starts_here = r.folder_start == at
                    && (r.child_count() > 0 || !parent_range_starts_here);
                shift_up(&mut r.folder_start, at, starts_here);
                shift_up(&mut r.file_start, at, starts_here);
                shift_up(&mut r.file_end, at, starts_here);
            }

            if r.parent >= at {
                r.parent += 1;
            }

            if i >= at {
                r.handle = i + 1;
                match lookup.get_mut(&r.path) {
                    Some(slot) if *slot == i => *slot = i + 1,
                    other => fatal(format!(
                        "lookup for {} is {:?}, array says {i}",
                        r.path, other
                    )),
                }
            }
        }

        let parent_after = if parent >= at { parent + 1 } else { parent };
        let range_at = nodes.len() as FileHandle + 1;
        let mut record = FileRecord::new_virtual(
            path.clone(),
            name.to_string(),
            parent_after,
            range_at,
            access,
            is_folder,
            now,
        );
        record.handle = at;

        nodes.insert(
            at as usize,
            Node {
                record,
                data: Vec::new(),
            },
        );
        lookup.insert(path, at);

        Ok(at)
    }

    /// Remove a file or an empty folder and return its last state.
    pub fn remove_leaf(&mut self, handle: FileHandle) -> VfsResult<FileRecord> {
        if handle == ROOT_HANDLE {
            return Err(VfsError::illegal("cannot remove the virtual root"));
        }
        let rec = self
            .get(handle)
            .ok_or_else(|| VfsError::not_found(format!("handle {handle}")))?;
        if rec.child_count() != 0 {
            return Err(VfsError::illegal(format!("{} still has children", rec.path)));
        }
        let (parent, is_folder) = (rec.parent, rec.is_folder);

        let Self { nodes, lookup } = self;
        for (i, node) in nodes.iter_mut().enumerate() {
            let i = i as FileHandle;
            if i == handle {
                continue;
            }
            let r = &mut node.record;

            if i == parent {
                if is_folder {
                    r.file_start -= 1;
                }
                r.file_end -= 1;
            } else {
                shift_down(&mut r.folder_start, handle);
                shift_down(&mut r.file_start, handle);
                shift_down(&mut r.file_end, handle);
            }

            if r.parent > handle {
                r.parent -= 1;
            }

            if i > handle {
                r.handle = i - 1;
                match lookup.get_mut(&r.path) {
                    Some(slot) if *slot == i => *slot = i - 1,
                    other => fatal(format!(
                        "lookup for {} is {:?}, array says {i}",
                        r.path, other
                    )),
                }
            }
        }

        let node = nodes.remove(handle as usize);
        if lookup.remove(&node.record.path) != Some(handle) {
            fatal(format!("lookup lost {} during removal", node.record.path));
        }
        Ok(node.record)
    }

    /// Remove a record and its whole subtree, calling `on_removed` after
    /// each record is erased. Children go before their parent; within a
    /// folder the last sub-folder goes first, then files back to front.
    pub fn remove_with<F>(&mut self, handle: FileHandle, mut on_removed: F) -> VfsResult<()>
    where
        F: FnMut(&FileTree, &FileRecord),
    {
        if handle == ROOT_HANDLE {
            return Err(VfsError::illegal("cannot remove the virtual root"));
        }
        let path = self
            .get(handle)
            .map(|r| r.path.clone())
            .ok_or_else(|| VfsError::not_found(format!("handle {handle}")))?;
        self.remove_subtree(&path, &mut on_removed)
    }

    /// Remove a subtree and return the erased records in removal order.
    pub fn remove(&mut self, handle: FileHandle) -> VfsResult<Vec<FileRecord>> {
        let mut removed = Vec::new();
        self.remove_with(handle, |_, rec| removed.push(rec.clone()))?;
        Ok(removed)
    }

    // Handles move while descendants are erased, so the walk re-finds each
    // folder by path on every step.
    fn remove_subtree<F>(&mut self, path: &str, on_removed: &mut F) -> VfsResult<()>
    where
        F: FnMut(&FileTree, &FileRecord),
    {
        loop {
            let handle = self.lookup(path).ok_or_else(|| VfsError::not_found(path))?;
            let rec = &self.nodes[handle as usize].record;
            let last_child = if rec.folder_count() > 0 {
                rec.file_start - 1
            } else if rec.file_count() > 0 {
                rec.file_end - 1
            } else {
                break;
            };
            let child_path = self.nodes[last_child as usize].record.path.clone();
            self.remove_subtree(&child_path, on_removed)?;
        }

        let handle = self.lookup(path).ok_or_else(|| VfsError::not_found(path))?;
        let removed = self.remove_leaf(handle)?;
        on_removed(&*self, &removed);
        Ok(())
    }

    /// Relabel a record (and every descendant of a folder) under `new_path`.
    ///
    /// Handles are untouched; only paths, the name and the lookup table change.
    pub fn rename(&mut self, handle: FileHandle, new_path: &str) -> VfsResult<()> {
        if handle == ROOT_HANDLE {
            return Err(VfsError::illegal("cannot rename the virtual root"));
        }
        let (_, new_name) = split_parent(new_path).ok_or_else(|| VfsError::invalid_path(new_path))?;
        if self.lookup.contains_key(new_path) {
            return Err(VfsError::already_exists(new_path));
        }
        let rec = self
            .get(handle)
            .ok_or_else(|| VfsError::not_found(format!("handle {handle}")))?;
        let old_len = rec.path.len();

        let mut targets = vec![handle];
        if rec.is_folder {
            targets.extend(self.children(handle, true));
        }

        for target in targets {
            let r = &mut self.nodes[target as usize].record;
            let relabeled = format!("{new_path}{}", &r.path[old_len..]);
            if self.lookup.remove(&r.path) != Some(target) {
                fatal(format!("lookup for {} disagrees with handle {target}", r.path));
            }
            self.lookup.insert(relabeled.clone(), target);
            r.path = relabeled;
        }

        self.nodes[handle as usize].record.name = new_name.to_string();
        Ok(())
    }

    /// Verify the tree-layout invariant and the lookup table in O(n).
    ///
    /// Checks that every folder's range holds exactly its direct children
    /// (folders before files), that the ranges partition all non-root
    /// records, that no empty range sits strictly inside another range,
    /// and that every path maps to its own index.
    pub fn check_layout(&self) -> Result<(), String> {
        let n = self.nodes.len();
        if n == 0 {
            return Err("tree has no root".into());
        }
        if self.lookup.len() != n {
            return Err(format!("lookup has {} entries for {n} records", self.lookup.len()));
        }

        let mut covered = 0usize;
        let mut interior = vec![false; n + 1];
        let mut empty_positions = Vec::new();

        for (i, node) in self.nodes.iter().enumerate() {
            let r = &node.record;
            let h = i as FileHandle;

            if r.handle != h {
                return Err(format!("{} stores handle {} at index {i}", r.path, r.handle));
            }
            if self.lookup.get(&r.path) != Some(&h) {
                return Err(format!("lookup for {} does not point at {i}", r.path));
            }
            if !(r.folder_start <= r.file_start
                && r.file_start <= r.file_end
                && r.file_end as usize <= n)
            {
                return Err(format!(
                    "{} has malformed range [{}, {}, {})",
                    r.path, r.folder_start, r.file_start, r.file_end
                ));
            }
            if !r.is_folder && r.child_count() != 0 {
                return Err(format!("file {} owns children", r.path));
            }

            if i != 0 {
                let parent = self
                    .get(r.parent)
                    .ok_or_else(|| format!("{} has dangling parent {}", r.path, r.parent))?;
                match split_parent(&r.path) {
                    Some((parent_path, name)) if parent_path == parent.path && name == r.name => {}
                    _ => return Err(format!("{} is not named under {}", r.path, parent.path)),
                }
            }

            for c in r.folder_start..r.file_end {
                if c == ROOT_HANDLE {
                    return Err(format!("{} claims the root as a child", r.path));
                }
                let child = &self.nodes[c as usize].record;
                if child.parent != h {
                    return Err(format!("{} lies in the range of {}", child.path, r.path));
                }
                if (c < r.file_start) != child.is_folder {
                    return Err(format!("{} is in the wrong sub-range of {}", child.path, r.path));
                }
            }

            covered += r.child_count() as usize;
            if r.child_count() == 0 {
                if r.is_folder {
                    empty_positions.push((r.folder_start as usize, &r.path));
                }
            } else {
                for gap in interior
                    .iter_mut()
                    .take(r.file_end as usize)
                    .skip(r.folder_start as usize + 1)
                {
                    *gap = true;
                }
            }
        }

        if covered != n - 1 {
            return Err(format!("ranges cover {covered} records, expected {}", n - 1));
        }
        for (pos, path) in empty_positions {
            if interior[pos] {
                return Err(format!("empty folder {path} is parked inside another range"));
            }
        }
        Ok(())
    }
}

fn shift_up(field: &mut FileHandle, at: FileHandle, inclusive: bool) {
    if *field > at || (inclusive && *field == at) {
        *field += 1;
    }
}

fn shift_down(field: &mut FileHandle, at: FileHandle) {
    if *field > at {
        *field -= 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree() -> FileTree {
        FileTree::new(FileAccess::read_write(), SystemTime::UNIX_EPOCH)
    }

    fn add(tree: &mut FileTree, path: &str, is_folder: bool) -> FileHandle {
        let (parent, name) = split_parent(path).unwrap();
        let parent = tree.lookup(parent).unwrap();
        let handle = tree.insert(parent, name, is_folder, SystemTime::UNIX_EPOCH).unwrap();
        tree.check_layout().unwrap();
        handle
    }

    fn names(tree: &FileTree, handle: FileHandle) -> Vec<String> {
        tree.children(handle, false)
            .into_iter()
            .map(|h| tree.get(h).unwrap().name.clone())
            .collect()
    }

    #[test]
    fn test_fresh_tree() {
        let t = tree();
        assert_eq!(t.len(), 1);
        let root = t.get(ROOT_HANDLE).unwrap();
        assert_eq!(root.path, "~");
        assert_eq!(root.child_count(), 0);
        t.check_layout().unwrap();
    }

    #[test]
    fn test_folder_then_file() {
        let mut t = tree();
        let docs = add(&mut t, "~/docs", true);
        let readme = add(&mut t, "~/docs/readme.txt", false);

        assert_eq!(t.get(ROOT_HANDLE).unwrap().folder_count(), 1);
        assert_eq!(t.get_path("~/docs").unwrap().file_count(), 1);
        assert_eq!(t.get(readme).unwrap().parent, docs);
    }

    #[test]
    fn test_folders_stay_before_files() {
        let mut t = tree();
        add(&mut t, "~/a.txt", false);
        add(&mut t, "~/b.txt", false);
        add(&mut t, "~/sub", true);
        add(&mut t, "~/c.txt", false);
        add(&mut t, "~/other", true);

        assert_eq!(names(&t, ROOT_HANDLE), ["sub", "other", "a.txt", "b.txt", "c.txt"]);
        let root = t.get(ROOT_HANDLE).unwrap();
        assert_eq!(root.folder_count(), 2);
        assert_eq!(root.file_count(), 3);
    }

    #[test]
    fn test_sibling_empty_folders() {
        let mut t = tree();
        add(&mut t, "~/a", true);
        add(&mut t, "~/b", true);
        add(&mut t, "~/a/x", false);
        add(&mut t, "~/b/y", false);
        add(&mut t, "~/a/c", true);
        add(&mut t, "~/b/z", true);
        add(&mut t, "~/a/c/deep", false);

        assert_eq!(names(&t, t.lookup("~/a").unwrap()), ["c", "x"]);
        assert_eq!(names(&t, t.lookup("~/b").unwrap()), ["z", "y"]);
        assert_eq!(names(&t, t.lookup("~/a/c").unwrap()), ["deep"]);
        assert!(names(&t, t.lookup("~/b/z").unwrap()).is_empty());
    }

    #[test]
    fn test_handles_outside_edit_stay_put() {
        let mut t = tree();
        let a = add(&mut t, "~/a", true);
        add(&mut t, "~/a/one", false);
        add(&mut t, "~/b", true);
        let before = t.lookup("~/a/one").unwrap();

        add(&mut t, "~/b/two", false);
        assert_eq!(t.lookup("~/a").unwrap(), a);
        assert!(t.lookup("~/a/one").unwrap() >= before);
    }

    #[test]
    fn test_remove_subtree_children_first() {
        let mut t = tree();
        add(&mut t, "~/docs", true);
        add(&mut t, "~/docs/readme.txt", false);
        add(&mut t, "~/docs/img", true);
        add(&mut t, "~/docs/img/logo.png", false);
        add(&mut t, "~/keep.txt", false);

        let docs = t.lookup("~/docs").unwrap();
        let removed: Vec<String> = t.remove(docs).unwrap().into_iter().map(|r| r.path).collect();
        assert_eq!(
            removed,
            ["~/docs/img/logo.png", "~/docs/img", "~/docs/readme.txt", "~/docs"]
        );
        assert_eq!(t.len(), 2);
        assert!(t.lookup("~/keep.txt").is_some());
        t.check_layout().unwrap();
    }

    #[test]
    fn test_parent_survives_until_children_gone() {
        let mut t = tree();
        add(&mut t, "~/d", true);
        add(&mut t, "~/d/f", false);
        let d = t.lookup("~/d").unwrap();

        let mut seen = Vec::new();
        t.remove_with(d, |tree, rec| {
            seen.push((rec.path.clone(), tree.lookup("~/d").is_some()));
        })
        .unwrap();
        assert_eq!(seen, [("~/d/f".to_string(), true), ("~/d".to_string(), false)]);
    }

    #[test]
    fn test_remove_root_is_illegal() {
        let mut t = tree();
        assert!(matches!(t.remove(ROOT_HANDLE), Err(VfsError::Illegal(_))));
        assert!(matches!(t.remove_leaf(ROOT_HANDLE), Err(VfsError::Illegal(_))));
    }

    #[test]
    fn test_remove_leaf_rejects_non_empty() {
        let mut t = tree();
        let d = add(&mut t, "~/d", true);
        add(&mut t, "~/d/f", false);
        assert!(matches!(t.remove_leaf(d), Err(VfsError::Illegal(_))));
    }

    #[test]
    fn test_rename_keeps_handles() {
        let mut t = tree();
        let docs = add(&mut t, "~/docs", true);
        let readme = add(&mut t, "~/docs/readme.txt", false);

        t.rename(readme, "~/docs/README.txt").unwrap();
        assert_eq!(t.lookup("~/docs/README.txt"), Some(readme));
        assert_eq!(t.get(readme).unwrap().name, "README.txt");
        assert!(t.lookup("~/docs/readme.txt").is_none());

        t.rename(docs, "~/papers").unwrap();
        assert_eq!(t.lookup("~/papers"), Some(docs));
        assert_eq!(t.get(readme).unwrap().path, "~/papers/README.txt");
        t.check_layout().unwrap();
    }

    #[test]
    fn test_insert_rejects_duplicates_and_files_as_parents() {
        let mut t = tree();
        let f = add(&mut t, "~/f", false);
        assert!(matches!(
            t.insert(ROOT_HANDLE, "f", false, SystemTime::UNIX_EPOCH),
            Err(VfsError::AlreadyExists(_))
        ));
        assert!(matches!(
            t.insert(f, "child", false, SystemTime::UNIX_EPOCH),
            Err(VfsError::Illegal(_))
        ));
        assert!(matches!(
            t.insert(ROOT_HANDLE, "..", true, SystemTime::UNIX_EPOCH),
            Err(VfsError::InvalidPath(_))
        ));
    }

    #[test]
    fn test_recursive_children_order() {
        let mut t = tree();
        add(&mut t, "~/a", true);
        add(&mut t, "~/top.txt", false);
        add(&mut t, "~/a/inner.txt", false);
        add(&mut t, "~/a/b", true);

        let all: Vec<String> = t
            .children(ROOT_HANDLE, true)
            .into_iter()
            .map(|h| t.get(h).unwrap().path.clone())
            .collect();
        assert_eq!(all, ["~/a", "~/top.txt", "~/a/b", "~/a/inner.txt"]);
    }

    #[test]
    fn test_new_records_inherit_access() {
        let mut t = FileTree::new(FileAccess::read_only(), SystemTime::UNIX_EPOCH);
        let h = t.insert(ROOT_HANDLE, "seeded", false, SystemTime::UNIX_EPOCH).unwrap();
        assert_eq!(t.get(h).unwrap().access, FileAccess::read_only());
    }
}
