//! The in-memory entry tree built by the scanner.
//!
//! Entries live in a flat arena and refer to their parent by index, so the
//! tree needs no back-pointer fixups and no reference cycles. Directories
//! own their children; child lists are name-sorted exactly once, after the
//! scan completes and before inode numbers are handed out.
use crate::fsaccess::{FileStat, S_IFBLK, S_IFCHR, S_IFDIR, S_IFIFO, S_IFLNK, S_IFMT, S_IFREG, S_IFSOCK};
use crate::progress::Progress;

/// Index of an entry in the [`EntryTree`] arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryId(pub(crate) u32);

/// The broad entry classification driving inode partitioning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EntryKind {
    Dir,
    Link,
    File,
    /// Block or character device.
    Device,
    /// Fifo or socket.
    Other,
}

impl EntryKind {
    pub fn of_mode(mode: u32) -> Option<Self> {
        Some(match mode & S_IFMT {
            S_IFDIR => Self::Dir,
            S_IFLNK => Self::Link,
            S_IFREG => Self::File,
            S_IFBLK | S_IFCHR => Self::Device,
            S_IFIFO | S_IFSOCK => Self::Other,
            _ => return None,
        })
    }
}

#[derive(Debug)]
pub struct Entry {
    pub name: String,
    /// Path relative to the scan root; empty for the root.
    pub path: String,
    pub parent: Option<EntryId>,
    pub kind: EntryKind,
    pub stat: FileStat,
    /// Filled during inode assignment, after the scan.
    pub inode: Option<u32>,

    /// Directories: children, name-sorted by [`EntryTree::sort_children`].
    pub children: Vec<EntryId>,
    /// Symlinks: the target.
    pub link_target: String,
    /// Files: the entry this one is a hardlink of, if any.
    pub hardlink_of: Option<EntryId>,
    /// Files: the distinct-content id, filled by deduplication.
    pub content_id: Option<u32>,
    /// Files: size forced to zero after an access failure.
    pub size_override: Option<u64>,
}

impl Entry {
    fn new(name: String, path: String, parent: Option<EntryId>, kind: EntryKind, stat: FileStat) -> Self {
        Self {
            name,
            path,
            parent,
            kind,
            stat,
            inode: None,
            children: Vec::new(),
            link_target: String::new(),
            hardlink_of: None,
            content_id: None,
            size_override: None,
        }
    }

    /// The effective content size, after access-failure overrides.
    pub fn size(&self) -> u64 {
        self.size_override.unwrap_or(self.stat.size)
    }

    pub fn inode(&self) -> u32 {
        self.inode.expect("inode assigned")
    }
}

#[derive(Debug)]
pub struct EntryTree {
    arena: Vec<Entry>,
}

impl EntryTree {
    /// Create a tree holding only the root directory.
    pub fn new(root_stat: FileStat) -> Self {
        Self {
            arena: vec![Entry::new(
                String::new(),
                String::new(),
                None,
                EntryKind::Dir,
                root_stat,
            )],
        }
    }

    pub fn root(&self) -> EntryId {
        EntryId(0)
    }

    pub fn len(&self) -> usize {
        self.arena.len()
    }

    pub fn get(&self, id: EntryId) -> &Entry {
        &self.arena[id.0 as usize]
    }

    pub fn get_mut(&mut self, id: EntryId) -> &mut Entry {
        &mut self.arena[id.0 as usize]
    }

    /// Append a child entry under `parent`.
    pub fn add(
        &mut self,
        parent: EntryId,
        name: String,
        kind: EntryKind,
        stat: FileStat,
    ) -> EntryId {
        let parent_path = &self.get(parent).path;
        let path = if parent_path.is_empty() {
            name.clone()
        } else {
            format!("{parent_path}/{name}")
        };
        let id = EntryId(self.arena.len() as u32);
        self.arena.push(Entry::new(name, path, Some(parent), kind, stat));
        self.get_mut(parent).children.push(id);
        id
    }

    /// Find a direct child of `parent` by name. Linear scan; only used
    /// during list-mode scanning, before children are sorted.
    pub fn find_child(&self, parent: EntryId, name: &str) -> Option<EntryId> {
        self.get(parent)
            .children
            .iter()
            .copied()
            .find(|&c| self.get(c).name == name)
    }

    /// Name-sort every directory's children. Called exactly once, after the
    /// tree is complete and before inode assignment.
    pub fn sort_children(&mut self) {
        for i in 0..self.arena.len() {
            if self.arena[i].kind != EntryKind::Dir {
                continue;
            }
            let mut children = std::mem::take(&mut self.arena[i].children);
            children.sort_by(|&a, &b| self.get(a).name.cmp(&self.get(b).name));
            self.arena[i].children = children;
        }
    }

    /// Visit entries in depth-first pre-order, the root first. Children
    /// order is whatever the child lists currently hold.
    pub fn walk(&self, mut cb: impl FnMut(EntryId, &Entry)) {
        let mut stack = vec![self.root()];
        while let Some(id) = stack.pop() {
            let entry = self.get(id);
            cb(id, entry);
            stack.extend(entry.children.iter().rev());
        }
    }

    /// Drop directories that (transitively) contain nothing.
    pub fn remove_empty_dirs(&mut self, prog: &Progress) {
        // Children are appended after their parent, so one reverse sweep
        // empties nested directories bottom-up.
        let mut keep = vec![true; self.arena.len()];
        for i in (1..self.arena.len()).rev() {
            if self.arena[i].kind != EntryKind::Dir {
                continue;
            }
            let children = &self.arena[i].children;
            if children.iter().all(|c| !keep[c.0 as usize]) {
                keep[i] = false;
                prog.dirs_found.sub(1);
            }
        }
        for i in 0..self.arena.len() {
            let kept = std::mem::take(&mut self.arena[i].children)
                .into_iter()
                .filter(|c| keep[c.0 as usize])
                .collect();
            self.arena[i].children = kept;
        }
    }
}
