//! Slot-arena inode table with link/lookup/open reference counting.
//!
//! Inodes are addressed by a 1-based numeric id; id 0 is reserved invalid
//! and id 1 is the root directory. Free slots form a singly linked list
//! threaded through the table, so registration never allocates a slot.
//! Parent/child cycles (`.` and `..`) are ordinary entries whose references
//! are counted in `links`, which makes the free threshold for a directory
//! `links == 1`: only its self-reference remains.

use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::mods::Mod;
use crate::nocase;

pub type InodeId = u64;

/// Reserved invalid id.
pub const INO_INVALID: InodeId = 0;
/// The root directory.
pub const INO_ROOT: InodeId = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileKind {
    Directory,
    Regular,
}

/// A directory entry owned by its parent directory inode.
///
/// An entry whose `present` flag is cleared is a tombstone: it keeps its
/// index (and with it the readdir offsets of its siblings) stable while the
/// parent has open handles, and is reaped when the last one closes.
#[derive(Debug)]
pub struct Dirent {
    pub name: OsString,
    pub present: bool,
    pub child: InodeId,
}

#[derive(Debug)]
pub(crate) enum NodeKind {
    Directory { entries: Vec<Dirent> },
    Regular,
}

#[derive(Debug)]
pub struct Inode {
    pub(crate) kind: NodeKind,
    pub(crate) owner: Arc<Mod>,
    pub(crate) real_path: PathBuf,
    pub(crate) links: u32,
    pub(crate) lookups: u64,
    pub(crate) fds: u32,
}

impl Inode {
    pub fn file_kind(&self) -> FileKind {
        match self.kind {
            NodeKind::Directory { .. } => FileKind::Directory,
            NodeKind::Regular => FileKind::Regular,
        }
    }

    pub fn is_dir(&self) -> bool {
        matches!(self.kind, NodeKind::Directory { .. })
    }

    pub fn owner(&self) -> &Arc<Mod> {
        &self.owner
    }

    pub fn real_path(&self) -> &Path {
        &self.real_path
    }

    pub fn links(&self) -> u32 {
        self.links
    }

    pub fn lookups(&self) -> u64 {
        self.lookups
    }

    pub fn fds(&self) -> u32 {
        self.fds
    }

    pub fn entries(&self) -> &[Dirent] {
        match &self.kind {
            NodeKind::Directory { entries } => entries,
            NodeKind::Regular => panic!("regular file has no directory entries"),
        }
    }

    fn entries_mut(&mut self) -> &mut Vec<Dirent> {
        match &mut self.kind {
            NodeKind::Directory { entries } => entries,
            NodeKind::Regular => panic!("regular file has no directory entries"),
        }
    }
}

#[derive(Debug)]
enum Slot {
    Free { next_free: InodeId },
    Used(Inode),
}

#[derive(Debug)]
pub struct InodeTable {
    slots: Vec<Slot>,
    free_head: InodeId,
}

impl InodeTable {
    /// Builds a table of `capacity` slots. Slot 0 stays reserved, slot 1 is
    /// left for the root, and the remaining slots are threaded into the
    /// free-list with its head at the highest index.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 2, "inode table capacity too small");
        let mut slots: Vec<Slot> = (0..capacity)
            .map(|_| Slot::Free {
                next_free: INO_INVALID,
            })
            .collect();
        for i in (INO_ROOT as usize + 2)..capacity {
            slots[i] = Slot::Free {
                next_free: (i - 1) as InodeId,
            };
        }
        InodeTable {
            slots,
            free_head: (capacity - 1) as InodeId,
        }
    }

    pub fn get(&self, id: InodeId) -> Option<&Inode> {
        match self.slots.get(id as usize)? {
            Slot::Used(node) => Some(node),
            Slot::Free { .. } => None,
        }
    }

    pub fn get_mut(&mut self, id: InodeId) -> Option<&mut Inode> {
        match self.slots.get_mut(id as usize)? {
            Slot::Used(node) => Some(node),
            Slot::Free { .. } => None,
        }
    }

    fn node(&self, id: InodeId) -> &Inode {
        self.get(id).expect("unallocated inode")
    }

    fn node_mut(&mut self, id: InodeId) -> &mut Inode {
        self.get_mut(id).expect("unallocated inode")
    }

    pub fn is_allocated(&self, id: InodeId) -> bool {
        self.get(id).is_some()
    }

    /// Pops the free-list head and installs a fresh inode there.
    pub fn register(&mut self, kind: FileKind, owner: Arc<Mod>, real_path: PathBuf) -> InodeId {
        let id = self.free_head;
        assert_ne!(id, INO_INVALID, "inode table exhausted");
        self.free_head = match &self.slots[id as usize] {
            Slot::Free { next_free } => *next_free,
            Slot::Used(_) => panic!("free-list head points at an allocated slot"),
        };
        self.install(id, kind, owner, real_path);
        id
    }

    /// Installs an inode into a specific slot. Used to bootstrap the root,
    /// which is never part of the free-list.
    pub fn register_at(&mut self, id: InodeId, kind: FileKind, owner: Arc<Mod>, real_path: PathBuf) {
        assert_ne!(id, INO_INVALID);
        assert!(
            matches!(self.slots[id as usize], Slot::Free { .. }),
            "slot {id} is already allocated"
        );
        self.install(id, kind, owner, real_path);
    }

    fn install(&mut self, id: InodeId, kind: FileKind, owner: Arc<Mod>, real_path: PathBuf) {
        let kind = match kind {
            FileKind::Directory => NodeKind::Directory {
                entries: Vec::with_capacity(8),
            },
            FileKind::Regular => NodeKind::Regular,
        };
        self.slots[id as usize] = Slot::Used(Inode {
            kind,
            owner,
            real_path,
            links: 0,
            lookups: 0,
            fds: 0,
        });
    }

    /// True when nothing references the inode any longer: no parent entry
    /// (for directories, nothing beyond the self-reference), no outstanding
    /// kernel lookups and no open handles.
    pub fn freeable(&self, id: InodeId) -> bool {
        let node = self.node(id);
        let min_links = match node.kind {
            NodeKind::Directory { .. } => 1,
            NodeKind::Regular => 0,
        };
        node.links <= min_links && node.lookups == 0 && node.fds == 0
    }

    fn free(&mut self, id: InodeId) {
        assert_ne!(id, INO_ROOT, "attempted to free the root inode");
        debug_assert!(self.freeable(id));
        let slot = std::mem::replace(
            &mut self.slots[id as usize],
            Slot::Free {
                next_free: self.free_head,
            },
        );
        self.free_head = id;
        let Slot::Used(node) = slot else {
            panic!("double free of inode {id}");
        };
        if let NodeKind::Directory { entries } = node.kind {
            // entry 0 is the dying inode's own `.`; `..` and any remaining
            // children still hold counted references, release them
            for (idx, ent) in entries.iter().enumerate() {
                if idx == 0 || !ent.present {
                    continue;
                }
                self.unlink(ent.child);
            }
        }
    }

    /// Frees the whole subtree under `id` regardless of reference counts.
    /// Unmount teardown only.
    pub fn force_free(&mut self, id: InodeId) {
        let slot = std::mem::replace(
            &mut self.slots[id as usize],
            Slot::Free {
                next_free: self.free_head,
            },
        );
        self.free_head = id;
        let Slot::Used(node) = slot else {
            panic!("force_free of unallocated inode {id}");
        };
        if let NodeKind::Directory { entries } = node.kind {
            for (idx, ent) in entries.iter().enumerate() {
                if idx < 2 || !ent.present {
                    continue;
                }
                self.force_free(ent.child);
            }
        }
    }

    pub fn link(&mut self, id: InodeId) {
        self.node_mut(id).links += 1;
    }

    pub fn unlink(&mut self, id: InodeId) {
        let node = self.node_mut(id);
        assert!(node.links >= 1, "link count underflow");
        node.links -= 1;
        if self.freeable(id) {
            self.free(id);
        }
    }

    pub fn lookup(&mut self, id: InodeId) {
        self.node_mut(id).lookups += 1;
    }

    pub fn forget(&mut self, id: InodeId, n: u64) {
        let node = self.node_mut(id);
        assert!(node.lookups >= n, "lookup count underflow");
        node.lookups -= n;
        if self.freeable(id) {
            self.free(id);
        }
    }

    pub fn open(&mut self, id: InodeId) {
        self.node_mut(id).fds += 1;
    }

    pub fn close(&mut self, id: InodeId) {
        let node = self.node_mut(id);
        assert!(node.fds >= 1, "open count underflow");
        node.fds -= 1;
        if node.fds == 0 {
            if let NodeKind::Directory { entries } = &mut node.kind {
                entries.retain(|ent| ent.present);
            }
        }
        if self.freeable(id) {
            self.free(id);
        }
    }

    /// Moves the inode's backing to another layer, keeping its relative path.
    pub fn retarget(&mut self, id: InodeId, owner: Arc<Mod>) {
        self.node_mut(id).owner = owner;
    }

    /// Moves the inode's backing to another layer and path.
    pub(crate) fn set_backing(&mut self, id: InodeId, owner: Arc<Mod>, real_path: PathBuf) {
        let node = self.node_mut(id);
        node.owner = owner;
        node.real_path = real_path;
    }

    pub fn insert_dirent(&mut self, parent: InodeId, name: &OsStr, child: InodeId) {
        self.node_mut(parent).entries_mut().push(Dirent {
            name: name.to_os_string(),
            present: true,
            child,
        });
        self.link(child);
    }

    pub fn erase_dirent(&mut self, parent: InodeId, idx: usize) {
        let node = self.node_mut(parent);
        let fds = node.fds;
        let entries = node.entries_mut();
        assert!(entries[idx].present, "erasing a tombstoned entry");
        let child = entries[idx].child;
        // drop or tombstone the entry before releasing the child, so a
        // cascading free of the parent cannot revisit it
        if fds != 0 {
            entries[idx].present = false;
        } else {
            entries.remove(idx);
        }
        self.unlink(child);
    }

    pub(crate) fn rename_dirent(&mut self, parent: InodeId, idx: usize, name: &OsStr) {
        self.node_mut(parent).entries_mut()[idx].name = name.to_os_string();
    }

    /// Index of the first present entry matching `name` case-insensitively.
    pub fn find_dirent_index(&self, parent: InodeId, name: &OsStr) -> Option<usize> {
        let node = self.get(parent)?;
        let NodeKind::Directory { entries } = &node.kind else {
            return None;
        };
        entries
            .iter()
            .position(|ent| ent.present && nocase::eq_nocase(&ent.name, name))
    }

    pub fn find_dirent(&self, parent: InodeId, name: &OsStr) -> Option<InodeId> {
        self.find_dirent_index(parent, name)
            .map(|idx| self.node(parent).entries()[idx].child)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_mod() -> (TempDir, Arc<Mod>) {
        let dir = TempDir::new().unwrap();
        let m = Mod::open("test", dir.path()).unwrap();
        (dir, m)
    }

    fn dir_table(m: &Arc<Mod>) -> InodeTable {
        let mut table = InodeTable::new(64);
        table.register_at(INO_ROOT, FileKind::Directory, m.clone(), PathBuf::from("."));
        table.insert_dirent(INO_ROOT, OsStr::new("."), INO_ROOT);
        table.insert_dirent(INO_ROOT, OsStr::new(".."), INO_ROOT);
        table
    }

    #[test]
    fn test_free_list_pops_from_highest_index() {
        let (_dir, m) = test_mod();
        let mut table = InodeTable::new(8);
        let a = table.register(FileKind::Regular, m.clone(), PathBuf::from("a"));
        let b = table.register(FileKind::Regular, m.clone(), PathBuf::from("b"));
        assert_eq!(a, 7);
        assert_eq!(b, 6);
        assert!(table.is_allocated(a));
        assert!(!table.is_allocated(5));
    }

    #[test]
    fn test_freed_slot_is_not_reused_until_popped() {
        let (_dir, m) = test_mod();
        let mut table = dir_table(&m);

        let file = table.register(FileKind::Regular, m.clone(), PathBuf::from("f"));
        table.insert_dirent(INO_ROOT, OsStr::new("f"), file);
        let idx = table.find_dirent_index(INO_ROOT, OsStr::new("f")).unwrap();
        table.erase_dirent(INO_ROOT, idx);
        assert!(!table.is_allocated(file));

        // the freed slot comes back as the next registration
        let again = table.register(FileKind::Regular, m.clone(), PathBuf::from("g"));
        assert_eq!(again, file);
    }

    #[test]
    fn test_file_freed_only_when_all_counters_drop() {
        let (_dir, m) = test_mod();
        let mut table = dir_table(&m);

        let file = table.register(FileKind::Regular, m.clone(), PathBuf::from("f"));
        table.insert_dirent(INO_ROOT, OsStr::new("f"), file);
        table.lookup(file);
        table.open(file);

        let idx = table.find_dirent_index(INO_ROOT, OsStr::new("f")).unwrap();
        table.erase_dirent(INO_ROOT, idx);
        assert!(table.is_allocated(file), "still open and looked up");

        table.close(file);
        assert!(table.is_allocated(file), "still looked up");
        table.forget(file, 1);
        assert!(!table.is_allocated(file));
    }

    #[test]
    fn test_forget_sums_to_outstanding_lookups() {
        let (_dir, m) = test_mod();
        let mut table = dir_table(&m);

        let file = table.register(FileKind::Regular, m.clone(), PathBuf::from("f"));
        table.insert_dirent(INO_ROOT, OsStr::new("f"), file);
        for _ in 0..5 {
            table.lookup(file);
        }
        let idx = table.find_dirent_index(INO_ROOT, OsStr::new("f")).unwrap();
        table.erase_dirent(INO_ROOT, idx);

        table.forget(file, 2);
        assert!(table.is_allocated(file));
        table.forget(file, 3);
        assert!(!table.is_allocated(file));
    }

    #[test]
    fn test_directory_release_drops_parent_reference() {
        let (_dir, m) = test_mod();
        let mut table = dir_table(&m);

        let sub = table.register(FileKind::Directory, m.clone(), PathBuf::from("sub"));
        table.insert_dirent(sub, OsStr::new("."), sub);
        table.insert_dirent(sub, OsStr::new(".."), INO_ROOT);
        table.insert_dirent(INO_ROOT, OsStr::new("sub"), sub);

        // `.` + parent entry, and the root picked up the `..` reference
        assert_eq!(table.get(sub).unwrap().links(), 2);
        let root_links = table.get(INO_ROOT).unwrap().links();

        let idx = table.find_dirent_index(INO_ROOT, OsStr::new("sub")).unwrap();
        table.erase_dirent(INO_ROOT, idx);
        assert!(!table.is_allocated(sub));
        assert_eq!(table.get(INO_ROOT).unwrap().links(), root_links - 1);
    }

    #[test]
    fn test_dot_and_dotdot_always_present() {
        let (_dir, m) = test_mod();
        let table = dir_table(&m);
        let root = table.get(INO_ROOT).unwrap();
        assert_eq!(root.entries()[0].name, OsString::from("."));
        assert_eq!(root.entries()[1].name, OsString::from(".."));
        assert!(root.entries()[0].present);
        assert!(root.entries()[1].present);
    }

    #[test]
    fn test_tombstone_preserves_indices_until_close() {
        let (_dir, m) = test_mod();
        let mut table = dir_table(&m);

        let a = table.register(FileKind::Regular, m.clone(), PathBuf::from("a"));
        let b = table.register(FileKind::Regular, m.clone(), PathBuf::from("b"));
        table.insert_dirent(INO_ROOT, OsStr::new("a"), a);
        table.insert_dirent(INO_ROOT, OsStr::new("b"), b);

        table.open(INO_ROOT);
        let idx = table.find_dirent_index(INO_ROOT, OsStr::new("a")).unwrap();
        table.erase_dirent(INO_ROOT, idx);

        // entry is tombstoned in place, `b` keeps its index
        assert_eq!(table.get(INO_ROOT).unwrap().entries().len(), 4);
        assert!(!table.get(INO_ROOT).unwrap().entries()[idx].present);
        assert_eq!(
            table.find_dirent_index(INO_ROOT, OsStr::new("b")),
            Some(idx + 1)
        );

        table.close(INO_ROOT);
        assert_eq!(table.get(INO_ROOT).unwrap().entries().len(), 3);
    }

    #[test]
    fn test_find_dirent_is_case_insensitive() {
        let (_dir, m) = test_mod();
        let mut table = dir_table(&m);

        let file = table.register(FileKind::Regular, m.clone(), PathBuf::from("Foo.esp"));
        table.insert_dirent(INO_ROOT, OsStr::new("Foo.esp"), file);

        assert_eq!(table.find_dirent(INO_ROOT, OsStr::new("FOO.ESP")), Some(file));
        assert_eq!(table.find_dirent(INO_ROOT, OsStr::new("foo.esp")), Some(file));
        assert_eq!(table.find_dirent(INO_ROOT, OsStr::new("bar.esp")), None);
    }

    #[test]
    fn test_force_free_tears_down_subtree() {
        let (_dir, m) = test_mod();
        let mut table = dir_table(&m);

        let sub = table.register(FileKind::Directory, m.clone(), PathBuf::from("sub"));
        table.insert_dirent(sub, OsStr::new("."), sub);
        table.insert_dirent(sub, OsStr::new(".."), INO_ROOT);
        table.insert_dirent(INO_ROOT, OsStr::new("sub"), sub);
        let file = table.register(FileKind::Regular, m.clone(), PathBuf::from("sub/f"));
        table.insert_dirent(sub, OsStr::new("f"), file);

        // counters that would normally pin the tree are ignored
        table.lookup(sub);
        table.open(file);

        table.force_free(INO_ROOT);
        assert!(!table.is_allocated(INO_ROOT));
        assert!(!table.is_allocated(sub));
        assert!(!table.is_allocated(file));
    }
}
