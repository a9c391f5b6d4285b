//! The VFS operation layer.
//!
//! [`OverlayFs`] owns the inode table and the open-handle table and
//! implements the operation set the host adapter dispatches into. Results
//! are plain payloads or `io::Error`s carrying raw OS error codes; nothing
//! here knows about the wire protocol.
//!
//! Reads fall through to whichever layer owns an inode. Writes never touch
//! the loopback base or a user mod: the first write-capable open of a
//! lower-layer file copies it into the output layer and retargets the inode
//! there.

use std::collections::BTreeMap;
use std::ffi::{CString, OsStr, OsString};
use std::fs::File;
use std::io;
use std::os::fd::AsRawFd;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::FileExt;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bitflags::bitflags;
use log::{debug, error, warn};
use nix::fcntl::{renameat, AtFlags, OFlag};
use nix::sys::stat::Mode;
use nix::unistd::{UnlinkatFlags, Whence};

use crate::inode::{FileKind, InodeId, InodeTable, INO_ROOT};
use crate::mods::{Mod, ModRegistry};
use crate::nocase::{self, nix_err};
use crate::overlay;
use crate::session::{MountError, MountOptions};

pub(crate) fn ebadf() -> io::Error {
    io::Error::from_raw_os_error(libc::EBADF)
}

pub(crate) fn einval() -> io::Error {
    io::Error::from_raw_os_error(libc::EINVAL)
}

pub(crate) fn enoent() -> io::Error {
    io::Error::from_raw_os_error(libc::ENOENT)
}

pub(crate) fn eexist() -> io::Error {
    io::Error::from_raw_os_error(libc::EEXIST)
}

pub(crate) fn eisdir() -> io::Error {
    io::Error::from_raw_os_error(libc::EISDIR)
}

pub(crate) fn enotdir() -> io::Error {
    io::Error::from_raw_os_error(libc::ENOTDIR)
}

pub(crate) fn eacces() -> io::Error {
    io::Error::from_raw_os_error(libc::EACCES)
}

pub(crate) fn eopnotsupp() -> io::Error {
    io::Error::from_raw_os_error(libc::EOPNOTSUPP)
}

/// Configuration for the overlay filesystem.
#[derive(Clone, Debug)]
pub struct Config {
    /// How long the host kernel may consider attributes valid. The union is
    /// stable for the duration of a mount, so the default is long.
    pub attr_timeout: Duration,

    /// How long the host kernel may consider directory entries valid.
    pub entry_timeout: Duration,

    /// Slot count of the inode table, fixed at mount.
    pub inode_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            attr_timeout: Duration::from_secs(512),
            entry_timeout: Duration::from_secs(512),
            inode_capacity: 65536,
        }
    }
}

/// Attributes of an overlay object: real size and times from the backing
/// filesystem combined with the synthetic link count and mode.
#[derive(Clone, Copy, Debug)]
pub struct Attr {
    pub ino: InodeId,
    pub kind: FileKind,
    pub size: u64,
    pub blocks: u64,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
    pub perm: u16,
    pub nlink: u32,
}

/// A name-resolution reply; carries the cache timeouts the host kernel
/// should apply.
#[derive(Clone, Copy, Debug)]
pub struct Entry {
    pub ino: InodeId,
    pub attr: Attr,
    pub attr_timeout: Duration,
    pub entry_timeout: Duration,
}

/// One emitted readdir record.
#[derive(Debug)]
pub struct DirEntry {
    pub ino: InodeId,
    pub next_offset: i64,
    pub kind: FileKind,
    pub name: OsString,
}

/// One emitted readdirplus record.
#[derive(Debug)]
pub struct DirEntryPlus {
    pub entry: Entry,
    pub next_offset: i64,
    pub name: OsString,
}

/// A timestamp update: an explicit time or "now".
#[derive(Clone, Copy, Debug)]
pub enum TimeSet {
    Now,
    Time(SystemTime),
}

/// Attribute changes requested by setattr. `unsupported` is set by the
/// adapter when the request carries bits this filesystem does not handle.
#[derive(Clone, Copy, Debug, Default)]
pub struct SetAttrs {
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub size: Option<u64>,
    pub atime: Option<TimeSet>,
    pub mtime: Option<TimeSet>,
    pub unsupported: bool,
}

/// Synthetic volume statistics.
#[derive(Clone, Copy, Debug)]
pub struct VolumeStats {
    pub name_max: u32,
}

bitflags! {
    /// Normalised open mode carried by a file handle.
    struct HandleFlags: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const TRUNC = 1 << 2;
        const EXCL = 1 << 3;
        const CREATE = 1 << 4;
    }
}

/// Data associated with an open file handle.
#[derive(Debug)]
struct HandleData {
    inode: InodeId,
    file: File,
}

/// Validates raw open flags. Flags the overlay cannot honour are rejected
/// with `EOPNOTSUPP`; the remainder is normalised into [`HandleFlags`].
fn parse_open_flags(flags: i32) -> io::Result<HandleFlags> {
    const UNSUPPORTED: &[(i32, &str)] = &[
        (libc::O_APPEND, "O_APPEND"),
        (libc::O_DIRECT, "O_DIRECT"),
        (libc::O_NOATIME, "O_NOATIME"),
        (libc::O_PATH, "O_PATH"),
        (libc::O_DIRECTORY, "O_DIRECTORY"),
        (libc::O_NOFOLLOW, "O_NOFOLLOW"),
        (libc::O_NOCTTY, "O_NOCTTY"),
        (libc::O_DSYNC, "O_DSYNC"),
        (libc::O_ASYNC, "O_ASYNC"),
    ];
    for (bit, name) in UNSUPPORTED {
        if flags & bit != 0 {
            debug!("open called with unsupported flag {name}");
            return Err(eopnotsupp());
        }
    }

    let mut parsed = match flags & libc::O_ACCMODE {
        libc::O_RDONLY => HandleFlags::READ,
        libc::O_WRONLY => HandleFlags::WRITE,
        libc::O_RDWR => HandleFlags::READ | HandleFlags::WRITE,
        _ => return Err(eopnotsupp()),
    };
    if flags & libc::O_TRUNC != 0 {
        parsed |= HandleFlags::TRUNC;
    }
    if flags & libc::O_EXCL != 0 {
        parsed |= HandleFlags::EXCL;
    }
    if flags & libc::O_CREAT != 0 {
        parsed |= HandleFlags::CREATE;
    }
    Ok(parsed)
}

/// Rebuilds the flag word passed to the backing open from the normalised
/// set, dropping anything the host was not meant to see.
fn backing_oflags(flags: HandleFlags) -> OFlag {
    let mut out = match (
        flags.contains(HandleFlags::READ),
        flags.contains(HandleFlags::WRITE),
    ) {
        (true, true) => OFlag::O_RDWR,
        (false, true) => OFlag::O_WRONLY,
        _ => OFlag::O_RDONLY,
    };
    if flags.contains(HandleFlags::TRUNC) {
        out |= OFlag::O_TRUNC;
    }
    if flags.contains(HandleFlags::EXCL) {
        out |= OFlag::O_EXCL;
    }
    if flags.contains(HandleFlags::CREATE) {
        out |= OFlag::O_CREAT;
    }
    out
}

fn perm_for(kind: FileKind) -> u16 {
    match kind {
        FileKind::Directory => 0o755,
        FileKind::Regular => 0o666,
    }
}

fn systime(sec: i64, nsec: i64) -> SystemTime {
    if sec >= 0 {
        UNIX_EPOCH + Duration::new(sec as u64, nsec.clamp(0, 999_999_999) as u32)
    } else {
        UNIX_EPOCH
    }
}

/// Attributes synthesised without consulting the backing filesystem. Used
/// for directory listings whose backing object is gone (or, like the
/// sentinel, never existed).
fn approximate_attr(ino: InodeId, kind: FileKind, nlink: u32) -> Attr {
    Attr {
        ino,
        kind,
        size: 0,
        blocks: 0,
        atime: UNIX_EPOCH,
        mtime: UNIX_EPOCH,
        ctime: UNIX_EPOCH,
        perm: perm_for(kind),
        nlink,
    }
}

fn set_times(owner: &Mod, path: &Path, atime: Option<TimeSet>, mtime: Option<TimeSet>) -> io::Result<()> {
    fn ts(t: Option<TimeSet>) -> libc::timespec {
        match t {
            None => libc::timespec {
                tv_sec: 0,
                tv_nsec: libc::UTIME_OMIT,
            },
            Some(TimeSet::Now) => libc::timespec {
                tv_sec: 0,
                tv_nsec: libc::UTIME_NOW,
            },
            Some(TimeSet::Time(t)) => {
                let d = t.duration_since(UNIX_EPOCH).unwrap_or_default();
                libc::timespec {
                    tv_sec: d.as_secs() as libc::time_t,
                    tv_nsec: d.subsec_nanos() as libc::c_long,
                }
            }
        }
    }

    let cpath = CString::new(path.as_os_str().as_bytes()).map_err(|_| einval())?;
    let times = [ts(atime), ts(mtime)];
    // Safe because the path is NUL-terminated and `times` outlives the call.
    let res = unsafe {
        libc::utimensat(
            owner.root_fd(),
            cpath.as_ptr(),
            times.as_ptr(),
            libc::AT_SYMLINK_NOFOLLOW,
        )
    };
    if res < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

struct EntrySnapshot {
    name: OsString,
    child: InodeId,
    kind: FileKind,
    links: u32,
    present: bool,
}

/// The synthesised overlay.
#[derive(Debug)]
pub struct OverlayFs {
    registry: ModRegistry,
    output: Arc<Mod>,
    inodes: Mutex<InodeTable>,
    handles: Mutex<BTreeMap<u64, Arc<HandleData>>>,
    next_handle: AtomicU64,
    cfg: Config,
}

impl OverlayFs {
    /// Builds the overlay from the mount inputs: opens every layer root,
    /// merges the layer trees in precedence order and plants the sentinel.
    /// All configuration errors surface here, before any dispatcher runs.
    pub fn new(opts: &MountOptions) -> Result<OverlayFs, MountError> {
        let cfg = opts.fs.clone();
        let open_layer = |name: String, path: &Path| {
            Mod::open(name, path).map_err(|source| MountError::LayerRoot {
                path: path.to_path_buf(),
                source,
            })
        };

        let mut registry = ModRegistry::new();
        let loopback = open_layer("loopback".into(), &opts.mountpoint)?;
        registry.register(loopback.clone())?;

        let mut table = InodeTable::new(cfg.inode_capacity);
        overlay::init_root(&mut table, &loopback);
        overlay::merge_layer(&mut table, &loopback)?;

        for src in &opts.mods {
            debug!("loading mod '{}'", src.name);
            let m = open_layer(src.name.clone(), &src.root)?;
            registry.register(m.clone())?;
            overlay::merge_layer(&mut table, &m)?;
        }

        let output_name = opts
            .output
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "output".into());
        let output = open_layer(output_name, &opts.output)?;
        registry.register(output.clone())?;
        overlay::merge_layer(&mut table, &output)?;

        overlay::ensure_sentinel(&mut table, &loopback);

        Ok(OverlayFs {
            registry,
            output,
            inodes: Mutex::new(table),
            handles: Mutex::new(BTreeMap::new()),
            next_handle: AtomicU64::new(1),
            cfg,
        })
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    pub fn registry(&self) -> &ModRegistry {
        &self.registry
    }

    fn table(&self) -> std::sync::MutexGuard<'_, InodeTable> {
        self.inodes.lock().unwrap()
    }

    fn snapshot(&self, ino: InodeId) -> io::Result<(Arc<Mod>, PathBuf, FileKind)> {
        let table = self.table();
        let node = table.get(ino).ok_or_else(ebadf)?;
        Ok((
            node.owner().clone(),
            node.real_path().to_path_buf(),
            node.file_kind(),
        ))
    }

    fn handle(&self, fh: u64) -> io::Result<Arc<HandleData>> {
        self.handles.lock().unwrap().get(&fh).cloned().ok_or_else(ebadf)
    }

    fn add_handle(&self, ino: InodeId, file: File) -> u64 {
        let fh = self.next_handle.fetch_add(1, Ordering::SeqCst);
        self.handles
            .lock()
            .unwrap()
            .insert(fh, Arc::new(HandleData { inode: ino, file }));
        fh
    }

    /// Stats the backing object through the case-insensitive layer and
    /// combines it with the synthetic fields.
    fn stat_inode(&self, ino: InodeId) -> io::Result<Attr> {
        let (owner, path, kind, links) = {
            let table = self.table();
            let node = table.get(ino).ok_or_else(ebadf)?;
            (
                node.owner().clone(),
                node.real_path().to_path_buf(),
                node.file_kind(),
                node.links(),
            )
        };
        let st = nocase::stat_nocase(owner.root_fd(), &path, AtFlags::AT_SYMLINK_NOFOLLOW)
            .map_err(|e| {
                if e.raw_os_error() != Some(libc::ENOENT) {
                    error!(
                        "stat failed for [{}] '{}'({}): {}",
                        owner.name(),
                        path.display(),
                        ino,
                        e
                    );
                }
                e
            })?;
        Ok(Attr {
            ino,
            kind,
            size: st.st_size as u64,
            blocks: st.st_blocks as u64,
            atime: systime(st.st_atime, st.st_atime_nsec),
            mtime: systime(st.st_mtime, st.st_mtime_nsec),
            ctime: systime(st.st_ctime, st.st_ctime_nsec),
            perm: perm_for(kind),
            nlink: links,
        })
    }

    /// Builds an entry reply for `ino` and records the kernel's new
    /// name-resolution reference.
    fn entry_for(&self, ino: InodeId) -> io::Result<Entry> {
        let attr = self.stat_inode(ino)?;
        self.table().lookup(ino);
        Ok(Entry {
            ino,
            attr,
            attr_timeout: self.cfg.attr_timeout,
            entry_timeout: self.cfg.entry_timeout,
        })
    }

    pub fn lookup(&self, parent: InodeId, name: &OsStr) -> io::Result<Entry> {
        debug!("lookup called for {}/'{}'", parent, name.to_string_lossy());
        let child = {
            let table = self.table();
            let node = table.get(parent).ok_or_else(ebadf)?;
            if !node.is_dir() {
                return Err(enotdir());
            }
            table.find_dirent(parent, name)
        };
        match child {
            Some(id) => self.entry_for(id),
            None => Err(enoent()),
        }
    }

    pub fn forget(&self, ino: InodeId, nlookup: u64) {
        debug!("forget called for {ino} ({nlookup})");
        // the root is torn down only at unmount
        if ino == INO_ROOT {
            return;
        }
        let mut table = self.table();
        if table.is_allocated(ino) {
            table.forget(ino, nlookup);
        }
    }

    pub fn forget_multi(&self, forgets: &[(InodeId, u64)]) {
        for &(ino, nlookup) in forgets {
            self.forget(ino, nlookup);
        }
    }

    pub fn getattr(&self, ino: InodeId) -> io::Result<(Attr, Duration)> {
        debug!("getattr called for {ino}");
        Ok((self.stat_inode(ino)?, self.cfg.attr_timeout))
    }

    pub fn setattr(
        &self,
        ino: InodeId,
        attrs: &SetAttrs,
        fh: Option<u64>,
    ) -> io::Result<(Attr, Duration)> {
        debug!("setattr called for {ino}");

        if attrs.mode.is_some() || attrs.uid.is_some() || attrs.gid.is_some() {
            debug!("mode and ownership changes are rejected");
            return Err(eacces());
        }

        if let Some(size) = attrs.size {
            let handle = self.handle(fh.ok_or_else(ebadf)?)?;
            let (owner, _, _) = self.snapshot(ino)?;
            // a write-capable open already redirected the inode
            assert!(
                Mod::same(&owner, &self.output),
                "size change on a non-output-backed inode"
            );
            handle.file.set_len(size)?;
        }

        if attrs.atime.is_some() || attrs.mtime.is_some() {
            let (owner, path, _) = self.snapshot(ino)?;
            set_times(&owner, &path, attrs.atime, attrs.mtime)?;
        }

        if attrs.unsupported {
            warn!("unhandled attribute bits in setattr request");
            return Err(eopnotsupp());
        }

        Ok((self.stat_inode(ino)?, self.cfg.attr_timeout))
    }

    fn snapshot_entries(&self, ino: InodeId) -> io::Result<Vec<EntrySnapshot>> {
        let table = self.table();
        let node = table.get(ino).ok_or_else(ebadf)?;
        if !node.is_dir() {
            return Err(enotdir());
        }
        Ok(node
            .entries()
            .iter()
            .map(|ent| {
                if !ent.present {
                    return EntrySnapshot {
                        name: OsString::new(),
                        child: 0,
                        kind: FileKind::Regular,
                        links: 0,
                        present: false,
                    };
                }
                let child = table.get(ent.child).expect("present entry child");
                EntrySnapshot {
                    name: ent.name.clone(),
                    child: ent.child,
                    kind: child.file_kind(),
                    links: child.links(),
                    present: true,
                }
            })
            .collect())
    }

    /// Emits consecutive directory entries starting at `offset` until `add`
    /// reports a full buffer. Tombstoned entries keep their offsets but are
    /// never emitted.
    pub fn readdir(
        &self,
        ino: InodeId,
        offset: i64,
        add: &mut dyn FnMut(DirEntry) -> bool,
    ) -> io::Result<()> {
        debug!("readdir called for {ino} at offset {offset}");
        let entries = self.snapshot_entries(ino)?;
        for (i, ent) in entries.iter().enumerate().skip(offset.max(0) as usize) {
            if !ent.present {
                continue;
            }
            let full = add(DirEntry {
                ino: ent.child,
                next_offset: (i + 1) as i64,
                kind: ent.kind,
                name: ent.name.clone(),
            });
            if full {
                break;
            }
        }
        Ok(())
    }

    /// Like readdir, but each record carries a full entry, and every emitted
    /// child beyond `.`/`..` picks up a name-resolution reference.
    pub fn readdirplus(
        &self,
        ino: InodeId,
        offset: i64,
        add: &mut dyn FnMut(DirEntryPlus) -> bool,
    ) -> io::Result<()> {
        debug!("readdirplus called for {ino} at offset {offset}");
        let entries = self.snapshot_entries(ino)?;
        for (i, ent) in entries.iter().enumerate().skip(offset.max(0) as usize) {
            if !ent.present {
                continue;
            }
            let attr = self
                .stat_inode(ent.child)
                .unwrap_or_else(|_| approximate_attr(ent.child, ent.kind, ent.links));
            let full = add(DirEntryPlus {
                entry: Entry {
                    ino: ent.child,
                    attr,
                    attr_timeout: self.cfg.attr_timeout,
                    entry_timeout: self.cfg.entry_timeout,
                },
                next_offset: (i + 1) as i64,
                name: ent.name.clone(),
            });
            if full {
                break;
            }
            if i >= 2 {
                self.table().lookup(ent.child);
            }
        }
        Ok(())
    }

    pub fn opendir(&self, ino: InodeId) -> io::Result<()> {
        debug!("opendir called for {ino}");
        let mut table = self.table();
        if !table.get(ino).ok_or_else(ebadf)?.is_dir() {
            return Err(enotdir());
        }
        table.open(ino);
        Ok(())
    }

    pub fn releasedir(&self, ino: InodeId) -> io::Result<()> {
        debug!("releasedir called for {ino}");
        let mut table = self.table();
        table.get(ino).ok_or_else(ebadf)?;
        table.close(ino);
        Ok(())
    }

    /// Walks `dir_path` from the logical root, creating each prefix in the
    /// output layer and retargeting the corresponding directory inodes to
    /// it. Halts if a component resolves to a non-directory.
    fn make_output_path(&self, dir_path: &Path) -> io::Result<()> {
        let mut parent = INO_ROOT;
        let mut prefix = PathBuf::from(".");
        let names = dir_path.components().filter_map(|c| match c {
            Component::Normal(name) => Some(name),
            _ => None,
        });
        for name in names {
            prefix.push(name);
            if let Err(e) =
                nocase::mkdir_nocase(self.output.root_fd(), &prefix, Mode::from_bits_truncate(0o755))
            {
                if e.raw_os_error() != Some(libc::EEXIST) {
                    warn!("failed to create output directory '{}': {}", prefix.display(), e);
                }
            }

            let mut table = self.table();
            match table.find_dirent(parent, name) {
                Some(child) => {
                    if !table.get(child).expect("present entry child").is_dir() {
                        return Ok(());
                    }
                    table.retarget(child, self.output.clone());
                    parent = child;
                }
                None => {
                    let id =
                        table.register(FileKind::Directory, self.output.clone(), prefix.clone());
                    table.insert_dirent(id, OsStr::new("."), id);
                    table.insert_dirent(id, OsStr::new(".."), parent);
                    table.insert_dirent(parent, name, id);
                    parent = id;
                }
            }
        }
        Ok(())
    }

    /// Copy-on-write: copies the backing file into the output layer at the
    /// same relative path and retargets the inode there. No-op for inodes
    /// the output layer already owns.
    fn redirect_to_output(&self, ino: InodeId) -> io::Result<()> {
        let (owner, path, _) = self.snapshot(ino)?;
        if Mod::same(&owner, &self.output) {
            return Ok(());
        }
        debug!("redirecting '{}' to the output layer", path.display());

        let dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
        self.make_output_path(&dir)?;
        nocase::copy_nocase(owner.root_fd(), &path, self.output.root_fd(), &path)?;
        self.table().retarget(ino, self.output.clone());
        Ok(())
    }

    pub fn open(&self, ino: InodeId, flags: i32) -> io::Result<u64> {
        debug!("open called for {ino}");
        let hflags = parse_open_flags(flags)?;
        let (_, _, kind) = self.snapshot(ino)?;
        if kind == FileKind::Directory {
            return Err(eisdir());
        }
        if hflags.contains(HandleFlags::WRITE) {
            self.redirect_to_output(ino)?;
        }
        let (owner, path, _) = self.snapshot(ino)?;
        let fd = nocase::open_nocase(
            owner.root_fd(),
            &path,
            backing_oflags(hflags),
            Mode::empty(),
        )?;
        self.table().open(ino);
        Ok(self.add_handle(ino, File::from(fd)))
    }

    /// Open with create semantics: a missing name is created write-through
    /// in the output layer; an existing one degrades to a plain open.
    pub fn create(
        &self,
        parent: InodeId,
        name: &OsStr,
        flags: i32,
        mode: u32,
    ) -> io::Result<(Entry, u64)> {
        debug!("create called for {}/'{}'", parent, name.to_string_lossy());
        let hflags = parse_open_flags(flags)?;
        let existing = {
            let table = self.table();
            let node = table.get(parent).ok_or_else(ebadf)?;
            if !node.is_dir() {
                return Err(enotdir());
            }
            table.find_dirent(parent, name)
        };

        match existing {
            None => {
                let (_, parent_path, _) = self.snapshot(parent)?;
                self.make_output_path(&parent_path)?;
                let real_path = parent_path.join(name);
                let fd = nocase::open_nocase(
                    self.output.root_fd(),
                    &real_path,
                    backing_oflags(hflags | HandleFlags::CREATE),
                    Mode::from_bits_truncate(mode),
                )?;
                let child = {
                    let mut table = self.table();
                    let id = table.register(FileKind::Regular, self.output.clone(), real_path);
                    table.insert_dirent(parent, name, id);
                    table.open(id);
                    id
                };
                let entry = self.entry_for(child)?;
                Ok((entry, self.add_handle(child, File::from(fd))))
            }
            Some(child) => {
                if hflags.contains(HandleFlags::EXCL) {
                    return Err(eexist());
                }
                let fh = self.open(child, flags)?;
                let entry = self.entry_for(child)?;
                Ok((entry, fh))
            }
        }
    }

    pub fn release(&self, ino: InodeId, fh: u64) -> io::Result<()> {
        debug!("release called for {ino}");
        let handle = self.handles.lock().unwrap().remove(&fh).ok_or_else(ebadf)?;
        debug_assert_eq!(handle.inode, ino);
        drop(handle);

        let mut table = self.table();
        let node = table.get(ino).ok_or_else(ebadf)?;
        assert!(!node.is_dir(), "release of a directory inode");
        table.close(ino);
        Ok(())
    }

    pub fn read(&self, ino: InodeId, fh: u64, offset: u64, size: u32) -> io::Result<Vec<u8>> {
        debug!("read called for {ino} ({size} @ {offset})");
        let handle = self.handle(fh)?;
        let mut buf = vec![0u8; size as usize];
        let mut done = 0;
        while done < buf.len() {
            match handle.file.read_at(&mut buf[done..], offset + done as u64) {
                Ok(0) => break,
                Ok(n) => done += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        buf.truncate(done);
        Ok(buf)
    }

    pub fn write(&self, ino: InodeId, fh: u64, offset: u64, data: &[u8]) -> io::Result<u32> {
        debug!("write called for {ino} ({} @ {offset})", data.len());
        let handle = self.handle(fh)?;
        handle.file.write_all_at(data, offset)?;
        Ok(data.len() as u32)
    }

    pub fn flush(&self, ino: InodeId, fh: u64) -> io::Result<()> {
        debug!("flush called for {ino}");
        let handle = self.handle(fh)?;
        // close a duplicate of the underlying descriptor
        handle.file.try_clone().map(drop)
    }

    pub fn fsync(&self, ino: InodeId, fh: u64, datasync: bool) -> io::Result<()> {
        debug!("fsync called for {ino}");
        let handle = self.handle(fh)?;
        if datasync {
            handle.file.sync_data()
        } else {
            handle.file.sync_all()
        }
    }

    pub fn lseek(&self, ino: InodeId, fh: u64, offset: i64, whence: i32) -> io::Result<i64> {
        debug!("lseek called for {ino}");
        let handle = self.handle(fh)?;
        let whence = match whence {
            libc::SEEK_SET => Whence::SeekSet,
            libc::SEEK_CUR => Whence::SeekCur,
            libc::SEEK_END => Whence::SeekEnd,
            libc::SEEK_DATA => Whence::SeekData,
            libc::SEEK_HOLE => Whence::SeekHole,
            _ => return Err(einval()),
        };
        nix::unistd::lseek(handle.file.as_raw_fd(), offset, whence).map_err(nix_err)
    }

    pub fn mkdir(&self, parent: InodeId, name: &OsStr, mode: u32) -> io::Result<Entry> {
        debug!("mkdir called for {}/'{}'", parent, name.to_string_lossy());
        {
            let table = self.table();
            let node = table.get(parent).ok_or_else(ebadf)?;
            if !node.is_dir() {
                return Err(enotdir());
            }
            if table.find_dirent(parent, name).is_some() {
                return Err(eexist());
            }
        }

        let (_, parent_path, _) = self.snapshot(parent)?;
        let real_path = parent_path.join(name);
        self.make_output_path(&parent_path)?;
        nocase::mkdir_nocase(self.output.root_fd(), &real_path, Mode::from_bits_truncate(mode))?;

        let child = {
            let mut table = self.table();
            let id = table.register(FileKind::Directory, self.output.clone(), real_path);
            table.insert_dirent(id, OsStr::new("."), id);
            table.insert_dirent(id, OsStr::new(".."), parent);
            table.insert_dirent(parent, name, id);
            id
        };
        self.entry_for(child)
    }

    pub fn rmdir(&self, parent: InodeId, name: &OsStr) -> io::Result<()> {
        debug!("rmdir called for {}/'{}'", parent, name.to_string_lossy());
        let child_path = {
            let table = self.table();
            table.get(parent).ok_or_else(ebadf)?;
            let child = table.find_dirent(parent, name).ok_or_else(enoent)?;
            let node = table.get(child).expect("present entry child");
            if !node.is_dir() {
                return Err(enotdir());
            }
            node.real_path().to_path_buf()
        };

        // missing in the output layer is fine: the directory may live only
        // in lower layers and is then merely hidden from the logical view
        match nocase::unlink_nocase(self.output.root_fd(), &child_path, UnlinkatFlags::RemoveDir) {
            Ok(()) => {}
            Err(e) if e.raw_os_error() == Some(libc::ENOENT) => {}
            Err(e) => return Err(e),
        }

        let mut table = self.table();
        let idx = table.find_dirent_index(parent, name).ok_or_else(enoent)?;
        table.erase_dirent(parent, idx);
        Ok(())
    }

    /// Unlinks a name. A file the output layer backs is deleted there; a
    /// lower-layer file keeps its backing and only the logical entry goes
    /// away, hiding it for the rest of the session.
    pub fn unlink(&self, parent: InodeId, name: &OsStr) -> io::Result<()> {
        debug!("unlink called for {}/'{}'", parent, name.to_string_lossy());
        let (owner, child_path) = {
            let table = self.table();
            table.get(parent).ok_or_else(ebadf)?;
            let child = table.find_dirent(parent, name).ok_or_else(enoent)?;
            let node = table.get(child).expect("present entry child");
            if node.is_dir() {
                return Err(eisdir());
            }
            (node.owner().clone(), node.real_path().to_path_buf())
        };

        if Mod::same(&owner, &self.output) {
            nocase::unlink_nocase(self.output.root_fd(), &child_path, UnlinkatFlags::NoRemoveDir)?;
        }

        let mut table = self.table();
        let idx = table.find_dirent_index(parent, name).ok_or_else(enoent)?;
        table.erase_dirent(parent, idx);
        Ok(())
    }

    /// Renames within the overlay. Output-backed sources move natively;
    /// lower-layer files are copied into the output layer under the new
    /// name. Either way the destination ends up output-backed under a fresh
    /// inode and the source entry is erased.
    pub fn rename(
        &self,
        parent1: InodeId,
        name1: &OsStr,
        parent2: InodeId,
        name2: &OsStr,
    ) -> io::Result<()> {
        debug!(
            "rename called for {}/'{}' to {}/'{}'",
            parent1,
            name1.to_string_lossy(),
            parent2,
            name2.to_string_lossy()
        );
        let (from_kind, from_owner, from_path, had_target, parent2_path) = {
            let table = self.table();
            for parent in [parent1, parent2] {
                if !table.get(parent).ok_or_else(ebadf)?.is_dir() {
                    return Err(enotdir());
                }
            }
            let from_id = table.find_dirent(parent1, name1).ok_or_else(enoent)?;
            let from = table.get(from_id).expect("present entry child");
            let to_id = table.find_dirent(parent2, name2);
            if let Some(to_id) = to_id {
                let to = table.get(to_id).expect("present entry child");
                assert_eq!(
                    to.file_kind(),
                    from.file_kind(),
                    "rename across object kinds"
                );
                if to_id == from_id {
                    return Ok(());
                }
            }
            (
                from.file_kind(),
                from.owner().clone(),
                from.real_path().to_path_buf(),
                to_id.is_some(),
                table
                    .get(parent2)
                    .expect("checked above")
                    .real_path()
                    .to_path_buf(),
            )
        };

        let to_path = parent2_path.join(name2);
        self.make_output_path(&parent2_path)?;

        if Mod::same(&from_owner, &self.output) {
            renameat(
                Some(self.output.root_fd()),
                &from_path,
                Some(self.output.root_fd()),
                &to_path,
            )
            .map_err(nix_err)?;
        } else {
            assert_eq!(
                from_kind,
                FileKind::Regular,
                "directory renames across layers are not supported"
            );
            nocase::copy_nocase(
                from_owner.root_fd(),
                &from_path,
                self.output.root_fd(),
                &to_path,
            )?;
        }

        let mut table = self.table();
        if had_target {
            if let Some(idx) = table.find_dirent_index(parent2, name2) {
                table.erase_dirent(parent2, idx);
            }
        }
        let new_id = table.register(FileKind::Regular, self.output.clone(), to_path);
        table.insert_dirent(parent2, name2, new_id);
        if let Some(idx) = table.find_dirent_index(parent1, name1) {
            table.erase_dirent(parent1, idx);
        }
        Ok(())
    }

    pub fn statfs(&self) -> VolumeStats {
        VolumeStats { name_max: 256 }
    }

    /// Unmount teardown: drops every open handle and frees the whole tree
    /// regardless of outstanding references.
    pub fn shutdown(&self) {
        debug!("freeing file tree");
        self.handles.lock().unwrap().clear();
        let mut table = self.table();
        if table.is_allocated(INO_ROOT) {
            table.force_free(INO_ROOT);
        }
    }

    /// Logs the merged view of the mount root.
    pub(crate) fn log_root_listing(&self) {
        let table = self.table();
        let root = table.get(INO_ROOT).expect("root inode");
        debug!("merged view at the mount root:");
        for ent in root.entries() {
            if !ent.present {
                continue;
            }
            let child = table.get(ent.child).expect("present entry child");
            debug!(
                "  {:6} {:14} {}",
                ent.child,
                child.owner().name(),
                ent.name.to_string_lossy()
            );
        }
    }

    #[cfg(test)]
    pub(crate) fn with_inodes<R>(&self, f: impl FnOnce(&InodeTable) -> R) -> R {
        f(&self.table())
    }
}
