//! A union/overlay virtual filesystem for game mod management.
//!
//! At a chosen mount point, `modvfs` exposes a single directory hierarchy
//! synthesised from an ordered stack of real directories: the mount point's
//! own contents (the loopback layer), zero or more mods in priority order,
//! and a writable output layer on top. Path resolution is case-insensitive
//! against the case-sensitive backing filesystem, and every modification is
//! redirected into the output layer, so neither the game installation nor
//! any mod directory is ever written to.
//!
//! The overlay is rebuilt from scratch on every [`Session::mount`]; nothing
//! about it persists or survives a crash, by design.

pub mod fomod;
mod fs;
mod fuse;
mod inode;
mod mods;
mod nocase;
mod overlay;
mod session;

pub use fs::{
    Attr, Config, DirEntry, DirEntryPlus, Entry, OverlayFs, SetAttrs, TimeSet, VolumeStats,
};
pub use inode::{Dirent, FileKind, Inode, InodeId, InodeTable, INO_INVALID, INO_ROOT};
pub use mods::{DuplicateMod, Mod, ModRegistry, ModSource};
pub use nocase::{
    canonicalize_case, copy_nocase, mkdir_nocase, open_nocase, stat_nocase, unlink_nocase,
};
pub use overlay::SENTINEL;
pub use session::{MountError, MountOptions, Session};
