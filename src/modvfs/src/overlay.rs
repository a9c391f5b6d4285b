//! Builds the merged inode tree from the layer stack.
//!
//! Layers are applied in precedence order: the loopback base first, then the
//! user mods in their configured order, and the output layer last. Directory
//! collisions merge into the existing logical directory; file collisions
//! retarget the existing inode so the later layer wins; a file/directory
//! collision across layers is a configuration error that fails the mount.

use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::warn;
use nix::dir::{Dir, Type};
use nix::fcntl::OFlag;
use nix::sys::stat::Mode;

use crate::inode::{FileKind, InodeId, InodeTable, INO_ROOT};
use crate::mods::Mod;
use crate::nocase::nix_err;
use crate::session::MountError;

/// Synthetic root entry marking an active mount for outside tooling. It is
/// recognised by name alone and does not resolve to a backing object.
pub const SENTINEL: &str = ".LMODORG";

/// Installs the root inode, backed by the loopback layer. The root's `..`
/// loops back onto itself, matching what tools observe on a typical overlay
/// mount.
pub(crate) fn init_root(table: &mut InodeTable, loopback: &Arc<Mod>) {
    table.register_at(
        INO_ROOT,
        FileKind::Directory,
        loopback.clone(),
        PathBuf::from("."),
    );
    table.insert_dirent(INO_ROOT, OsStr::new("."), INO_ROOT);
    table.insert_dirent(INO_ROOT, OsStr::new(".."), INO_ROOT);
}

/// Merges one layer's tree into the table, rooted at the logical root.
pub(crate) fn merge_layer(table: &mut InodeTable, layer: &Arc<Mod>) -> Result<(), MountError> {
    merge_dir(table, INO_ROOT, layer, Path::new("."))
}

fn walk_err(path: &Path, err: nix::Error) -> MountError {
    MountError::LayerWalk {
        path: path.to_path_buf(),
        source: nix_err(err),
    }
}

fn merge_dir(
    table: &mut InodeTable,
    parent: InodeId,
    layer: &Arc<Mod>,
    real_path: &Path,
) -> Result<(), MountError> {
    let mut dir = Dir::openat(
        layer.root_fd(),
        real_path,
        OFlag::O_RDONLY | OFlag::O_DIRECTORY,
        Mode::empty(),
    )
    .map_err(|e| walk_err(real_path, e))?;

    for entry in dir.iter() {
        let entry = entry.map_err(|e| walk_err(real_path, e))?;
        let name_bytes = entry.file_name().to_bytes();
        if name_bytes == b"." || name_bytes == b".." {
            continue;
        }
        let name = OsStr::from_bytes(name_bytes);
        let child_path = real_path.join(name);

        match entry.file_type() {
            Some(Type::Directory) => {
                let child = match table.find_dirent(parent, name) {
                    Some(existing) => {
                        if !table.get(existing).expect("present entry child").is_dir() {
                            return Err(MountError::KindCollision { path: child_path });
                        }
                        // merged: the existing inode keeps its earlier owner
                        existing
                    }
                    None => {
                        let id =
                            table.register(FileKind::Directory, layer.clone(), child_path.clone());
                        table.insert_dirent(id, OsStr::new("."), id);
                        table.insert_dirent(id, OsStr::new(".."), parent);
                        table.insert_dirent(parent, name, id);
                        id
                    }
                };
                merge_dir(table, child, layer, &child_path)?;
            }
            Some(Type::File) => match table.find_dirent_index(parent, name) {
                Some(idx) => {
                    let existing = table.get(parent).expect("parent inode").entries()[idx].child;
                    if table.get(existing).expect("present entry child").is_dir() {
                        return Err(MountError::KindCollision { path: child_path });
                    }
                    // the later layer wins: it now backs the file, and the
                    // entry takes its casing
                    table.set_backing(existing, layer.clone(), child_path);
                    table.rename_dirent(parent, idx, name);
                }
                None => {
                    let id = table.register(FileKind::Regular, layer.clone(), child_path);
                    table.insert_dirent(parent, name, id);
                }
            },
            _ => {
                warn!(
                    "unhandled file type for '{}', entry ignored",
                    child_path.display()
                );
            }
        }
    }
    Ok(())
}

/// Ensures the root lists the sentinel entry. If no layer genuinely contains
/// a file of that name, a synthetic inode without a backing object is
/// registered; readdir shows it with approximate attributes and lookups on
/// it report "no such entry".
pub(crate) fn ensure_sentinel(table: &mut InodeTable, loopback: &Arc<Mod>) {
    let name = OsStr::new(SENTINEL);
    if table.find_dirent(INO_ROOT, name).is_none() {
        let id = table.register(FileKind::Regular, loopback.clone(), PathBuf::from(SENTINEL));
        table.insert_dirent(INO_ROOT, name, id);
    }
}
