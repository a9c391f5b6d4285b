//! Interface contract between the overlay and the FOMOD installer.
//!
//! The installer is an external collaborator: it drives an interactive
//! wizard over an XML module configuration, neither of which lives here.
//! What it needs from the VFS is exactly two handles, and the VFS stays
//! unaware of it:
//!
//! - a read view of the mounted game data directory, used only for
//!   case-insensitive stats when evaluating `fileDependency` conditions;
//! - a write target: a fresh mod's data root that becomes a layer on the
//!   next mount.

use std::fs;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::path::{Path, PathBuf};

use nix::fcntl::{open, AtFlags, OFlag};
use nix::sys::stat::Mode;

use crate::nocase::{self, nix_err};

/// State of a file named by a `fileDependency` condition. The overlay can
/// only observe presence: a plugin that exists but is not in the load order
/// (`Inactive`) is indistinguishable from a missing one here and evaluates
/// as absent.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileState {
    Active,
    Inactive,
    Missing,
}

/// Read view of the mounted data directory.
pub struct GameDataView {
    root: OwnedFd,
}

impl GameDataView {
    pub fn open(data_dir: &Path) -> io::Result<GameDataView> {
        let fd = open(data_dir, OFlag::O_RDONLY | OFlag::O_DIRECTORY, Mode::empty())
            .map_err(nix_err)?;
        Ok(GameDataView {
            root: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    /// Observed state of `rel` under the data root, case-insensitively.
    pub fn file_state(&self, rel: &Path) -> FileState {
        match nocase::stat_nocase(self.root.as_raw_fd(), rel, AtFlags::empty()) {
            Ok(st) if st.st_mode & libc::S_IFMT == libc::S_IFREG => FileState::Active,
            _ => FileState::Missing,
        }
    }

    /// Evaluates a `fileDependency` condition requiring `wanted`.
    pub fn satisfies(&self, rel: &Path, wanted: FileState) -> bool {
        let present = self.file_state(rel) == FileState::Active;
        match wanted {
            FileState::Active => present,
            FileState::Inactive | FileState::Missing => !present,
        }
    }
}

/// Write target for an installation: the data root of a fresh mod.
pub struct InstallTarget {
    root: PathBuf,
    rootfd: OwnedFd,
}

impl InstallTarget {
    /// Creates (if needed) and opens the target data root.
    pub fn create(root: &Path) -> io::Result<InstallTarget> {
        fs::create_dir_all(root)?;
        let fd = open(root, OFlag::O_RDONLY | OFlag::O_DIRECTORY, Mode::empty()).map_err(nix_err)?;
        Ok(InstallTarget {
            root: root.to_path_buf(),
            rootfd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Canonicalises the destination against what already exists in the
    /// target, so repeated installs extend one tree instead of forking a
    /// second casing of it.
    fn dest_path(&self, dest_rel: &Path) -> io::Result<PathBuf> {
        let fixed = nocase::canonicalize_case(self.rootfd.as_raw_fd(), dest_rel)?;
        Ok(self.root.join(fixed))
    }

    /// Copies one chosen file into the target, creating parent directories.
    pub fn install_file(&self, src: &Path, dest_rel: &Path) -> io::Result<()> {
        let dest = self.dest_path(dest_rel)?;
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(src, &dest)?;
        Ok(())
    }

    /// Copies a chosen folder into the target, merging with existing
    /// directories and overwriting existing files.
    pub fn install_dir(&self, src: &Path, dest_rel: &Path) -> io::Result<()> {
        let dest = self.dest_path(dest_rel)?;
        copy_tree(src, &dest)
    }
}

fn copy_tree(src: &Path, dest: &Path) -> io::Result<()> {
    fs::create_dir_all(dest)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let target = dest.join(entry.file_name());
        let kind = entry.file_type()?;
        if kind.is_dir() {
            copy_tree(&entry.path(), &target)?;
        } else if kind.is_file() {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn game_data() -> TempDir {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("Data")).unwrap();
        fs::write(dir.path().join("Data/Skyrim.esm"), "esm").unwrap();
        dir
    }

    #[test]
    fn test_file_state_is_case_insensitive() {
        let dir = game_data();
        let view = GameDataView::open(dir.path()).unwrap();

        assert_eq!(view.file_state(Path::new("data/SKYRIM.ESM")), FileState::Active);
        assert_eq!(view.file_state(Path::new("Data/missing.esp")), FileState::Missing);
        // directories are not dependency files
        assert_eq!(view.file_state(Path::new("Data")), FileState::Missing);
    }

    #[test]
    fn test_satisfies_dependency_states() {
        let dir = game_data();
        let view = GameDataView::open(dir.path()).unwrap();

        assert!(view.satisfies(Path::new("DATA/skyrim.esm"), FileState::Active));
        assert!(!view.satisfies(Path::new("DATA/skyrim.esm"), FileState::Missing));
        assert!(view.satisfies(Path::new("Data/other.esp"), FileState::Missing));
        assert!(view.satisfies(Path::new("Data/other.esp"), FileState::Inactive));
        assert!(!view.satisfies(Path::new("Data/other.esp"), FileState::Active));
    }

    #[test]
    fn test_install_file_reuses_existing_casing() {
        let staging = TempDir::new().unwrap();
        fs::write(staging.path().join("mod.esp"), "plugin").unwrap();

        let target_dir = TempDir::new().unwrap();
        let target = InstallTarget::create(&target_dir.path().join("data")).unwrap();
        fs::create_dir_all(target.root().join("Meshes/Armor")).unwrap();

        target
            .install_file(&staging.path().join("mod.esp"), Path::new("MESHES/armor/mod.esp"))
            .unwrap();

        // the existing prefix keeps its casing, only the new leaf is created
        assert!(target.root().join("Meshes/Armor/mod.esp").exists());
        assert!(!target.root().join("MESHES").exists());
    }

    #[test]
    fn test_install_dir_merges_and_overwrites() {
        let staging = TempDir::new().unwrap();
        fs::create_dir_all(staging.path().join("textures")).unwrap();
        fs::write(staging.path().join("textures/a.dds"), "new").unwrap();
        fs::write(staging.path().join("readme.txt"), "readme").unwrap();

        let target_dir = TempDir::new().unwrap();
        let target = InstallTarget::create(target_dir.path()).unwrap();
        fs::create_dir_all(target.root().join("Install/textures")).unwrap();
        fs::write(target.root().join("Install/textures/a.dds"), "old").unwrap();
        fs::write(target.root().join("Install/textures/b.dds"), "keep").unwrap();

        target.install_dir(staging.path(), Path::new("install")).unwrap();

        let base = target.root().join("Install");
        assert_eq!(fs::read_to_string(base.join("textures/a.dds")).unwrap(), "new");
        assert_eq!(fs::read_to_string(base.join("textures/b.dds")).unwrap(), "keep");
        assert_eq!(fs::read_to_string(base.join("readme.txt")).unwrap(), "readme");
    }
}
