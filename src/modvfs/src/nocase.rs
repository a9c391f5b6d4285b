//! Case-insensitive path resolution over a case-sensitive backing filesystem.
//!
//! Game content routinely mixes `Data`, `data` and `DATA` for the same
//! directory, so every primitive here takes a directory fd and a relative
//! path, walks it component by component and matches each component against
//! the backing directory under ASCII case folding. The first matching entry
//! in enumeration order wins. Folding is ASCII-only: filenames that differ
//! only in non-ASCII case are distinct names.

use std::fs::File;
use std::ffi::{OsStr, OsString};
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::{Component, Path, PathBuf};

use nix::dir::Dir;
use nix::fcntl::{openat, AtFlags, OFlag};
use nix::sys::stat::{fstatat, mkdirat, FileStat, Mode};
use nix::unistd::{unlinkat, UnlinkatFlags};

pub(crate) fn nix_err(err: nix::Error) -> io::Error {
    io::Error::from_raw_os_error(err as i32)
}

fn enoent() -> io::Error {
    io::Error::from_raw_os_error(libc::ENOENT)
}

/// True when `a` and `b` are equal under ASCII case folding.
pub(crate) fn eq_nocase(a: &OsStr, b: &OsStr) -> bool {
    a.as_bytes().eq_ignore_ascii_case(b.as_bytes())
}

/// Splits a relative path into its intermediate directories and final
/// component. An empty path (or a bare `.`) addresses the directory itself.
fn split(path: &Path) -> (Vec<&OsStr>, &OsStr) {
    let mut parts: Vec<&OsStr> = path
        .components()
        .filter_map(|c| match c {
            Component::Normal(name) => Some(name),
            _ => None,
        })
        .collect();
    match parts.pop() {
        Some(last) => (parts, last),
        None => (Vec::new(), OsStr::new(".")),
    }
}

/// Scans `dirfd` for the first entry matching `name` case-insensitively and
/// returns its on-disk spelling.
fn match_entry(dirfd: RawFd, name: &OsStr) -> io::Result<Option<OsString>> {
    let mut dir = Dir::openat(
        dirfd,
        ".",
        OFlag::O_RDONLY | OFlag::O_DIRECTORY,
        Mode::empty(),
    )
    .map_err(nix_err)?;
    for entry in dir.iter() {
        let entry = entry.map_err(nix_err)?;
        let entry_name = OsStr::from_bytes(entry.file_name().to_bytes());
        if eq_nocase(entry_name, name) {
            return Ok(Some(entry_name.to_os_string()));
        }
    }
    Ok(None)
}

fn open_dir(dirfd: RawFd, name: &OsStr) -> io::Result<OwnedFd> {
    let fd = openat(
        dirfd,
        name,
        OFlag::O_RDONLY | OFlag::O_DIRECTORY,
        Mode::empty(),
    )
    .map_err(nix_err)?;
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Walks the intermediate components of `path` and returns an fd for the
/// directory holding the final component (`None` means `dirfd` itself),
/// together with the final component as spelled by the caller.
fn walk_parent<'p>(dirfd: RawFd, path: &'p Path) -> io::Result<(Option<OwnedFd>, &'p OsStr)> {
    let (dirs, last) = split(path);
    let mut current: Option<OwnedFd> = None;
    for name in dirs {
        let at = current.as_ref().map_or(dirfd, |fd| fd.as_raw_fd());
        match match_entry(at, name)? {
            Some(real) => current = Some(open_dir(at, &real)?),
            None => return Err(enoent()),
        }
    }
    Ok((current, last))
}

/// Case-insensitive `openat`. With `O_CREAT`, a final component that has no
/// case-insensitive match is created with the casing given by the caller.
pub fn open_nocase(dirfd: RawFd, path: &Path, flags: OFlag, mode: Mode) -> io::Result<OwnedFd> {
    let (parent, last) = walk_parent(dirfd, path)?;
    let at = parent.as_ref().map_or(dirfd, |fd| fd.as_raw_fd());
    let target = match match_entry(at, last)? {
        Some(real) => real,
        None if flags.contains(OFlag::O_CREAT) => last.to_os_string(),
        None => return Err(enoent()),
    };
    let fd = openat(at, target.as_os_str(), flags, mode).map_err(nix_err)?;
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Case-insensitive `fstatat`.
pub fn stat_nocase(dirfd: RawFd, path: &Path, flags: AtFlags) -> io::Result<FileStat> {
    let (parent, last) = walk_parent(dirfd, path)?;
    let at = parent.as_ref().map_or(dirfd, |fd| fd.as_raw_fd());
    match match_entry(at, last)? {
        Some(real) => fstatat(at, real.as_os_str(), flags).map_err(nix_err),
        None => Err(enoent()),
    }
}

/// Case-insensitive `unlinkat`.
pub fn unlink_nocase(dirfd: RawFd, path: &Path, flags: UnlinkatFlags) -> io::Result<()> {
    let (parent, last) = walk_parent(dirfd, path)?;
    let at = parent.as_ref().map_or(dirfd, |fd| fd.as_raw_fd());
    match match_entry(at, last)? {
        Some(real) => unlinkat(Some(at), real.as_os_str(), flags).map_err(nix_err),
        None => Err(enoent()),
    }
}

/// Case-insensitive `mkdirat`. A final component that already has a
/// case-insensitive match is re-created under its on-disk spelling, so the
/// caller observes the host's `EEXIST`.
pub fn mkdir_nocase(dirfd: RawFd, path: &Path, mode: Mode) -> io::Result<()> {
    let (parent, last) = walk_parent(dirfd, path)?;
    let at = parent.as_ref().map_or(dirfd, |fd| fd.as_raw_fd());
    let target = match match_entry(at, last)? {
        Some(real) => real,
        None => last.to_os_string(),
    };
    mkdirat(at, target.as_os_str(), mode).map_err(nix_err)
}

/// Copies a regular file between two layers, creating or truncating the
/// destination. Both paths resolve case-insensitively; a missing destination
/// is created with the casing given by the caller.
pub fn copy_nocase(from_fd: RawFd, from: &Path, to_fd: RawFd, to: &Path) -> io::Result<u64> {
    let src = open_nocase(from_fd, from, OFlag::O_RDONLY, Mode::empty())?;
    let dst = open_nocase(
        to_fd,
        to,
        OFlag::O_WRONLY | OFlag::O_CREAT | OFlag::O_TRUNC,
        Mode::from_bits_truncate(0o666),
    )?;
    let mut src = File::from(src);
    let mut dst = File::from(dst);
    io::copy(&mut src, &mut dst)
}

/// Rewrites `path` so that every component that resolves in the backing tree
/// carries its on-disk casing. Components past the first unresolved one keep
/// the caller's spelling; install flows rely on this to extend an existing
/// tree instead of forking a second casing of it.
pub fn canonicalize_case(dirfd: RawFd, path: &Path) -> io::Result<PathBuf> {
    let names: Vec<&OsStr> = path
        .components()
        .filter_map(|c| match c {
            Component::Normal(name) => Some(name),
            _ => None,
        })
        .collect();

    let mut out = PathBuf::new();
    let mut current: Option<OwnedFd> = None;
    let mut resolved = true;
    for (i, &name) in names.iter().enumerate() {
        if resolved {
            let at = current.as_ref().map_or(dirfd, |fd| fd.as_raw_fd());
            match match_entry(at, name)? {
                Some(real) => {
                    out.push(&real);
                    if i + 1 < names.len() {
                        match open_dir(at, &real) {
                            Ok(fd) => current = Some(fd),
                            // matched a non-directory mid-path; stop correcting
                            Err(_) => resolved = false,
                        }
                    }
                    continue;
                }
                None => resolved = false,
            }
        }
        out.push(name);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::io::Read;
    use tempfile::TempDir;

    fn dirfd(dir: &TempDir) -> OwnedFd {
        let fd = nix::fcntl::open(
            dir.path(),
            OFlag::O_RDONLY | OFlag::O_DIRECTORY,
            Mode::empty(),
        )
        .unwrap();
        unsafe { OwnedFd::from_raw_fd(fd) }
    }

    fn setup() -> TempDir {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("Data/Textures")).unwrap();
        fs::write(dir.path().join("Data/Foo.esp"), "foo").unwrap();
        fs::write(dir.path().join("Data/Textures/armor.dds"), "dds").unwrap();
        dir
    }

    #[test]
    fn test_open_mixed_case() -> io::Result<()> {
        let dir = setup();
        let fd = dirfd(&dir);

        let file = open_nocase(
            fd.as_raw_fd(),
            Path::new("data/FOO.ESP"),
            OFlag::O_RDONLY,
            Mode::empty(),
        )?;
        let mut content = String::new();
        File::from(file).read_to_string(&mut content)?;
        assert_eq!(content, "foo");
        Ok(())
    }

    #[test]
    fn test_open_missing_is_enoent() {
        let dir = setup();
        let fd = dirfd(&dir);

        let err = open_nocase(
            fd.as_raw_fd(),
            Path::new("data/missing.esp"),
            OFlag::O_RDONLY,
            Mode::empty(),
        )
        .unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ENOENT));
    }

    #[test]
    fn test_open_creates_with_given_casing() -> io::Result<()> {
        let dir = setup();
        let fd = dirfd(&dir);

        open_nocase(
            fd.as_raw_fd(),
            Path::new("DATA/New.esp"),
            OFlag::O_WRONLY | OFlag::O_CREAT,
            Mode::from_bits_truncate(0o666),
        )?;
        // intermediate components resolve to the on-disk tree, the final
        // one is created as spelled
        assert!(dir.path().join("Data/New.esp").exists());
        Ok(())
    }

    #[test]
    fn test_stat_and_unlink() -> io::Result<()> {
        let dir = setup();
        let fd = dirfd(&dir);

        let st = stat_nocase(
            fd.as_raw_fd(),
            Path::new("DATA/TEXTURES/ARMOR.DDS"),
            AtFlags::AT_SYMLINK_NOFOLLOW,
        )?;
        assert_eq!(st.st_size, 3);

        unlink_nocase(
            fd.as_raw_fd(),
            Path::new("data/textures/Armor.DDS"),
            UnlinkatFlags::NoRemoveDir,
        )?;
        assert!(!dir.path().join("Data/Textures/armor.dds").exists());
        Ok(())
    }

    #[test]
    fn test_mkdir_existing_is_eexist() {
        let dir = setup();
        let fd = dirfd(&dir);

        let err = mkdir_nocase(
            fd.as_raw_fd(),
            Path::new("data"),
            Mode::from_bits_truncate(0o755),
        )
        .unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EEXIST));

        mkdir_nocase(
            fd.as_raw_fd(),
            Path::new("DATA/Meshes"),
            Mode::from_bits_truncate(0o755),
        )
        .unwrap();
        assert!(dir.path().join("Data/Meshes").is_dir());
    }

    #[test]
    fn test_copy_between_trees() -> io::Result<()> {
        let from = setup();
        let to = TempDir::new().unwrap();
        fs::create_dir(to.path().join("Data")).unwrap();
        let from_fd = dirfd(&from);
        let to_fd = dirfd(&to);

        copy_nocase(
            from_fd.as_raw_fd(),
            Path::new("data/foo.esp"),
            to_fd.as_raw_fd(),
            Path::new("DATA/foo.esp"),
        )?;
        assert_eq!(fs::read_to_string(to.path().join("Data/foo.esp"))?, "foo");
        Ok(())
    }

    #[test]
    fn test_canonicalize_case() -> io::Result<()> {
        let dir = setup();
        let fd = dirfd(&dir);

        let fixed = canonicalize_case(fd.as_raw_fd(), Path::new("DATA/textures/ARMOR.dds"))?;
        assert_eq!(fixed, PathBuf::from("Data/Textures/armor.dds"));

        // unresolved tail keeps the caller's spelling
        let fixed = canonicalize_case(fd.as_raw_fd(), Path::new("data/NewDir/file.dds"))?;
        assert_eq!(fixed, PathBuf::from("Data/NewDir/file.dds"));
        Ok(())
    }

    #[test]
    fn test_first_match_in_enumeration_order_wins() -> io::Result<()> {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("readme.txt"), "lower").unwrap();
        fs::write(dir.path().join("README.TXT"), "upper").unwrap();
        let fd = dirfd(&dir);

        // both spellings resolve, and always to the same entry
        let a = stat_nocase(
            fd.as_raw_fd(),
            Path::new("readme.txt"),
            AtFlags::AT_SYMLINK_NOFOLLOW,
        )?;
        let b = stat_nocase(
            fd.as_raw_fd(),
            Path::new("Readme.Txt"),
            AtFlags::AT_SYMLINK_NOFOLLOW,
        )?;
        assert_eq!(a.st_ino, b.st_ino);
        Ok(())
    }
}
