//! Registry of mount layers.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use nix::fcntl::{open, OFlag};
use nix::sys::stat::Mode;

use crate::nocase::nix_err;

/// A named layer contributing files to the overlay.
///
/// A mod's identity is its allocation, not its name: inodes compare owners
/// with [`Mod::same`] and two registered mods never share a name. The root
/// handle stays open until the registry is dropped at unmount.
pub struct Mod {
    name: String,
    root: OwnedFd,
}

impl Mod {
    /// Opens a durable handle to the layer's root directory.
    pub fn open(name: impl Into<String>, root: &Path) -> io::Result<Arc<Mod>> {
        let fd = open(root, OFlag::O_RDONLY | OFlag::O_DIRECTORY, Mode::empty()).map_err(nix_err)?;
        Ok(Arc::new(Mod {
            name: name.into(),
            root: unsafe { OwnedFd::from_raw_fd(fd) },
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn root_fd(&self) -> RawFd {
        self.root.as_raw_fd()
    }

    /// True when `a` and `b` are the same layer.
    pub fn same(a: &Arc<Mod>, b: &Arc<Mod>) -> bool {
        Arc::ptr_eq(a, b)
    }
}

impl std::fmt::Debug for Mod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mod").field("name", &self.name).finish()
    }
}

/// A mod available for mounting: a name plus the root path backing it.
#[derive(Clone, Debug)]
pub struct ModSource {
    pub name: String,
    pub root: PathBuf,
}

impl ModSource {
    pub fn new(name: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        ModSource {
            name: name.into(),
            root: root.into(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("redefinition of mod '{0}'")]
pub struct DuplicateMod(pub String);

/// Sorted-by-name list of registered mods, immutable once the overlay is
/// mounted. The registry exists so inodes can name their owning layer in
/// diagnostics and so the overlay builder can iterate layers; precedence is
/// the builder's walk order, not the registry order.
#[derive(Default, Debug)]
pub struct ModRegistry {
    mods: Vec<Arc<Mod>>,
}

impl ModRegistry {
    pub fn new() -> Self {
        ModRegistry { mods: Vec::new() }
    }

    pub fn register(&mut self, m: Arc<Mod>) -> Result<(), DuplicateMod> {
        match self.mods.binary_search_by(|probe| probe.name().cmp(m.name())) {
            Ok(_) => Err(DuplicateMod(m.name().to_string())),
            Err(idx) => {
                self.mods.insert(idx, m);
                Ok(())
            }
        }
    }

    pub fn find(&self, name: &str) -> Option<&Arc<Mod>> {
        self.mods
            .binary_search_by(|probe| probe.name().cmp(name))
            .ok()
            .map(|idx| &self.mods[idx])
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Mod>> {
        self.mods.iter()
    }

    pub fn len(&self) -> usize {
        self.mods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mods.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_register_and_find() {
        let dir = TempDir::new().unwrap();
        let mut registry = ModRegistry::new();

        let b = Mod::open("beta", dir.path()).unwrap();
        let a = Mod::open("alpha", dir.path()).unwrap();
        registry.register(b.clone()).unwrap();
        registry.register(a.clone()).unwrap();

        assert_eq!(registry.len(), 2);
        assert!(Mod::same(registry.find("alpha").unwrap(), &a));
        assert!(Mod::same(registry.find("beta").unwrap(), &b));
        assert!(registry.find("gamma").is_none());

        // kept sorted by name
        let names: Vec<&str> = registry.iter().map(|m| m.name()).collect();
        assert_eq!(names, ["alpha", "beta"]);
    }

    #[test]
    fn test_duplicate_name_is_rejected() {
        let dir = TempDir::new().unwrap();
        let mut registry = ModRegistry::new();

        registry.register(Mod::open("same", dir.path()).unwrap()).unwrap();
        let err = registry
            .register(Mod::open("same", dir.path()).unwrap())
            .unwrap_err();
        assert_eq!(err.0, "same");
    }

    #[test]
    fn test_identity_is_not_name() {
        let dir = TempDir::new().unwrap();
        let a = Mod::open("m", dir.path()).unwrap();
        let b = Mod::open("m", dir.path()).unwrap();
        assert!(Mod::same(&a, &a.clone()));
        assert!(!Mod::same(&a, &b));
    }
}
