//! Mount lifecycle.
//!
//! A [`Session`] owns the overlay state and the dispatcher thread driving
//! it. The main thread stays free to block on user input; unmounting joins
//! the dispatcher and tears the in-memory tree down. Nothing about the
//! overlay persists between sessions.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info};

use crate::fs::{Config, OverlayFs};
use crate::fuse::FuseAdapter;
use crate::mods::{DuplicateMod, ModSource};
use crate::overlay::SENTINEL;

/// Configuration errors that fail a mount attempt. All of them surface
/// before the dispatcher thread starts.
#[derive(Debug, thiserror::Error)]
pub enum MountError {
    #[error(transparent)]
    Duplicate(#[from] DuplicateMod),

    #[error("failed to open layer root '{path}'")]
    LayerRoot {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to read layer directory '{path}'")]
    LayerWalk {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("incompatible mapping for '{path}', cannot merge a file with a directory")]
    KindCollision { path: PathBuf },

    #[error("a vfs is already mounted at '{0}'")]
    AlreadyMounted(PathBuf),

    #[error("failed to mount virtual filesystem")]
    Mount(#[source] io::Error),
}

/// Mount-time inputs: the mount point (which doubles as the loopback
/// layer), the writable output directory, and the user mods in priority
/// order.
#[derive(Clone, Debug)]
pub struct MountOptions {
    pub mountpoint: PathBuf,
    pub output: PathBuf,
    pub mods: Vec<ModSource>,
    pub fs: Config,
}

impl MountOptions {
    pub fn new(mountpoint: impl Into<PathBuf>, output: impl Into<PathBuf>) -> Self {
        MountOptions {
            mountpoint: mountpoint.into(),
            output: output.into(),
            mods: Vec::new(),
            fs: Config::default(),
        }
    }

    pub fn with_mod(mut self, source: ModSource) -> Self {
        self.mods.push(source);
        self
    }
}

/// An active mount. Dropping the session unmounts it.
pub struct Session {
    fs: Arc<OverlayFs>,
    backend: Option<fuser::BackgroundSession>,
    mountpoint: PathBuf,
}

impl Session {
    /// Validates the configuration, builds the overlay and starts the
    /// dispatcher thread.
    pub fn mount(opts: MountOptions) -> Result<Session, MountError> {
        if Self::is_active(&opts.mountpoint) {
            return Err(MountError::AlreadyMounted(opts.mountpoint));
        }

        let fs = Arc::new(OverlayFs::new(&opts)?);
        fs.log_root_listing();

        let mount_opts = [fuser::MountOption::FSName("modvfs".into())];
        let backend = fuser::spawn_mount2(FuseAdapter::new(fs.clone()), &opts.mountpoint, &mount_opts)
            .map_err(MountError::Mount)?;
        info!("vfs mounted at '{}'", opts.mountpoint.display());

        Ok(Session {
            fs,
            backend: Some(backend),
            mountpoint: opts.mountpoint,
        })
    }

    pub fn mountpoint(&self) -> &Path {
        &self.mountpoint
    }

    /// True when a directory already presents the sentinel entry, i.e. an
    /// overlay is mounted there right now.
    pub fn is_active(mountpoint: &Path) -> bool {
        match std::fs::read_dir(mountpoint) {
            Ok(entries) => entries
                .filter_map(Result::ok)
                .any(|ent| ent.file_name() == SENTINEL),
            Err(_) => false,
        }
    }

    /// Unmounts and tears down the in-memory tree.
    pub fn unmount(mut self) {
        self.teardown();
    }

    fn teardown(&mut self) {
        if let Some(backend) = self.backend.take() {
            backend.join();
            debug!("dispatcher thread joined");
        }
        self.fs.shutdown();
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.teardown();
    }
}
