//! Scoped working directories.
//!
//! Both guards release on drop. Release failures are logged, never raised.

use crate::error::Result;
use crate::process::{Cmd, CommandRunner};
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use tracing::{debug, warn};

/// A fresh directory below the tmp root.
///
/// Dropping removes the directory only if it is empty; anything left
/// behind (a mount that failed to release, say) is kept for inspection.
#[derive(Debug)]
pub struct ScratchDir {
    path: PathBuf,
}

impl ScratchDir {
    pub fn new(tmp_root: &Path) -> Result<Self> {
        fs::create_dir_all(tmp_root)?;
        let path = tempfile::Builder::new()
            .prefix("vmbuilder")
            .tempdir_in(tmp_root)?
            .into_path();
        debug!("Created scratch directory {}", path.display());
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_dir(&self.path) {
            warn!("Leaving {} in place: {}", self.path.display(), e);
        }
    }
}

/// Parse a `--tmpfs` size: `-` selects the 1024 MB default.
pub fn tmpfs_size(arg: &str) -> Result<u64> {
    if arg == "-" {
        return Ok(1024);
    }
    crate::disk::parse_size(arg)
}

/// A tmpfs mounted on an existing directory.
pub struct TmpfsMount {
    dir: PathBuf,
    runner: Rc<dyn CommandRunner>,
}

impl TmpfsMount {
    pub fn mount(dir: &Path, size_mb: u64, runner: Rc<dyn CommandRunner>) -> Result<Self> {
        Cmd::new("mount")
            .args(["-t", "tmpfs", "-o"])
            .arg(format!("size={size_mb}M,mode=0770"))
            .arg("tmpfs")
            .arg_path(dir)
            .error_msg("Failed to mount tmpfs")
            .run(&*runner)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            runner,
        })
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }
}

impl Drop for TmpfsMount {
    fn drop(&mut self) {
        let result = Cmd::new("umount")
            .args(["-t", "tmpfs"])
            .arg_path(&self.dir)
            .error_msg("Failed to unmount tmpfs")
            .run(&*self.runner);
        if let Err(e) = result {
            warn!("{}", e);
        }
    }
}
