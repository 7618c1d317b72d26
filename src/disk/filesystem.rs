//! Filesystems: standalone images or the contents of a partition.

use super::FsType;
use crate::cleanup::CleanupHandle;
use crate::error::{Error, Result};
use crate::process::{Cmd, CommandRunner};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

/// A filesystem to create, format and mount.
///
/// Standalone filesystems get their own backing file (see [`create`]);
/// filesystems owned by a [`Partition`] use the mapper device assigned to
/// the partition as `filename`.
///
/// [`create`]: Filesystem::create
/// [`Partition`]: super::Partition
#[derive(Debug, Clone)]
pub struct Filesystem {
    /// Size in megabytes.
    pub size: u64,
    pub fstype: FsType,
    pub mntpnt: Option<String>,
    /// Backing file or device node, once known.
    pub filename: Option<PathBuf>,
    /// Device letters the guest sees this filesystem under.
    pub devletter: String,
    /// Explicit guest device name, overriding letter and index.
    pub device: String,
    /// Reserved in the layout but never formatted or mounted.
    pub dummy: bool,
    /// Backing file existed before the build.
    pub preallocated: bool,
    pub uuid: Option<String>,
    pub(crate) index: usize,
    pub(crate) mntpath: Option<PathBuf>,
    pub(crate) mount_handle: Option<CleanupHandle>,
}

impl Filesystem {
    pub fn new(fstype: FsType, mntpnt: Option<&str>) -> Self {
        Self {
            size: 0,
            fstype,
            mntpnt: mntpnt.map(str::to_string),
            filename: None,
            devletter: "a".to_string(),
            device: String::new(),
            dummy: false,
            preallocated: false,
            uuid: None,
            index: 0,
            mntpath: None,
            mount_handle: None,
        }
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = size;
        self
    }

    pub fn with_filename(mut self, filename: impl Into<PathBuf>) -> Self {
        self.filename = Some(filename.into());
        self
    }

    pub fn with_devletter(mut self, devletter: impl Into<String>) -> Self {
        self.devletter = devletter.into();
        self
    }

    pub fn with_device(mut self, device: impl Into<String>) -> Self {
        self.device = device.into();
        self
    }

    pub fn with_dummy(mut self, dummy: bool) -> Self {
        self.dummy = dummy;
        self
    }

    /// Position among the standalone filesystems of the layout.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Whether [`mount`](Self::mount) would do anything.
    pub fn is_mountable(&self) -> bool {
        self.fstype != FsType::Swap && !self.dummy && self.mntpnt.is_some()
    }

    pub fn mount_path(&self) -> Option<&Path> {
        self.mntpath.as_deref()
    }

    pub fn fstab_options(&self) -> &'static str {
        "defaults"
    }

    /// Guest device name without prefix, e.g. `a1`.
    pub fn suffix(&self) -> String {
        if self.device.is_empty() {
            format!("{}{}", self.devletter, self.index + 1)
        } else {
            self.device.clone()
        }
    }

    /// Pick a backing file name in `workdir` that does not exist yet.
    ///
    /// The root filesystem is `root.img`, swap is `swap.img` and anything
    /// else is named after its mount point (`/var/log` → `var_log.img`).
    /// Without a mount point the name falls back to its position, `fs1.img`.
    pub fn backing_file_name(&self, workdir: &Path) -> PathBuf {
        let mut stem = match (self.mntpnt.as_deref(), self.fstype) {
            (Some("/"), _) => "root".to_string(),
            (_, FsType::Swap) => "swap".to_string(),
            (Some(mntpnt), _) => mntpnt
                .trim_start_matches('/')
                .chars()
                .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
                .collect(),
            (None, _) => format!("fs{}", self.index + 1),
        };
        while workdir.join(format!("{stem}.img")).exists() {
            stem.push('_');
        }
        workdir.join(format!("{stem}.img"))
    }

    /// Allocate the backing file unless it already exists, then format it.
    pub fn create(
        &mut self,
        workdir: &Path,
        runner: &dyn CommandRunner,
        ext3_256_inodes: bool,
    ) -> Result<()> {
        info!("Creating filesystem: {:?} ({}, {}MB)", self.mntpnt, self.fstype, self.size);

        let filename = match self.filename.take() {
            Some(existing) => existing,
            None => self.backing_file_name(workdir),
        };
        if filename.exists() {
            self.preallocated = true;
        } else {
            Cmd::new(crate::preflight::qemu_img())
                .args(["create", "-f", "raw"])
                .arg_path(&filename)
                .arg(format!("{}M", self.size))
                .error_msg("Failed to allocate filesystem image")
                .run(runner)?;
        }
        self.filename = Some(filename);

        self.mkfs(runner, ext3_256_inodes)
    }

    /// Format the backing file and record its UUID.
    pub fn mkfs(&mut self, runner: &dyn CommandRunner, ext3_256_inodes: bool) -> Result<()> {
        let filename = self.filename.clone().ok_or_else(|| {
            Error::config("cannot format a filesystem before it has a backing file")
        })?;
        if self.dummy {
            return Ok(());
        }

        let (program, flags) = self.fstype.mkfs_command(ext3_256_inodes);
        Cmd::new(program)
            .args(flags.iter().copied())
            .arg_path(&filename)
            .error_msg(&format!("Failed to create {} filesystem", self.fstype))
            .run(runner)?;

        Cmd::new("udevadm").arg("settle").run(runner)?;

        let out = Cmd::new("blkid")
            .args(["-c", "/dev/null", "-sUUID", "-ovalue"])
            .arg_path(&filename)
            .error_msg("Failed to read filesystem UUID")
            .run(runner)?;
        let uuid = out.stdout.trim();
        self.uuid = (!uuid.is_empty()).then(|| uuid.to_string());
        Ok(())
    }

    /// Loop-mount below `rootmnt` at this filesystem's mount point.
    ///
    /// Swap, dummy and mount-point-less filesystems are skipped and yield
    /// `None`. The caller owns registering the matching unmount.
    pub fn mount(&mut self, rootmnt: &Path, runner: &dyn CommandRunner) -> Result<Option<PathBuf>> {
        if !self.is_mountable() {
            return Ok(None);
        }
        let (Some(mntpnt), Some(filename)) = (self.mntpnt.as_deref(), self.filename.as_deref())
        else {
            return Err(Error::config(format!(
                "cannot mount {:?} before it has a backing file",
                self.mntpnt
            )));
        };

        let relative = mntpnt.trim_start_matches('/');
        let mntpath = if relative.is_empty() {
            rootmnt.to_path_buf()
        } else {
            rootmnt.join(relative)
        };
        fs::create_dir_all(&mntpath)?;
        Cmd::new("mount")
            .args(["-o", "loop"])
            .arg_path(filename)
            .arg_path(&mntpath)
            .error_msg("Failed to mount filesystem")
            .run(runner)?;

        self.mntpath = Some(mntpath.clone());
        Ok(Some(mntpath))
    }

    /// Unmount if mounted. Does nothing the second time.
    pub fn umount(&mut self, runner: &dyn CommandRunner) -> Result<()> {
        let Some(mntpath) = self.mntpath.take() else {
            return Ok(());
        };
        Cmd::new("umount")
            .arg_path(&mntpath)
            .error_msg("Failed to unmount filesystem")
            .run(runner)?;
        Ok(())
    }
}
