//! Disk images and the partitions allocated on them.

use super::size::detect_size;
use super::{Filesystem, FsType};
use crate::cleanup::CleanupHandle;
use crate::devname::index_to_devname;
use crate::error::{Error, Result};
use crate::process::{Cmd, CommandRunner};
use std::path::{Path, PathBuf};
use tracing::info;

/// A partition on a [`Disk`]. Offsets are megabytes, `end` inclusive.
#[derive(Debug, Clone)]
pub struct Partition {
    begin: i64,
    end: i64,
    fs: Filesystem,
}

impl Partition {
    pub fn begin(&self) -> i64 {
        self.begin
    }

    pub fn end(&self) -> i64 {
        self.end
    }

    pub fn fstype(&self) -> FsType {
        self.fs.fstype
    }

    pub fn mntpnt(&self) -> Option<&str> {
        self.fs.mntpnt.as_deref()
    }

    /// Host mapper device, once the disk is mapped.
    pub fn filename(&self) -> Option<&Path> {
        self.fs.filename.as_deref()
    }

    pub fn fs(&self) -> &Filesystem {
        &self.fs
    }

    pub fn fs_mut(&mut self) -> &mut Filesystem {
        &mut self.fs
    }

    fn overlaps(&self, begin: i64, end: i64) -> bool {
        begin <= self.end && end >= self.begin
    }
}

/// A disk image file (or block device) and its partition table.
#[derive(Debug, Clone)]
pub struct Disk {
    pub filename: PathBuf,
    /// Size in megabytes.
    pub size: u64,
    /// The file existed before the build and is used as-is.
    pub preallocated: bool,
    /// Output format after [`convert`](Disk::convert).
    pub format_type: Option<String>,
    pub(crate) index: usize,
    pub(crate) map_handle: Option<CleanupHandle>,
    partitions: Vec<Partition>,
}

impl Disk {
    /// Describe a disk image at `filename`.
    ///
    /// An existing file is sized from the host and must not be given a
    /// size; a new file needs one.
    pub fn new(filename: impl Into<PathBuf>, size: Option<u64>) -> Result<Self> {
        let filename = filename.into();
        let size = size.filter(|s| *s > 0);

        let (size, preallocated) = match (filename.exists(), size) {
            (true, Some(_)) => {
                return Err(Error::config(format!(
                    "{} exists, but a size was given",
                    filename.display()
                )))
            }
            (true, None) => (detect_size(&filename)?, true),
            (false, Some(size)) => (size, false),
            (false, None) => {
                return Err(Error::config(format!(
                    "{} does not exist and no size was given",
                    filename.display()
                )))
            }
        };

        Ok(Self {
            filename,
            size,
            preallocated,
            format_type: None,
            index: 0,
            map_handle: None,
            partitions: Vec::new(),
        })
    }

    /// Position among the disks of the layout.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn partitions(&self) -> &[Partition] {
        &self.partitions
    }

    pub fn partitions_mut(&mut self) -> &mut [Partition] {
        &mut self.partitions
    }

    /// Allocate a partition of `length` megabytes starting at `begin`.
    ///
    /// Partitions are kept sorted by start offset, which is the order the
    /// partitioning and mapping tools number them in.
    pub fn add_part(
        &mut self,
        begin: i64,
        length: u64,
        fstype: FsType,
        mntpnt: Option<&str>,
    ) -> Result<()> {
        if length == 0 {
            return Err(Error::config(format!(
                "Partition at {begin}MB on {} has zero length",
                self.filename.display()
            )));
        }
        let length = i64::try_from(length)
            .map_err(|_| Error::config(format!("Partition length {length}MB is too large")))?;
        let end = begin.checked_add(length - 1).ok_or_else(|| {
            Error::config(format!("Partition at {begin}MB of {length}MB runs past any disk"))
        })?;

        info!(
            "Adding partition to {}: {}-{} ({}, {:?})",
            self.filename.display(),
            begin,
            end,
            fstype,
            mntpnt
        );

        if let Some(other) = self.partitions.iter().find(|p| p.overlaps(begin, end)) {
            return Err(Error::config(format!(
                "Partition overlaps with existing partition ({}-{} vs {}-{})",
                begin, end, other.begin, other.end
            )));
        }
        if begin < 0 || end > i64::try_from(self.size).unwrap_or(i64::MAX) {
            return Err(Error::config(format!(
                "Partition is out of bounds. start={}, end={}, disksize={}",
                begin, end, self.size
            )));
        }

        let fs = Filesystem::new(fstype, mntpnt).with_size(length as u64);
        self.partitions.push(Partition { begin, end, fs });
        self.partitions.sort_by_key(|p| p.begin);
        Ok(())
    }

    /// Allocate the image file unless it was preallocated.
    pub fn create(&mut self, runner: &dyn CommandRunner) -> Result<()> {
        if self.preallocated {
            return Ok(());
        }
        info!("Creating disk image: {} ({}MB)", self.filename.display(), self.size);
        Cmd::new(crate::preflight::qemu_img())
            .args(["create", "-f", "raw"])
            .arg_path(&self.filename)
            .arg(format!("{}M", self.size))
            .error_msg("Failed to create disk image")
            .run(runner)?;
        Ok(())
    }

    /// Format every partition through its mapper device.
    pub fn mkfs(&mut self, runner: &dyn CommandRunner, ext3_256_inodes: bool) -> Result<()> {
        for part in &mut self.partitions {
            part.fs.mkfs(runner, ext3_256_inodes)?;
        }
        Ok(())
    }

    /// Guest device letters, e.g. `a` for the first disk.
    pub fn devletters(&self) -> String {
        index_to_devname(self.index)
    }

    /// GRUB legacy name of the whole disk, `(hd0)`.
    pub fn grub_id(&self) -> String {
        format!("(hd{})", self.index)
    }

    /// GRUB legacy name of partition `part`, `(hd0,0)`.
    pub fn partition_grub_id(&self, part: usize) -> String {
        format!("(hd{},{})", self.index, part)
    }

    /// Guest device suffix of partition `part`, `a1` for the first one.
    pub fn partition_suffix(&self, part: usize) -> String {
        format!("{}{}", self.devletters(), part + 1)
    }
}
