//! The full storage plan of a build and the queries run against it.

use super::{Disk, Filesystem, Partition};
use crate::error::{Error, Result};
use std::path::PathBuf;

/// Addresses a filesystem inside a [`Layout`], standalone or partition-owned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FsId {
    Standalone(usize),
    Partition { disk: usize, part: usize },
}

/// A partition together with the disk it lives on.
#[derive(Debug, Clone, Copy)]
pub struct PartitionRef<'a> {
    pub disk: &'a Disk,
    pub index: usize,
}

impl<'a> PartitionRef<'a> {
    pub fn partition(&self) -> &'a Partition {
        &self.disk.partitions()[self.index]
    }

    pub fn grub_id(&self) -> String {
        self.disk.partition_grub_id(self.index)
    }

    pub fn suffix(&self) -> String {
        self.disk.partition_suffix(self.index)
    }
}

#[derive(Debug, Default)]
pub struct Layout {
    pub disks: Vec<Disk>,
    pub filesystems: Vec<Filesystem>,
}

impl Layout {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a disk image; see [`Disk::new`] for the size rules.
    pub fn add_disk(
        &mut self,
        filename: impl Into<PathBuf>,
        size: Option<u64>,
    ) -> Result<&mut Disk> {
        let mut disk = Disk::new(filename, size)?;
        disk.index = self.disks.len();
        self.disks.push(disk);
        let last = self.disks.len() - 1;
        Ok(&mut self.disks[last])
    }

    pub fn add_filesystem(&mut self, mut fs: Filesystem) -> &mut Filesystem {
        fs.index = self.filesystems.len();
        self.filesystems.push(fs);
        let last = self.filesystems.len() - 1;
        &mut self.filesystems[last]
    }

    pub fn fs(&self, id: FsId) -> Option<&Filesystem> {
        match id {
            FsId::Standalone(i) => self.filesystems.get(i),
            FsId::Partition { disk, part } => self
                .disks
                .get(disk)
                .and_then(|d| d.partitions().get(part))
                .map(Partition::fs),
        }
    }

    pub fn fs_mut(&mut self, id: FsId) -> Option<&mut Filesystem> {
        match id {
            FsId::Standalone(i) => self.filesystems.get_mut(i),
            FsId::Partition { disk, part } => self
                .disks
                .get_mut(disk)
                .and_then(|d| d.partitions_mut().get_mut(part))
                .map(Partition::fs_mut),
        }
    }

    /// Every filesystem in mount order.
    ///
    /// Standalone filesystems come first, then partitions in disk order;
    /// the result is stably sorted by mount point length so parents mount
    /// before children. Reverse it to unmount.
    pub fn mount_order(&self) -> Vec<FsId> {
        let mut ids: Vec<FsId> = (0..self.filesystems.len()).map(FsId::Standalone).collect();
        for (d, disk) in self.disks.iter().enumerate() {
            ids.extend((0..disk.partitions().len()).map(|p| FsId::Partition { disk: d, part: p }));
        }
        ids.sort_by_key(|id| self.fs(*id).map_or(0, mntpnt_len));
        ids
    }

    pub fn ordered_filesystems(&self) -> Vec<&Filesystem> {
        self.mount_order()
            .into_iter()
            .filter_map(|id| self.fs(id))
            .collect()
    }

    pub fn ordered_partitions(&self) -> Vec<PartitionRef<'_>> {
        ordered_partitions(&self.disks)
    }

    pub fn path_to_partition(&self, path: &str) -> Result<PartitionRef<'_>> {
        path_to_partition(&self.disks, path)
    }

    /// Partition holding the guest root.
    pub fn rootpart(&self) -> Result<PartitionRef<'_>> {
        self.path_to_partition("/")
    }

    /// Partition holding `/boot` (the root partition without a separate one).
    pub fn bootpart(&self) -> Result<PartitionRef<'_>> {
        self.path_to_partition("/boot/foo")
    }
}

fn mntpnt_len(fs: &Filesystem) -> usize {
    fs.mntpnt.as_deref().map_or(0, str::len)
}

/// All partitions of `disks`, stably sorted by mount point length.
pub fn ordered_partitions(disks: &[Disk]) -> Vec<PartitionRef<'_>> {
    let mut parts: Vec<PartitionRef<'_>> = disks
        .iter()
        .flat_map(|disk| {
            (0..disk.partitions().len()).map(move |index| PartitionRef { disk, index })
        })
        .collect();
    parts.sort_by_key(|p| mntpnt_len(p.partition().fs()));
    parts
}

/// The partition whose mount point is the longest prefix of `path`.
pub fn path_to_partition<'a>(disks: &'a [Disk], path: &str) -> Result<PartitionRef<'a>> {
    ordered_partitions(disks)
        .into_iter()
        .rev()
        .find(|p| p.partition().mntpnt().is_some_and(|m| path.starts_with(m)))
        .ok_or_else(|| Error::not_found(format!("Couldn't find partition hosting {path}")))
}
