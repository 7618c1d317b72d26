//! Virtual disk layout: disks, partitions and filesystem images.
//!
//! A build owns a [`Layout`]: the disk images it will partition and the
//! standalone filesystem images it will format. Everything is sized in
//! megabytes. The layout is validated as it is assembled (overlapping or
//! out-of-bounds partitions are rejected up front) and later mutated in place
//! as mapper devices and backing files get assigned.
//!
//! - [`size`] - size strings and host size detection
//! - [`image`] - [`Disk`] and [`Partition`], partition allocation
//! - [`filesystem`] - [`Filesystem`] creation, formatting, mounting
//! - [`layout`] - mount ordering and path-to-partition lookup
//! - [`mapper`] - partition tables and loop/mapper device binding
//! - [`convert`] - raw image conversion to hypervisor formats

pub mod convert;
pub mod filesystem;
pub mod image;
pub mod layout;
pub mod mapper;
pub mod size;

pub use filesystem::Filesystem;
pub use image::{Disk, Partition};
pub use layout::{FsId, Layout, PartitionRef};
pub use mapper::UnmapPolicy;
pub use size::{detect_size, parse_size};

use crate::error::{Error, Result};
use std::fmt;
use std::str::FromStr;

/// Filesystem types the builder can create.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FsType {
    Ext2,
    Ext3,
    Ext4,
    Xfs,
    Swap,
}

impl FsType {
    /// Type hint handed to `parted mkpart`.
    pub fn parted_fstype(self) -> &'static str {
        match self {
            FsType::Swap => "linux-swap(new)",
            _ => "ext2",
        }
    }

    /// Type column of an `/etc/fstab` entry.
    pub fn fstab_fstype(self) -> &'static str {
        match self {
            FsType::Ext2 => "ext2",
            FsType::Ext3 => "ext3",
            FsType::Ext4 => "ext4",
            FsType::Xfs => "xfs",
            FsType::Swap => "swap",
        }
    }

    /// Program and flags that format a device of this type.
    ///
    /// Old guests cannot read ext3 with 256-byte inodes; pass
    /// `ext3_256_inodes = false` to force 128-byte inodes.
    pub fn mkfs_command(self, ext3_256_inodes: bool) -> (&'static str, &'static [&'static str]) {
        match self {
            FsType::Ext2 => ("mkfs.ext2", &["-F"]),
            FsType::Ext3 if ext3_256_inodes => ("mkfs.ext3", &["-F"]),
            FsType::Ext3 => ("mkfs.ext3", &["-I", "128", "-F"]),
            FsType::Ext4 => ("mkfs.ext4", &["-F"]),
            FsType::Xfs => ("mkfs.xfs", &[]),
            FsType::Swap => ("mkswap", &[]),
        }
    }
}

impl fmt::Display for FsType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.fstab_fstype())
    }
}

impl FromStr for FsType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ext2" => Ok(FsType::Ext2),
            "ext3" => Ok(FsType::Ext3),
            "ext4" => Ok(FsType::Ext4),
            "xfs" => Ok(FsType::Xfs),
            "swap" | "linux-swap" => Ok(FsType::Swap),
            other => Err(Error::config(format!("unknown partition type: {other}"))),
        }
    }
}
