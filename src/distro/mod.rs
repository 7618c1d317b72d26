//! Guest distributions.
//!
//! A distro builds the guest tree (`bootstrap`, `configure_os`) before any
//! image exists, and takes part in the hypervisor's phases after the
//! hypervisor plugins, e.g. to write `/etc/fstab` once the layout is final.

pub mod rootfs;

pub use rootfs::RootfsDistro;

use crate::context::Vm;
use crate::disk::FsType;
use crate::plugin::Plugin;

pub trait Distro: Plugin {
    /// Name used on the command line and in config sections.
    fn arg(&self) -> &str;

    /// Filesystem used for partitions the user did not type explicitly.
    fn preferred_filesystem(&self) -> FsType {
        FsType::Ext3
    }

    /// Whether the guest can read ext3 with 256-byte inodes.
    fn has_256_bit_inode_ext3_support(&self) -> bool {
        true
    }
}

/// `/etc/fstab` for the current layout, parents before children.
pub fn fstab(vm: &Vm) -> String {
    let mut lines =
        vec!["# <file system>\t<mount point>\t<type>\t<options>\t<dump>\t<pass>".to_string()];

    let mut entries: Vec<(String, &crate::disk::Filesystem)> = vm
        .layout
        .filesystems
        .iter()
        .filter(|fs| !fs.dummy)
        .map(|fs| (fs.suffix(), fs))
        .collect();
    for disk in &vm.layout.disks {
        for (index, part) in disk.partitions().iter().enumerate() {
            entries.push((disk.partition_suffix(index), part.fs()));
        }
    }
    entries.sort_by_key(|(_, fs)| fs.mntpnt.as_deref().map_or(0, str::len));

    for (suffix, fs) in entries {
        let device = format!("/dev/{}{}", vm.disk_prefix, suffix);
        let line = match (fs.fstype, fs.mntpnt.as_deref()) {
            (FsType::Swap, _) => format!("{device}\tnone\tswap\tsw\t0\t0"),
            (_, Some(mntpnt)) => format!(
                "{}\t{}\t{}\t{}\t0\t{}",
                device,
                mntpnt,
                fs.fstype.fstab_fstype(),
                fs.fstab_options(),
                if mntpnt == "/" { 1 } else { 2 }
            ),
            (_, None) => continue,
        };
        lines.push(line);
    }

    let mut fstab = lines.join("\n");
    fstab.push('\n');
    fstab
}
