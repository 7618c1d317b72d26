//! Hypervisor targets.
//!
//! A hypervisor decides how storage is laid out (partitioned disk images or
//! one image per filesystem), whether a bootloader is needed and how the
//! finished images are converted and deployed.
//!
//! - [`kvm`] - qcow2 disk images plus a `run.sh` launcher (`kvm`, `qemu`)
//! - [`xen`] - raw filesystem images plus `xen.conf`

pub mod kvm;
pub mod xen;

pub use kvm::Kvm;
pub use xen::Xen;

use crate::context::Vm;
use crate::error::Result;
use crate::plugin::Plugin;
use tracing::info;

/// How a hypervisor wants the guest storage laid out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageKind {
    /// Partitioned disk images.
    DiskImage,
    /// One image file per filesystem.
    FsImage,
}

pub trait Hypervisor: Plugin {
    /// Name used on the command line and in config sections.
    fn arg(&self) -> &str;

    fn preferred_storage(&self) -> StorageKind;

    fn needs_bootloader(&self) -> bool;

    /// Guest block device prefix.
    fn disk_prefix(&self) -> &str {
        "sd"
    }

    /// Format the finished disk images are converted to.
    fn filetype(&self) -> &str;
}

/// Create, partition, map and format all storage, then mount it below
/// `vm.mount_dir` parents first.
pub fn mount_partitions(vm: &mut Vm) -> Result<()> {
    info!("Mounting target filesystems");
    let runner = vm.runner();
    let workdir = vm.workdir.clone();
    let ext3_256_inodes = vm.ext3_256_inodes;

    for fs in vm.layout.filesystems.iter_mut() {
        fs.create(&workdir, &*runner, ext3_256_inodes)?;
    }
    for index in 0..vm.layout.disks.len() {
        vm.layout.disks[index].create(&*runner)?;
        vm.layout.disks[index].partition(&*runner)?;
        vm.map_partitions(index)?;
        vm.layout.disks[index].mkfs(&*runner, ext3_256_inodes)?;
    }

    let rootmnt = vm.mount_dir.clone();
    for id in vm.layout.mount_order() {
        vm.mount_fs(id, &rootmnt)?;
    }
    Ok(())
}

/// Unmount children first, then release every disk's mapper devices.
pub fn unmount_partitions(vm: &mut Vm) -> Result<()> {
    info!("Unmounting target filesystems");
    for id in vm.layout.mount_order().into_iter().rev() {
        vm.umount_fs(id)?;
    }
    for index in 0..vm.layout.disks.len() {
        vm.unmap_disk(index, false)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::{FsType, UnmapPolicy};
    use crate::process::testing::RecordingRunner;
    use std::rc::Rc;
    use tempfile::TempDir;

    const KPARTX: &str = "\
add map loop0p1 (253:0): 0 1 linear /dev/loop0 63
add map loop0p2 (253:1): 0 1 linear /dev/loop0 64
add map loop0p3 (253:2): 0 1 linear /dev/loop0 65
";

    fn vm(temp: &TempDir, runner: &Rc<RecordingRunner>) -> Vm {
        let mut vm = Vm::with_runner(temp.path(), runner.clone());
        vm.unmap_policy = UnmapPolicy::immediate();
        let disk = vm.add_disk(temp.path().join("disk0.img"), Some(4096)).unwrap();
        disk.add_part(0, 1000, FsType::Ext4, Some("/")).unwrap();
        disk.add_part(1000, 1000, FsType::Swap, None).unwrap();
        disk.add_part(2000, 1000, FsType::Ext4, Some("/boot")).unwrap();
        vm
    }

    fn position(calls: &[String], prefix: &str) -> usize {
        calls.iter().position(|c| c.starts_with(prefix)).unwrap()
    }

    #[test]
    fn test_mount_sequence() {
        let temp = TempDir::new().unwrap();
        let runner = Rc::new(RecordingRunner::new());
        runner.respond("kpartx -av", KPARTX);
        let mut vm = vm(&temp, &runner);

        mount_partitions(&mut vm).unwrap();
        let calls = runner.calls();

        assert!(position(&calls, "parted") < position(&calls, "kpartx -av"));
        assert!(position(&calls, "kpartx -av") < position(&calls, "mkfs.ext4"));
        assert_eq!(runner.count("mkswap"), 1);

        let mounts: Vec<&String> = calls.iter().filter(|c| c.starts_with("mount")).collect();
        assert_eq!(mounts.len(), 2);
        assert!(mounts[0].contains("/dev/mapper/loop0p1"));
        assert!(mounts[1].contains("/dev/mapper/loop0p3"));
        assert_eq!(vm.pending_cleanups().len(), 3);
    }

    #[test]
    fn test_unmount_reverses_and_unmaps() {
        let temp = TempDir::new().unwrap();
        let runner = Rc::new(RecordingRunner::new());
        runner.respond("kpartx -av", KPARTX);
        let mut vm = vm(&temp, &runner);

        mount_partitions(&mut vm).unwrap();
        unmount_partitions(&mut vm).unwrap();

        let calls = runner.calls();
        let umounts: Vec<&String> = calls.iter().filter(|c| c.starts_with("umount")).collect();
        assert!(umounts[0].ends_with("boot"));
        assert!(position(&calls, "umount") < position(&calls, "kpartx -d"));
        assert!(vm.pending_cleanups().is_empty());
    }

    #[test]
    fn test_failed_format_leaves_unmap_pending() {
        let temp = TempDir::new().unwrap();
        let runner = Rc::new(RecordingRunner::new());
        runner.respond("kpartx -av", KPARTX);
        runner.fail("mkswap", None);
        let mut vm = vm(&temp, &runner);

        assert!(mount_partitions(&mut vm).is_err());
        assert_eq!(vm.pending_cleanups().len(), 1);
        vm.cleanup().unwrap();
        assert_eq!(runner.count("kpartx -d"), 2);
    }
}
