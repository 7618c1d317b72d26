//! The build context shared by every phase.

use crate::cleanup::{self, CleanupHandle, CleanupStack};
use crate::disk::{Disk, Filesystem, FsId, Layout, UnmapPolicy};
use crate::error::{Error, Result};
use crate::plugin::Hook;
use crate::process::{CommandRunner, HostRunner};
use crate::settings::Settings;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use tracing::debug;

/// Ad-hoc phase callback registered at runtime.
pub type Callback = Box<dyn FnMut(&mut Vm, Option<&Path>) -> Result<()>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NicKind {
    #[default]
    Dhcp,
    Static,
}

/// A guest network interface.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Nic {
    pub kind: NicKind,
    pub mac: Option<String>,
    pub ip: Option<Ipv4Addr>,
    pub network: Option<Ipv4Addr>,
    pub netmask: Option<Ipv4Addr>,
    pub broadcast: Option<Ipv4Addr>,
    pub gateway: Option<Ipv4Addr>,
    pub dns: Option<Ipv4Addr>,
}

/// Everything one build owns: storage layout, settings, directories,
/// pending teardown and runtime callbacks.
pub struct Vm {
    pub layout: Layout,
    pub settings: Settings,
    pub nics: Vec<Nic>,
    /// Scratch space for backing files and temporary trees.
    pub workdir: PathBuf,
    /// Guest root: the bootstrap tree, later the mounted image.
    pub chroot_dir: PathBuf,
    /// Where the image filesystems get mounted.
    pub mount_dir: PathBuf,
    pub destdir: PathBuf,
    /// Files produced by `convert` and `deploy`.
    pub result_files: Vec<PathBuf>,
    /// Guest block device prefix, `sd` or `xvd`.
    pub disk_prefix: String,
    pub ext3_256_inodes: bool,
    pub unmap_policy: UnmapPolicy,
    runner: Rc<dyn CommandRunner>,
    cleanup_stack: CleanupStack<Vm>,
    hooks: HashMap<Hook, Vec<Callback>>,
}

impl Vm {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self::with_runner(workdir, Rc::new(HostRunner))
    }

    pub fn with_runner(workdir: impl Into<PathBuf>, runner: Rc<dyn CommandRunner>) -> Self {
        let workdir = workdir.into();
        Self {
            layout: Layout::new(),
            settings: Settings::new(),
            nics: Vec::new(),
            chroot_dir: workdir.join("chroot"),
            mount_dir: workdir.join("root"),
            destdir: workdir.join("out"),
            workdir,
            result_files: Vec::new(),
            disk_prefix: "sd".to_string(),
            ext3_256_inodes: true,
            unmap_policy: UnmapPolicy::default(),
            runner,
            cleanup_stack: CleanupStack::new(),
            hooks: HashMap::new(),
        }
    }

    /// Shared handle to the command runner.
    ///
    /// Cloned out so callers can hold it across mutable borrows of the
    /// layout.
    pub fn runner(&self) -> Rc<dyn CommandRunner> {
        Rc::clone(&self.runner)
    }

    pub fn add_disk(
        &mut self,
        filename: impl Into<PathBuf>,
        size: Option<u64>,
    ) -> Result<&mut Disk> {
        self.layout.add_disk(filename, size)
    }

    pub fn add_filesystem(&mut self, fs: Filesystem) -> &mut Filesystem {
        self.layout.add_filesystem(fs)
    }

    /// Register a teardown action to run when the build is cleaned up.
    pub fn push_cleanup<F>(&mut self, label: impl Into<String>, action: F) -> CleanupHandle
    where
        F: FnOnce(&mut Vm) -> Result<()> + 'static,
    {
        self.cleanup_stack.push(label, action)
    }

    pub fn cancel_cleanup(&mut self, handle: CleanupHandle) -> bool {
        self.cleanup_stack.cancel(handle)
    }

    pub fn pending_cleanups(&self) -> Vec<String> {
        self.cleanup_stack.labels().map(str::to_string).collect()
    }

    /// Run every pending teardown action, newest first.
    pub fn cleanup(&mut self) -> Result<()> {
        debug!("Cleaning up ({} pending)", self.cleanup_stack.len());
        cleanup::unwind(self, |vm| &mut vm.cleanup_stack)
    }

    /// Run `callback` whenever `hook` is dispatched, after the plugins.
    pub fn register_hook<F>(&mut self, hook: Hook, callback: F)
    where
        F: FnMut(&mut Vm, Option<&Path>) -> Result<()> + 'static,
    {
        self.hooks.entry(hook).or_default().push(Box::new(callback));
    }

    /// Run the callbacks registered for `hook`, in registration order.
    ///
    /// Callbacks may register further callbacks; those run from the next
    /// dispatch on.
    pub(crate) fn run_callbacks(&mut self, hook: Hook, target: Option<&Path>) -> Result<()> {
        let mut callbacks = self.hooks.remove(&hook).unwrap_or_default();
        let mut result = Ok(());
        for callback in callbacks.iter_mut() {
            result = callback(self, target);
            if result.is_err() {
                break;
            }
        }
        if let Some(added) = self.hooks.remove(&hook) {
            callbacks.extend(added);
        }
        self.hooks.insert(hook, callbacks);
        result
    }

    /// Bind disk `index` to mapper devices, registering the unmap first.
    pub fn map_partitions(&mut self, index: usize) -> Result<()> {
        let filename = self.disk(index)?.filename.clone();
        let handle = self.push_cleanup(format!("unmap {}", filename.display()), move |vm: &mut Vm| {
            vm.unmap_disk(index, true)
        });
        let runner = self.runner();
        let disk = self.disk_mut(index)?;
        disk.map_handle = Some(handle);
        disk.map_partitions(&*runner)
    }

    /// Tear down the mapper devices of disk `index`.
    pub fn unmap_disk(&mut self, index: usize, ignore_fail: bool) -> Result<()> {
        let runner = self.runner();
        let policy = self.unmap_policy;
        let disk = self.disk_mut(index)?;
        let handle = disk.map_handle.take();
        let result = disk.unmap(&*runner, &policy, ignore_fail);
        if let Some(handle) = handle {
            self.cancel_cleanup(handle);
        }
        result
    }

    /// Mount filesystem `id` below `rootmnt`, registering the unmount.
    pub fn mount_fs(&mut self, id: FsId, rootmnt: &Path) -> Result<()> {
        let runner = self.runner();
        let Some(mntpath) = self.fs_mut(id)?.mount(rootmnt, &*runner)? else {
            return Ok(());
        };
        let handle = self.push_cleanup(format!("umount {}", mntpath.display()), move |vm: &mut Vm| {
            vm.umount_fs(id)
        });
        self.fs_mut(id)?.mount_handle = Some(handle);
        Ok(())
    }

    /// Unmount filesystem `id` and drop its pending cleanup.
    pub fn umount_fs(&mut self, id: FsId) -> Result<()> {
        let runner = self.runner();
        let fs = self.fs_mut(id)?;
        let handle = fs.mount_handle.take();
        let result = fs.umount(&*runner);
        if let Some(handle) = handle {
            self.cancel_cleanup(handle);
        }
        result
    }

    fn disk(&self, index: usize) -> Result<&Disk> {
        self.layout
            .disks
            .get(index)
            .ok_or_else(|| Error::not_found(format!("no disk {index}")))
    }

    fn disk_mut(&mut self, index: usize) -> Result<&mut Disk> {
        self.layout
            .disks
            .get_mut(index)
            .ok_or_else(|| Error::not_found(format!("no disk {index}")))
    }

    fn fs_mut(&mut self, id: FsId) -> Result<&mut Filesystem> {
        self.layout
            .fs_mut(id)
            .ok_or_else(|| Error::not_found(format!("no filesystem {id:?}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::FsType;
    use crate::process::testing::RecordingRunner;
    use std::cell::RefCell;
    use tempfile::TempDir;

    const KPARTX: &str = "add map loop0p1 (253:0): 0 1 linear /dev/loop0 63\n";

    fn vm(temp: &TempDir, runner: &Rc<RecordingRunner>) -> Vm {
        let mut vm = Vm::with_runner(temp.path(), runner.clone());
        vm.unmap_policy = UnmapPolicy::immediate();
        vm.add_disk(temp.path().join("disk0.img"), Some(1024))
            .unwrap()
            .add_part(0, 1024, FsType::Ext4, Some("/"))
            .unwrap();
        vm
    }

    #[test]
    fn test_mapped_disk_is_unmapped_by_cleanup() {
        let temp = TempDir::new().unwrap();
        let runner = Rc::new(RecordingRunner::new());
        runner.respond("kpartx -av", KPARTX);
        let mut vm = vm(&temp, &runner);

        vm.map_partitions(0).unwrap();
        assert_eq!(vm.pending_cleanups().len(), 1);

        vm.cleanup().unwrap();
        assert_eq!(runner.count("kpartx -d"), 2);
        assert!(vm.layout.disks[0].partitions()[0].filename().is_none());
    }

    #[test]
    fn test_explicit_unmap_cancels_cleanup() {
        let temp = TempDir::new().unwrap();
        let runner = Rc::new(RecordingRunner::new());
        runner.respond("kpartx -av", KPARTX);
        let mut vm = vm(&temp, &runner);

        vm.map_partitions(0).unwrap();
        vm.unmap_disk(0, false).unwrap();
        vm.cleanup().unwrap();
        assert_eq!(runner.count("kpartx -d"), 2);
    }

    #[test]
    fn test_mount_then_cleanup_unmounts_before_unmap() {
        let temp = TempDir::new().unwrap();
        let runner = Rc::new(RecordingRunner::new());
        runner.respond("kpartx -av", KPARTX);
        let mut vm = vm(&temp, &runner);
        let rootmnt = temp.path().join("mnt");

        vm.map_partitions(0).unwrap();
        vm.mount_fs(FsId::Partition { disk: 0, part: 0 }, &rootmnt).unwrap();
        vm.cleanup().unwrap();

        let calls = runner.calls();
        let umount = calls.iter().position(|c| c.starts_with("umount")).unwrap();
        let unmap = calls.iter().position(|c| c.starts_with("kpartx -d")).unwrap();
        assert!(umount < unmap);
        assert_eq!(runner.count("umount"), 1);
    }

    #[test]
    fn test_explicit_umount_cancels_cleanup() {
        let temp = TempDir::new().unwrap();
        let runner = Rc::new(RecordingRunner::new());
        runner.respond("kpartx -av", KPARTX);
        let mut vm = vm(&temp, &runner);
        let id = FsId::Partition { disk: 0, part: 0 };

        vm.map_partitions(0).unwrap();
        vm.mount_fs(id, &temp.path().join("mnt")).unwrap();
        vm.umount_fs(id).unwrap();
        assert_eq!(vm.pending_cleanups().len(), 1);
        vm.cleanup().unwrap();
        assert_eq!(runner.count("umount"), 1);
    }

    #[test]
    fn test_callbacks_run_in_registration_order() {
        let temp = TempDir::new().unwrap();
        let mut vm = Vm::with_runner(temp.path(), Rc::new(RecordingRunner::new()));
        let log = Rc::new(RefCell::new(Vec::new()));

        for name in ["first", "second"] {
            let log = log.clone();
            vm.register_hook(Hook::Deploy, move |_, _| {
                log.borrow_mut().push(name);
                Ok(())
            });
        }
        vm.run_callbacks(Hook::Deploy, None).unwrap();
        vm.run_callbacks(Hook::Convert, None).unwrap();

        assert_eq!(*log.borrow(), vec!["first", "second"]);
    }

    #[test]
    fn test_callback_registered_during_dispatch_runs_next_time() {
        let temp = TempDir::new().unwrap();
        let mut vm = Vm::with_runner(temp.path(), Rc::new(RecordingRunner::new()));
        let count = Rc::new(RefCell::new(0));

        let inner = count.clone();
        vm.register_hook(Hook::Deploy, move |vm, _| {
            let inner = inner.clone();
            vm.register_hook(Hook::Deploy, move |_, _| {
                *inner.borrow_mut() += 1;
                Ok(())
            });
            Ok(())
        });

        vm.run_callbacks(Hook::Deploy, None).unwrap();
        assert_eq!(*count.borrow(), 0);
        vm.run_callbacks(Hook::Deploy, None).unwrap();
        assert_eq!(*count.borrow(), 1);
    }
}
