//! Xen paravirtualised guests.

use super::{Hypervisor, StorageKind};
use crate::context::Vm;
use crate::error::{Error, Result};
use crate::plugin::Plugin;
use crate::process::Cmd;
use crate::settings::{Setting, SettingKind, Settings};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

/// One raw image per filesystem, booted by an external kernel.
pub struct Xen {
    images: Vec<PathBuf>,
}

impl Xen {
    pub fn create(settings: &mut Settings) -> Result<Box<dyn Hypervisor>> {
        Ok(Box::new(Self::new(settings)?))
    }

    fn new(settings: &mut Settings) -> Result<Self> {
        settings.register(
            Setting::new(
                "xen-kernel",
                SettingKind::Str,
                "Path to the kernel to use (e.g.: /boot/vmlinux-2.6.27-7-server).",
            )
            .group("Xen options"),
        )?;
        settings.register(
            Setting::new(
                "xen-ramdisk",
                SettingKind::Str,
                "Path to the ramdisk to use (e.g.: /boot/initrd.img-2.6.27-7-server).",
            )
            .group("Xen options"),
        )?;
        settings.register(
            Setting::new("mem", SettingKind::Int, "Assign MEM megabytes of memory to the guest vm.")
                .group("Xen options")
                .default_value(128),
        )?;
        Ok(Self { images: Vec::new() })
    }

    fn config(&self, vm: &Vm) -> Result<String> {
        let hostname = match vm.settings.get_str("hostname") {
            Ok(Some(hostname)) => hostname.to_string(),
            _ => "vm".to_string(),
        };
        let kernel = vm.settings.get_str("xen-kernel")?.unwrap_or_default();
        let mem = vm.settings.get_int("mem")?.unwrap_or(128);

        let ramdisk = match vm.settings.get_str("xen-ramdisk")? {
            Some(ramdisk) => format!("ramdisk = '{ramdisk}'\n"),
            None => String::new(),
        };
        let disks: Vec<String> = self
            .images
            .iter()
            .enumerate()
            .map(|(i, image)| format!("'tap:aio:{},xvda{},w'", image.display(), i + 1))
            .collect();
        let disks = disks.join(",\n");

        Ok(format!(
            "# Configuration file for the Xen instance {hostname}
kernel = '{kernel}'
{ramdisk}memory = {mem}

root = '/dev/xvda1 ro'
disk = [
{disks}
]

name = '{hostname}'

dhcp    = 'dhcp'
vif = ['']

on_poweroff = 'destroy'
on_reboot   = 'restart'
on_crash    = 'restart'

extra = 'xencons=tty console=tty1 console=hvc0'
"
        ))
    }
}

impl Plugin for Xen {
    fn name(&self) -> &str {
        "Xen"
    }

    fn preflight_check(&mut self, vm: &mut Vm) -> Result<()> {
        if vm.settings.get_str("xen-kernel")?.is_none() {
            return Err(Error::config("xen-kernel must be set for Xen guests"));
        }
        Ok(())
    }

    fn mount_partitions(&mut self, vm: &mut Vm) -> Result<()> {
        super::mount_partitions(vm)
    }

    fn unmount_partitions(&mut self, vm: &mut Vm) -> Result<()> {
        super::unmount_partitions(vm)
    }

    /// Move the filesystem images into the destination, keeping them sparse.
    fn convert(&mut self, vm: &mut Vm) -> Result<()> {
        let runner = vm.runner();
        // xen.conf is read from wherever the guest gets started.
        let destdir = std::path::absolute(&vm.destdir)?;
        self.images.clear();
        for fs in vm.layout.filesystems.iter_mut() {
            if fs.preallocated {
                continue;
            }
            let Some(source) = fs.filename.clone() else {
                continue;
            };
            let file_name = source.file_name().unwrap_or(source.as_os_str());
            let destination = destdir.join(file_name);
            info!("Moving {} to {}", source.display(), destination.display());
            Cmd::new("cp")
                .arg("--sparse=always")
                .arg_path(&source)
                .arg_path(&destination)
                .error_msg("Failed to copy filesystem image")
                .run(&*runner)?;
            fs::remove_file(&source)?;
            fs.filename = Some(destination.clone());
            self.images.push(destination);
        }
        vm.result_files.extend(self.images.iter().cloned());
        Ok(())
    }

    fn deploy(&mut self, vm: &mut Vm) -> Result<()> {
        let xenconf = vm.destdir.join("xen.conf");
        write_config(&xenconf, &self.config(vm)?)?;
        vm.result_files.push(xenconf);
        Ok(())
    }
}

fn write_config(path: &Path, contents: &str) -> Result<()> {
    info!("Writing {}", path.display());
    fs::write(path, contents)?;
    Ok(())
}

impl Hypervisor for Xen {
    fn arg(&self) -> &str {
        "xen"
    }

    fn preferred_storage(&self) -> StorageKind {
        StorageKind::FsImage
    }

    fn needs_bootloader(&self) -> bool {
        false
    }

    fn disk_prefix(&self) -> &str {
        "xvd"
    }

    fn filetype(&self) -> &str {
        "raw"
    }
}
