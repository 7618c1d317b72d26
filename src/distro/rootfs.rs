//! Guest built from a prebuilt root filesystem tarball.
//!
//! The tarball (`.tar`, or zstd-compressed `.tar.zst`) is unpacked into the
//! chroot; the distro then only writes the host identity and `/etc/fstab`.

use super::{fstab, Distro};
use crate::context::Vm;
use crate::disk::FsType;
use crate::error::{Error, Result};
use crate::plugin::Plugin;
use crate::settings::{Setting, SettingKind, Settings};
use std::fs::{self, File};
use std::io::Read;
use std::path::Path;
use tracing::info;

pub struct RootfsDistro;

impl RootfsDistro {
    pub fn create(settings: &mut Settings) -> Result<Box<dyn Distro>> {
        settings.register(
            Setting::new("rootfs", SettingKind::Str, "Root filesystem tarball (.tar or .tar.zst).")
                .group("Root filesystem"),
        )?;
        settings.register(
            Setting::new("hostname", SettingKind::Str, "Set NAME as the hostname of the guest.")
                .group("Root filesystem")
                .default_value("vm"),
        )?;
        Ok(Box::new(RootfsDistro))
    }
}

fn is_zstd(path: &Path) -> bool {
    let name = path.to_string_lossy();
    name.ends_with(".tar.zst") || name.ends_with(".tzst")
}

/// Unpack `tarball` into `dest`, decompressing zstd archives on the fly.
pub fn unpack(tarball: &Path, dest: &Path) -> Result<()> {
    fs::create_dir_all(dest)?;
    let f = File::open(tarball)?;
    let reader: Box<dyn Read> = if is_zstd(tarball) {
        Box::new(zstd::stream::Decoder::new(f)?)
    } else {
        Box::new(f)
    };
    let mut archive = tar::Archive::new(reader);
    archive.set_preserve_permissions(true);
    archive.unpack(dest).map_err(|e| {
        Error::config(format!("Failed to unpack {}: {}", tarball.display(), e))
    })?;
    Ok(())
}

fn rootfs_setting(vm: &Vm) -> Result<&Path> {
    vm.settings
        .get_str("rootfs")?
        .map(Path::new)
        .ok_or_else(|| Error::config("rootfs must be set to a root filesystem tarball"))
}

fn hostname(vm: &Vm) -> Result<String> {
    Ok(vm.settings.get_str("hostname")?.unwrap_or("vm").to_string())
}

impl Plugin for RootfsDistro {
    fn name(&self) -> &str {
        "Root filesystem tarball"
    }

    fn preflight_check(&mut self, vm: &mut Vm) -> Result<()> {
        let tarball = rootfs_setting(vm)?;
        if !tarball.is_file() {
            return Err(Error::config(format!(
                "The rootfs tarball does not exist: {}",
                tarball.display()
            )));
        }
        let name = tarball.to_string_lossy();
        if !(name.ends_with(".tar") || is_zstd(tarball)) {
            return Err(Error::config(format!(
                "Unsupported rootfs archive {}: expected .tar or .tar.zst",
                tarball.display()
            )));
        }
        Ok(())
    }

    fn bootstrap(&mut self, vm: &mut Vm) -> Result<()> {
        let tarball = rootfs_setting(vm)?.to_path_buf();
        info!("Unpacking {} into {}", tarball.display(), vm.chroot_dir.display());
        unpack(&tarball, &vm.chroot_dir)
    }

    fn configure_os(&mut self, vm: &mut Vm) -> Result<()> {
        let hostname = hostname(vm)?;
        let etc = vm.chroot_dir.join("etc");
        fs::create_dir_all(&etc)?;
        fs::write(etc.join("hostname"), format!("{hostname}\n"))?;
        fs::write(
            etc.join("hosts"),
            format!(
                "127.0.0.1\tlocalhost\n127.0.1.1\t{hostname}\n\n\
                 ::1\tip6-localhost ip6-loopback\nff02::1\tip6-allnodes\nff02::2\tip6-allrouters\n"
            ),
        )?;
        Ok(())
    }

    fn configure_mounting(&mut self, vm: &mut Vm) -> Result<()> {
        let etc = vm.chroot_dir.join("etc");
        fs::create_dir_all(&etc)?;
        info!("Writing {}", etc.join("fstab").display());
        fs::write(etc.join("fstab"), fstab(vm))?;
        Ok(())
    }
}

impl Distro for RootfsDistro {
    fn arg(&self) -> &str {
        "rootfs"
    }

    fn preferred_filesystem(&self) -> FsType {
        FsType::Ext4
    }
}
