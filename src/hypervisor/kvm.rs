//! KVM and plain QEMU targets.

use super::{Hypervisor, StorageKind};
use crate::context::Vm;
use crate::error::Result;
use crate::plugin::Plugin;
use crate::settings::{Setting, SettingKind, Settings};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use tracing::info;

/// Partitioned disk images converted to qcow2, started by a `run.sh`.
pub struct Kvm {
    arg: &'static str,
    name: &'static str,
    images: Vec<PathBuf>,
}

impl Kvm {
    fn new(arg: &'static str, name: &'static str, settings: &mut Settings) -> Result<Self> {
        settings.register(
            Setting::new("mem", SettingKind::Int, "Assign MEM megabytes of memory to the guest vm.")
                .group("VM settings")
                .default_value(128),
        )?;
        settings.register(
            Setting::new("cpus", SettingKind::Int, "Assign NUM cpus to the guest vm.")
                .group("VM settings")
                .default_value(1),
        )?;
        Ok(Self {
            arg,
            name,
            images: Vec::new(),
        })
    }

    pub fn kvm(settings: &mut Settings) -> Result<Box<dyn Hypervisor>> {
        Ok(Box::new(Self::new("kvm", "KVM", settings)?))
    }

    pub fn qemu(settings: &mut Settings) -> Result<Box<dyn Hypervisor>> {
        Ok(Box::new(Self::new("qemu", "QEMu", settings)?))
    }

    /// Shell script launching the guest with every converted image.
    fn run_script(&self, vm: &Vm) -> Result<String> {
        let mem = vm.settings.get_int("mem")?.unwrap_or(128);
        let cpus = vm.settings.get_int("cpus")?.unwrap_or(1);

        let mut cmdline = vec![
            "kvm".to_string(),
            "-m".to_string(),
            mem.to_string(),
            "-smp".to_string(),
            cpus.to_string(),
        ];
        for image in &self.images {
            let file = image
                .file_name()
                .map(|f| f.to_string_lossy().into_owned())
                .unwrap_or_default();
            cmdline.push("-drive".to_string());
            cmdline.push(format!("file={file}"));
        }
        cmdline.push("\"$@\"".to_string());

        Ok(format!("#!/bin/sh\n\nexec {}\n", cmdline.join(" ")))
    }
}

impl Plugin for Kvm {
    fn name(&self) -> &str {
        self.name
    }

    fn mount_partitions(&mut self, vm: &mut Vm) -> Result<()> {
        super::mount_partitions(vm)
    }

    fn unmount_partitions(&mut self, vm: &mut Vm) -> Result<()> {
        super::unmount_partitions(vm)
    }

    fn convert(&mut self, vm: &mut Vm) -> Result<()> {
        let runner = vm.runner();
        let destdir = vm.destdir.clone();
        self.images.clear();
        for disk in vm.layout.disks.iter_mut() {
            let image = disk.convert(&destdir, self.filetype(), &*runner)?;
            self.images.push(image);
        }
        vm.result_files.extend(self.images.iter().cloned());
        Ok(())
    }

    fn deploy(&mut self, vm: &mut Vm) -> Result<()> {
        let script = vm.destdir.join("run.sh");
        info!("Writing {}", script.display());
        fs::write(&script, self.run_script(vm)?)?;
        fs::set_permissions(&script, fs::Permissions::from_mode(0o775))?;
        vm.result_files.push(script);
        Ok(())
    }
}

impl Hypervisor for Kvm {
    fn arg(&self) -> &str {
        self.arg
    }

    fn preferred_storage(&self) -> StorageKind {
        StorageKind::DiskImage
    }

    fn needs_bootloader(&self) -> bool {
        true
    }

    fn filetype(&self) -> &str {
        "qcow2"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::testing::RecordingRunner;
    use std::rc::Rc;
    use tempfile::TempDir;

    #[test]
    fn test_convert_and_deploy_write_run_script() {
        let temp = TempDir::new().unwrap();
        let runner = Rc::new(RecordingRunner::new());
        let mut vm = Vm::with_runner(temp.path(), runner.clone());
        vm.destdir = temp.path().join("out");
        fs::create_dir(&vm.destdir).unwrap();

        let mut kvm = Kvm::new("kvm", "KVM", &mut vm.settings).unwrap();
        vm.settings.set("mem", 512).unwrap();
        for name in ["disk0.img", "disk1.img"] {
            let path = temp.path().join(name);
            vm.add_disk(&path, Some(64)).unwrap();
            fs::write(&path, b"raw").unwrap();
        }

        kvm.convert(&mut vm).unwrap();
        kvm.deploy(&mut vm).unwrap();

        let script = fs::read_to_string(vm.destdir.join("run.sh")).unwrap();
        assert_eq!(
            script,
            "#!/bin/sh\n\nexec kvm -m 512 -smp 1 \
             -drive file=disk0.qcow2 -drive file=disk1.qcow2 \"$@\"\n"
        );
        let mode = fs::metadata(vm.destdir.join("run.sh")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o775);
        assert_eq!(vm.result_files.len(), 3);
        assert_eq!(runner.count("VBoxManage"), 0);
    }

    #[test]
    fn test_registers_vm_settings() {
        let mut settings = Settings::new();
        let kvm = Kvm::qemu(&mut settings).unwrap();
        assert_eq!(kvm.arg(), "qemu");
        assert_eq!(settings.get_int("mem").unwrap(), Some(128));
        assert_eq!(settings.get_int("cpus").unwrap(), Some(1));
    }
}
