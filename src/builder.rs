//! Build orchestration.
//!
//! A build runs in two scopes that share one [`Vm`]:
//!
//! - the distro scope (distro plugins, then callbacks, then the distro)
//!   builds the guest tree in `chroot_dir` before any image exists;
//! - the hypervisor scope (hypervisor plugins and the distro, then
//!   callbacks, then the hypervisor) lays out storage, installs the tree
//!   into it and produces the result files.
//!
//! Every dispatch that fails drains the cleanup stack before returning.

use crate::context::{Nic, Vm};
use crate::distro::Distro;
use crate::error::Result;
use crate::hooks::call_hooks;
use crate::hypervisor::Hypervisor;
use crate::plugin::{Hook, Plugin, PluginSet};
use crate::process::Cmd;
use crate::registry::Registry;
use std::fs;
use std::path::Path;
use tracing::{info, warn};

pub struct Builder {
    pub vm: Vm,
    distro: Box<dyn Distro>,
    hypervisor: Box<dyn Hypervisor>,
    distro_plugins: PluginSet,
    hypervisor_plugins: PluginSet,
}

impl Builder {
    /// Look up the named components, registering their settings in `vm`.
    pub fn new(registry: &Registry, mut vm: Vm, hypervisor: &str, distro: &str) -> Result<Self> {
        let distro = registry.distro(distro, &mut vm.settings)?;
        let hypervisor = registry.hypervisor(hypervisor, &mut vm.settings)?;
        let distro_plugins = registry.distro_plugins(&mut vm.settings)?;
        let hypervisor_plugins = registry.hypervisor_plugins(&mut vm.settings)?;
        Ok(Self::from_parts(vm, distro, hypervisor, distro_plugins, hypervisor_plugins))
    }

    pub fn from_parts(
        vm: Vm,
        distro: Box<dyn Distro>,
        hypervisor: Box<dyn Hypervisor>,
        distro_plugins: PluginSet,
        hypervisor_plugins: PluginSet,
    ) -> Self {
        Self {
            vm,
            distro,
            hypervisor,
            distro_plugins,
            hypervisor_plugins,
        }
    }

    pub fn distro(&self) -> &dyn Distro {
        self.distro.as_ref()
    }

    pub fn hypervisor(&self) -> &dyn Hypervisor {
        self.hypervisor.as_ref()
    }

    fn call_distro(&mut self, hook: Hook) -> Result<()> {
        info!("Calling hook: {}", hook);
        let Builder {
            vm,
            distro,
            distro_plugins,
            ..
        } = self;
        let owner: &mut dyn Plugin = distro.as_mut();
        call_hooks(vm, hook, None, distro_plugins.iter_mut().collect(), Some(owner))
    }

    fn call_hypervisor(&mut self, hook: Hook, target: Option<&Path>) -> Result<()> {
        info!("Calling hook: {}", hook);
        let Builder {
            vm,
            distro,
            hypervisor,
            hypervisor_plugins,
            ..
        } = self;
        let mut plugins: Vec<&mut dyn Plugin> = hypervisor_plugins.iter_mut().collect();
        plugins.push(distro.as_mut());
        let owner: &mut dyn Plugin = hypervisor.as_mut();
        call_hooks(vm, hook, target, plugins, Some(owner))
    }

    /// Run `step`, draining the cleanup stack if it fails.
    fn guarded(&mut self, step: impl FnOnce(&mut Vm) -> Result<()>) -> Result<()> {
        let result = step(&mut self.vm);
        if result.is_err() {
            if let Err(e) = self.vm.cleanup() {
                warn!("Cleanup after failed step was incomplete: {}", e);
            }
        }
        result
    }

    /// Bootstrap and configure the guest tree in `vm.chroot_dir`.
    pub fn build_chroot(&mut self) -> Result<()> {
        self.call_distro(Hook::PreflightCheck)?;
        self.call_distro(Hook::SetDefaults)?;
        self.call_distro(Hook::Bootstrap)?;
        self.call_distro(Hook::ConfigureOs)?;
        self.vm.cleanup()
    }

    /// Lay out storage, copy the guest tree into it and make it bootable.
    pub fn install_os(&mut self) -> Result<()> {
        self.vm.nics = vec![Nic::default()];
        self.vm.disk_prefix = self.hypervisor.disk_prefix().to_string();
        self.vm.ext3_256_inodes = self.distro.has_256_bit_inode_ext3_support();

        self.call_hypervisor(Hook::PreflightCheck, None)?;
        self.call_hypervisor(Hook::ConfigureNetworking, None)?;
        self.call_hypervisor(Hook::ConfigureMounting, None)?;
        self.call_hypervisor(Hook::MountPartitions, None)?;

        self.guarded(|vm| {
            let runner = vm.runner();
            Cmd::new("rsync")
                .arg("-aHA")
                .arg(format!("{}/", vm.chroot_dir.display()))
                .arg_path(&vm.mount_dir)
                .error_msg("Failed to copy the guest tree into the image")
                .run(&*runner)?;
            vm.chroot_dir = vm.mount_dir.clone();
            Ok(())
        })?;

        if self.hypervisor.needs_bootloader() {
            self.call_hypervisor(Hook::InstallBootloader, None)?;
        }
        self.call_hypervisor(Hook::InstallKernel, None)?;
        self.call_distro(Hook::PostInstall)?;
        self.call_hypervisor(Hook::UnmountPartitions, None)?;

        if let Err(e) = fs::remove_dir(&self.vm.mount_dir) {
            warn!("Could not remove {}: {}", self.vm.mount_dir.display(), e);
        }
        Ok(())
    }

    /// Convert and deploy into `vm.destdir`, then hand every result file to
    /// `fix_ownership`.
    pub fn finalise(&mut self) -> Result<()> {
        self.guarded(|vm| Ok(fs::create_dir_all(&vm.destdir)?))?;
        self.call_hypervisor(Hook::Convert, None)?;
        self.call_hypervisor(Hook::Deploy, None)?;

        let files = self.vm.result_files.clone();
        for file in &files {
            self.call_hypervisor(Hook::FixOwnership, Some(file))?;
        }
        self.vm.cleanup()
    }

    pub fn run(&mut self) -> Result<()> {
        self.build_chroot()?;
        self.install_os()?;
        self.finalise()
    }
}
