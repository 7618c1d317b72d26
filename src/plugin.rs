//! Build phases and the plugins that take part in them.

use crate::context::Vm;
use crate::error::Result;
use std::fmt;
use std::path::Path;

/// A named point in the build at which plugins run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Hook {
    PreflightCheck,
    SetDefaults,
    Bootstrap,
    ConfigureOs,
    ConfigureNetworking,
    ConfigureMounting,
    MountPartitions,
    InstallBootloader,
    InstallKernel,
    PostInstall,
    UnmountPartitions,
    Convert,
    Deploy,
    /// Runs once per result file, with the file as target.
    FixOwnership,
}

impl Hook {
    pub fn name(self) -> &'static str {
        match self {
            Hook::PreflightCheck => "preflight_check",
            Hook::SetDefaults => "set_defaults",
            Hook::Bootstrap => "bootstrap",
            Hook::ConfigureOs => "configure_os",
            Hook::ConfigureNetworking => "configure_networking",
            Hook::ConfigureMounting => "configure_mounting",
            Hook::MountPartitions => "mount_partitions",
            Hook::InstallBootloader => "install_bootloader",
            Hook::InstallKernel => "install_kernel",
            Hook::PostInstall => "post_install",
            Hook::UnmountPartitions => "unmount_partitions",
            Hook::Convert => "convert",
            Hook::Deploy => "deploy",
            Hook::FixOwnership => "fix_ownership",
        }
    }
}

impl fmt::Display for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Something that takes part in a build.
///
/// Every phase has a no-op default, so a plugin only implements the phases
/// it cares about. Lower [`priority`](Plugin::priority) runs first.
#[allow(unused_variables)]
pub trait Plugin {
    fn name(&self) -> &str;

    fn priority(&self) -> i32 {
        10
    }

    fn preflight_check(&mut self, vm: &mut Vm) -> Result<()> {
        Ok(())
    }

    fn set_defaults(&mut self, vm: &mut Vm) -> Result<()> {
        Ok(())
    }

    fn bootstrap(&mut self, vm: &mut Vm) -> Result<()> {
        Ok(())
    }

    fn configure_os(&mut self, vm: &mut Vm) -> Result<()> {
        Ok(())
    }

    fn configure_networking(&mut self, vm: &mut Vm) -> Result<()> {
        Ok(())
    }

    fn configure_mounting(&mut self, vm: &mut Vm) -> Result<()> {
        Ok(())
    }

    fn mount_partitions(&mut self, vm: &mut Vm) -> Result<()> {
        Ok(())
    }

    fn install_bootloader(&mut self, vm: &mut Vm) -> Result<()> {
        Ok(())
    }

    fn install_kernel(&mut self, vm: &mut Vm) -> Result<()> {
        Ok(())
    }

    fn post_install(&mut self, vm: &mut Vm) -> Result<()> {
        Ok(())
    }

    fn unmount_partitions(&mut self, vm: &mut Vm) -> Result<()> {
        Ok(())
    }

    fn convert(&mut self, vm: &mut Vm) -> Result<()> {
        Ok(())
    }

    fn deploy(&mut self, vm: &mut Vm) -> Result<()> {
        Ok(())
    }

    fn fix_ownership(&mut self, vm: &mut Vm, path: &Path) -> Result<()> {
        Ok(())
    }
}

/// Run `hook` on a single plugin.
pub fn invoke(
    plugin: &mut dyn Plugin,
    hook: Hook,
    vm: &mut Vm,
    target: Option<&Path>,
) -> Result<()> {
    match hook {
        Hook::PreflightCheck => plugin.preflight_check(vm),
        Hook::SetDefaults => plugin.set_defaults(vm),
        Hook::Bootstrap => plugin.bootstrap(vm),
        Hook::ConfigureOs => plugin.configure_os(vm),
        Hook::ConfigureNetworking => plugin.configure_networking(vm),
        Hook::ConfigureMounting => plugin.configure_mounting(vm),
        Hook::MountPartitions => plugin.mount_partitions(vm),
        Hook::InstallBootloader => plugin.install_bootloader(vm),
        Hook::InstallKernel => plugin.install_kernel(vm),
        Hook::PostInstall => plugin.post_install(vm),
        Hook::UnmountPartitions => plugin.unmount_partitions(vm),
        Hook::Convert => plugin.convert(vm),
        Hook::Deploy => plugin.deploy(vm),
        Hook::FixOwnership => match target {
            Some(path) => plugin.fix_ownership(vm, path),
            None => Ok(()),
        },
    }
}

/// Plugins kept in ascending priority; equal priorities keep insertion order.
#[derive(Default)]
pub struct PluginSet {
    plugins: Vec<Box<dyn Plugin>>,
}

impl PluginSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, plugin: Box<dyn Plugin>) {
        let priority = plugin.priority();
        let pos = self.plugins.partition_point(|p| p.priority() <= priority);
        self.plugins.insert(pos, plugin);
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.plugins.iter().map(|p| p.name()).collect()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut dyn Plugin> + '_ {
        self.plugins.iter_mut().map(|p| p.as_mut() as &mut dyn Plugin)
    }
}
