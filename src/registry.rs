//! Named distros, hypervisors and the plugins attached to each scope.

use crate::distro::{Distro, RootfsDistro};
use crate::error::{Error, Result};
use crate::hypervisor::{Hypervisor, Kvm, Xen};
use crate::plugin::{Plugin, PluginSet};
use crate::plugins::{NetworkPlugin, PostInstall};
use crate::settings::Settings;
use std::collections::BTreeMap;

/// Builds a distro, registering its settings.
pub type DistroFactory = fn(&mut Settings) -> Result<Box<dyn Distro>>;
/// Builds a hypervisor, registering its settings.
pub type HypervisorFactory = fn(&mut Settings) -> Result<Box<dyn Hypervisor>>;
/// Builds a plugin, registering its settings.
pub type PluginFactory = fn(&mut Settings) -> Result<Box<dyn Plugin>>;

#[derive(Default)]
pub struct Registry {
    distros: BTreeMap<String, DistroFactory>,
    hypervisors: BTreeMap<String, HypervisorFactory>,
    distro_plugins: Vec<(String, PluginFactory)>,
    hypervisor_plugins: Vec<(String, PluginFactory)>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in component.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register_distro("rootfs", RootfsDistro::create);
        registry.register_hypervisor("kvm", Kvm::kvm);
        registry.register_hypervisor("qemu", Kvm::qemu);
        registry.register_hypervisor("xen", Xen::create);
        registry.register_hypervisor_plugin("network", NetworkPlugin::create);
        registry.register_distro_plugin("postinst", PostInstall::create);
        registry
    }

    pub fn register_distro(&mut self, name: &str, factory: DistroFactory) {
        self.distros.insert(name.to_string(), factory);
    }

    pub fn register_hypervisor(&mut self, name: &str, factory: HypervisorFactory) {
        self.hypervisors.insert(name.to_string(), factory);
    }

    pub fn register_distro_plugin(&mut self, name: &str, factory: PluginFactory) {
        self.distro_plugins.push((name.to_string(), factory));
    }

    pub fn register_hypervisor_plugin(&mut self, name: &str, factory: PluginFactory) {
        self.hypervisor_plugins.push((name.to_string(), factory));
    }

    pub fn distro(&self, name: &str, settings: &mut Settings) -> Result<Box<dyn Distro>> {
        let factory = self.distros.get(name).ok_or_else(|| {
            Error::not_found(format!(
                "Invalid distro. Valid distros: {}",
                self.distro_names().join(" ")
            ))
        })?;
        factory(settings)
    }

    pub fn hypervisor(&self, name: &str, settings: &mut Settings) -> Result<Box<dyn Hypervisor>> {
        let factory = self.hypervisors.get(name).ok_or_else(|| {
            Error::not_found(format!(
                "Invalid hypervisor. Valid hypervisors: {}",
                self.hypervisor_names().join(" ")
            ))
        })?;
        factory(settings)
    }

    pub fn distro_plugins(&self, settings: &mut Settings) -> Result<PluginSet> {
        instantiate(&self.distro_plugins, settings)
    }

    pub fn hypervisor_plugins(&self, settings: &mut Settings) -> Result<PluginSet> {
        instantiate(&self.hypervisor_plugins, settings)
    }

    pub fn distro_names(&self) -> Vec<&str> {
        self.distros.keys().map(String::as_str).collect()
    }

    pub fn hypervisor_names(&self) -> Vec<&str> {
        self.hypervisors.keys().map(String::as_str).collect()
    }

    pub fn plugin_names(&self) -> Vec<&str> {
        self.hypervisor_plugins
            .iter()
            .chain(self.distro_plugins.iter())
            .map(|(name, _)| name.as_str())
            .collect()
    }
}

fn instantiate(
    factories: &[(String, PluginFactory)],
    settings: &mut Settings,
) -> Result<PluginSet> {
    let mut set = PluginSet::new();
    for (_, factory) in factories {
        set.add(factory(settings)?);
    }
    Ok(set)
}
