//! Phase dispatch with rollback on failure.
//!
//! A phase runs on the scope's plugins in priority order, then on the
//! callbacks registered with [`Vm::register_hook`], then on the scope owner
//! itself. If any of them fails, every pending cleanup action is run before
//! the original error is handed back, so no mount or mapping outlives a
//! failed build.

use crate::context::Vm;
use crate::error::Result;
use crate::plugin::{invoke, Hook, Plugin};
use std::path::Path;
use tracing::{debug, error, warn};

/// Dispatch `hook` to `plugins`, then the ad-hoc callbacks, then `owner`.
pub fn call_hooks(
    vm: &mut Vm,
    hook: Hook,
    target: Option<&Path>,
    plugins: Vec<&mut dyn Plugin>,
    owner: Option<&mut dyn Plugin>,
) -> Result<()> {
    match run(vm, hook, target, plugins, owner) {
        Ok(()) => Ok(()),
        Err(e) => {
            error!("{} failed: {}", hook, e);
            if let Err(cleanup_err) = vm.cleanup() {
                warn!("Cleanup after failed {} was incomplete: {}", hook, cleanup_err);
            }
            Err(e)
        }
    }
}

fn run(
    vm: &mut Vm,
    hook: Hook,
    target: Option<&Path>,
    plugins: Vec<&mut dyn Plugin>,
    owner: Option<&mut dyn Plugin>,
) -> Result<()> {
    for plugin in plugins {
        debug!("Calling {} on {}", hook, plugin.name());
        invoke(plugin, hook, vm, target)?;
    }
    vm.run_callbacks(hook, target)?;
    if let Some(owner) = owner {
        debug!("Calling {} on {}", hook, owner.name());
        invoke(owner, hook, vm, target)?;
    }
    Ok(())
}
