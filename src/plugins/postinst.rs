//! Post-install customisation: copy host files into the guest and run a
//! user script against the finished tree.

use crate::context::Vm;
use crate::error::{Error, Result};
use crate::plugin::Plugin;
use crate::process::Cmd;
use crate::settings::{Setting, SettingKind, Settings};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tracing::info;

pub struct PostInstall;

impl PostInstall {
    pub fn create(settings: &mut Settings) -> Result<Box<dyn Plugin>> {
        let group = "Post install actions";
        settings.register(
            Setting::new(
                "copy",
                SettingKind::Str,
                "Read 'source dest' lines from FILE, copying source files from host \
                 to dest in the guest's file system.",
            )
            .group(group),
        )?;
        settings.register(
            Setting::new(
                "execscript",
                SettingKind::Str,
                "Run SCRIPT after distro installation finishes. Script will be called \
                 with the guest's chroot as first argument.",
            )
            .group(group),
        )?;
        Ok(Box::new(PostInstall))
    }
}

/// `(source, dest)` pairs from a copy list; lines with fewer than two fields
/// are skipped.
pub fn parse_copy_list(text: &str) -> Vec<(String, String)> {
    text.lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            match (fields.next(), fields.next()) {
                (Some(src), Some(dest)) => Some((src.to_string(), dest.to_string())),
                _ => None,
            }
        })
        .collect()
}

/// `dest` resolved inside the guest root.
fn guest_path(chroot: &Path, dest: &str) -> PathBuf {
    chroot.join(dest.trim_start_matches('/'))
}

impl Plugin for PostInstall {
    fn name(&self) -> &str {
        "Post install plugin"
    }

    fn preflight_check(&mut self, vm: &mut Vm) -> Result<()> {
        if let Some(copy) = vm.settings.get_str("copy")? {
            if !Path::new(copy).is_file() {
                return Err(Error::config(format!(
                    "The path to the copy directive is invalid: {copy}. \
                     Make sure you are providing a full path."
                )));
            }
        }

        if let Some(script) = vm.settings.get_str("execscript")? {
            let path = Path::new(script);
            if !path.is_file() {
                return Err(Error::config(format!(
                    "The path to the execscript file is invalid: {script}. \
                     Make sure you are providing a full path."
                )));
            }
            let mode = fs::metadata(path)?.permissions().mode();
            if mode & 0o444 == 0 || mode & 0o111 == 0 {
                return Err(Error::config(format!(
                    "The execscript file is not readable and executable: {script}"
                )));
            }
        }
        Ok(())
    }

    fn post_install(&mut self, vm: &mut Vm) -> Result<()> {
        let runner = vm.runner();

        if let Some(copy) = vm.settings.get_str("copy")?.map(str::to_string) {
            info!("Copying files specified by copy in: {}", copy);
            for (src, dest) in parse_copy_list(&fs::read_to_string(&copy)?) {
                let target = guest_path(&vm.chroot_dir, &dest);
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)?;
                }
                Cmd::new("cp")
                    .arg("-LpR")
                    .arg(&src)
                    .arg_path(&target)
                    .error_msg("Failed to copy file into the guest")
                    .run(&*runner)?;
            }
        }

        if let Some(script) = vm.settings.get_str("execscript")?.map(str::to_string) {
            info!("Executing script: {}", script);
            Cmd::new(script)
                .arg_path(&vm.chroot_dir)
                .error_msg("Post-install script failed")
                .run(&*runner)?;
        }
        Ok(())
    }
}
