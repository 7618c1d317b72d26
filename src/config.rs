//! TOML configuration files.
//!
//! ```toml
//! [default]
//! mem = 512
//!
//! [rootfs]
//! hostname = "builder"
//!
//! [kvm]
//! cpus = 2
//! ```
//!
//! The `[default]` table applies to every build, then the table named after
//! the distro, then the one named after the hypervisor. Later files override
//! earlier ones.

use crate::error::{Error, Result};
use crate::settings::{SettingKind, SettingValue, Settings};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

type Section = BTreeMap<String, toml::Value>;

#[derive(Debug, Default, Deserialize)]
#[serde(transparent)]
struct ConfigFile {
    sections: BTreeMap<String, Section>,
}

/// Merged contents of every config file read.
#[derive(Debug, Default)]
pub struct Config {
    sections: BTreeMap<String, Section>,
}

/// System-wide and per-user config files, in the order they apply.
pub fn default_paths() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from("/etc/vm-builder.toml")];
    if let Some(home) = dirs::home_dir() {
        paths.push(home.join(".vm-builder.toml"));
    }
    paths
}

impl Config {
    /// Read every existing file of `paths`; missing files are skipped.
    pub fn load(paths: &[PathBuf]) -> Result<Self> {
        let mut config = Config::default();
        for path in paths {
            if path.exists() {
                config.merge_file(path)?;
            } else {
                debug!("No config file at {}", path.display());
            }
        }
        Ok(config)
    }

    pub fn merge_file(&mut self, path: &Path) -> Result<()> {
        debug!("Reading config file {}", path.display());
        let text = fs::read_to_string(path)?;
        self.merge_str(&text)
            .map_err(|e| Error::config(format!("{}: {}", path.display(), e)))
    }

    pub fn merge_str(&mut self, text: &str) -> Result<()> {
        let file: ConfigFile =
            toml::from_str(text).map_err(|e| Error::config(e.to_string()))?;
        for (name, section) in file.sections {
            self.sections.entry(name).or_default().extend(section);
        }
        Ok(())
    }

    /// Apply `[default]`, then each of `sections`, onto `settings`.
    ///
    /// Keys naming settings no loaded component registered are ignored; a
    /// config file is shared between builds using different plugins.
    pub fn apply(&self, settings: &mut Settings, sections: &[&str]) -> Result<()> {
        for name in std::iter::once("default").chain(sections.iter().copied()) {
            let Some(section) = self.sections.get(name) else {
                continue;
            };
            for (key, value) in section {
                if !settings.contains(key) {
                    warn!("[{}] {}: no such setting, ignoring", name, key);
                    continue;
                }
                let kind = settings.setting(key)?.kind();
                settings.set(key, to_setting_value(key, kind, value)?)?;
            }
        }
        Ok(())
    }
}

fn to_setting_value(key: &str, kind: SettingKind, value: &toml::Value) -> Result<SettingValue> {
    match (kind, value) {
        (_, toml::Value::String(s)) => kind.coerce(s),
        (SettingKind::Int, toml::Value::Integer(i)) => Ok(SettingValue::Int(*i)),
        (SettingKind::Bool, toml::Value::Boolean(b)) => Ok(SettingValue::Bool(*b)),
        (SettingKind::Str, toml::Value::Integer(i)) => Ok(SettingValue::Str(i.to_string())),
        (SettingKind::List, toml::Value::Array(items)) => items
            .iter()
            .map(|item| match item {
                toml::Value::String(s) => Ok(s.clone()),
                other => Err(Error::setting(format!(
                    "{key}: list entries must be strings, got {other}"
                ))),
            })
            .collect::<Result<Vec<_>>>()
            .map(SettingValue::List),
        (kind, other) => Err(Error::setting(format!(
            "{key}: expected a {kind} value, got {other}"
        ))),
    }
}
