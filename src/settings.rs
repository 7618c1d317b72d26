//! Typed, named build settings.
//!
//! Distros, hypervisors and plugins register the settings they understand
//! when they are instantiated. Values arrive as strings (command line, config
//! files) and are coerced to the setting's kind once, at the boundary.

use crate::error::{Error, Result};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingKind {
    Str,
    Bool,
    Int,
    List,
}

impl SettingKind {
    /// Interpret a user-supplied string as a value of this kind.
    ///
    /// Booleans accept `yes/true/on/1` and `no/false/off/0`; lists are split
    /// on `:` or `,`.
    pub fn coerce(self, raw: &str) -> Result<SettingValue> {
        match self {
            SettingKind::Str => Ok(SettingValue::Str(raw.to_string())),
            SettingKind::Bool => match raw.trim().to_ascii_lowercase().as_str() {
                "yes" | "true" | "on" | "1" => Ok(SettingValue::Bool(true)),
                "no" | "false" | "off" | "0" => Ok(SettingValue::Bool(false)),
                other => Err(Error::setting(format!("could not parse '{other}' as a boolean"))),
            },
            SettingKind::Int => raw
                .trim()
                .parse()
                .map(SettingValue::Int)
                .map_err(|_| Error::setting(format!("could not parse '{raw}' as an integer"))),
            SettingKind::List => Ok(SettingValue::List(
                raw.split([':', ','])
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect(),
            )),
        }
    }
}

impl fmt::Display for SettingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SettingKind::Str => "string",
            SettingKind::Bool => "boolean",
            SettingKind::Int => "integer",
            SettingKind::List => "list",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettingValue {
    Str(String),
    Bool(bool),
    Int(i64),
    List(Vec<String>),
}

impl SettingValue {
    pub fn kind(&self) -> SettingKind {
        match self {
            SettingValue::Str(_) => SettingKind::Str,
            SettingValue::Bool(_) => SettingKind::Bool,
            SettingValue::Int(_) => SettingKind::Int,
            SettingValue::List(_) => SettingKind::List,
        }
    }
}

impl fmt::Display for SettingValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SettingValue::Str(s) => f.write_str(s),
            SettingValue::Bool(b) => write!(f, "{b}"),
            SettingValue::Int(i) => write!(f, "{i}"),
            SettingValue::List(items) => f.write_str(&items.join(",")),
        }
    }
}

impl From<&str> for SettingValue {
    fn from(s: &str) -> Self {
        SettingValue::Str(s.to_string())
    }
}

impl From<String> for SettingValue {
    fn from(s: String) -> Self {
        SettingValue::Str(s)
    }
}

impl From<bool> for SettingValue {
    fn from(b: bool) -> Self {
        SettingValue::Bool(b)
    }
}

impl From<i64> for SettingValue {
    fn from(i: i64) -> Self {
        SettingValue::Int(i)
    }
}

impl From<i32> for SettingValue {
    fn from(i: i32) -> Self {
        SettingValue::Int(i64::from(i))
    }
}

impl From<Vec<String>> for SettingValue {
    fn from(items: Vec<String>) -> Self {
        SettingValue::List(items)
    }
}

/// One registered setting.
#[derive(Debug, Clone)]
pub struct Setting {
    name: String,
    kind: SettingKind,
    help: String,
    group: String,
    default: Option<SettingValue>,
    value: Option<SettingValue>,
    valid_options: Option<Vec<String>>,
}

impl Setting {
    pub fn new(name: &str, kind: SettingKind, help: &str) -> Self {
        Self {
            name: name.to_string(),
            kind,
            help: help.to_string(),
            group: "General".to_string(),
            default: None,
            value: None,
            valid_options: None,
        }
    }

    pub fn group(mut self, group: &str) -> Self {
        self.group = group.to_string();
        self
    }

    pub fn default_value(mut self, value: impl Into<SettingValue>) -> Self {
        self.default = Some(value.into());
        self
    }

    /// Restrict string values to `options`.
    pub fn valid_options(mut self, options: &[&str]) -> Self {
        self.valid_options = Some(options.iter().map(|s| s.to_string()).collect());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> SettingKind {
        self.kind
    }

    pub fn help(&self) -> &str {
        &self.help
    }

    pub fn group_name(&self) -> &str {
        &self.group
    }

    pub fn options(&self) -> Option<&[String]> {
        self.valid_options.as_deref()
    }

    /// The explicit value, else the default.
    pub fn current(&self) -> Option<&SettingValue> {
        self.value.as_ref().or(self.default.as_ref())
    }

    pub fn is_explicit(&self) -> bool {
        self.value.is_some()
    }

    fn check(&self, value: &SettingValue) -> Result<()> {
        if value.kind() != self.kind {
            return Err(Error::setting(format!(
                "{} is a {} setting, got a {} value",
                self.name,
                self.kind,
                value.kind()
            )));
        }
        if let (Some(options), SettingValue::Str(s)) = (&self.valid_options, value) {
            if !options.contains(s) {
                return Err(Error::setting(format!(
                    "{} is not a valid option for {}. Options are: {}",
                    s,
                    self.name,
                    options.join(" ")
                )));
            }
        }
        Ok(())
    }
}

/// All settings known to a build, in registration order.
#[derive(Debug, Clone, Default)]
pub struct Settings {
    settings: Vec<Setting>,
}

fn valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
}

impl Settings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, setting: Setting) -> Result<()> {
        if !valid_name(&setting.name) {
            return Err(Error::setting(format!(
                "invalid setting name '{}': use lowercase letters, digits and dashes",
                setting.name
            )));
        }
        if self.find(&setting.name).is_some() {
            return Err(Error::setting(format!(
                "setting '{}' is already registered",
                setting.name
            )));
        }
        if let Some(default) = &setting.default {
            setting.check(default)?;
        }
        self.settings.push(setting);
        Ok(())
    }

    fn find(&self, name: &str) -> Option<&Setting> {
        self.settings.iter().find(|s| s.name == name)
    }

    fn find_mut(&mut self, name: &str) -> Result<&mut Setting> {
        self.settings
            .iter_mut()
            .find(|s| s.name == name)
            .ok_or_else(|| Error::not_found(format!("unknown setting: {name}")))
    }

    pub fn setting(&self, name: &str) -> Result<&Setting> {
        self.find(name)
            .ok_or_else(|| Error::not_found(format!("unknown setting: {name}")))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.find(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Setting> {
        self.settings.iter()
    }

    pub fn get(&self, name: &str) -> Result<Option<&SettingValue>> {
        Ok(self.setting(name)?.current())
    }

    /// Set an already typed value.
    pub fn set(&mut self, name: &str, value: impl Into<SettingValue>) -> Result<()> {
        let value = value.into();
        let setting = self.find_mut(name)?;
        setting.check(&value)?;
        setting.value = Some(value);
        Ok(())
    }

    /// Set from a string, coerced to the setting's kind.
    pub fn set_fuzzy(&mut self, name: &str, raw: &str) -> Result<()> {
        let kind = self.setting(name)?.kind;
        self.set(name, kind.coerce(raw)?)
    }

    /// Replace the default; an explicit value still wins.
    pub fn set_default(&mut self, name: &str, value: impl Into<SettingValue>) -> Result<()> {
        let value = value.into();
        let setting = self.find_mut(name)?;
        setting.check(&value)?;
        setting.default = Some(value);
        Ok(())
    }

    pub fn is_explicit(&self, name: &str) -> Result<bool> {
        Ok(self.setting(name)?.is_explicit())
    }

    pub fn get_str(&self, name: &str) -> Result<Option<&str>> {
        match self.get(name)? {
            None => Ok(None),
            Some(SettingValue::Str(s)) => Ok(Some(s.as_str())),
            Some(other) => Err(mismatch(name, SettingKind::Str, other)),
        }
    }

    /// Unset booleans read as `false`.
    pub fn get_bool(&self, name: &str) -> Result<bool> {
        match self.get(name)? {
            None => Ok(false),
            Some(SettingValue::Bool(b)) => Ok(*b),
            Some(other) => Err(mismatch(name, SettingKind::Bool, other)),
        }
    }

    pub fn get_int(&self, name: &str) -> Result<Option<i64>> {
        match self.get(name)? {
            None => Ok(None),
            Some(SettingValue::Int(i)) => Ok(Some(*i)),
            Some(other) => Err(mismatch(name, SettingKind::Int, other)),
        }
    }

    /// Unset lists read as empty.
    pub fn get_list(&self, name: &str) -> Result<Vec<String>> {
        match self.get(name)? {
            None => Ok(Vec::new()),
            Some(SettingValue::List(items)) => Ok(items.clone()),
            Some(other) => Err(mismatch(name, SettingKind::List, other)),
        }
    }
}

fn mismatch(name: &str, expected: SettingKind, got: &SettingValue) -> Error {
    Error::setting(format!(
        "{} was read as a {} setting but holds a {} value",
        name,
        expected,
        got.kind()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> Settings {
        let mut settings = Settings::new();
        settings
            .register(Setting::new("mem", SettingKind::Int, "Memory in MB").default_value(128))
            .unwrap();
        settings
            .register(Setting::new("debug", SettingKind::Bool, "Debug output"))
            .unwrap();
        settings
            .register(Setting::new("components", SettingKind::List, "Components"))
            .unwrap();
        settings
            .register(
                Setting::new("arch", SettingKind::Str, "Architecture")
                    .valid_options(&["amd64", "i386"]),
            )
            .unwrap();
        settings
    }

    #[test]
    fn test_default_then_explicit() {
        let mut settings = settings();
        assert_eq!(settings.get_int("mem").unwrap(), Some(128));
        settings.set("mem", 512).unwrap();
        assert_eq!(settings.get_int("mem").unwrap(), Some(512));
        assert!(settings.is_explicit("mem").unwrap());
    }

    #[test]
    fn test_set_default_does_not_override_explicit_value() {
        let mut settings = settings();
        settings.set("mem", 256).unwrap();
        settings.set_default("mem", 1024).unwrap();
        assert_eq!(settings.get_int("mem").unwrap(), Some(256));
    }

    #[test]
    fn test_fuzzy_booleans() {
        let mut settings = settings();
        for raw in ["yes", "TRUE", "on", "1"] {
            settings.set_fuzzy("debug", raw).unwrap();
            assert!(settings.get_bool("debug").unwrap());
        }
        for raw in ["no", "false", "Off", "0"] {
            settings.set_fuzzy("debug", raw).unwrap();
            assert!(!settings.get_bool("debug").unwrap());
        }
        assert!(matches!(
            settings.set_fuzzy("debug", "maybe"),
            Err(Error::Setting(_))
        ));
    }

    #[test]
    fn test_fuzzy_lists() {
        let mut settings = settings();
        settings.set_fuzzy("components", "main, universe:multiverse").unwrap();
        assert_eq!(
            settings.get_list("components").unwrap(),
            vec!["main", "universe", "multiverse"]
        );
        settings.set_fuzzy("components", "").unwrap();
        assert!(settings.get_list("components").unwrap().is_empty());
    }

    #[test]
    fn test_fuzzy_int_rejects_garbage() {
        let mut settings = settings();
        assert!(settings.set_fuzzy("mem", "lots").is_err());
        assert_eq!(settings.get_int("mem").unwrap(), Some(128));
    }

    #[test]
    fn test_typed_set_rejects_wrong_kind() {
        let mut settings = settings();
        assert!(matches!(settings.set("mem", "512"), Err(Error::Setting(_))));
        assert!(settings.get_str("mem").is_err());
    }

    #[test]
    fn test_valid_options() {
        let mut settings = settings();
        settings.set("arch", "i386").unwrap();
        assert!(settings.set("arch", "sparc").is_err());
        assert_eq!(settings.get_str("arch").unwrap(), Some("i386"));
    }

    #[test]
    fn test_registration_rules() {
        let mut settings = settings();
        assert!(settings
            .register(Setting::new("mem", SettingKind::Int, "again"))
            .is_err());
        assert!(settings
            .register(Setting::new("Bad_Name", SettingKind::Str, "nope"))
            .is_err());
        assert!(matches!(settings.get("nope"), Err(Error::NotFound(_))));
    }
}
