//! Sectioned key/value configuration with three-tier precedence.
//!
//! Every key keeps a built-in default, a value read from the config file and
//! a command-line override; the effective value is the highest layer that is
//! set. Sections with a registered schema only accept their registered keys.

use std::fmt;
use std::fs;
use std::path::Path;
use serde::{Serialize, Deserialize};

use crate::core::cpus::CpuList;
use crate::core::error::{Result, RtevalError};

pub const RTEVAL_SECTION: &str = "rteval";
pub const LOADS_SECTION: &str = "loads";
pub const MEASUREMENT_SECTION: &str = "measurement";

/// Value that enables a module when listed in a family section.
pub const MODULE_ENABLED: &str = "module";

/// Default system-wide config file, read when no explicit file is given.
pub const DEFAULT_CONFIG_FILE: &str = "/etc/rteval.conf";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OptionKind {
    Str,
    Int,
    Float,
    Bool,
    CpuList,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ConfigValue {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    CpuList(CpuList),
}

impl ConfigValue {
    pub fn kind(&self) -> OptionKind {
        match self {
            ConfigValue::Str(_) => OptionKind::Str,
            ConfigValue::Int(_) => OptionKind::Int,
            ConfigValue::Float(_) => OptionKind::Float,
            ConfigValue::Bool(_) => OptionKind::Bool,
            ConfigValue::CpuList(_) => OptionKind::CpuList,
        }
    }

    /// Parse a command-line string as a value of `kind`.
    pub fn parse(kind: OptionKind, text: &str) -> std::result::Result<Self, String> {
        let text = text.trim();
        match kind {
            OptionKind::Str => Ok(ConfigValue::Str(text.to_string())),
            OptionKind::Int => text
                .parse::<i64>()
                .map(ConfigValue::Int)
                .map_err(|_| format!("'{}' is not an integer", text)),
            OptionKind::Float => text
                .parse::<f64>()
                .map(ConfigValue::Float)
                .map_err(|_| format!("'{}' is not a number", text)),
            OptionKind::Bool => parse_bool(text).map(ConfigValue::Bool),
            OptionKind::CpuList => CpuList::parse(text)
                .map(ConfigValue::CpuList)
                .map_err(|e| e.to_string()),
        }
    }

    fn from_toml(kind: OptionKind, value: &toml::Value) -> std::result::Result<Self, String> {
        match (kind, value) {
            (_, toml::Value::String(text)) => Self::parse(kind, text),
            (OptionKind::Str, other) => Ok(ConfigValue::Str(other.to_string())),
            (OptionKind::Int, toml::Value::Integer(i)) => Ok(ConfigValue::Int(*i)),
            (OptionKind::Float, toml::Value::Integer(i)) => Ok(ConfigValue::Float(*i as f64)),
            (OptionKind::Float, toml::Value::Float(f)) => Ok(ConfigValue::Float(*f)),
            (OptionKind::Bool, toml::Value::Boolean(b)) => Ok(ConfigValue::Bool(*b)),
            (OptionKind::CpuList, toml::Value::Integer(i)) if *i >= 0 => {
                Ok(ConfigValue::CpuList(CpuList::new([*i as usize])))
            }
            (OptionKind::CpuList, toml::Value::Array(items)) => items
                .iter()
                .map(|item| match item {
                    toml::Value::Integer(i) if *i >= 0 => Ok(*i as usize),
                    other => Err(format!("'{}' is not a CPU index", other)),
                })
                .collect::<std::result::Result<CpuList, String>>()
                .map(ConfigValue::CpuList),
            (kind, other) => Err(format!("'{}' does not fit option type {:?}", other, kind)),
        }
    }

    fn from_toml_untyped(value: &toml::Value) -> Self {
        match value {
            toml::Value::String(text) => ConfigValue::Str(text.clone()),
            toml::Value::Integer(i) => ConfigValue::Int(*i),
            toml::Value::Float(f) => ConfigValue::Float(*f),
            toml::Value::Boolean(b) => ConfigValue::Bool(*b),
            other => ConfigValue::Str(other.to_string()),
        }
    }
}

impl fmt::Display for ConfigValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigValue::Str(s) => write!(f, "{}", s),
            ConfigValue::Int(i) => write!(f, "{}", i),
            ConfigValue::Float(v) => write!(f, "{}", v),
            ConfigValue::Bool(b) => write!(f, "{}", b),
            ConfigValue::CpuList(cpus) => write!(f, "{}", cpus),
        }
    }
}

fn parse_bool(text: &str) -> std::result::Result<bool, String> {
    match text.to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Ok(true),
        "false" | "no" | "off" | "0" => Ok(false),
        _ => Err(format!("'{}' is not a boolean", text)),
    }
}

/// One registered option of a section schema.
#[derive(Debug, Clone, PartialEq)]
pub struct OptionSpec {
    pub key: String,
    pub kind: OptionKind,
    pub default: Option<ConfigValue>,
}

impl OptionSpec {
    pub fn new(key: &str, kind: OptionKind, default: Option<ConfigValue>) -> Self {
        Self { key: key.to_string(), kind, default }
    }

    pub fn optional(key: &str, kind: OptionKind) -> Self {
        Self::new(key, kind, None)
    }

    pub fn string(key: &str, default: &str) -> Self {
        Self::new(key, OptionKind::Str, Some(ConfigValue::Str(default.to_string())))
    }

    pub fn int(key: &str, default: i64) -> Self {
        Self::new(key, OptionKind::Int, Some(ConfigValue::Int(default)))
    }

    pub fn float(key: &str, default: f64) -> Self {
        Self::new(key, OptionKind::Float, Some(ConfigValue::Float(default)))
    }

    pub fn boolean(key: &str, default: bool) -> Self {
        Self::new(key, OptionKind::Bool, Some(ConfigValue::Bool(default)))
    }

    pub fn cpulist(key: &str) -> Self {
        Self::new(key, OptionKind::CpuList, Some(ConfigValue::CpuList(CpuList::empty())))
    }
}

/// Schema of the `[rteval]` section.
pub fn rteval_options() -> Vec<OptionSpec> {
    vec![
        OptionSpec::boolean("verbose", false),
        OptionSpec::float("duration", 60.0),
        OptionSpec::string("workdir", "."),
        OptionSpec::optional("reportdir", OptionKind::Str),
        OptionSpec::optional("annotate", OptionKind::Str),
        OptionSpec::cpulist("loads_cpulist"),
        OptionSpec::cpulist("measurement_cpulist"),
        OptionSpec::float("warmup", 5.0),
        OptionSpec::float("stop_grace", 10.0),
        OptionSpec::float("report_interval", 600.0),
    ]
}

#[derive(Debug, Clone, Default)]
struct Layers {
    default: Option<ConfigValue>,
    file: Option<ConfigValue>,
    cli: Option<ConfigValue>,
}

impl Layers {
    fn effective(&self) -> Option<&ConfigValue> {
        self.cli.as_ref().or(self.file.as_ref()).or(self.default.as_ref())
    }
}

#[derive(Debug, Clone)]
struct Entry {
    key: String,
    kind: Option<OptionKind>,
    layers: Layers,
}

#[derive(Debug, Clone, Default)]
struct Section {
    registered: bool,
    entries: Vec<Entry>,
}

impl Section {
    fn entry_mut(&mut self, key: &str) -> Option<&mut Entry> {
        self.entries.iter_mut().find(|entry| entry.key == key)
    }

    /// Entry for `key`, created on demand when the section has no schema.
    fn writable_entry(&mut self, section: &str, key: &str) -> Result<&mut Entry> {
        if let Some(index) = self.entries.iter().position(|entry| entry.key == key) {
            return Ok(&mut self.entries[index]);
        }
        if self.registered {
            return Err(RtevalError::Config(format!(
                "Unknown option '{}' in section [{}]", key, section
            )));
        }
        self.entries.push(Entry { key: key.to_string(), kind: None, layers: Layers::default() });
        let last = self.entries.len() - 1;
        Ok(&mut self.entries[last])
    }
}

/// Read-only snapshot of one section handed to modules.
#[derive(Debug, Clone, PartialEq)]
pub struct SectionView {
    name: String,
    values: Vec<(String, Option<ConfigValue>)>,
}

impl SectionView {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.iter().map(|(key, _)| key.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Effective value of a registered key; `None` when it has no value.
    pub fn get(&self, key: &str) -> Result<Option<&ConfigValue>> {
        self.values
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, value)| value.as_ref())
            .ok_or_else(|| {
                RtevalError::Config(format!("Unregistered option '{}' in section [{}]", key, self.name))
            })
    }

    fn require(&self, key: &str) -> Result<&ConfigValue> {
        self.get(key)?.ok_or_else(|| {
            RtevalError::Config(format!("Option '{}' in section [{}] has no value", key, self.name))
        })
    }

    fn mismatch(&self, key: &str, wanted: &str, value: &ConfigValue) -> RtevalError {
        RtevalError::Config(format!(
            "Option '{}' in section [{}] is {:?}, expected {}", key, self.name, value.kind(), wanted
        ))
    }

    pub fn get_str(&self, key: &str) -> Result<String> {
        Ok(self.require(key)?.to_string())
    }

    pub fn get_opt_str(&self, key: &str) -> Result<Option<String>> {
        Ok(self.get(key)?.map(ToString::to_string))
    }

    pub fn get_int(&self, key: &str) -> Result<i64> {
        match self.require(key)? {
            ConfigValue::Int(i) => Ok(*i),
            other => Err(self.mismatch(key, "an integer", other)),
        }
    }

    pub fn get_float(&self, key: &str) -> Result<f64> {
        match self.require(key)? {
            ConfigValue::Float(f) => Ok(*f),
            ConfigValue::Int(i) => Ok(*i as f64),
            other => Err(self.mismatch(key, "a number", other)),
        }
    }

    pub fn get_bool(&self, key: &str) -> Result<bool> {
        match self.require(key)? {
            ConfigValue::Bool(b) => Ok(*b),
            other => Err(self.mismatch(key, "a boolean", other)),
        }
    }

    pub fn get_cpulist(&self, key: &str) -> Result<CpuList> {
        match self.require(key)? {
            ConfigValue::CpuList(cpus) => Ok(cpus.clone()),
            ConfigValue::Str(text) => CpuList::parse(text),
            other => Err(self.mismatch(key, "a CPU list", other)),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConfigStore {
    sections: Vec<(String, Section)>,
}

impl ConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn find(&self, name: &str) -> Option<&Section> {
        self.sections.iter().find(|(n, _)| n == name).map(|(_, s)| s)
    }

    fn find_or_create(&mut self, name: &str) -> &mut Section {
        if let Some(index) = self.sections.iter().position(|(n, _)| n == name) {
            return &mut self.sections[index].1;
        }
        self.sections.push((name.to_string(), Section::default()));
        let last = self.sections.len() - 1;
        &mut self.sections[last].1
    }

    /// Register the schema of `section`, seeding each option's default layer.
    /// Registering the same key twice keeps the first default.
    pub fn register_schema(&mut self, section: &str, options: &[OptionSpec]) {
        let target = self.find_or_create(section);
        target.registered = true;
        for option in options {
            match target.entry_mut(&option.key) {
                Some(entry) => {
                    entry.kind = Some(option.kind);
                    if entry.layers.default.is_none() {
                        entry.layers.default = option.default.clone();
                    }
                }
                None => target.entries.push(Entry {
                    key: option.key.clone(),
                    kind: Some(option.kind),
                    layers: Layers { default: option.default.clone(), ..Layers::default() },
                }),
            }
        }
    }

    pub fn has_section(&self, name: &str) -> bool {
        self.find(name).is_some()
    }

    pub fn section_names(&self) -> impl Iterator<Item = &str> {
        self.sections.iter().map(|(name, _)| name.as_str())
    }

    /// Snapshot of `name`; an empty section is created on first access.
    pub fn section(&mut self, name: &str) -> SectionView {
        let section = self.find_or_create(name);
        SectionView {
            name: name.to_string(),
            values: section
                .entries
                .iter()
                .map(|entry| (entry.key.clone(), entry.layers.effective().cloned()))
                .collect(),
        }
    }

    /// Add default values that are not already present. Explicit (file or
    /// override) values are never touched.
    pub fn append_config(&mut self, section: &str, defaults: &[(&str, ConfigValue)]) -> Result<()> {
        let target = self.find_or_create(section);
        for (key, value) in defaults {
            let entry = target.writable_entry(section, key)?;
            if entry.layers.default.is_none() {
                entry.layers.default = Some(value.clone());
            }
        }
        Ok(())
    }

    pub fn load_file(&mut self, path: &Path) -> Result<()> {
        let text = fs::read_to_string(path).map_err(|e| {
            RtevalError::Config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;
        self.load_str(&text)
            .map_err(|e| RtevalError::Config(format!("{}: {}", path.display(), e)))
    }

    /// Merge a TOML document into the file layer. Keys listed in the document
    /// move to the front of their section in document order.
    pub fn load_str(&mut self, text: &str) -> Result<()> {
        let document: toml::Table = text
            .parse()
            .map_err(|e| RtevalError::Config(format!("Failed to parse config: {}", e)))?;

        for (name, value) in &document {
            let table = match value {
                toml::Value::Table(table) => table,
                other => {
                    return Err(RtevalError::Config(format!(
                        "Option '{} = {}' is outside of any section", name, other
                    )))
                }
            };

            let section = self.find_or_create(name);
            for (key, raw) in table {
                let entry = section.writable_entry(name, key)?;
                let value = match entry.kind {
                    Some(kind) => ConfigValue::from_toml(kind, raw).map_err(|e| {
                        RtevalError::Config(format!("[{}] {}: {}", name, key, e))
                    })?,
                    None => ConfigValue::from_toml_untyped(raw),
                };
                entry.layers.file = Some(value);
            }

            let order: Vec<&String> = table.keys().collect();
            section.entries.sort_by_key(|entry| {
                order.iter().position(|key| **key == entry.key).unwrap_or(usize::MAX)
            });
        }
        Ok(())
    }

    /// Apply one command-line override.
    pub fn set_override(&mut self, section: &str, key: &str, value: &str) -> Result<()> {
        let target = self.find_or_create(section);
        let entry = target.writable_entry(section, key)?;
        let value = ConfigValue::parse(entry.kind.unwrap_or(OptionKind::Str), value)
            .map_err(|e| RtevalError::Config(format!("[{}] {}: {}", section, key, e)))?;
        entry.layers.cli = Some(value);
        Ok(())
    }

    /// Apply `section.key=value` overrides. Applying the same set twice is
    /// a no-op the second time.
    pub fn update_from_overrides<I, S>(&mut self, overrides: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for item in overrides {
            let item = item.as_ref();
            let (path, value) = item.split_once('=').ok_or_else(|| {
                RtevalError::Config(format!("Override '{}' is not of the form section.key=value", item))
            })?;
            let (section, key) = path.trim().split_once('.').ok_or_else(|| {
                RtevalError::Config(format!("Override '{}' does not name a section", item))
            })?;
            self.set_override(section, key, value)?;
        }
        Ok(())
    }

    /// Modules enabled in a family section, in section order.
    pub fn enabled_modules(&mut self, family_section: &str) -> Vec<String> {
        let view = self.section(family_section);
        view.values
            .iter()
            .filter(|(_, value)| matches!(value, Some(ConfigValue::Str(v)) if v == MODULE_ENABLED))
            .map(|(key, _)| key.clone())
            .collect()
    }
}

/// Parse a run duration with an optional `s`, `m`, `h` or `d` suffix into
/// seconds. A bare number is taken as seconds.
pub fn parse_duration(text: &str) -> Result<f64> {
    let text = text.trim();
    let (number, multiplier) = match text.chars().last() {
        Some('s') => (&text[..text.len() - 1], 1.0),
        Some('m') => (&text[..text.len() - 1], 60.0),
        Some('h') => (&text[..text.len() - 1], 3600.0),
        Some('d') => (&text[..text.len() - 1], 86400.0),
        _ => (text, 1.0),
    };
    let value = number
        .trim()
        .parse::<f64>()
        .map_err(|_| RtevalError::Config(format!("Invalid duration format: '{}'", text)))?;
    if !value.is_finite() || value <= 0.0 {
        return Err(RtevalError::Config(format!("Duration must be positive: '{}'", text)));
    }
    Ok(value * multiplier)
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;

    fn store() -> ConfigStore {
        let mut store = ConfigStore::new();
        store.register_schema(RTEVAL_SECTION, &rteval_options());
        store.register_schema(LOADS_SECTION, &[
            OptionSpec::string("stress", MODULE_ENABLED),
            OptionSpec::string("hackbench", MODULE_ENABLED),
        ]);
        store
    }

    #[test]
    fn test_defaults_visible_through_view() {
        let mut store = store();
        let view = store.section(RTEVAL_SECTION);
        assert_eq!(view.get_float("duration").unwrap(), 60.0);
        assert!(!view.get_bool("verbose").unwrap());
        assert!(view.get_cpulist("loads_cpulist").unwrap().is_empty());
        assert_eq!(view.get_opt_str("annotate").unwrap(), None);
    }

    #[test]
    fn test_unregistered_key_is_an_error() {
        let mut store = store();
        let view = store.section(RTEVAL_SECTION);
        assert!(matches!(view.get_str("no_such_key"), Err(RtevalError::Config(_))));
    }

    #[test]
    fn test_missing_value_is_an_error() {
        let mut store = store();
        let view = store.section(RTEVAL_SECTION);
        assert!(view.get_str("reportdir").is_err());
    }

    #[test]
    fn test_section_created_on_first_access() {
        let mut store = store();
        assert!(!store.has_section("cyclic"));
        let view = store.section("cyclic");
        assert!(view.is_empty());
        assert!(store.has_section("cyclic"));
    }

    #[test]
    fn test_precedence_defaults_file_overrides() {
        let mut store = store();
        store.load_str(indoc! {r#"
            [rteval]
            duration = 120
            workdir = "/var/tmp"
        "#}).unwrap();
        store.update_from_overrides(["rteval.duration=30"]).unwrap();

        let view = store.section(RTEVAL_SECTION);
        assert_eq!(view.get_float("duration").unwrap(), 30.0);
        assert_eq!(view.get_str("workdir").unwrap(), "/var/tmp");
        assert_eq!(view.get_float("warmup").unwrap(), 5.0);
    }

    #[test]
    fn test_file_loaded_after_override_does_not_win() {
        let mut store = store();
        store.update_from_overrides(["rteval.duration=30"]).unwrap();
        store.load_str("[rteval]\nduration = 900\n").unwrap();
        assert_eq!(store.section(RTEVAL_SECTION).get_float("duration").unwrap(), 30.0);
    }

    #[test]
    fn test_overrides_are_idempotent() {
        let mut store = store();
        let overrides = ["rteval.duration=45", "rteval.measurement_cpulist=2-3"];
        store.update_from_overrides(overrides).unwrap();
        let once = store.section(RTEVAL_SECTION);
        store.update_from_overrides(overrides).unwrap();
        let twice = store.section(RTEVAL_SECTION);
        assert_eq!(once, twice);
        assert_eq!(twice.get_cpulist("measurement_cpulist").unwrap().to_string(), "2-3");
    }

    #[test]
    fn test_unknown_key_rejected_at_load_time() {
        let mut store = store();
        let err = store.load_str("[rteval]\ndurration = 5\n").unwrap_err();
        assert!(err.to_string().contains("durration"));
    }

    #[test]
    fn test_type_mismatch_rejected_at_load_time() {
        let mut store = store();
        assert!(store.load_str("[rteval]\nduration = \"soon\"\n").is_err());
        assert!(store.update_from_overrides(["rteval.verbose=maybe"]).is_err());
    }

    #[test]
    fn test_unregistered_sections_accept_any_key() {
        let mut store = store();
        store.load_str("[site]\nlab = \"b12\"\nracks = 4\n").unwrap();
        let view = store.section("site");
        assert_eq!(view.get_str("lab").unwrap(), "b12");
        assert_eq!(view.get_int("racks").unwrap(), 4);
    }

    #[test]
    fn test_append_config_never_overwrites() {
        let mut store = store();
        store.load_str("[site]\nlab = \"b12\"\n").unwrap();
        store.append_config("site", &[
            ("lab", ConfigValue::Str("default-lab".into())),
            ("floor", ConfigValue::Int(3)),
        ]).unwrap();
        store.append_config("site", &[("floor", ConfigValue::Int(9))]).unwrap();

        let view = store.section("site");
        assert_eq!(view.get_str("lab").unwrap(), "b12");
        assert_eq!(view.get_int("floor").unwrap(), 3);
        assert!(store.append_config(RTEVAL_SECTION, &[("bogus", ConfigValue::Int(1))]).is_err());
    }

    #[test]
    fn test_enabled_modules_follow_file_order() {
        let mut store = store();
        assert_eq!(store.enabled_modules(LOADS_SECTION), vec!["stress", "hackbench"]);

        store.load_str("[loads]\nhackbench = \"module\"\nstress = \"module\"\n").unwrap();
        assert_eq!(store.enabled_modules(LOADS_SECTION), vec!["hackbench", "stress"]);

        store.update_from_overrides(["loads.stress=off"]).unwrap();
        assert_eq!(store.enabled_modules(LOADS_SECTION), vec!["hackbench"]);
    }

    #[test]
    fn test_cpulist_from_toml_array() {
        let mut store = store();
        store.load_str("[rteval]\nloads_cpulist = [0, 1, 2]\n").unwrap();
        let cpus = store.section(RTEVAL_SECTION).get_cpulist("loads_cpulist").unwrap();
        assert_eq!(cpus.to_string(), "0-2");
    }

    #[test]
    fn test_top_level_key_rejected() {
        let mut store = store();
        assert!(store.load_str("duration = 5\n").is_err());
    }

    #[test]
    fn test_parse_duration_units() {
        assert_eq!(parse_duration("2m").unwrap(), 120.0);
        assert_eq!(parse_duration("1h").unwrap(), 3600.0);
        assert_eq!(parse_duration("30").unwrap(), 30.0);
        assert_eq!(parse_duration("45s").unwrap(), 45.0);
        assert_eq!(parse_duration("1d").unwrap(), 86400.0);
        assert_eq!(parse_duration("1.5h").unwrap(), 5400.0);
    }

    #[test]
    fn test_parse_duration_invalid() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("soon").is_err());
        assert!(parse_duration("-5m").is_err());
        assert!(parse_duration("0").is_err());
        assert!(parse_duration("10w").is_err());
    }
}
