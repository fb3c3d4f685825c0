use std::fmt;
use std::sync::Arc;

use crate::core::config::{self, ConfigStore, OptionSpec, MODULE_ENABLED, RTEVAL_SECTION};
use crate::core::error::{Result, RtevalError};
use crate::core::logging::LogHandle;
use crate::core::module::{Module, ModuleKind};

pub type ModuleConstructor = Arc<dyn Fn(LogHandle) -> Box<dyn Module> + Send + Sync>;

/// A module the binary knows how to build, with its config schema.
#[derive(Clone)]
pub struct ModuleDescriptor {
    pub name: String,
    pub kind: ModuleKind,
    pub description: String,
    pub options: Vec<OptionSpec>,
    pub enabled_by_default: bool,
    constructor: ModuleConstructor,
}

impl fmt::Debug for ModuleDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleDescriptor")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("enabled_by_default", &self.enabled_by_default)
            .finish()
    }
}

impl ModuleDescriptor {
    pub fn create(&self, log: LogHandle) -> Box<dyn Module> {
        (self.constructor)(log)
    }
}

/// Static name -> constructor table. Configuration decides which entries
/// are active for a run.
#[derive(Debug, Clone, Default)]
pub struct ModuleRegistry {
    entries: Vec<ModuleDescriptor>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every module shipped with the binary.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        crate::modules::register_builtin(&mut registry);
        registry
    }

    pub fn register<F>(
        &mut self,
        name: &str,
        kind: ModuleKind,
        description: &str,
        options: Vec<OptionSpec>,
        enabled_by_default: bool,
        constructor: F,
    ) -> Result<()>
    where
        F: Fn(LogHandle) -> Box<dyn Module> + Send + Sync + 'static,
    {
        if self.get(name).is_some() {
            return Err(RtevalError::Config(format!("Module {} registered twice", name)));
        }
        self.entries.push(ModuleDescriptor {
            name: name.to_string(),
            kind,
            description: description.to_string(),
            options,
            enabled_by_default,
            constructor: Arc::new(constructor),
        });
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&ModuleDescriptor> {
        self.entries.iter().find(|entry| entry.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ModuleDescriptor> {
        self.entries.iter()
    }

    pub fn of_kind(&self, kind: ModuleKind) -> impl Iterator<Item = &ModuleDescriptor> {
        self.entries.iter().filter(move |entry| entry.kind == kind)
    }

    /// Register every schema the registry implies: `[rteval]`, the two
    /// family listings and one section per module.
    pub fn configure(&self, store: &mut ConfigStore) {
        store.register_schema(RTEVAL_SECTION, &config::rteval_options());
        for kind in [ModuleKind::Load, ModuleKind::Measurement] {
            let listing: Vec<OptionSpec> = self
                .of_kind(kind)
                .map(|entry| {
                    if entry.enabled_by_default {
                        OptionSpec::string(&entry.name, MODULE_ENABLED)
                    } else {
                        OptionSpec::optional(&entry.name, config::OptionKind::Str)
                    }
                })
                .collect();
            store.register_schema(kind.section(), &listing);
        }
        for entry in &self.entries {
            store.register_schema(&entry.name, &entry.options);
        }
    }

    /// A store carrying every registered default.
    pub fn default_config(&self) -> ConfigStore {
        let mut store = ConfigStore::new();
        self.configure(&mut store);
        store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::testing::{registry, Journal, Script};

    #[test]
    fn test_builtin_registry_lists_both_families() {
        let registry = ModuleRegistry::builtin();
        let loads: Vec<&str> = registry.of_kind(ModuleKind::Load).map(|e| e.name.as_str()).collect();
        let probes: Vec<&str> = registry.of_kind(ModuleKind::Measurement).map(|e| e.name.as_str()).collect();
        assert_eq!(loads, vec!["stress", "hackbench"]);
        assert_eq!(probes, vec!["cyclic", "sysstat"]);
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let journal = Journal::default();
        let mut registry = registry(&[("a", ModuleKind::Load, Script::default())], &journal);
        let result = registry.register("a", ModuleKind::Load, "", Vec::new(), true, |_| {
            unreachable!("constructor of a rejected module")
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_configure_enables_defaults_and_rejects_unknown_modules() {
        let mut store = ModuleRegistry::builtin().default_config();
        assert_eq!(store.enabled_modules("loads"), vec!["stress", "hackbench"]);
        assert_eq!(store.enabled_modules("measurement"), vec!["cyclic", "sysstat"]);
        assert!(store.load_str("[loads]\nkcompile = \"module\"\n").is_err());
        assert!(store.load_str("[loads]\ncyclic = \"module\"\n").is_err());
    }

    #[test]
    fn test_module_sections_are_registered() {
        let mut store = ModuleRegistry::builtin().default_config();
        assert!(store.has_section("cyclic"));
        assert_eq!(store.section("cyclic").get_int("interval").unwrap(), 1000);
        assert!(store.load_str("[cyclic]\nintervall = 5\n").is_err());
    }

    #[test]
    fn test_create_builds_named_module() {
        let registry = ModuleRegistry::builtin();
        let module = registry.get("sysstat").unwrap().create(LogHandle::silent());
        assert_eq!(module.name(), "sysstat");
        assert_eq!(module.kind(), ModuleKind::Measurement);
    }
}
