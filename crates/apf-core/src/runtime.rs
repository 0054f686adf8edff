//! The runtime: one class registry, the modules loaded into it and the
//! last-resort object creator.
//!
//! ```rust,ignore
//! let runtime = Runtime::new();
//! runtime.set_version(1, 0);
//! runtime.load("modules/libhello.so")?;
//!
//! let greeter = runtime.create::<dyn Greeter>("Hello");
//! ```
//!
//! Pass a `&Runtime` (or `Arc<Runtime>`) to the code that needs it, or use
//! [`Runtime::global`] for a single process-wide instance.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};

use crate::capability::Capability;
use crate::config::RuntimeConfig;
use crate::error::Result;
use crate::handle::{CapabilityHandle, ObjectCreator, ObjectFactory};
use crate::loader::{ModuleSummary, PluginLoader};
use crate::module::{ModuleDefinition, Version};
use crate::object::ObjectRef;
use crate::record::FactoryRecord;
use crate::registry::ClassRegistry;

static GLOBAL: Lazy<Runtime> = Lazy::new(Runtime::new);

type Fallback = Arc<RwLock<Option<ObjectCreator>>>;

pub struct Runtime {
    registry: Arc<ClassRegistry>,
    loader: Mutex<PluginLoader>,
    fallback: Fallback,
}

impl Runtime {
    /// Create a runtime that loads native libraries.
    pub fn new() -> Self {
        Self::with_loader(PluginLoader::new())
    }

    pub fn with_loader(loader: PluginLoader) -> Self {
        Self {
            registry: Arc::new(ClassRegistry::new()),
            loader: Mutex::new(loader),
            fallback: Arc::new(RwLock::new(None)),
        }
    }

    /// Create a native runtime from configuration.
    pub fn from_config(config: &RuntimeConfig) -> Self {
        let runtime = Self::new();
        runtime.configure(config);
        runtime
    }

    /// Apply host version, search paths and registration policy, then load
    /// discovered modules when `autoload` is set. Load failures are logged.
    pub fn configure(&self, config: &RuntimeConfig) {
        {
            let mut loader = self.loader.lock();
            let version = config.host_version.version();
            loader.set_version(version.major(), version.minor());
            loader.set_replace_existing(config.replace_existing);
            for path in &config.search_paths {
                loader.add_search_path(path);
            }
        }

        if config.autoload {
            for (path, result) in self.load_discovered() {
                if let Err(e) = result {
                    tracing::warn!("Failed to autoload module {}: {}", path.display(), e);
                }
            }
        }
    }

    /// The process-wide runtime, created on first use.
    pub fn global() -> &'static Runtime {
        &GLOBAL
    }

    pub fn registry(&self) -> &Arc<ClassRegistry> {
        &self.registry
    }

    pub fn set_version(&self, major: u16, minor: u16) {
        self.loader.lock().set_version(major, minor);
    }

    pub fn host_version(&self) -> Option<Version> {
        self.loader.lock().host_version()
    }

    pub fn add_search_path(&self, path: impl AsRef<Path>) {
        self.loader.lock().add_search_path(path);
    }

    /// Load a module and register its classes. Returns the module version.
    pub fn load(&self, path: impl AsRef<Path>) -> Result<Version> {
        let creator = self.object_creator_entry();
        self.loader.lock().load(path, &self.registry, &creator)
    }

    /// Unload a module. Every handle to its objects must be released first.
    pub fn unload(&self, path: impl AsRef<Path>) -> Result<()> {
        self.loader.lock().unload(path, &self.registry)
    }

    /// Unload every module, without waiting for live handles.
    pub fn unload_all(&self) -> usize {
        self.loader.lock().unload_all(&self.registry)
    }

    /// Load every module file in the search paths that is not loaded yet.
    pub fn load_discovered(&self) -> Vec<(PathBuf, Result<Version>)> {
        let creator = self.object_creator_entry();
        let mut loader = self.loader.lock();
        let pending: Vec<PathBuf> = loader
            .discover()
            .into_iter()
            .filter(|path| !loader.is_loaded(path))
            .collect();

        pending
            .into_iter()
            .map(|path| {
                let result = loader.load(&path, &self.registry, &creator);
                (path, result)
            })
            .collect()
    }

    /// Register the classes of a module linked into the host, without
    /// version negotiation. Returns how many were registered.
    pub fn load_internal_module(&self, module: &ModuleDefinition) -> usize {
        module.set_object_creator(self.object_creator_entry());
        let replace = self.loader.lock().replace_existing();
        let registered = self.registry.register_all(module.records(), replace);
        tracing::info!(
            "Loaded internal module version {} ({}/{} classes registered)",
            module.version(),
            registered,
            module.records().len()
        );
        registered
    }

    /// Set the creator consulted when the registry has no class for an id.
    ///
    /// It must not resolve back into this runtime's own entry point.
    pub fn set_object_creator(&self, creator: Option<ObjectCreator>) {
        *self.fallback.write() = creator;
    }

    /// Entry point handed to modules: the registry, then the fallback creator.
    pub fn object_creator_entry(&self) -> ObjectCreator {
        let registry = self.registry.clone();
        let fallback = self.fallback.clone();
        // SAFETY: resolves through the registry or another `ObjectCreator`.
        unsafe { ObjectCreator::new(move |id| resolve(&registry, &fallback, id)) }
    }

    /// Create an object and view it as `C`; empty on failure.
    pub fn create<C: ?Sized + Capability>(&self, capability_id: &str) -> CapabilityHandle<C> {
        CapabilityHandle::create(self, capability_id)
    }

    pub fn modules(&self) -> Vec<ModuleSummary> {
        self.loader.lock().modules()
    }

    pub fn is_loaded(&self, path: impl AsRef<Path>) -> bool {
        self.loader.lock().is_loaded(path)
    }
}

// SAFETY: resolves through the registry or another `ObjectCreator`.
unsafe impl ObjectFactory for Runtime {
    fn create_object(&self, capability_id: &str) -> Result<(ObjectRef, FactoryRecord)> {
        resolve(&self.registry, &self.fallback, capability_id)
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

/// Unloads every module still loaded.
impl Drop for Runtime {
    fn drop(&mut self) {
        let unloaded = self.loader.get_mut().unload_all(&self.registry);
        if unloaded > 0 {
            tracing::debug!("Runtime dropped, unloaded {} modules", unloaded);
        }
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("classes", &self.registry.len())
            .field("loader", &*self.loader.lock())
            .field("fallback", &self.fallback.read().is_some())
            .finish()
    }
}

fn resolve(
    registry: &ClassRegistry,
    fallback: &RwLock<Option<ObjectCreator>>,
    capability_id: &str,
) -> Result<(ObjectRef, FactoryRecord)> {
    match registry.create(capability_id) {
        Ok(created) => Ok(created),
        Err(err) => {
            let creator = fallback.read().clone();
            match creator {
                Some(creator) => creator.create(capability_id),
                None => Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use once_cell::sync::Lazy;

    use super::*;
    use crate::error::Error;
    use crate::loader::{EntryPoints, MemoryOpener};
    use crate::module::{ModuleInfoFn, SetObjectCreatorFn};
    use crate::object::{CapabilityTable, Component};

    trait Sensor: Send + Sync {
        fn read(&self) -> f64;
    }

    impl Capability for dyn Sensor {
        const NAME: &'static str = "runtime.tests.Sensor";
    }

    struct Thermometer;

    impl Sensor for Thermometer {
        fn read(&self) -> f64 {
            21.5
        }
    }

    impl Component for Thermometer {
        fn create() -> Self {
            Thermometer
        }

        fn capabilities(table: &mut CapabilityTable<Self>) {
            table.expose::<dyn Sensor>(|t| t);
        }
    }

    static SENSORS: Lazy<ModuleDefinition> = Lazy::new(|| {
        ModuleDefinition::builder(Version::new(1, 0))
            .class(FactoryRecord::component::<Thermometer>("thermometer"))
            .build()
    });

    fn sensors_info(host: u32, records: &mut Option<&'static [FactoryRecord]>) -> u32 {
        SENSORS.module_info(host, records)
    }

    fn sensors_set_creator(creator: ObjectCreator) {
        SENSORS.set_object_creator(creator)
    }

    #[test]
    fn test_internal_module() {
        let runtime = Runtime::new();
        let module = ModuleDefinition::builder(Version::new(1, 0))
            .class(FactoryRecord::component::<Thermometer>("internal.thermometer"))
            .build();
        assert_eq!(runtime.load_internal_module(&module), 1);
        assert!(module.has_host());

        let sensor = runtime.create::<dyn Sensor>("internal.thermometer");
        assert_eq!(sensor.read(), 21.5);

        // the module creates host classes through its host link
        let through_module = CapabilityHandle::<dyn Sensor>::create(&module, "internal.thermometer");
        assert!(through_module.is_valid());
    }

    #[test]
    fn test_load_through_memory_opener() {
        let opener = MemoryOpener::new();
        opener.insert(
            "sensors",
            EntryPoints {
                module_info: Some(sensors_info as ModuleInfoFn),
                set_object_creator: Some(sensors_set_creator as SetObjectCreatorFn),
            },
        );
        let runtime = Runtime::with_loader(PluginLoader::with_opener(opener));
        runtime.set_version(1, 0);

        assert_eq!(runtime.load("sensors").unwrap(), Version::new(1, 0));
        assert!(runtime.is_loaded("sensors"));
        assert!(SENSORS.has_host());
        assert_eq!(runtime.create::<dyn Sensor>("thermometer").read(), 21.5);

        runtime.unload("sensors").unwrap();
        assert!(runtime.create::<dyn Sensor>("thermometer").is_empty());
    }

    #[test]
    fn test_fallback_creator() {
        let runtime = Runtime::new();
        assert!(matches!(
            runtime.create_object("remote.thermometer"),
            Err(Error::NotFound(_))
        ));

        let other = Arc::new(ClassRegistry::new());
        other.register_default(FactoryRecord::component::<Thermometer>("remote.thermometer"));
        let source = other.clone();
        let creator = unsafe { ObjectCreator::new(move |id| source.create(id)) };
        runtime.set_object_creator(Some(creator));

        let sensor = runtime.create::<dyn Sensor>("remote.thermometer");
        assert_eq!(sensor.read(), 21.5);

        // modules see the fallback through the entry point too
        let entry = runtime.object_creator_entry();
        assert!(CapabilityHandle::<dyn Sensor>::create(&entry, "remote.thermometer").is_valid());

        runtime.set_object_creator(None);
        assert!(runtime.create::<dyn Sensor>("remote.thermometer").is_empty());
    }

    #[test]
    fn test_configure() {
        let dir = tempfile::tempdir().unwrap();
        let config = RuntimeConfig {
            host_version: Version::new(2, 5).into(),
            search_paths: vec![dir.path().to_path_buf()],
            autoload: true,
            replace_existing: false,
        };
        let runtime = Runtime::from_config(&config);
        assert_eq!(runtime.host_version(), Some(Version::new(2, 5)));
        assert!(runtime.modules().is_empty());

        runtime.registry().register_default(FactoryRecord::component::<Thermometer>("a"));
        let module = ModuleDefinition::builder(Version::new(1, 0))
            .class(FactoryRecord::component::<Thermometer>("a"))
            .build();
        // replace_existing = false keeps the first registration
        assert_eq!(runtime.load_internal_module(&module), 0);
    }

    #[test]
    fn test_global_is_shared() {
        assert!(std::ptr::eq(Runtime::global(), Runtime::global()));
    }
}
