//! Plugin loader.
//!
//! Opens modules, negotiates the version with each one, registers the
//! records it exports and unregisters exactly those records again on unload.
//! Libraries are opened through a [`LibraryOpener`]; [`NativeOpener`] uses
//! the platform loader, [`MemoryOpener`] serves modules linked into the host.
//!
//! Unloading does not wait for live objects. Every handle to an object of a
//! module's classes must be released before the module is unloaded.

mod memory;
mod native;

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{Error, Result};
use crate::handle::ObjectCreator;
use crate::module::{ModuleInfoFn, SetObjectCreatorFn, Version};
use crate::record::{CapabilityId, FactoryRecord};
use crate::registry::ClassRegistry;

pub use memory::MemoryOpener;
pub use native::NativeOpener;

/// Entry points resolved from an opened library.
#[derive(Debug, Clone, Copy, Default)]
pub struct EntryPoints {
    /// Required.
    pub module_info: Option<ModuleInfoFn>,
    pub set_object_creator: Option<SetObjectCreatorFn>,
}

/// An opened library.
pub trait DynamicLibrary: Send {
    fn entry_points(&self) -> EntryPoints;

    /// Close the library. Function pointers obtained from it become invalid.
    fn close(self: Box<Self>) -> std::result::Result<(), String>;
}

/// Opens libraries by path.
pub trait LibraryOpener: Send + Sync {
    fn open(&self, path: &Path) -> std::result::Result<Box<dyn DynamicLibrary>, String>;
}

/// Check if a file is a module library based on extension.
pub fn is_module_file(path: &Path) -> bool {
    path.is_file()
        && path.extension().and_then(|e| e.to_str()) == Some(std::env::consts::DLL_EXTENSION)
}

/// A loaded module.
struct ModuleRecord {
    library: Box<dyn DynamicLibrary>,
    version: Version,
    records: Vec<FactoryRecord>,
    loaded_at: DateTime<Utc>,
}

/// Snapshot of a loaded module.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModuleSummary {
    pub path: PathBuf,
    pub version: Version,
    pub class_ids: Vec<CapabilityId>,
    pub loaded_at: DateTime<Utc>,
}

/// Tracks loaded modules by path.
pub struct PluginLoader {
    opener: Box<dyn LibraryOpener>,
    host_version: Option<Version>,
    modules: HashMap<PathBuf, ModuleRecord>,
    search_paths: Vec<PathBuf>,
    replace_existing: bool,
}

impl PluginLoader {
    /// Create a loader backed by the platform library loader.
    pub fn new() -> Self {
        Self::with_opener(NativeOpener)
    }

    /// Create a loader with a custom opener.
    pub fn with_opener(opener: impl LibraryOpener + 'static) -> Self {
        Self {
            opener: Box::new(opener),
            host_version: None,
            modules: HashMap::new(),
            search_paths: Vec::new(),
            replace_existing: true,
        }
    }

    /// Set the host version offered to modules. Must precede [`load`](Self::load).
    pub fn set_version(&mut self, major: u16, minor: u16) {
        self.host_version = Some(Version::new(major, minor));
    }

    pub fn host_version(&self) -> Option<Version> {
        self.host_version
    }

    /// Whether a module's records replace classes already registered under
    /// the same id. Defaults to `true`.
    pub fn set_replace_existing(&mut self, replace: bool) {
        self.replace_existing = replace;
    }

    pub fn replace_existing(&self) -> bool {
        self.replace_existing
    }

    /// Add a search path for modules.
    pub fn add_search_path(&mut self, path: impl AsRef<Path>) -> &mut Self {
        let path = path.as_ref().to_path_buf();
        if !self.search_paths.contains(&path) {
            self.search_paths.push(path);
        }
        self
    }

    /// Get all search paths.
    pub fn search_paths(&self) -> &[PathBuf] {
        &self.search_paths
    }

    /// Module files found in the search paths, sorted per directory.
    ///
    /// Missing or unreadable directories are skipped.
    pub fn discover(&self) -> Vec<PathBuf> {
        let mut discovered = Vec::new();

        for search_path in &self.search_paths {
            let entries = match std::fs::read_dir(search_path) {
                Ok(entries) => entries,
                Err(e) => {
                    tracing::debug!("Skip search path {:?}: {}", search_path, e);
                    continue;
                }
            };

            let mut found: Vec<PathBuf> = entries
                .flatten()
                .map(|entry| entry.path())
                .filter(|path| is_module_file(path))
                .collect();
            found.sort();

            for path in found {
                tracing::info!("Discovered module: {}", path.display());
                discovered.push(path);
            }
        }

        discovered
    }

    /// Load the module at `path` and register its classes.
    ///
    /// `creator` is handed to the module, when it accepts one, as its way to
    /// create classes it does not define itself. Returns the module version.
    pub fn load(
        &mut self,
        path: impl AsRef<Path>,
        registry: &ClassRegistry,
        creator: &ObjectCreator,
    ) -> Result<Version> {
        let path = path.as_ref();
        let host = self.host_version.ok_or(Error::VersionNotSet)?;

        if self.modules.contains_key(path) {
            return Err(Error::AlreadyLoaded(path.to_path_buf()));
        }

        let library = self.opener.open(path).map_err(|reason| Error::OpenFailure {
            path: path.to_path_buf(),
            reason,
        })?;

        let entry_points = library.entry_points();
        let Some(module_info) = entry_points.module_info else {
            close_library(path, library);
            return Err(Error::OpenFailure {
                path: path.to_path_buf(),
                reason: "missing symbol apf_get_module_info".to_string(),
            });
        };

        let mut table = None;
        let version = module_info(host.raw(), &mut table);
        if version == 0 {
            close_library(path, library);
            return Err(Error::Incompatible {
                path: path.to_path_buf(),
                host,
            });
        }
        let Some(table) = table else {
            close_library(path, library);
            return Err(Error::OpenFailure {
                path: path.to_path_buf(),
                reason: "module returned no class table".to_string(),
            });
        };
        let records = table.to_vec();

        if let Some(set_object_creator) = entry_points.set_object_creator {
            set_object_creator(creator.clone());
        }

        let registered = registry.register_all(&records, self.replace_existing);
        let version = Version::from_raw(version);
        tracing::info!(
            "Loaded module {} version {} ({}/{} classes registered)",
            path.display(),
            version,
            registered,
            records.len()
        );

        self.modules.insert(
            path.to_path_buf(),
            ModuleRecord {
                library,
                version,
                records,
                loaded_at: Utc::now(),
            },
        );
        Ok(version)
    }

    /// Unregister the module's classes and close it.
    ///
    /// Only records still identical to what the module exported are removed;
    /// a class another module has since replaced stays registered.
    pub fn unload(&mut self, path: impl AsRef<Path>, registry: &ClassRegistry) -> Result<()> {
        let path = path.as_ref();
        let module = self
            .modules
            .remove(path)
            .ok_or_else(|| Error::NotLoaded(path.to_path_buf()))?;
        Self::release(path, module, registry);
        Ok(())
    }

    /// Unload every module. Returns how many were unloaded.
    pub fn unload_all(&mut self, registry: &ClassRegistry) -> usize {
        let modules: Vec<_> = self.modules.drain().collect();
        let count = modules.len();
        for (path, module) in modules {
            Self::release(&path, module, registry);
        }
        count
    }

    fn release(path: &Path, module: ModuleRecord, registry: &ClassRegistry) {
        let removed = module
            .records
            .iter()
            .filter(|record| registry.unregister(record))
            .count();
        close_library(path, module.library);
        tracing::info!(
            "Unloaded module {} ({}/{} classes unregistered)",
            path.display(),
            removed,
            module.records.len()
        );
    }

    pub fn is_loaded(&self, path: impl AsRef<Path>) -> bool {
        self.modules.contains_key(path.as_ref())
    }

    /// Loaded modules, sorted by path.
    pub fn modules(&self) -> Vec<ModuleSummary> {
        let mut summaries: Vec<_> = self
            .modules
            .iter()
            .map(|(path, module)| ModuleSummary {
                path: path.clone(),
                version: module.version,
                class_ids: module
                    .records
                    .iter()
                    .map(|r| r.capability_id.clone())
                    .collect(),
                loaded_at: module.loaded_at,
            })
            .collect();
        summaries.sort_by(|a, b| a.path.cmp(&b.path));
        summaries
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}

impl Default for PluginLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for PluginLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginLoader")
            .field("host_version", &self.host_version)
            .field("modules", &self.modules.keys().collect::<Vec<_>>())
            .field("search_paths", &self.search_paths)
            .field("replace_existing", &self.replace_existing)
            .finish_non_exhaustive()
    }
}

fn close_library(path: &Path, library: Box<dyn DynamicLibrary>) {
    if let Err(e) = library.close() {
        tracing::warn!("Failed to close module {}: {}", path.display(), e);
    }
}
