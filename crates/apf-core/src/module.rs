//! Module side of the plugin ABI.
//!
//! A module is a `cdylib` that declares a [`ModuleDefinition`] and exports it
//! with [`export_module!`](crate::export_module):
//!
//! ```rust,ignore
//! use apf_core::module::{ModuleDefinition, Version};
//! use apf_core::FactoryRecord;
//! use once_cell::sync::Lazy;
//!
//! static MODULE: Lazy<ModuleDefinition> = Lazy::new(|| {
//!     ModuleDefinition::builder(Version::new(1, 0))
//!         .supports(Version::new(1, 0), Version::MAX)
//!         .class(FactoryRecord::component::<Hello>("Hello"))
//!         .build()
//! });
//!
//! apf_core::export_module!(MODULE);
//! ```
//!
//! Both entry points use the Rust ABI. Host and module must be built with the
//! same toolchain and the same `apf-core`.

use std::fmt;
use std::str::FromStr;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::handle::{ObjectCreator, ObjectFactory};
use crate::object::ObjectRef;
use crate::record::FactoryRecord;

/// Exported name of the required module-info entry point.
pub const MODULE_INFO_SYMBOL: &[u8] = b"apf_get_module_info\0";

/// Exported name of the optional object-creator setter.
pub const SET_OBJECT_CREATOR_SYMBOL: &[u8] = b"apf_set_object_creator\0";

/// `apf_get_module_info(host_version, &mut records) -> module_version`.
///
/// Returns 0 when the module does not support `host_version`. The record
/// table is written either way.
pub type ModuleInfoFn = fn(u32, &mut Option<&'static [FactoryRecord]>) -> u32;

/// `apf_set_object_creator(creator)`.
pub type SetObjectCreatorFn = fn(ObjectCreator);

/// Packed `(major << 16) | minor` version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Version(u32);

impl Version {
    /// Highest version a module can declare support for.
    pub const MAX: Version = Version(0x0FFF_FFFF);

    pub const MIN: Version = Version(0);

    pub const fn new(major: u16, minor: u16) -> Self {
        Self(((major as u32) << 16) | minor as u32)
    }

    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    pub const fn major(self) -> u16 {
        (self.0 >> 16) as u16
    }

    pub const fn minor(self) -> u16 {
        (self.0 & 0xFFFF) as u16
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major(), self.minor())
    }
}

/// Parses `"major.minor"` (or a bare `"major"`).
impl FromStr for Version {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let (major, minor) = s.split_once('.').unwrap_or((s, "0"));
        let parse = |part: &str| {
            part.trim()
                .parse::<u16>()
                .map_err(|e| Error::Config(format!("invalid version '{}': {}", s, e)))
        };
        Ok(Self::new(parse(major)?, parse(minor)?))
    }
}

/// Everything a module exports: its version, the host versions it supports,
/// its factory records and the host link set by the loader.
pub struct ModuleDefinition {
    version: Version,
    min_support: Version,
    max_support: Version,
    records: Vec<FactoryRecord>,
    host: RwLock<Option<ObjectCreator>>,
}

impl ModuleDefinition {
    pub fn builder(version: Version) -> ModuleDefinitionBuilder {
        ModuleDefinitionBuilder {
            version,
            min_support: Version::MIN,
            max_support: Version::MAX,
            records: Vec::new(),
        }
    }

    pub fn version(&self) -> Version {
        self.version
    }

    /// Inclusive range of host versions this module accepts.
    pub fn supported(&self) -> (Version, Version) {
        (self.min_support, self.max_support)
    }

    pub fn is_compatible(&self, host: Version) -> bool {
        self.min_support <= host && host <= self.max_support
    }

    pub fn records(&self) -> &[FactoryRecord] {
        &self.records
    }

    /// Body of the exported module-info entry point.
    ///
    /// Writes the record table and returns the module version, or 0 when
    /// `host_version` is outside the supported range.
    pub fn module_info(
        &'static self,
        host_version: u32,
        records: &mut Option<&'static [FactoryRecord]>,
    ) -> u32 {
        *records = Some(&self.records);
        if self.is_compatible(Version::from_raw(host_version)) {
            self.version.raw()
        } else {
            0
        }
    }

    /// Body of the exported setter. The last creator set wins.
    pub fn set_object_creator(&self, creator: ObjectCreator) {
        *self.host.write() = Some(creator);
    }

    /// Whether the host has handed over its object creator.
    pub fn has_host(&self) -> bool {
        self.host.read().is_some()
    }
}

/// Module code creates host-registered classes through the host link.
// SAFETY: forwards to the host's `ObjectCreator`.
unsafe impl ObjectFactory for ModuleDefinition {
    fn create_object(&self, capability_id: &str) -> Result<(ObjectRef, FactoryRecord)> {
        let host = self.host.read().clone();
        match host {
            Some(creator) => creator.create(capability_id),
            None => Err(Error::NotFound(format!(
                "{} (no host object creator set)",
                capability_id
            ))),
        }
    }
}

impl fmt::Debug for ModuleDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleDefinition")
            .field("version", &self.version)
            .field("min_support", &self.min_support)
            .field("max_support", &self.max_support)
            .field("records", &self.records)
            .field("has_host", &self.has_host())
            .finish()
    }
}

pub struct ModuleDefinitionBuilder {
    version: Version,
    min_support: Version,
    max_support: Version,
    records: Vec<FactoryRecord>,
}

impl ModuleDefinitionBuilder {
    /// Inclusive range of supported host versions. Defaults to everything.
    pub fn supports(mut self, min: Version, max: Version) -> Self {
        self.min_support = min;
        self.max_support = max;
        self
    }

    pub fn class(mut self, record: FactoryRecord) -> Self {
        self.records.push(record);
        self
    }

    pub fn classes(mut self, records: impl IntoIterator<Item = FactoryRecord>) -> Self {
        self.records.extend(records);
        self
    }

    pub fn build(self) -> ModuleDefinition {
        ModuleDefinition {
            version: self.version,
            min_support: self.min_support,
            max_support: self.max_support,
            records: self.records,
            host: RwLock::new(None),
        }
    }
}

/// Export a `static` [`ModuleDefinition`] as a loadable module.
///
/// Emits the `apf_get_module_info` and `apf_set_object_creator` entry
/// points. Use once per `cdylib`.
#[macro_export]
macro_rules! export_module {
    ($definition:path) => {
        #[no_mangle]
        pub fn apf_get_module_info(
            host_version: u32,
            records: &mut ::core::option::Option<&'static [$crate::FactoryRecord]>,
        ) -> u32 {
            $crate::module::ModuleDefinition::module_info(&$definition, host_version, records)
        }

        #[no_mangle]
        pub fn apf_set_object_creator(creator: $crate::ObjectCreator) {
            $crate::module::ModuleDefinition::set_object_creator(&$definition, creator)
        }

        const _: $crate::module::ModuleInfoFn = apf_get_module_info;
        const _: $crate::module::SetObjectCreatorFn = apf_set_object_creator;
    };
}
