//! In-process component runtime.
//!
//! Independently compiled units expose capabilities (traits) under a string
//! capability-id. Modules are loaded at run time, their objects are shared
//! through reference-counted [`CapabilityHandle`]s, and [`Signal`]s carry
//! events between otherwise unrelated objects.

pub mod capability;
pub mod config;
pub mod error;
pub mod handle;
pub mod loader;
pub mod logging;
pub mod module;
pub mod object;
pub mod record;
pub mod registry;
pub mod runtime;
pub mod signal;

pub use capability::{Capability, FeatureId};
pub use error::{Error, Result};
pub use handle::{CapabilityHandle, ObjectCreator, ObjectFactory};
pub use loader::{ModuleSummary, PluginLoader};
pub use module::{ModuleDefinition, Version};
pub use object::{CapabilityTable, Component, Instance, ObjectRef};
pub use record::{CapabilityId, FactoryRecord};
pub use registry::ClassRegistry;
pub use runtime::Runtime;
pub use signal::{Signal, SlotToken};

/// Re-exports commonly used types.
pub mod prelude {
    // Configuration
    pub use crate::config::{env_vars, RuntimeConfig};

    // Error handling
    pub use crate::error::{Error, Result};

    // Classes and objects
    pub use crate::capability::Capability;
    pub use crate::handle::{CapabilityHandle, ObjectFactory};
    pub use crate::object::{CapabilityTable, Component};
    pub use crate::record::FactoryRecord;

    // Modules
    pub use crate::module::{ModuleDefinition, Version};
    pub use crate::runtime::Runtime;

    // Events
    pub use crate::signal::{Signal, SlotToken};
}
