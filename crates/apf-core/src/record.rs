//! Factory records: the create/destroy/query triple for one capability-id.

use std::fmt;

use crate::capability::FeatureId;
use crate::object::{create_component, create_singleton, destroy_component, Component, ObjectRef};

/// Process-wide unique name of a registrable class.
pub type CapabilityId = String;

/// Construct an object; `None` when construction failed.
pub type CreateFn = fn() -> Option<ObjectRef>;

/// Destroy an object created by the paired [`CreateFn`].
pub type DestroyFn = unsafe fn(ObjectRef);

/// Report whether objects of the class answer a capability.
pub type SupportsFn = fn(FeatureId) -> bool;

/// Factory record for one capability-id.
///
/// Two records are equal when their capability-id and all three function
/// pointers match; the display name is not part of identity. Function
/// pointers point into the module that built the record and become invalid
/// when that module is unloaded.
#[derive(Clone)]
pub struct FactoryRecord {
    pub display_name: String,
    pub capability_id: CapabilityId,
    create_fn: CreateFn,
    destroy_fn: Option<DestroyFn>,
    supports_fn: SupportsFn,
}

impl FactoryRecord {
    /// Record from raw functions.
    ///
    /// # Safety
    /// When `destroy_fn` is present, every object returned by `create_fn`
    /// must be a fresh allocation that `destroy_fn` can reclaim exactly
    /// once. Objects shared between calls (singletons) need `None`.
    pub unsafe fn new(
        display_name: impl Into<String>,
        capability_id: impl Into<CapabilityId>,
        create_fn: CreateFn,
        destroy_fn: Option<DestroyFn>,
        supports_fn: SupportsFn,
    ) -> Self {
        Self {
            display_name: display_name.into(),
            capability_id: capability_id.into(),
            create_fn,
            destroy_fn,
            supports_fn,
        }
    }

    /// Record for a regular component: a fresh object per creation,
    /// destroyed when its last handle is released.
    pub fn component<T: Component>(capability_id: impl Into<CapabilityId>) -> Self {
        // SAFETY: create_component allocates a fresh instance per call.
        unsafe {
            Self::new(
                format!("Object<{}>", short_type_name::<T>()),
                capability_id,
                create_component::<T>,
                Some(destroy_component as DestroyFn),
                T::supports,
            )
        }
    }

    /// Record for a singleton component: every creation yields the same
    /// object, and releasing handles never destroys it.
    pub fn singleton<T: Component>(capability_id: impl Into<CapabilityId>) -> Self {
        // SAFETY: singletons are never destroyed.
        unsafe {
            Self::new(
                format!("SingleObject<{}>", short_type_name::<T>()),
                capability_id,
                create_singleton::<T>,
                None,
                T::supports,
            )
        }
    }

    /// Override the display name.
    pub fn with_display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = display_name.into();
        self
    }

    /// Identity comparison: capability-id and function pointers.
    pub fn identity_eq(&self, other: &FactoryRecord) -> bool {
        let destroy_eq = match (self.destroy_fn, other.destroy_fn) {
            (Some(a), Some(b)) => std::ptr::fn_addr_eq(a, b),
            (None, None) => true,
            _ => false,
        };
        self.capability_id == other.capability_id
            && std::ptr::fn_addr_eq(self.create_fn, other.create_fn)
            && destroy_eq
            && std::ptr::fn_addr_eq(self.supports_fn, other.supports_fn)
    }

    /// Whether releasing the last handle destroys the object. False for
    /// singletons.
    pub fn destroys_objects(&self) -> bool {
        self.destroy_fn.is_some()
    }

    /// Whether objects of this class answer `feature`.
    pub fn supports(&self, feature: FeatureId) -> bool {
        (self.supports_fn)(feature)
    }

    /// Invoke the create function.
    pub fn create(&self) -> Option<ObjectRef> {
        (self.create_fn)()
    }

    /// Invoke the destroy function, if the record has one.
    ///
    /// # Safety
    /// `object` must have been created by this record and must not be used
    /// afterwards. The module that owns the record must still be loaded.
    pub unsafe fn destroy(&self, object: ObjectRef) {
        if let Some(destroy) = self.destroy_fn {
            destroy(object);
        }
    }
}

impl PartialEq for FactoryRecord {
    fn eq(&self, other: &Self) -> bool {
        self.identity_eq(other)
    }
}

impl Eq for FactoryRecord {}

impl fmt::Debug for FactoryRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FactoryRecord")
            .field("display_name", &self.display_name)
            .field("capability_id", &self.capability_id)
            .field("destroy_fn", &self.destroy_fn.is_some())
            .finish_non_exhaustive()
    }
}

impl fmt::Display for FactoryRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.capability_id, self.display_name)
    }
}

fn short_type_name<T>() -> &'static str {
    let full = std::any::type_name::<T>();
    full.rsplit("::").next().unwrap_or(full)
}
