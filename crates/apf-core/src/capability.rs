//! Capability naming.
//!
//! A capability is an interface an object can answer, normally a trait
//! object type such as `dyn Greeter`. Capabilities are identified at run time
//! by a [`FeatureId`] hashed from their name, so a host and a module compiled
//! separately agree on identity without sharing type information.

use std::fmt;

/// Identifier of a capability, derived from its name.
///
/// The hash is a plain polynomial (`h * 33 + byte`) with no collision
/// detection. Two distinct capability names that hash to the same value are
/// indistinguishable to [`FactoryRecord::supports`](crate::FactoryRecord::supports);
/// pick names that are unlikely to collide (e.g. namespaced).
///
/// Bytes are added as unsigned values. A hash that adds a signed C `char`
/// gives the same result for ASCII names only; names containing non-ASCII
/// characters produce different ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FeatureId(i64);

impl FeatureId {
    /// Hash a capability name.
    pub const fn of(name: &str) -> Self {
        let bytes = name.as_bytes();
        let mut value: i64 = 0;
        let mut i = 0;
        while i < bytes.len() {
            value = (value << 5).wrapping_add(value).wrapping_add(bytes[i] as i64);
            i += 1;
        }
        Self(value)
    }

    /// Raw hash value.
    pub const fn raw(self) -> i64 {
        self.0
    }
}

impl fmt::Display for FeatureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// An interface that objects created through the registry can expose.
///
/// Implement it on the trait object type:
///
/// ```rust
/// use apf_core::Capability;
///
/// pub trait Greeter: Send + Sync {
///     fn greet(&self) -> String;
/// }
///
/// impl Capability for dyn Greeter {
///     const NAME: &'static str = "Greeter";
/// }
/// ```
pub trait Capability: 'static {
    /// Stable, process-wide name of the capability.
    const NAME: &'static str;

    /// Feature id derived from [`Self::NAME`].
    fn feature_id() -> FeatureId {
        FeatureId::of(Self::NAME)
    }
}
