//! Objects created through factory records.
//!
//! Every object handed out by a factory is an [`Instance`]: the concrete
//! value, type-erased, plus a table of typed views keyed by [`FeatureId`].
//! The table is what lets a [`CapabilityHandle`](crate::CapabilityHandle)
//! turn an opaque [`ObjectRef`] into `&dyn Trait` without raw pointer
//! reinterpretation: a view is either present and typed, or absent.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::ptr::NonNull;

use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::capability::{Capability, FeatureId};

type ErasedValue = dyn Any + Send + Sync;

/// Projects the erased concrete value onto one capability.
trait View<C: ?Sized>: Send + Sync {
    fn project<'a>(&self, value: &'a ErasedValue) -> Option<&'a C>;
}

struct Projection<T, C: ?Sized> {
    project: fn(&T) -> &C,
}

impl<T, C> View<C> for Projection<T, C>
where
    T: Any + Send + Sync,
    C: ?Sized + 'static,
{
    fn project<'a>(&self, value: &'a ErasedValue) -> Option<&'a C> {
        value.downcast_ref::<T>().map(self.project)
    }
}

/// Capabilities a component answers, built by [`Component::capabilities`].
pub struct CapabilityTable<T> {
    views: HashMap<FeatureId, Box<ErasedValue>>,
    _component: PhantomData<fn() -> T>,
}

impl<T: Any + Send + Sync> CapabilityTable<T> {
    fn new() -> Self {
        Self {
            views: HashMap::new(),
            _component: PhantomData,
        }
    }

    /// Expose capability `C`, answered by projecting the component.
    ///
    /// ```rust,ignore
    /// table.expose::<dyn Greeter>(|hello| hello);
    /// ```
    pub fn expose<C>(&mut self, project: fn(&T) -> &C) -> &mut Self
    where
        C: ?Sized + Capability,
    {
        let view: Box<dyn View<C>> = Box::new(Projection { project });
        self.views.insert(C::feature_id(), Box::new(view));
        self
    }

    /// Whether a capability has been exposed.
    pub fn contains(&self, feature: FeatureId) -> bool {
        self.views.contains_key(&feature)
    }

    pub fn len(&self) -> usize {
        self.views.len()
    }

    pub fn is_empty(&self) -> bool {
        self.views.is_empty()
    }
}

/// A class that can be registered and instantiated by capability-id.
///
/// ```rust
/// use apf_core::{Capability, CapabilityTable, Component};
///
/// pub trait Greeter: Send + Sync {
///     fn greet(&self) -> String;
/// }
///
/// impl Capability for dyn Greeter {
///     const NAME: &'static str = "Greeter";
/// }
///
/// struct Hello;
///
/// impl Greeter for Hello {
///     fn greet(&self) -> String {
///         "hello".to_string()
///     }
/// }
///
/// impl Component for Hello {
///     fn create() -> Self {
///         Hello
///     }
///
///     fn capabilities(table: &mut CapabilityTable<Self>) {
///         table.expose::<dyn Greeter>(|h| h);
///     }
/// }
/// ```
pub trait Component: Any + Send + Sync + Sized {
    /// Construct a fresh object.
    fn create() -> Self;

    /// Declare every capability the component answers.
    fn capabilities(table: &mut CapabilityTable<Self>);

    /// Whether the component answers `feature`.
    fn supports(feature: FeatureId) -> bool {
        let mut table = CapabilityTable::new();
        Self::capabilities(&mut table);
        table.contains(feature)
    }
}

/// A created object: the concrete value plus its capability views.
pub struct Instance {
    value: Box<ErasedValue>,
    views: HashMap<FeatureId, Box<ErasedValue>>,
    type_name: &'static str,
}

impl Instance {
    /// Wrap a component, collecting its capability table.
    pub fn new<T: Component>(value: T) -> Self {
        let mut table = CapabilityTable::<T>::new();
        T::capabilities(&mut table);
        Self {
            value: Box::new(value),
            views: table.views,
            type_name: std::any::type_name::<T>(),
        }
    }

    /// Typed view for capability `C`, if the object answers it.
    pub fn view<C: ?Sized + Capability>(&self) -> Option<&C> {
        let entry = self.views.get(&C::feature_id())?;
        let view = (**entry).downcast_ref::<Box<dyn View<C>>>()?;
        view.project(&*self.value)
    }

    /// Downcast to the concrete component type.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        (*self.value).downcast_ref::<T>()
    }

    /// Name of the concrete type, for diagnostics.
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instance")
            .field("type_name", &self.type_name)
            .field("views", &self.views.len())
            .finish()
    }
}

/// Opaque reference to a heap-allocated [`Instance`].
///
/// Identity is the address. The reference does not own the instance; the
/// factory record that created it decides how (and whether) it is destroyed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectRef(NonNull<Instance>);

// Instances only hold `Send + Sync` values.
unsafe impl Send for ObjectRef {}
unsafe impl Sync for ObjectRef {}

impl ObjectRef {
    /// Move an instance to the heap and return a reference to it.
    pub fn new(instance: Instance) -> Self {
        Self(NonNull::from(Box::leak(Box::new(instance))))
    }

    /// Address of the instance.
    pub fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }

    /// Borrow the instance.
    ///
    /// # Safety
    /// The instance must not have been destroyed, and must outlive `'a`.
    pub unsafe fn instance<'a>(self) -> &'a Instance {
        self.0.as_ref()
    }

    /// Reclaim ownership of the instance.
    ///
    /// # Safety
    /// Must be called at most once per instance, and only for instances
    /// created by [`ObjectRef::new`] that no one else will touch again.
    pub unsafe fn into_instance(self) -> Box<Instance> {
        Box::from_raw(self.0.as_ptr())
    }
}

/// Create function for a regular component: one fresh object per call.
pub fn create_component<T: Component>() -> Option<ObjectRef> {
    Some(ObjectRef::new(Instance::new(T::create())))
}

/// Destroy function for objects created by [`create_component`].
///
/// # Safety
/// `object` must come from [`create_component`] and must not be used again.
pub unsafe fn destroy_component(object: ObjectRef) {
    drop(object.into_instance());
}

/// One instance per component type, never destroyed.
static SINGLETONS: Lazy<Mutex<HashMap<TypeId, ObjectRef>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Create function for a singleton component: every call returns the same
/// object, constructed on first use.
pub fn create_singleton<T: Component>() -> Option<ObjectRef> {
    let mut singletons = SINGLETONS.lock();
    let object = singletons
        .entry(TypeId::of::<T>())
        .or_insert_with(|| ObjectRef::new(Instance::new(T::create())));
    Some(*object)
}

#[cfg(test)]
mod tests {
    use super::*;

    trait Named: Send + Sync {
        fn name(&self) -> &str;
    }

    impl Capability for dyn Named {
        const NAME: &'static str = "tests.Named";
    }

    trait Counted: Send + Sync {
        fn count(&self) -> usize;
    }

    impl Capability for dyn Counted {
        const NAME: &'static str = "tests.Counted";
    }

    struct Widget {
        name: String,
    }

    impl Named for Widget {
        fn name(&self) -> &str {
            &self.name
        }
    }

    impl Component for Widget {
        fn create() -> Self {
            Widget {
                name: "widget".to_string(),
            }
        }

        fn capabilities(table: &mut CapabilityTable<Self>) {
            table.expose::<dyn Named>(|w| w);
        }
    }

    struct Registry;

    impl Component for Registry {
        fn create() -> Self {
            Registry
        }

        fn capabilities(_table: &mut CapabilityTable<Self>) {}
    }

    #[test]
    fn test_instance_views() {
        let instance = Instance::new(Widget::create());
        assert_eq!(instance.view::<dyn Named>().unwrap().name(), "widget");
        assert!(instance.view::<dyn Counted>().is_none());
        assert!(instance.downcast_ref::<Widget>().is_some());
        assert!(instance.type_name().ends_with("Widget"));
    }

    #[test]
    fn test_component_supports() {
        assert!(Widget::supports(<dyn Named as Capability>::feature_id()));
        assert!(!Widget::supports(<dyn Counted as Capability>::feature_id()));
        assert!(!Registry::supports(<dyn Named as Capability>::feature_id()));
    }

    #[test]
    fn test_create_and_destroy_component() {
        let object = create_component::<Widget>().unwrap();
        let name = unsafe { object.instance() }
            .view::<dyn Named>()
            .map(|n| n.name().to_string());
        assert_eq!(name.as_deref(), Some("widget"));
        unsafe { destroy_component(object) };
    }

    #[test]
    fn test_singleton_is_shared() {
        let a = create_singleton::<Registry>().unwrap();
        let b = create_singleton::<Registry>().unwrap();
        assert_eq!(a, b);

        let c = create_component::<Registry>().unwrap();
        assert_ne!(a, c);
        unsafe { destroy_component(c) };
    }
}
