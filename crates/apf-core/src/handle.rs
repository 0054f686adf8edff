//! Reference-counted capability handles.
//!
//! A [`CapabilityHandle<C>`] holds one dynamically created object viewed as
//! capability `C` (normally `dyn Trait`). Handles obtained from each other by
//! [`query`](CapabilityHandle::query) share a single atomic reference count;
//! the object is destroyed through its factory record exactly once, when the
//! last handle sharing the count is released.
//!
//! ```rust,ignore
//! let greeter = CapabilityHandle::<dyn Greeter>::create(&runtime, "Hello");
//! if let Some(g) = greeter.get() {
//!     println!("{}", g.greet());
//! }
//! let named = greeter.query::<dyn Named>()?;
//! ```

use std::fmt;
use std::ops::Deref;
use std::ptr::NonNull;
use std::sync::atomic::{self, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::capability::Capability;
use crate::error::{Error, Result};
use crate::object::ObjectRef;
use crate::record::FactoryRecord;
use crate::registry::ClassRegistry;

/// Same limit as `Arc`: past this the count could wrap.
const MAX_REFCOUNT: usize = isize::MAX as usize;

/// Something that can instantiate a class by capability-id.
///
/// # Safety
/// Every object returned by `create_object` must be owned by the caller:
/// either a fresh allocation of the returned record, or an object the record
/// never destroys (a singleton). Handing out an object some handle already
/// owns would destroy it twice.
pub unsafe trait ObjectFactory {
    /// Create an object, returning it with the record needed to destroy it.
    fn create_object(&self, capability_id: &str) -> Result<(ObjectRef, FactoryRecord)>;
}

// SAFETY: registry records are built under the `FactoryRecord::new` contract.
unsafe impl ObjectFactory for ClassRegistry {
    fn create_object(&self, capability_id: &str) -> Result<(ObjectRef, FactoryRecord)> {
        self.create(capability_id)
    }
}

/// Host entry point for object creation, handed to loaded modules.
#[derive(Clone)]
pub struct ObjectCreator(
    Arc<dyn Fn(&str) -> Result<(ObjectRef, FactoryRecord)> + Send + Sync>,
);

impl ObjectCreator {
    /// Wrap a creation closure.
    ///
    /// # Safety
    /// `create` must uphold the [`ObjectFactory`] contract.
    pub unsafe fn new<F>(create: F) -> Self
    where
        F: Fn(&str) -> Result<(ObjectRef, FactoryRecord)> + Send + Sync + 'static,
    {
        Self(Arc::new(create))
    }

    pub fn create(&self, capability_id: &str) -> Result<(ObjectRef, FactoryRecord)> {
        (self.0)(capability_id)
    }
}

// SAFETY: guaranteed by `ObjectCreator::new`.
unsafe impl ObjectFactory for ObjectCreator {
    fn create_object(&self, capability_id: &str) -> Result<(ObjectRef, FactoryRecord)> {
        self.create(capability_id)
    }
}

impl fmt::Debug for ObjectCreator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ObjectCreator").finish()
    }
}

struct RefCount {
    count: AtomicUsize,
}

/// Everything a non-empty handle holds. Either all of it is present or the
/// handle is empty.
struct Shared<C: ?Sized> {
    view: NonNull<C>,
    object: ObjectRef,
    count: NonNull<RefCount>,
    record: FactoryRecord,
}

impl<C: ?Sized> Shared<C> {
    fn refcount(&self) -> &AtomicUsize {
        // SAFETY: the cell outlives every handle that shares it.
        unsafe { &self.count.as_ref().count }
    }

    fn retain(&self) {
        let old = self.refcount().fetch_add(1, Ordering::Relaxed);
        if old > MAX_REFCOUNT {
            std::process::abort();
        }
    }
}

/// Reference-counted handle to an object, viewed as capability `C`.
pub struct CapabilityHandle<C: ?Sized + Capability> {
    shared: Option<Shared<C>>,
}

// The object itself is `Send + Sync`; sharing the view needs `C: Sync`.
unsafe impl<C: ?Sized + Capability + Sync> Send for CapabilityHandle<C> {}
unsafe impl<C: ?Sized + Capability + Sync> Sync for CapabilityHandle<C> {}

impl<C: ?Sized + Capability> CapabilityHandle<C> {
    /// The empty handle.
    pub fn empty() -> Self {
        Self { shared: None }
    }

    /// Create an object by capability-id and view it as `C`.
    ///
    /// Returns the empty handle when the id cannot be resolved or the object
    /// does not answer `C`; use [`try_create`](Self::try_create) for the
    /// reason.
    pub fn create<F>(factory: &F, capability_id: &str) -> Self
    where
        F: ObjectFactory + ?Sized,
    {
        match Self::try_create(factory, capability_id) {
            Ok(handle) => handle,
            Err(err) => {
                tracing::debug!("Instance {} from '{}' failed: {}", C::NAME, capability_id, err);
                Self::empty()
            }
        }
    }

    /// Create an object by capability-id and view it as `C`.
    pub fn try_create<F>(factory: &F, capability_id: &str) -> Result<Self>
    where
        F: ObjectFactory + ?Sized,
    {
        let (object, record) = factory.create_object(capability_id)?;
        // SAFETY: `ObjectFactory` hands over ownership of the object.
        unsafe { Self::adopt(object, record) }
    }

    /// Take ownership of a freshly created object with a new count of one.
    ///
    /// An object that does not answer `C` is destroyed right away.
    ///
    /// # Safety
    /// `object` must have been created by `record` and must not be owned by
    /// any other handle. Passing the object of an existing handle (for
    /// example from [`object`](Self::object)) destroys it twice.
    pub unsafe fn adopt(object: ObjectRef, record: FactoryRecord) -> Result<Self> {
        let view = if record.supports(C::feature_id()) {
            // SAFETY: the caller passed a live object nobody else holds.
            unsafe { object.instance() }.view::<C>().map(NonNull::from)
        } else {
            None
        };

        let Some(view) = view else {
            let err = Error::NotFound(format!(
                "'{}' does not answer {}",
                record.capability_id,
                C::NAME
            ));
            // SAFETY: no handle references the object yet.
            unsafe { record.destroy(object) };
            return Err(err);
        };

        let count = NonNull::from(Box::leak(Box::new(RefCount {
            count: AtomicUsize::new(1),
        })));
        Ok(Self {
            shared: Some(Shared {
                view,
                object,
                count,
                record,
            }),
        })
    }

    /// View the same object as capability `D`, sharing this handle's count.
    pub fn query<D: ?Sized + Capability>(&self) -> Result<CapabilityHandle<D>> {
        let shared = self.shared.as_ref().ok_or(Error::Empty)?;
        let unsupported = || {
            Error::NotFound(format!(
                "'{}' does not answer {}",
                shared.record.capability_id,
                D::NAME
            ))
        };
        if !shared.record.supports(D::feature_id()) {
            return Err(unsupported());
        }
        // SAFETY: this handle keeps the object alive.
        let view = unsafe { shared.object.instance() }
            .view::<D>()
            .map(NonNull::from)
            .ok_or_else(unsupported)?;

        shared.retain();
        Ok(CapabilityHandle {
            shared: Some(Shared {
                view,
                object: shared.object,
                count: shared.count,
                record: shared.record.clone(),
            }),
        })
    }

    /// View `source`'s object as `C`, or the empty handle when it does not
    /// answer `C`.
    pub fn cast_from<S: ?Sized + Capability>(source: &CapabilityHandle<S>) -> Self {
        source.query::<C>().unwrap_or_default()
    }

    /// Whether the handle holds an object.
    pub fn is_valid(&self) -> bool {
        self.shared.is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.is_none()
    }

    /// Borrow the capability, if the handle is non-empty.
    pub fn get(&self) -> Option<&C> {
        // SAFETY: the view points into the object, alive while we hold a count.
        self.shared.as_ref().map(|s| unsafe { s.view.as_ref() })
    }

    /// The underlying object.
    pub fn object(&self) -> Option<ObjectRef> {
        self.shared.as_ref().map(|s| s.object)
    }

    /// The factory record that created the object.
    pub fn record(&self) -> Option<&FactoryRecord> {
        self.shared.as_ref().map(|s| &s.record)
    }

    /// Number of handles sharing this handle's count (0 when empty).
    pub fn use_count(&self) -> usize {
        self.shared
            .as_ref()
            .map_or(0, |s| s.refcount().load(Ordering::Acquire))
    }

    /// Whether both handles hold the same object, regardless of capability.
    pub fn same_object<D: ?Sized + Capability>(&self, other: &CapabilityHandle<D>) -> bool {
        self.object() == other.object()
    }

    /// Drop this handle's reference.
    ///
    /// Idempotent. When the shared count reaches zero the object is destroyed
    /// through its record and the count is freed. The handle is empty
    /// afterwards in every case.
    pub fn release(&mut self) {
        let Some(shared) = self.shared.take() else {
            return;
        };
        if shared.refcount().fetch_sub(1, Ordering::Release) != 1 {
            return;
        }
        atomic::fence(Ordering::Acquire);

        tracing::trace!("Destroy object [{}]", shared.record);
        // SAFETY: this was the last handle; nothing references the object or
        // the count any more.
        unsafe {
            shared.record.destroy(shared.object);
            drop(Box::from_raw(shared.count.as_ptr()));
        }
    }
}

impl<C: ?Sized + Capability> Default for CapabilityHandle<C> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<C: ?Sized + Capability> Clone for CapabilityHandle<C> {
    fn clone(&self) -> Self {
        let shared = self.shared.as_ref().map(|shared| {
            shared.retain();
            Shared {
                view: shared.view,
                object: shared.object,
                count: shared.count,
                record: shared.record.clone(),
            }
        });
        Self { shared }
    }
}

impl<C: ?Sized + Capability> Drop for CapabilityHandle<C> {
    fn drop(&mut self) {
        self.release();
    }
}

/// Member access. Panics on an empty handle; check with
/// [`is_valid`](CapabilityHandle::is_valid) or use
/// [`get`](CapabilityHandle::get).
impl<C: ?Sized + Capability> Deref for CapabilityHandle<C> {
    type Target = C;

    fn deref(&self) -> &C {
        match self.get() {
            Some(view) => view,
            None => panic!("dereferenced an empty CapabilityHandle<{}>", C::NAME),
        }
    }
}

impl<C, D> PartialEq<CapabilityHandle<D>> for CapabilityHandle<C>
where
    C: ?Sized + Capability,
    D: ?Sized + Capability,
{
    fn eq(&self, other: &CapabilityHandle<D>) -> bool {
        self.same_object(other)
    }
}

impl<C: ?Sized + Capability> Eq for CapabilityHandle<C> {}

impl<C: ?Sized + Capability> fmt::Debug for CapabilityHandle<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.shared {
            Some(shared) => f
                .debug_struct("CapabilityHandle")
                .field("capability", &C::NAME)
                .field("class", &shared.record.capability_id)
                .field("object", &format!("{:#x}", shared.object.addr()))
                .field("use_count", &self.use_count())
                .finish(),
            None => f
                .debug_struct("CapabilityHandle")
                .field("capability", &C::NAME)
                .field("empty", &true)
                .finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::object::{CapabilityTable, Component};

    trait Speaker: Send + Sync {
        fn speak(&self) -> String;
    }

    impl Capability for dyn Speaker {
        const NAME: &'static str = "handle.tests.Speaker";
    }

    trait Counter: Send + Sync {
        fn bump(&self) -> usize;
    }

    impl Capability for dyn Counter {
        const NAME: &'static str = "handle.tests.Counter";
    }

    trait Unrelated: Send + Sync {}

    impl Capability for dyn Unrelated {
        const NAME: &'static str = "handle.tests.Unrelated";
    }

    /// Declares a component answering Speaker and Counter whose drops are
    /// counted in its own static, so parallel tests do not interfere.
    macro_rules! tracked_component {
        ($name:ident, $drops:ident) => {
            #[allow(dead_code)]
            static $drops: AtomicUsize = AtomicUsize::new(0);

            struct $name {
                hits: AtomicUsize,
            }

            impl Drop for $name {
                fn drop(&mut self) {
                    $drops.fetch_add(1, Ordering::SeqCst);
                }
            }

            impl Speaker for $name {
                fn speak(&self) -> String {
                    stringify!($name).to_string()
                }
            }

            impl Counter for $name {
                fn bump(&self) -> usize {
                    self.hits.fetch_add(1, Ordering::SeqCst) + 1
                }
            }

            impl Component for $name {
                fn create() -> Self {
                    $name {
                        hits: AtomicUsize::new(0),
                    }
                }

                fn capabilities(table: &mut CapabilityTable<Self>) {
                    table
                        .expose::<dyn Speaker>(|c| c)
                        .expose::<dyn Counter>(|c| c);
                }
            }
        };
    }

    fn registry_with<T: Component>(id: &str) -> ClassRegistry {
        let registry = ClassRegistry::new();
        registry.register_default(FactoryRecord::component::<T>(id));
        registry
    }

    #[test]
    fn test_create_by_id() {
        tracked_component!(Parrot, PARROT_DROPS);
        let registry = registry_with::<Parrot>("parrot");

        let speaker = CapabilityHandle::<dyn Speaker>::create(&registry, "parrot");
        assert!(speaker.is_valid());
        assert_eq!(speaker.speak(), "Parrot");
        assert_eq!(speaker.use_count(), 1);
        assert_eq!(speaker.record().map(|r| r.capability_id.as_str()), Some("parrot"));

        drop(speaker);
        assert_eq!(PARROT_DROPS.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_create_unknown_is_empty() {
        let registry = ClassRegistry::new();
        let handle = CapabilityHandle::<dyn Speaker>::create(&registry, "nobody");
        assert!(handle.is_empty());
        assert!(handle.get().is_none());
        assert_eq!(handle.use_count(), 0);
        assert!(matches!(
            CapabilityHandle::<dyn Speaker>::try_create(&registry, "nobody"),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_create_unsupported_capability_destroys_object() {
        tracked_component!(Mime, MIME_DROPS);
        let registry = registry_with::<Mime>("mime");

        let handle = CapabilityHandle::<dyn Unrelated>::create(&registry, "mime");
        assert!(handle.is_empty());
        assert_eq!(MIME_DROPS.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cast_shares_count() {
        tracked_component!(Robin, ROBIN_DROPS);
        let registry = registry_with::<Robin>("robin");

        let speaker = CapabilityHandle::<dyn Speaker>::create(&registry, "robin");
        let counter = speaker.query::<dyn Counter>().unwrap();

        assert_eq!(speaker.use_count(), 2);
        assert_eq!(counter.use_count(), 2);
        assert!(speaker.same_object(&counter));
        assert!(speaker == counter);
        assert_eq!(counter.bump(), 1);
        assert_eq!(counter.bump(), 2);
    }

    #[test]
    fn test_cast_to_unsupported_is_empty() {
        tracked_component!(Crow, CROW_DROPS);
        let registry = registry_with::<Crow>("crow");

        let speaker = CapabilityHandle::<dyn Speaker>::create(&registry, "crow");
        assert!(matches!(
            speaker.query::<dyn Unrelated>(),
            Err(Error::NotFound(_))
        ));
        let cast = CapabilityHandle::<dyn Unrelated>::cast_from(&speaker);
        assert!(cast.is_empty());
        assert_eq!(speaker.use_count(), 1);

        let empty = CapabilityHandle::<dyn Speaker>::empty();
        assert_eq!(empty.query::<dyn Counter>().unwrap_err(), Error::Empty);
    }

    #[test]
    fn test_round_trip_destroys_once_on_final_release() {
        tracked_component!(Finch, FINCH_DROPS);
        let registry = registry_with::<Finch>("finch");

        let mut speaker = CapabilityHandle::<dyn Speaker>::create(&registry, "finch");
        let mut counter = CapabilityHandle::<dyn Counter>::cast_from(&speaker);
        assert_eq!(speaker.use_count(), 2);

        counter.release();
        assert!(counter.is_empty());
        assert_eq!(FINCH_DROPS.load(Ordering::SeqCst), 0);
        assert_eq!(speaker.use_count(), 1);

        // idempotent
        counter.release();
        assert_eq!(speaker.use_count(), 1);

        speaker.release();
        assert!(speaker.is_empty());
        assert_eq!(FINCH_DROPS.load(Ordering::SeqCst), 1);

        speaker.release();
        assert_eq!(FINCH_DROPS.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_clone_and_equality() {
        tracked_component!(Owl, OWL_DROPS);
        let registry = registry_with::<Owl>("owl");

        let a = CapabilityHandle::<dyn Speaker>::create(&registry, "owl");
        let b = a.clone();
        let c = CapabilityHandle::<dyn Speaker>::create(&registry, "owl");

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.use_count(), 2);
        assert_eq!(c.use_count(), 1);
        assert_eq!(
            CapabilityHandle::<dyn Speaker>::empty(),
            CapabilityHandle::<dyn Counter>::empty()
        );

        drop(a);
        drop(b);
        drop(c);
        assert_eq!(OWL_DROPS.load(Ordering::SeqCst), 2);
    }

    #[test]
    #[should_panic(expected = "empty CapabilityHandle")]
    fn test_deref_empty_panics() {
        let handle = CapabilityHandle::<dyn Speaker>::empty();
        let _ = handle.speak();
    }

    #[test]
    fn test_singleton_survives_release() {
        tracked_component!(Moon, MOON_DROPS);
        let registry = ClassRegistry::new();
        registry.register_default(FactoryRecord::singleton::<Moon>("moon"));

        let first = CapabilityHandle::<dyn Counter>::create(&registry, "moon");
        assert_eq!(first.bump(), 1);
        drop(first);

        let second = CapabilityHandle::<dyn Counter>::create(&registry, "moon");
        assert_eq!(second.bump(), 2);
        assert_eq!(MOON_DROPS.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_object_creator_factory() {
        tracked_component!(Wren, WREN_DROPS);
        let registry = Arc::new(registry_with::<Wren>("wren"));
        let creator = {
            let registry = registry.clone();
            unsafe { ObjectCreator::new(move |id| registry.create(id)) }
        };

        let speaker = CapabilityHandle::<dyn Speaker>::create(&creator, "wren");
        assert_eq!(speaker.speak(), "Wren");
    }

    #[test]
    fn test_each_created_object_destroyed_once() {
        tracked_component!(Heron, HERON_DROPS);
        let registry = registry_with::<Heron>("heron");

        let first = CapabilityHandle::<dyn Speaker>::create(&registry, "heron");
        let shared = first.clone();
        let second = CapabilityHandle::<dyn Speaker>::create(&registry, "heron");
        assert!(!first.same_object(&second));
        assert_eq!(first.use_count(), 2);
        assert_eq!(second.use_count(), 1);

        // a freshly created object gets its own count
        let (object, record) = registry.create("heron").unwrap();
        let adopted = unsafe { CapabilityHandle::<dyn Counter>::adopt(object, record) }.unwrap();
        assert_eq!(adopted.object(), Some(object));
        assert_eq!(adopted.use_count(), 1);

        drop(first);
        assert_eq!(HERON_DROPS.load(Ordering::SeqCst), 0);
        drop(shared);
        drop(second);
        drop(adopted);
        assert_eq!(HERON_DROPS.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_concurrent_clone_and_release() {
        tracked_component!(Swift, SWIFT_DROPS);
        let registry = registry_with::<Swift>("swift");
        let root = CapabilityHandle::<dyn Counter>::create(&registry, "swift");

        std::thread::scope(|scope| {
            for _ in 0..8 {
                let local = root.clone();
                scope.spawn(move || {
                    for _ in 0..1000 {
                        let copy = local.clone();
                        let speaker = copy.query::<dyn Speaker>().unwrap();
                        copy.bump();
                        drop(speaker);
                        drop(copy);
                    }
                });
            }
        });

        assert_eq!(root.use_count(), 1);
        assert_eq!(root.bump(), 8001);
        drop(root);
        assert_eq!(SWIFT_DROPS.load(Ordering::SeqCst), 1);
    }
}
