//! Class registry: capability-id → factory record.
//!
//! One mutex serializes every operation, including the factory call inside
//! [`ClassRegistry::create`]. Factories are therefore not reentrant with
//! respect to the registry that invokes them: a create function that
//! registers, unregisters or creates through the same registry deadlocks.
//! Well-behaved factories only construct their own object.

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::object::ObjectRef;
use crate::record::{CapabilityId, FactoryRecord};

/// Mapping from capability-id to the record that creates it.
pub struct ClassRegistry {
    classes: Mutex<HashMap<CapabilityId, FactoryRecord>>,
}

impl ClassRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            classes: Mutex::new(HashMap::new()),
        }
    }

    /// Register a record.
    ///
    /// Inserts when the id is free. When a record already exists under the
    /// id it is replaced if `replace` is set; otherwise nothing changes and
    /// `false` is returned.
    pub fn register(&self, record: FactoryRecord, replace: bool) -> bool {
        let mut classes = self.classes.lock();
        match classes.entry(record.capability_id.clone()) {
            Entry::Vacant(slot) => {
                tracing::debug!("Register class ok [{}]", record);
                slot.insert(record);
                true
            }
            Entry::Occupied(mut slot) if replace => {
                tracing::debug!("Replace class [{}] with [{}]", slot.get(), record);
                slot.insert(record);
                true
            }
            Entry::Occupied(slot) => {
                tracing::debug!("Register class rejected, [{}] already present", slot.get());
                false
            }
        }
    }

    /// Register a record, replacing any existing one.
    pub fn register_default(&self, record: FactoryRecord) -> bool {
        self.register(record, true)
    }

    /// Like [`register`](Self::register) without replacement, reporting the
    /// collision as [`Error::Duplicate`].
    pub fn try_register(&self, record: FactoryRecord) -> Result<()> {
        let id = record.capability_id.clone();
        if self.register(record, false) {
            Ok(())
        } else {
            Err(Error::Duplicate(id))
        }
    }

    /// Register a table of records, skipping (and logging) the ones that
    /// fail. Returns how many were registered.
    pub fn register_all<'a>(
        &self,
        records: impl IntoIterator<Item = &'a FactoryRecord>,
        replace: bool,
    ) -> usize {
        let mut registered = 0;
        for record in records {
            if self.register(record.clone(), replace) {
                registered += 1;
            } else {
                tracing::warn!("Register class failed [{}]", record);
            }
        }
        registered
    }

    /// Remove whatever record is stored under `capability_id`.
    pub fn unregister_id(&self, capability_id: &str) {
        if self.classes.lock().remove(capability_id).is_some() {
            tracing::debug!("Unregister class [{}]", capability_id);
        }
    }

    /// Remove the stored record for `record.capability_id`, but only if it
    /// is identity-equal to `record`.
    ///
    /// A stale unregister (for example from a module that was superseded by
    /// a later registrant) leaves the newer record in place.
    pub fn unregister(&self, record: &FactoryRecord) -> bool {
        let mut classes = self.classes.lock();
        let same = classes
            .get(&record.capability_id)
            .map(|stored| stored.identity_eq(record));
        match same {
            Some(true) => {
                classes.remove(&record.capability_id);
                tracing::debug!("Unregister class [{}]", record);
                true
            }
            Some(false) => {
                tracing::debug!(
                    "Keep class [{}], a different record is registered under it",
                    record.capability_id
                );
                false
            }
            None => false,
        }
    }

    /// Instantiate the class registered under `capability_id`.
    ///
    /// Returns the object together with the record needed to destroy it.
    pub fn create(&self, capability_id: &str) -> Result<(ObjectRef, FactoryRecord)> {
        let classes = self.classes.lock();
        let record = classes
            .get(capability_id)
            .ok_or_else(|| Error::NotFound(capability_id.to_string()))?;
        let object = record
            .create()
            .ok_or_else(|| Error::CreationFailed(capability_id.to_string()))?;
        Ok((object, record.clone()))
    }

    /// Destroy an object through its record's destroy function.
    ///
    /// # Safety
    /// See [`FactoryRecord::destroy`].
    pub unsafe fn destroy(object: ObjectRef, record: &FactoryRecord) {
        record.destroy(object);
    }

    /// Whether a class is registered under `capability_id`.
    pub fn has_class(&self, capability_id: &str) -> bool {
        self.classes.lock().contains_key(capability_id)
    }

    /// Copy of the record stored under `capability_id`.
    pub fn record(&self, capability_id: &str) -> Option<FactoryRecord> {
        self.classes.lock().get(capability_id).cloned()
    }

    /// All registered capability-ids, sorted.
    pub fn class_ids(&self) -> Vec<CapabilityId> {
        let mut ids: Vec<_> = self.classes.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.classes.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.lock().is_empty()
    }
}

impl Default for ClassRegistry {
    fn default() -> Self {
        Self::new()
    }
}
