//! In-memory weak collections that understand virtual objects.
//!
//! A virtual object or presence may be represented by many short-lived
//! handles over its lifetime, so keying by handle identity would lose
//! entries whenever a representative is dropped and rebuilt. These tables
//! key such objects by vref and register as recognizers with the
//! reference manager, which removes the entry once the vref is gone for
//! good. Every other handle is keyed by identity and held weakly.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use tracing::{Level, event};

use crate::core::{Result, SlotType, StoreError, Value, parse_vat_slot};
use crate::handle::{Handle, HandleInner};
use crate::runtime::RuntimeInner;
use crate::vrm::{Recognizer, VrefTable};

/// The vref to key `handle` by, if it names a virtual object or an import.
fn vref_key(handle: &Handle) -> Result<Option<String>> {
    let Some(vref) = handle.vref() else {
        return Ok(None);
    };
    let parsed = parse_vat_slot(&vref)?;
    let keyed = parsed.slot_type == SlotType::Object
        && (parsed.is_stored() || !parsed.allocated_by_vat);
    Ok(keyed.then_some(vref))
}

struct IdentityEntry {
    key: Weak<HandleInner>,
    facet: Option<usize>,
    value: Option<Value>,
}

impl IdentityEntry {
    fn is_for(&self, handle: &Handle) -> bool {
        self.facet == handle.facet() && Weak::ptr_eq(&self.key, &handle.downgrade())
    }
}

struct WeakTableCore {
    rt: Weak<RuntimeInner>,
    table: Rc<VrefTable>,
    by_identity: RefCell<Vec<IdentityEntry>>,
}

impl WeakTableCore {
    fn new(rt: &Rc<RuntimeInner>, holds_values: bool) -> Self {
        Self {
            rt: Rc::downgrade(rt),
            table: rt.vrm.new_vref_table(holds_values),
            by_identity: RefCell::new(Vec::new()),
        }
    }

    fn runtime(&self) -> Result<Rc<RuntimeInner>> {
        self.rt
            .upgrade()
            .ok_or_else(|| StoreError::Invariant("runtime dropped".to_string()))
    }

    fn recognizer(&self) -> Recognizer {
        Recognizer::Table(Rc::clone(&self.table))
    }

    fn has(&self, key: &Handle) -> Result<bool> {
        Ok(match vref_key(key)? {
            Some(vref) => self.table.contains(&vref),
            None => self.by_identity.borrow().iter().any(|entry| entry.is_for(key)),
        })
    }

    fn get(&self, key: &Handle) -> Result<Option<Value>> {
        Ok(match vref_key(key)? {
            Some(vref) => self.table.get(&vref).flatten(),
            None => self
                .by_identity
                .borrow()
                .iter()
                .find(|entry| entry.is_for(key))
                .and_then(|entry| entry.value.clone()),
        })
    }

    fn put(&self, key: &Handle, value: Option<Value>) -> Result<()> {
        match vref_key(key)? {
            Some(vref) => {
                if !self.table.contains(&vref) {
                    self.runtime()?
                        .vrm
                        .add_recognizable_value(key, &self.recognizer())?;
                }
                self.table.insert(vref, value);
            }
            None => {
                let mut entries = self.by_identity.borrow_mut();
                entries.retain(|entry| entry.key.strong_count() > 0);
                match entries.iter_mut().find(|entry| entry.is_for(key)) {
                    Some(entry) => entry.value = value,
                    None => entries.push(IdentityEntry {
                        key: key.downgrade(),
                        facet: key.facet(),
                        value,
                    }),
                }
            }
        }
        Ok(())
    }

    fn delete(&self, key: &Handle) -> Result<bool> {
        match vref_key(key)? {
            Some(vref) => {
                if !self.table.contains(&vref) {
                    return Ok(false);
                }
                self.runtime()?
                    .vrm
                    .remove_recognizable_value(key, &self.recognizer())?;
                Ok(self.table.remove(&vref))
            }
            None => {
                let removed = {
                    let mut entries = self.by_identity.borrow_mut();
                    let position = entries.iter().position(|entry| entry.is_for(key));
                    position.map(|i| entries.remove(i))
                };
                Ok(removed.is_some())
            }
        }
    }

    fn len(&self) -> usize {
        let live = self
            .by_identity
            .borrow()
            .iter()
            .filter(|entry| entry.key.strong_count() > 0)
            .count();
        self.table.len() + live
    }
}

impl Drop for WeakTableCore {
    fn drop(&mut self) {
        let Some(rt) = self.rt.upgrade() else {
            return;
        };
        let recognizer = self.recognizer();
        for vref in self.table.vrefs() {
            if let Err(err) = rt.vrm.remove_recognizable_vref(&vref, &recognizer) {
                event!(Level::WARN, vref = %vref, error = %err, "failed to release weak key");
            }
        }
    }
}

/// Weak map whose keys may be virtual objects or imports.
///
/// ```
/// use vobjstore::{MemorySyscall, RuntimeConfig, VirtualRuntime};
///
/// let rt = VirtualRuntime::new(MemorySyscall::new(), RuntimeConfig::default()).unwrap();
/// let seen = rt.make_vo_aware_weak_map();
/// let peer = rt.import("o-4").unwrap();
/// seen.set(&peer, "hello").unwrap();
/// drop(peer);
/// assert_eq!(seen.get(&rt.import("o-4").unwrap()).unwrap(), Some("hello".into()));
/// ```
pub struct VoAwareWeakMap {
    core: WeakTableCore,
}

impl VoAwareWeakMap {
    pub(crate) fn new(rt: &Rc<RuntimeInner>) -> Self {
        Self {
            core: WeakTableCore::new(rt, true),
        }
    }

    pub fn has(&self, key: &Handle) -> Result<bool> {
        self.core.has(key)
    }

    pub fn get(&self, key: &Handle) -> Result<Option<Value>> {
        self.core.get(key)
    }

    pub fn set(&self, key: &Handle, value: impl Into<Value>) -> Result<()> {
        self.core.put(key, Some(value.into()))
    }

    /// Returns whether an entry was removed.
    pub fn delete(&self, key: &Handle) -> Result<bool> {
        self.core.delete(key)
    }

    /// Entries whose keys are still alive.
    pub fn len(&self) -> usize {
        self.core.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Weak set counterpart of [`VoAwareWeakMap`].
pub struct VoAwareWeakSet {
    core: WeakTableCore,
}

impl VoAwareWeakSet {
    pub(crate) fn new(rt: &Rc<RuntimeInner>) -> Self {
        Self {
            core: WeakTableCore::new(rt, false),
        }
    }

    pub fn has(&self, value: &Handle) -> Result<bool> {
        self.core.has(value)
    }

    pub fn add(&self, value: &Handle) -> Result<()> {
        self.core.put(value, None)
    }

    pub fn delete(&self, value: &Handle) -> Result<bool> {
        self.core.delete(value)
    }

    pub fn len(&self) -> usize {
        self.core.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::handle::FarBehavior;
    use crate::runtime::VirtualRuntime;
    use crate::storage::MemorySyscall;

    #[test]
    fn test_local_objects_are_keyed_by_identity() {
        let rt = VirtualRuntime::new(MemorySyscall::new(), RuntimeConfig::default()).unwrap();
        let map = rt.make_vo_aware_weak_map();
        let a = Handle::far("a", FarBehavior::new());
        let b = Handle::far("b", FarBehavior::new());
        map.set(&a, 1).unwrap();
        map.set(&a, 2).unwrap();
        assert_eq!(map.get(&a).unwrap(), Some(Value::from(2)));
        assert!(!map.has(&b).unwrap());
        assert_eq!(map.len(), 1);

        drop(a);
        assert!(map.is_empty());
        assert!(!map.delete(&b).unwrap());
    }

    #[test]
    fn test_facets_are_distinct_keys() {
        let rt = VirtualRuntime::new(MemorySyscall::new(), RuntimeConfig::default()).unwrap();
        let set = rt.make_vo_aware_weak_set();
        let kit = Handle::far("kit", FarBehavior::new());
        set.add(&kit.with_facet(0)).unwrap();
        assert!(set.has(&kit.with_facet(0)).unwrap());
        assert!(!set.has(&kit.with_facet(1)).unwrap());
        assert!(set.delete(&kit.with_facet(0)).unwrap());
        assert!(set.is_empty());
    }
}
