//! Identity registry: which in-memory handle stands for which vref.
//!
//! `slot_to_val` holds representatives weakly so that dropping the last
//! user clone lets the handle go. Exported remotables are pinned strongly
//! until the kernel drops them.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::rc::{Rc, Weak};

use tracing::{Level, event};

use super::RuntimeInner;
use crate::core::{Result, SlotType, StoreError, Value, make_vat_slot, parse_vat_slot};
use crate::handle::{FinalizationQueue, Handle, HandleBody, HandleInner};
use crate::marshal::{CapData, serialize_with, unserialize_with};
use crate::vrm::{ExportStatus, IdKind};

#[derive(Default)]
pub(crate) struct SlotRegistry {
    slot_to_val: RefCell<HashMap<String, Weak<HandleInner>>>,
    exported_remotables: RefCell<BTreeMap<String, Handle>>,
    kernel_recognizable: RefCell<BTreeSet<String>>,
    finalization_queue: FinalizationQueue,
}

impl SlotRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn live_count(&self) -> usize {
        self.slot_to_val
            .borrow()
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }

    pub fn take_exported(&self) -> Vec<String> {
        let exported = std::mem::take(&mut *self.exported_remotables.borrow_mut());
        exported.into_keys().collect()
    }

    pub fn clear_kernel_recognizable(&self) {
        self.kernel_recognizable.borrow_mut().clear();
    }

    pub fn forget_kernel_recognizable(&self, vref: &str) -> bool {
        self.kernel_recognizable.borrow_mut().remove(vref)
    }

    fn take_finalized(&self) -> Vec<String> {
        std::mem::take(&mut *self.finalization_queue.borrow_mut())
    }
}

impl RuntimeInner {
    /// The live representative registered under `base_ref`, if any.
    pub(crate) fn get_val_for_slot(&self, base_ref: &str) -> Option<Handle> {
        let inner = self.registry.slot_to_val.borrow().get(base_ref)?.upgrade()?;
        Some(Handle::from_inner(inner, None))
    }

    pub(crate) fn required_val_for_slot(&self, vref: &str) -> Result<Handle> {
        let parsed = parse_vat_slot(vref)?;
        let cohort = self
            .get_val_for_slot(&parsed.base_ref)
            .ok_or_else(|| StoreError::UnknownReference(format!("no value for {}", vref)))?;
        Ok(match parsed.facet {
            Some(facet) => cohort.with_facet(facet),
            None => cohort,
        })
    }

    pub(crate) fn register_value(&self, base_ref: &str, cohort: &Handle) -> Result<()> {
        let parsed = parse_vat_slot(base_ref)?;
        if parsed.facet.is_some() {
            return Err(StoreError::Invariant(format!(
                "registerValue({}) should not receive individual facets",
                base_ref
            )));
        }
        cohort.set_base_ref(base_ref);
        self.registry
            .slot_to_val
            .borrow_mut()
            .insert(base_ref.to_string(), cohort.downgrade());
        if parsed.slot_type == SlotType::Object {
            cohort.register_finalizer(&self.registry.finalization_queue, base_ref);
        }
        Ok(())
    }

    /// Vref for `handle`, allocating one for a fresh local object or
    /// promise.
    pub(crate) fn convert_val_to_slot(&self, handle: &Handle) -> Result<String> {
        if let Some(vref) = handle.vref() {
            return Ok(vref);
        }
        let slot = match handle.body() {
            HandleBody::Promise => make_vat_slot(
                SlotType::Promise,
                true,
                self.vrm.allocate_next_id(IdKind::Promise)?,
            ),
            HandleBody::Far(_) => make_vat_slot(
                SlotType::Object,
                true,
                self.vrm.allocate_next_id(IdKind::Export)?,
            ),
            _ => {
                return Err(StoreError::UnknownReference(format!(
                    "{} has no vref",
                    handle.iface()
                )));
            }
        };
        self.register_value(&slot, &handle.cohort())?;
        Ok(slot)
    }

    /// Handle for `vref`, reanimating a stored object or creating a
    /// presence, promise or device the first time a foreign vref is seen.
    pub(crate) fn convert_slot_to_val(self: &Rc<Self>, vref: &str, iface: &str) -> Result<Handle> {
        let parsed = parse_vat_slot(vref)?;
        let with_facet = |cohort: Handle| match parsed.facet {
            Some(facet) => cohort.with_facet(facet),
            None => cohort,
        };
        if let Some(cohort) = self.get_val_for_slot(&parsed.base_ref) {
            return Ok(with_facet(cohort));
        }
        let cohort = if parsed.is_stored() {
            self.vrm.reanimate(self, &parsed.base_ref)?
        } else {
            let iface = if iface.is_empty() {
                format!("Alleged: {}", vref)
            } else {
                iface.to_string()
            };
            match (parsed.slot_type, parsed.allocated_by_vat) {
                (SlotType::Object, true) => {
                    return Err(StoreError::UnknownReference(format!(
                        "I don't remember allocating {}",
                        vref
                    )));
                }
                (SlotType::Object, false) => Handle::new(iface, HandleBody::Presence),
                (SlotType::Promise, _) => Handle::new("Promise", HandleBody::Promise),
                (SlotType::Device, true) => {
                    return Err(StoreError::UnknownReference(format!(
                        "unexpected device {} allocated by vat",
                        vref
                    )));
                }
                (SlotType::Device, false) => Handle::new(iface, HandleBody::Device),
            }
        };
        self.register_value(&parsed.base_ref, &cohort)?;
        Ok(with_facet(cohort))
    }

    pub(crate) fn serialize(&self, value: &Value) -> Result<CapData> {
        serialize_with(value, &mut |handle| self.convert_val_to_slot(handle))
    }

    pub(crate) fn unserialize(self: &Rc<Self>, capdata: &CapData) -> Result<Value> {
        unserialize_with(capdata, &mut |vref, iface| {
            Ok(Value::Ref(self.convert_slot_to_val(vref, iface)?))
        })
    }

    /// Keep an exported vref alive until the kernel drops it.
    pub(crate) fn retain_exported_vref(&self, vref: &str) -> Result<()> {
        let parsed = parse_vat_slot(vref)?;
        if parsed.slot_type != SlotType::Object || !parsed.allocated_by_vat {
            return Ok(());
        }
        if parsed.is_stored() {
            self.vrm.set_export_status(vref, ExportStatus::Reachable)
        } else {
            let handle = self.required_val_for_slot(vref)?;
            self.registry
                .exported_remotables
                .borrow_mut()
                .insert(vref.to_string(), handle);
            self.registry
                .kernel_recognizable
                .borrow_mut()
                .insert(vref.to_string());
            Ok(())
        }
    }

    pub(crate) fn drop_exports(&self, vrefs: &[String]) -> Result<()> {
        for vref in vrefs {
            let released = self.registry.exported_remotables.borrow_mut().remove(vref);
            drop(released);
            let parsed = parse_vat_slot(vref)?;
            if parsed.is_stored() {
                self.vrm.set_export_status(vref, ExportStatus::Recognizable)?;
            }
        }
        Ok(())
    }

    pub(crate) fn retire_exports(&self, vrefs: &[String]) -> Result<()> {
        for vref in vrefs {
            let parsed = parse_vat_slot(vref)?;
            if parsed.is_stored() {
                self.vrm.set_export_status(vref, ExportStatus::None)?;
            } else {
                self.registry.forget_kernel_recognizable(vref);
            }
        }
        Ok(())
    }

    pub(crate) fn retire_imports(self: &Rc<Self>, vrefs: &[String]) -> Result<()> {
        for vref in vrefs {
            self.vrm.cease_recognition(self, vref)?;
        }
        Ok(())
    }

    /// Move handles reclaimed since the last pass into the possibly-dead
    /// set. A base ref that was reanimated in the meantime is skipped.
    pub(crate) fn process_finalizers(&self) {
        for base_ref in self.registry.take_finalized() {
            let mut slots = self.registry.slot_to_val.borrow_mut();
            let dead = slots
                .get(&base_ref)
                .is_some_and(|weak| weak.strong_count() == 0);
            if dead {
                slots.remove(&base_ref);
                drop(slots);
                event!(Level::TRACE, base_ref = %base_ref, "representative finalized");
                self.vrm.add_to_possibly_dead(&base_ref);
            }
        }
    }
}
