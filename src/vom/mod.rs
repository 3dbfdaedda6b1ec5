//! Virtual object manager: kind definitions, kind handles and the state
//! cache shared by every instance.

mod behavior;
mod descriptor;
mod facetiousness;
mod kind;
mod weak;

use std::cell::{Cell, RefCell, RefMut};
use std::collections::{BTreeSet, HashMap};
use std::rc::{Rc, Weak};

use tracing::{Level, event};

pub use behavior::{Behavior, BehaviorEntry, Method, PropertyKey};
pub use descriptor::{DurableKindDescriptor, VirtualKindDescriptor};
pub use facetiousness::{Facetiousness, assess_facetiousness, check_and_update_facetiousness};
pub(crate) use kind::KindDefinition;
pub use kind::{Context, Facets, InitFn, KindMaker, KindOptions, State};
pub use weak::{VoAwareWeakMap, VoAwareWeakSet};

use crate::config::RuntimeConfig;
use crate::core::{Result, StoreError, Value, make_base_ref, parse_vat_slot};
use crate::handle::{Handle, HandleBody};
use crate::marshal::CapData;
use crate::pattern::Pattern;
use crate::runtime::RuntimeInner;
use crate::storage::{Cache, VatStore, enumerate_keys_with_prefix};
use crate::vrm::{IdKind, KindBackend};
use kind::{KindParams, StateBacking, StateRecord};

/// Reanimates kind handles; they carry no state of their own.
struct KindHandleBackend;

impl KindBackend for KindHandleBackend {
    fn reanimate(&self, rt: &Rc<RuntimeInner>, base_ref: &str) -> Result<Handle> {
        rt.vom.reanimate_kind_handle(base_ref)
    }

    fn delete_stored(&self, _rt: &Rc<RuntimeInner>, _base_ref: &str) -> Result<bool> {
        Ok(false)
    }
}

/// Arguments shared by every flavor of kind definition.
pub(crate) struct KindSpec {
    pub tag: String,
    pub init: Option<InitFn>,
    pub multifaceted: bool,
    pub behavior: Behavior,
    pub options: KindOptions,
}

fn insist_same_capdata(old: &CapData, new: &CapData) -> Result<()> {
    if old.body != new.body {
        return Err(StoreError::TypeMismatch(
            "durable Kind stateShape mismatch (body)".to_string(),
        ));
    }
    if old.slots.len() != new.slots.len() {
        return Err(StoreError::TypeMismatch(
            "durable Kind stateShape mismatch (slots.length)".to_string(),
        ));
    }
    for (i, (old_vref, new_vref)) in old.slots.iter().zip(&new.slots).enumerate() {
        if old_vref != new_vref {
            return Err(StoreError::TypeMismatch(format!(
                "durable Kind stateShape mismatch (slot[{}])",
                i
            )));
        }
    }
    Ok(())
}

pub(crate) struct VirtualObjectManager {
    rt: Weak<RuntimeInner>,
    store: VatStore,
    allow_state_shape_changes: bool,
    label_instances: bool,
    kind_id_id: Cell<u64>,
    data_cache: RefCell<Cache<StateRecord>>,
    next_instance_ids: RefCell<HashMap<u64, u64>>,
    kind_descriptors: RefCell<HashMap<u64, DurableKindDescriptor>>,
    defined_durable_kinds: RefCell<BTreeSet<u64>>,
    definitions: RefCell<Vec<Rc<KindDefinition>>>,
}

impl VirtualObjectManager {
    pub fn new(rt: Weak<RuntimeInner>, store: VatStore, config: &RuntimeConfig) -> Self {
        Self {
            rt,
            data_cache: RefCell::new(Cache::new(StateBacking {
                store: store.clone(),
            })),
            store,
            allow_state_shape_changes: config.allow_state_shape_changes,
            label_instances: config.label_instances,
            kind_id_id: Cell::new(0),
            next_instance_ids: RefCell::new(HashMap::new()),
            kind_descriptors: RefCell::new(HashMap::new()),
            defined_durable_kinds: RefCell::new(BTreeSet::new()),
            definitions: RefCell::new(Vec::new()),
        }
    }

    /// Load or allocate the kind id under which kind handles themselves are
    /// exported.
    pub fn initialize_kind_handle_kind(&self, rt: &RuntimeInner) -> Result<()> {
        let kind_id_id = match self.store.get("kindIDID")? {
            Some(raw) => raw
                .parse()
                .map_err(|_| StoreError::Storage(format!("bad kindIDID {:?}", raw)))?,
            None => {
                let id = rt.vrm.allocate_next_id(IdKind::Export)?;
                self.store.set("kindIDID", &id.to_string())?;
                id
            }
        };
        self.kind_id_id.set(kind_id_id);
        rt.vrm.register_kind(kind_id_id, Rc::new(KindHandleBackend), true);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Instance state
    // ------------------------------------------------------------------

    fn data_cache(&self) -> Result<RefMut<'_, Cache<StateRecord>>> {
        self.data_cache
            .try_borrow_mut()
            .map_err(|_| StoreError::Invariant("re-entrant state access".to_string()))
    }

    /// Run `f` on the cached state of `base_ref` without marking it dirty.
    pub(crate) fn with_state<R>(
        &self,
        base_ref: &str,
        f: impl FnOnce(&mut StateRecord) -> R,
    ) -> Result<R> {
        self.data_cache()?
            .with_entry(base_ref, f)?
            .ok_or_else(|| StoreError::StateAccess(format!("no state for {}", base_ref)))
    }

    pub(crate) fn update_state(
        &self,
        base_ref: &str,
        f: impl FnOnce(&mut StateRecord),
    ) -> Result<()> {
        let mut cache = self.data_cache()?;
        let mut record = cache
            .get(base_ref)?
            .ok_or_else(|| StoreError::StateAccess(format!("no state for {}", base_ref)))?;
        f(&mut record);
        cache.set(base_ref, record);
        Ok(())
    }

    pub(crate) fn set_state(&self, base_ref: &str, record: StateRecord) -> Result<()> {
        self.data_cache()?.set(base_ref, record);
        Ok(())
    }

    pub(crate) fn delete_state(&self, base_ref: &str) -> Result<()> {
        self.data_cache()?.delete(base_ref);
        Ok(())
    }

    /// Write dirty state and forget every cached state record and context.
    pub fn flush_state_caches(&self) -> Result<()> {
        self.data_cache()?.flush()?;
        let definitions: Vec<Rc<KindDefinition>> = self.definitions.borrow().clone();
        for definition in definitions {
            definition.flush_contexts()?;
        }
        Ok(())
    }

    pub(crate) fn next_instance_id(&self, kind_id: u64, durable: bool) -> Result<u64> {
        let mut ids = self.next_instance_ids.borrow_mut();
        let next = ids.get_mut(&kind_id).ok_or_else(|| {
            StoreError::Invariant(format!("no instance counter for kind {}", kind_id))
        })?;
        let id = *next;
        *next += 1;
        if durable {
            self.store
                .set(&DurableKindDescriptor::next_id_key(kind_id), &next.to_string())?;
        }
        Ok(id)
    }

    // ------------------------------------------------------------------
    // Kind handles
    // ------------------------------------------------------------------

    fn save_descriptor(&self, desc: &DurableKindDescriptor) -> Result<()> {
        self.store
            .set(&DurableKindDescriptor::key(desc.kind_id), &serde_json::to_string(desc)?)
    }

    pub fn make_kind_handle(&self, rt: &RuntimeInner, tag: &str) -> Result<Handle> {
        let kind_id = rt.vrm.allocate_next_id(IdKind::Export)?;
        let desc = DurableKindDescriptor::new(kind_id, tag);
        self.save_descriptor(&desc)?;
        self.store
            .set(&DurableKindDescriptor::next_id_key(kind_id), "1")?;
        self.next_instance_ids.borrow_mut().insert(kind_id, 1);
        self.kind_descriptors.borrow_mut().insert(kind_id, desc);

        let handle = Handle::new("kind", HandleBody::KindHandle { kind_id });
        let base_ref = make_base_ref(self.kind_id_id.get(), kind_id, true);
        rt.register_value(&base_ref, &handle)?;
        event!(Level::DEBUG, base_ref = %base_ref, tag = %tag, "kind handle created");
        Ok(handle)
    }

    fn reanimate_kind_handle(&self, base_ref: &str) -> Result<Handle> {
        let parsed = parse_vat_slot(base_ref)?;
        let kind_id = parsed
            .subid
            .ok_or_else(|| StoreError::UnknownReference(format!("bad kind handle {}", base_ref)))?;
        let raw = self
            .store
            .get(&DurableKindDescriptor::key(kind_id))?
            .ok_or_else(|| {
                StoreError::UnknownReference(format!("no descriptor for kind {}", kind_id))
            })?;
        let desc: DurableKindDescriptor = serde_json::from_str(&raw)?;
        let next_id = match self.store.get(&DurableKindDescriptor::next_id_key(kind_id))? {
            Some(raw) => raw
                .parse()
                .map_err(|_| StoreError::Storage(format!("bad nextID {:?}", raw)))?,
            None => 1,
        };
        self.next_instance_ids
            .borrow_mut()
            .entry(kind_id)
            .or_insert(next_id);
        self.kind_descriptors
            .borrow_mut()
            .entry(kind_id)
            .or_insert(desc);
        Ok(Handle::new("kind", HandleBody::KindHandle { kind_id }))
    }

    // ------------------------------------------------------------------
    // Definitions
    // ------------------------------------------------------------------

    fn define_kind_internal(
        &self,
        rt: &Rc<RuntimeInner>,
        kind_id: u64,
        spec: KindSpec,
        durable: bool,
        descriptor: Option<&mut DurableKindDescriptor>,
    ) -> Result<Rc<KindDefinition>> {
        let KindSpec {
            tag,
            init,
            multifaceted,
            behavior,
            options,
        } = spec;

        let proposed = match assess_facetiousness(&behavior) {
            Facetiousness::One if multifaceted => {
                return Err(StoreError::InvalidBehavior(format!(
                    "multi-faceted definition of \"{}\" got a single-facet behavior",
                    tag
                )));
            }
            Facetiousness::One => None,
            Facetiousness::Many if !multifaceted => {
                return Err(StoreError::InvalidBehavior(format!(
                    "single-facet definition of \"{}\" got a multi-faceted behavior",
                    tag
                )));
            }
            Facetiousness::Many => Some(behavior.names()),
            Facetiousness::Not => {
                return Err(StoreError::InvalidBehavior(format!(
                    "invalid behavior specifier for \"{}\"",
                    tag
                )));
            }
        };

        let shape_value = match &options.state_shape {
            Some(shape) => Pattern::record(shape.clone()).to_value(),
            None => Value::Null,
        };
        let new_shape = rt.serialize(&shape_value)?;
        if durable {
            for (i, vref) in new_shape.slots.iter().enumerate() {
                if !rt.vrm.is_durable(vref)? {
                    return Err(StoreError::NotDurable(format!(
                        "stateShape is not durable: slot {} of {}",
                        i, new_shape.body
                    )));
                }
            }
        }

        let (facet_names, old_slots) = match descriptor {
            Some(desc) => {
                let facet_names = check_and_update_facetiousness(&tag, desc, proposed)?;
                let old_slots = match &desc.state_shape_cap_data {
                    Some(old) => {
                        if !self.allow_state_shape_changes {
                            insist_same_capdata(old, &new_shape)?;
                        }
                        old.slots.clone()
                    }
                    None => Vec::new(),
                };
                desc.state_shape_cap_data = Some(new_shape.clone());
                self.save_descriptor(desc)?;
                (facet_names, old_slots)
            }
            None => (proposed, Vec::new()),
        };
        rt.vrm
            .update_reference_counts(rt, &old_slots, &new_shape.slots)?;

        let definition = KindDefinition::new(
            self.rt.clone(),
            KindParams {
                kind_id,
                tag,
                durable,
                facet_names: facet_names.clone(),
                behavior,
                init,
                options,
                label_instances: self.label_instances,
            },
        );
        let backend: Rc<dyn KindBackend> = definition.clone();
        rt.vrm.register_kind(kind_id, backend, durable);
        if let Some(names) = facet_names {
            rt.vrm.remember_facet_names(kind_id, names)?;
        }
        self.definitions.borrow_mut().push(Rc::clone(&definition));
        event!(
            Level::DEBUG,
            kind_id,
            tag = %definition.tag(),
            durable,
            "kind defined"
        );
        Ok(definition)
    }

    pub fn define_kind(&self, rt: &Rc<RuntimeInner>, spec: KindSpec) -> Result<KindMaker> {
        let kind_id = rt.vrm.allocate_next_id(IdKind::Export)?;
        let desc = VirtualKindDescriptor {
            kind_id,
            tag: spec.tag.clone(),
        };
        self.store
            .set(&VirtualKindDescriptor::key(kind_id), &serde_json::to_string(&desc)?)?;
        self.next_instance_ids.borrow_mut().insert(kind_id, 1);
        let definition = self.define_kind_internal(rt, kind_id, spec, false, None)?;
        Ok(KindMaker::new(definition))
    }

    pub fn define_durable_kind(
        &self,
        rt: &Rc<RuntimeInner>,
        kind_handle: &Handle,
        spec: KindSpec,
    ) -> Result<KindMaker> {
        let HandleBody::KindHandle { kind_id, .. } = kind_handle.body() else {
            return Err(StoreError::UnknownReference(format!(
                "unknown handle {}",
                kind_handle.iface()
            )));
        };
        let kind_id = *kind_id;
        let mut desc = self
            .kind_descriptors
            .borrow()
            .get(&kind_id)
            .cloned()
            .ok_or_else(|| {
                StoreError::UnknownReference(format!("no descriptor for kind {}", kind_id))
            })?;
        if self.defined_durable_kinds.borrow().contains(&kind_id) {
            return Err(StoreError::KindRedefinition(desc.tag));
        }
        let spec = KindSpec {
            tag: desc.tag.clone(),
            ..spec
        };
        let definition = self.define_kind_internal(rt, kind_id, spec, true, Some(&mut desc))?;
        self.kind_descriptors.borrow_mut().insert(kind_id, desc);
        self.defined_durable_kinds.borrow_mut().insert(kind_id);
        Ok(KindMaker::new(definition))
    }

    /// Fail with every durable kind that has a stored descriptor but was
    /// not defined again in this incarnation.
    pub fn insist_all_durable_kinds_reconnected(&self) -> Result<()> {
        let defined = self.defined_durable_kinds.borrow();
        let mut missing = Vec::new();
        for key in enumerate_keys_with_prefix(&self.store, "vom.dkind.")? {
            if !key.ends_with(".descriptor") {
                continue;
            }
            let Some(raw) = self.store.get(&key)? else {
                continue;
            };
            let desc: DurableKindDescriptor = serde_json::from_str(&raw)?;
            if !defined.contains(&desc.kind_id) {
                missing.push(desc.tag);
            }
        }
        if missing.is_empty() {
            return Ok(());
        }
        missing.sort();
        Err(StoreError::MissingTags(missing))
    }
}
