//! The runtime that ties the store, the reference manager, collections
//! and virtual objects together for one incarnation of a process.

mod gc;
mod registry;
mod stop;

use std::rc::Rc;

use tracing::{Level, event};

pub use gc::GcReport;
pub(crate) use registry::SlotRegistry;

use crate::collections::{
    CollectionManager, MapStore, SetStore, StoreKind, StoreOptions, WeakMapStore, WeakSetStore,
};
use crate::config::RuntimeConfig;
use crate::core::{Result, Value, parse_vat_slot};
use crate::handle::Handle;
use crate::marshal::CapData;
use crate::storage::{Syscall, VatStore};
use crate::vom::{
    Behavior, KindMaker, KindOptions, KindSpec, VirtualObjectManager, VoAwareWeakMap, VoAwareWeakSet,
};
use crate::vrm::{RetentionStats, VirtualReferenceManager};

pub(crate) struct RuntimeInner {
    pub(crate) config: RuntimeConfig,
    pub(crate) store: VatStore,
    pub(crate) vrm: VirtualReferenceManager,
    pub(crate) registry: SlotRegistry,
    pub(crate) collections: CollectionManager,
    pub(crate) vom: VirtualObjectManager,
}

impl RuntimeInner {
    /// Write back and drop every per-turn cache.
    pub(crate) fn flush_caches(&self) -> Result<()> {
        self.vom.flush_state_caches()?;
        self.collections.flush_schema_cache()?;
        self.vrm.flush_id_counters()
    }
}

/// One incarnation of a process that keeps its objects in a [`Syscall`]
/// store.
///
/// Cloning is cheap and yields another handle to the same runtime.
///
/// ```
/// use vobjstore::{MemorySyscall, RuntimeConfig, StoreOptions, VirtualRuntime};
///
/// let rt = VirtualRuntime::new(MemorySyscall::new(), RuntimeConfig::default()).unwrap();
/// let scores = rt.make_map_store("scores", StoreOptions::new()).unwrap();
/// scores.init("alice", 3).unwrap();
/// assert_eq!(scores.get("alice").unwrap(), 3.into());
/// rt.end_turn().unwrap();
/// ```
#[derive(Clone)]
pub struct VirtualRuntime(Rc<RuntimeInner>);

impl VirtualRuntime {
    pub fn new<S: Syscall + 'static>(syscall: S, config: RuntimeConfig) -> Result<Self> {
        config.validate()?;
        let store = VatStore::new(syscall);
        let inner = Rc::new_cyclic(|weak| RuntimeInner {
            vrm: VirtualReferenceManager::new(store.clone(), config.relax_durability_rules),
            registry: SlotRegistry::new(),
            collections: CollectionManager::new(weak.clone(), store.clone(), config.max_key_length),
            vom: VirtualObjectManager::new(weak.clone(), store.clone(), &config),
            store,
            config,
        });
        inner.vom.initialize_kind_handle_kind(&inner)?;
        inner.collections.initialize_store_kinds(&inner)?;
        inner.flush_caches()?;
        event!(Level::INFO, "runtime started");
        Ok(Self(inner))
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.0.config
    }

    // ------------------------------------------------------------------
    // Marshalling
    // ------------------------------------------------------------------

    pub fn serialize(&self, value: &Value) -> Result<CapData> {
        self.0.serialize(value)
    }

    pub fn unserialize(&self, capdata: &CapData) -> Result<Value> {
        self.0.unserialize(capdata)
    }

    /// Whether `value` could be stored in durable data.
    pub fn can_be_durable(&self, value: &Value) -> Result<bool> {
        let capdata = self.0.serialize(value)?;
        for vref in &capdata.slots {
            if !self.0.vrm.is_durable(vref)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    // ------------------------------------------------------------------
    // Kernel-facing surface
    // ------------------------------------------------------------------

    /// Hand `handle` to the kernel, making it reachable from outside.
    pub fn export(&self, handle: &Handle) -> Result<String> {
        let vref = self.0.convert_val_to_slot(handle)?;
        self.0.retain_exported_vref(&vref)?;
        Ok(vref)
    }

    /// Handle for a vref the kernel delivered to this process.
    pub fn import(&self, vref: &str) -> Result<Handle> {
        self.0.convert_slot_to_val(vref, "")
    }

    pub fn drop_exports(&self, vrefs: &[String]) -> Result<()> {
        self.0.drop_exports(vrefs)
    }

    pub fn retire_exports(&self, vrefs: &[String]) -> Result<()> {
        self.0.retire_exports(vrefs)
    }

    pub fn retire_imports(&self, vrefs: &[String]) -> Result<()> {
        self.0.retire_imports(vrefs)
    }

    /// Flush all per-turn caches to the store.
    pub fn end_turn(&self) -> Result<()> {
        self.0.flush_caches()
    }

    pub fn bring_out_your_dead(&self) -> Result<GcReport> {
        self.0.bring_out_your_dead()
    }

    /// Shut this incarnation down, abandoning what cannot survive it.
    pub fn stop(&self) -> Result<()> {
        self.0.release_old_state()
    }

    // ------------------------------------------------------------------
    // Collections
    // ------------------------------------------------------------------

    fn make_store(&self, label: &str, set: bool, weak: bool, options: StoreOptions) -> Result<Handle> {
        let kind = StoreKind::select(set, weak, options.durable);
        self.0
            .collections
            .make_collection(&self.0, label, kind, options.key_shape, options.value_shape)
    }

    pub fn make_map_store(&self, label: &str, options: StoreOptions) -> Result<MapStore> {
        MapStore::from_handle(self.make_store(label, false, false, options)?)
    }

    pub fn make_weak_map_store(&self, label: &str, options: StoreOptions) -> Result<WeakMapStore> {
        WeakMapStore::from_handle(self.make_store(label, false, true, options)?)
    }

    pub fn make_set_store(&self, label: &str, options: StoreOptions) -> Result<SetStore> {
        SetStore::from_handle(self.make_store(label, true, false, options)?)
    }

    pub fn make_weak_set_store(&self, label: &str, options: StoreOptions) -> Result<WeakSetStore> {
        WeakSetStore::from_handle(self.make_store(label, true, true, options)?)
    }

    /// An in-memory weak map that keeps entries for virtual objects and
    /// imports across representatives.
    pub fn make_vo_aware_weak_map(&self) -> VoAwareWeakMap {
        VoAwareWeakMap::new(&self.0)
    }

    pub fn make_vo_aware_weak_set(&self) -> VoAwareWeakSet {
        VoAwareWeakSet::new(&self.0)
    }

    /// The durable root map that survives restarts.
    pub fn provide_baggage(&self) -> Result<MapStore> {
        MapStore::from_handle(self.0.collections.provide_baggage(&self.0)?)
    }

    // ------------------------------------------------------------------
    // Kinds
    // ------------------------------------------------------------------

    fn spec<F>(tag: &str, init: F, multifaceted: bool, behavior: Behavior, options: KindOptions) -> KindSpec
    where
        F: Fn(&[Value]) -> Result<Value> + 'static,
    {
        KindSpec {
            tag: tag.to_string(),
            init: Some(Rc::new(init)),
            multifaceted,
            behavior,
            options,
        }
    }

    pub fn define_kind<F>(
        &self,
        tag: &str,
        init: F,
        behavior: Behavior,
        options: KindOptions,
    ) -> Result<KindMaker>
    where
        F: Fn(&[Value]) -> Result<Value> + 'static,
    {
        self.0
            .vom
            .define_kind(&self.0, Self::spec(tag, init, false, behavior, options))
    }

    pub fn define_kind_multi<F>(
        &self,
        tag: &str,
        init: F,
        behavior: Behavior,
        options: KindOptions,
    ) -> Result<KindMaker>
    where
        F: Fn(&[Value]) -> Result<Value> + 'static,
    {
        self.0
            .vom
            .define_kind(&self.0, Self::spec(tag, init, true, behavior, options))
    }

    /// A durable token naming a kind that must be redefined, with the same
    /// facet layout, in every later incarnation.
    pub fn make_kind_handle(&self, tag: &str) -> Result<Handle> {
        self.0.vom.make_kind_handle(&self.0, tag)
    }

    pub fn define_durable_kind<F>(
        &self,
        kind_handle: &Handle,
        init: F,
        behavior: Behavior,
        options: KindOptions,
    ) -> Result<KindMaker>
    where
        F: Fn(&[Value]) -> Result<Value> + 'static,
    {
        let spec = Self::spec("", init, false, behavior, options);
        self.0.vom.define_durable_kind(&self.0, kind_handle, spec)
    }

    pub fn define_durable_kind_multi<F>(
        &self,
        kind_handle: &Handle,
        init: F,
        behavior: Behavior,
        options: KindOptions,
    ) -> Result<KindMaker>
    where
        F: Fn(&[Value]) -> Result<Value> + 'static,
    {
        let spec = Self::spec("", init, true, behavior, options);
        self.0.vom.define_durable_kind(&self.0, kind_handle, spec)
    }

    pub fn insist_all_durable_kinds_reconnected(&self) -> Result<()> {
        self.0.vom.insist_all_durable_kinds_reconnected()
    }

    // ------------------------------------------------------------------
    // Diagnostics
    // ------------------------------------------------------------------

    /// Number of stored-data references to the object `vref` names.
    pub fn ref_count(&self, vref: &str) -> Result<u64> {
        let parsed = parse_vat_slot(vref)?;
        self.0.vrm.get_ref_count(&parsed.base_ref)
    }

    pub fn is_recognizable(&self, vref: &str) -> Result<bool> {
        self.0.vrm.is_vref_recognizable(vref)
    }

    /// Number of in-memory representatives still alive.
    pub fn live_representatives(&self) -> usize {
        self.0.registry.live_count()
    }

    pub fn retention_stats(&self) -> RetentionStats {
        self.0.vrm.retention_stats()
    }
}

impl std::fmt::Debug for VirtualRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualRuntime")
            .field("config", &self.0.config)
            .field("live_representatives", &self.live_representatives())
            .finish()
    }
}
