//! Virtual reference manager.
//!
//! Tracks the three legs that keep a stored object alive (in-memory
//! representatives, references from stored data, and export status) and
//! the weaker notion of recognizability used by weak collections. Objects
//! whose legs may all have dropped are collected into the possibly-dead
//! set for the next collection pass.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::rc::{Rc, Weak};

use serde::{Deserialize, Serialize};
use tracing::{Level, event};

use crate::core::{Result, SlotType, StoreError, Value, make_facet_ref, parse_vat_slot};
use crate::handle::Handle;
use crate::runtime::RuntimeInner;
use crate::storage::{VatStore, enumerate_keys_with_prefix, prefixed_keys_exist};

/// Per-kind hooks used when a stored object has to be brought back into
/// memory or removed from the store.
pub(crate) trait KindBackend {
    fn reanimate(&self, rt: &Rc<RuntimeInner>, base_ref: &str) -> Result<Handle>;

    /// Remove the stored state of `base_ref`. Returns true when the removal
    /// released references that could make further collection worthwhile.
    fn delete_stored(&self, rt: &Rc<RuntimeInner>, base_ref: &str) -> Result<bool>;
}

#[derive(Clone)]
struct KindInfo {
    backend: Rc<dyn KindBackend>,
    durable: bool,
    facet_names: Option<Vec<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ExportStatus {
    Reachable,
    Recognizable,
    None,
}

impl ExportStatus {
    fn code(&self) -> char {
        match self {
            Self::Reachable => 'r',
            Self::Recognizable => 's',
            Self::None => 'n',
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum IdKind {
    Export,
    Collection,
    Promise,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IdCounters {
    #[serde(rename = "exportID")]
    export_id: u64,
    #[serde(rename = "collectionID")]
    collection_id: u64,
    #[serde(rename = "promiseID")]
    promise_id: u64,
}

impl Default for IdCounters {
    fn default() -> Self {
        Self {
            export_id: 1,
            collection_id: 1,
            promise_id: 5,
        }
    }
}

/// Sizes of the in-memory tables, for leak checks in tests and tooling.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetentionStats {
    pub remotable_refcounts: usize,
    pub possibly_dead: usize,
    pub possibly_retired: usize,
    pub kinds: usize,
}

/// Who can recognize a vref: a stored weak collection (recorded under
/// `vom.ir.`) or an in-memory weak table.
pub(crate) enum Recognizer {
    Collection(u64),
    Table(Rc<VrefTable>),
}

/// Vref-keyed side of an in-memory weak map or set. Sets keep no values.
pub(crate) struct VrefTable {
    id: u64,
    holds_values: bool,
    entries: RefCell<BTreeMap<String, Option<Value>>>,
}

impl VrefTable {
    pub fn get(&self, vref: &str) -> Option<Option<Value>> {
        self.entries.borrow().get(vref).cloned()
    }

    pub fn contains(&self, vref: &str) -> bool {
        self.entries.borrow().contains_key(vref)
    }

    pub fn insert(&self, vref: String, value: Option<Value>) -> bool {
        self.entries.borrow_mut().insert(vref, value).is_none()
    }

    pub fn remove(&self, vref: &str) -> bool {
        let removed = self.entries.borrow_mut().remove(vref);
        removed.is_some()
    }

    pub fn vrefs(&self) -> Vec<String> {
        self.entries.borrow().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    /// Drop the entry for a vref nobody can name any more. Returns true
    /// when a value was released with it.
    fn forget(&self, vref: &str) -> bool {
        let removed = self.entries.borrow_mut().remove(vref);
        removed.is_some() && self.holds_values
    }
}

pub(crate) struct VirtualReferenceManager {
    store: VatStore,
    relax_durability_rules: bool,
    kinds: RefCell<HashMap<u64, KindInfo>>,
    /// Remotables and promises referenced from stored data, held strongly.
    remotable_refcounts: RefCell<BTreeMap<String, (Handle, u64)>>,
    possibly_dead: RefCell<BTreeSet<String>>,
    possibly_retired: RefCell<BTreeSet<String>>,
    /// In-memory weak tables that recognize each vref, by table id.
    vref_recognizers: RefCell<BTreeMap<String, BTreeMap<u64, Weak<VrefTable>>>>,
    next_table_id: Cell<u64>,
    id_counters: RefCell<Option<IdCounters>>,
    id_counters_dirty: Cell<bool>,
}

impl VirtualReferenceManager {
    pub fn new(store: VatStore, relax_durability_rules: bool) -> Self {
        Self {
            store,
            relax_durability_rules,
            kinds: RefCell::new(HashMap::new()),
            remotable_refcounts: RefCell::new(BTreeMap::new()),
            possibly_dead: RefCell::new(BTreeSet::new()),
            possibly_retired: RefCell::new(BTreeSet::new()),
            vref_recognizers: RefCell::new(BTreeMap::new()),
            next_table_id: Cell::new(1),
            id_counters: RefCell::new(None),
            id_counters_dirty: Cell::new(false),
        }
    }

    // ------------------------------------------------------------------
    // ID allocation
    // ------------------------------------------------------------------

    fn load_id_counters(&self) -> Result<()> {
        if self.id_counters.borrow().is_some() {
            return Ok(());
        }
        let counters = match self.store.get("idCounters")? {
            Some(raw) => serde_json::from_str(&raw)?,
            None => IdCounters::default(),
        };
        *self.id_counters.borrow_mut() = Some(counters);
        Ok(())
    }

    pub fn allocate_next_id(&self, kind: IdKind) -> Result<u64> {
        self.load_id_counters()?;
        let mut guard = self.id_counters.borrow_mut();
        let counters = guard
            .as_mut()
            .ok_or_else(|| StoreError::Invariant("id counters not loaded".to_string()))?;
        let slot = match kind {
            IdKind::Export => &mut counters.export_id,
            IdKind::Collection => &mut counters.collection_id,
            IdKind::Promise => &mut counters.promise_id,
        };
        let id = *slot;
        *slot += 1;
        self.id_counters_dirty.set(true);
        Ok(id)
    }

    pub fn flush_id_counters(&self) -> Result<()> {
        if !self.id_counters_dirty.get() {
            return Ok(());
        }
        if let Some(counters) = self.id_counters.borrow().as_ref() {
            self.store.set("idCounters", &serde_json::to_string(counters)?)?;
        }
        self.id_counters_dirty.set(false);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Kinds
    // ------------------------------------------------------------------

    pub fn register_kind(&self, kind_id: u64, backend: Rc<dyn KindBackend>, durable: bool) {
        self.kinds.borrow_mut().insert(
            kind_id,
            KindInfo {
                backend,
                durable,
                facet_names: None,
            },
        );
    }

    pub fn remember_facet_names(&self, kind_id: u64, facet_names: Vec<String>) -> Result<()> {
        let mut kinds = self.kinds.borrow_mut();
        let info = kinds
            .get_mut(&kind_id)
            .ok_or_else(|| StoreError::Invariant(format!("no kind {} to name facets for", kind_id)))?;
        info.facet_names = Some(facet_names);
        Ok(())
    }

    pub fn facet_names(&self, kind_id: u64) -> Option<Vec<String>> {
        self.kinds
            .borrow()
            .get(&kind_id)
            .and_then(|info| info.facet_names.clone())
    }

    fn facet_count(&self, kind_id: u64) -> usize {
        self.facet_names(kind_id).map(|names| names.len()).unwrap_or(1)
    }

    fn backend(&self, kind_id: u64) -> Result<Rc<dyn KindBackend>> {
        self.kinds
            .borrow()
            .get(&kind_id)
            .map(|info| Rc::clone(&info.backend))
            .ok_or_else(|| StoreError::UnknownReference(format!("unknown kind ID {}", kind_id)))
    }

    pub fn is_kind_durable(&self, kind_id: u64) -> Option<bool> {
        self.kinds.borrow().get(&kind_id).map(|info| info.durable)
    }

    /// Build a fresh in-memory representative for a stored object.
    pub fn reanimate(&self, rt: &Rc<RuntimeInner>, base_ref: &str) -> Result<Handle> {
        let parsed = parse_vat_slot(base_ref)?;
        let backend = self.backend(parsed.id)?;
        backend.reanimate(rt, base_ref)
    }

    /// Whether `vref` may be stored in durable data.
    pub fn is_durable(&self, vref: &str) -> Result<bool> {
        let parsed = parse_vat_slot(vref)?;
        Ok(match parsed.slot_type {
            _ if self.relax_durability_rules => true,
            SlotType::Promise => false,
            SlotType::Device => true,
            SlotType::Object if !parsed.allocated_by_vat => true,
            SlotType::Object if parsed.is_stored() => {
                self.is_kind_durable(parsed.id).unwrap_or(parsed.durable)
            }
            SlotType::Object => false,
        })
    }

    // ------------------------------------------------------------------
    // Reference counts
    // ------------------------------------------------------------------

    pub fn get_ref_count(&self, base_ref: &str) -> Result<u64> {
        match self.store.get(&format!("vom.rc.{}", base_ref))? {
            Some(raw) => raw
                .parse()
                .map_err(|_| StoreError::Storage(format!("bad refcount {:?} for {}", raw, base_ref))),
            None => Ok(0),
        }
    }

    fn set_ref_count(&self, base_ref: &str, count: u64) -> Result<()> {
        let key = format!("vom.rc.{}", base_ref);
        if count == 0 {
            self.store.delete(&key)?;
            self.add_to_possibly_dead(base_ref);
        } else {
            self.store.set(&key, &count.to_string())?;
        }
        Ok(())
    }

    fn inc_ref_count(&self, base_ref: &str) -> Result<()> {
        let old = self.get_ref_count(base_ref)?;
        self.set_ref_count(base_ref, old + 1)
    }

    fn dec_ref_count(&self, base_ref: &str) -> Result<()> {
        let old = self.get_ref_count(base_ref)?;
        if old == 0 {
            return Err(StoreError::Invariant(format!(
                "attempt to decref {} below 0",
                base_ref
            )));
        }
        self.set_ref_count(base_ref, old - 1)
    }

    /// A reference to `vref` was written into stored data.
    pub fn add_reachable_vref(&self, rt: &Rc<RuntimeInner>, vref: &str) -> Result<()> {
        let parsed = parse_vat_slot(vref)?;
        match parsed.slot_type {
            SlotType::Object if parsed.allocated_by_vat && !parsed.is_stored() => {
                self.incref_remotable(rt, vref)
            }
            SlotType::Object => self.inc_ref_count(&parsed.base_ref),
            SlotType::Promise => self.incref_remotable(rt, vref),
            SlotType::Device => Ok(()),
        }
    }

    fn incref_remotable(&self, rt: &Rc<RuntimeInner>, vref: &str) -> Result<()> {
        let mut counts = self.remotable_refcounts.borrow_mut();
        if let Some(entry) = counts.get_mut(vref) {
            entry.1 += 1;
            return Ok(());
        }
        let handle = rt.required_val_for_slot(vref)?;
        counts.insert(vref.to_string(), (handle, 1));
        Ok(())
    }

    /// A stored reference to `vref` was removed. Returns true if an
    /// in-memory strong reference was released as a result.
    pub fn remove_reachable_vref(&self, vref: &str) -> Result<bool> {
        let parsed = parse_vat_slot(vref)?;
        match parsed.slot_type {
            SlotType::Object if parsed.allocated_by_vat && !parsed.is_stored() => {
                self.decref_remotable(vref)
            }
            SlotType::Object => {
                self.dec_ref_count(&parsed.base_ref)?;
                Ok(false)
            }
            SlotType::Promise => self.decref_remotable(vref),
            SlotType::Device => Ok(false),
        }
    }

    fn decref_remotable(&self, vref: &str) -> Result<bool> {
        let released = {
            let mut counts = self.remotable_refcounts.borrow_mut();
            match counts.get_mut(vref) {
                None => {
                    return Err(StoreError::Invariant(format!(
                        "attempt to decref {} below 0",
                        vref
                    )));
                }
                Some(entry) if entry.1 > 1 => {
                    entry.1 -= 1;
                    None
                }
                Some(_) => counts.remove(vref),
            }
        };
        // the handle is dropped here, outside the borrow
        Ok(released.is_some())
    }

    /// Adjust refcounts for a stored value whose slots changed from
    /// `before` to `after`. Slots present in both are left alone.
    pub fn update_reference_counts(
        &self,
        rt: &Rc<RuntimeInner>,
        before: &[String],
        after: &[String],
    ) -> Result<()> {
        #[derive(PartialEq)]
        enum Change {
            Drop,
            Keep,
            Add,
        }
        let mut status: BTreeMap<&str, Change> = BTreeMap::new();
        for vref in before {
            status.insert(vref, Change::Drop);
        }
        for vref in after {
            match status.get(vref.as_str()) {
                Some(Change::Drop) => {
                    status.insert(vref, Change::Keep);
                }
                Some(_) => {}
                None => {
                    status.insert(vref, Change::Add);
                }
            }
        }
        for (vref, change) in status {
            match change {
                Change::Add => self.add_reachable_vref(rt, vref)?,
                Change::Drop => {
                    self.remove_reachable_vref(vref)?;
                }
                Change::Keep => {}
            }
        }
        Ok(())
    }

    pub fn is_presence_reachable(&self, vref: &str) -> Result<bool> {
        Ok(self.get_ref_count(vref)? > 0)
    }

    // ------------------------------------------------------------------
    // Export status
    // ------------------------------------------------------------------

    fn export_status_raw(&self, base_ref: &str) -> Result<String> {
        Ok(self
            .store
            .get(&format!("vom.es.{}", base_ref))?
            .unwrap_or_default())
    }

    pub fn set_export_status(&self, vref: &str, status: ExportStatus) -> Result<()> {
        let parsed = parse_vat_slot(vref)?;
        let key = format!("vom.es.{}", parsed.base_ref);
        let mut codes: Vec<char> = self.export_status_raw(&parsed.base_ref)?.chars().collect();
        let facets = self.facet_count(parsed.id);
        while codes.len() < facets {
            codes.push('n');
        }
        let index = parsed.facet.unwrap_or(0);
        if index >= codes.len() {
            return Err(StoreError::Invariant(format!("facet index out of range in {}", vref)));
        }
        codes[index] = status.code();
        let encoded: String = codes.iter().collect();
        event!(Level::DEBUG, vref = %vref, status = %encoded, "export status");

        match status {
            ExportStatus::Recognizable => {
                self.store.set(&key, &encoded)?;
                if self.get_ref_count(&parsed.base_ref)? == 0 && !codes.contains(&'r') {
                    self.add_to_possibly_dead(&parsed.base_ref);
                }
            }
            ExportStatus::Reachable => self.store.set(&key, &encoded)?,
            ExportStatus::None => {
                if codes.iter().all(|c| *c == 'n') {
                    self.store.delete(&key)?;
                } else {
                    self.store.set(&key, &encoded)?;
                }
            }
        }
        Ok(())
    }

    pub fn is_virtual_object_reachable(&self, base_ref: &str) -> Result<bool> {
        let exported = self.export_status_raw(base_ref)?.contains('r');
        Ok(exported || self.get_ref_count(base_ref)? > 0)
    }

    /// Delete a stored object that has lost all its legs. Returns whether
    /// more collection may be needed, and the facet vrefs that were still
    /// recognizable by the kernel and must now be retired.
    pub fn delete_virtual_object(
        &self,
        rt: &Rc<RuntimeInner>,
        base_ref: &str,
    ) -> Result<(bool, Vec<String>)> {
        let parsed = parse_vat_slot(base_ref)?;
        let status = self.export_status_raw(base_ref)?;
        if status.contains('r') || self.get_ref_count(base_ref)? > 0 {
            return Err(StoreError::Invariant(format!(
                "attempt to delete reachable object {}",
                base_ref
            )));
        }
        let faceted = self.facet_names(parsed.id).is_some();
        let retirees: Vec<String> = status
            .chars()
            .enumerate()
            .filter(|(_, code)| *code == 's')
            .map(|(i, _)| {
                if faceted {
                    make_facet_ref(base_ref, i)
                } else {
                    base_ref.to_string()
                }
            })
            .collect();

        event!(Level::DEBUG, base_ref = %base_ref, "deleting stored object");
        let backend = self.backend(parsed.id)?;
        let mut do_more = backend.delete_stored(rt, base_ref)?;
        self.store.delete(&format!("vom.rc.{}", base_ref))?;
        self.store.delete(&format!("vom.es.{}", base_ref))?;
        do_more = self.cease_recognition(rt, base_ref)? || do_more;
        Ok((do_more, retirees))
    }

    // ------------------------------------------------------------------
    // Recognizability
    // ------------------------------------------------------------------

    /// Allocate the identity of a new in-memory weak collection.
    pub fn new_vref_table(&self, holds_values: bool) -> Rc<VrefTable> {
        let id = self.next_table_id.get();
        self.next_table_id.set(id + 1);
        Rc::new(VrefTable {
            id,
            holds_values,
            entries: RefCell::new(BTreeMap::new()),
        })
    }

    /// Record that `recognizer` can recognize `value`. Stored weak
    /// collections record every object key, in-memory tables skip local
    /// remotables, which they hold by identity instead.
    pub fn add_recognizable_value(&self, value: &Handle, recognizer: &Recognizer) -> Result<()> {
        let Some(vref) = value.vref() else {
            return Ok(());
        };
        let parsed = parse_vat_slot(&vref)?;
        if parsed.slot_type != SlotType::Object {
            return Ok(());
        }
        let not_remotable = !parsed.allocated_by_vat || parsed.is_stored();
        match recognizer {
            Recognizer::Collection(collection_id) => {
                self.store.set(&format!("vom.ir.{}|{}", vref, collection_id), "1")?;
            }
            Recognizer::Table(table) if not_remotable => {
                self.vref_recognizers
                    .borrow_mut()
                    .entry(vref)
                    .or_default()
                    .insert(table.id, Rc::downgrade(table));
            }
            Recognizer::Table(_) => {}
        }
        Ok(())
    }

    pub fn remove_recognizable_vref(&self, vref: &str, recognizer: &Recognizer) -> Result<()> {
        let parsed = parse_vat_slot(vref)?;
        if parsed.slot_type != SlotType::Object {
            return Ok(());
        }
        let is_presence = !parsed.allocated_by_vat;
        let not_remotable = is_presence || parsed.is_stored();
        match recognizer {
            Recognizer::Collection(collection_id) => {
                self.store.delete(&format!("vom.ir.{}|{}", vref, collection_id))?;
                if is_presence {
                    self.possibly_retired.borrow_mut().insert(vref.to_string());
                }
            }
            Recognizer::Table(table) if not_remotable => {
                let mut recognizers = self.vref_recognizers.borrow_mut();
                let now_empty = match recognizers
                    .get_mut(vref)
                    .and_then(|tables| tables.remove(&table.id).map(|_| tables.is_empty()))
                {
                    Some(now_empty) => now_empty,
                    None => {
                        return Err(StoreError::Invariant(format!(
                            "{} was not recognized by weak table {}",
                            vref, table.id
                        )));
                    }
                };
                if now_empty {
                    recognizers.remove(vref);
                    if is_presence {
                        self.possibly_retired.borrow_mut().insert(vref.to_string());
                    }
                }
            }
            Recognizer::Table(_) => {}
        }
        Ok(())
    }

    pub fn remove_recognizable_value(&self, value: &Handle, recognizer: &Recognizer) -> Result<()> {
        match value.vref() {
            Some(vref) => self.remove_recognizable_vref(&vref, recognizer),
            None => Ok(()),
        }
    }

    pub fn is_vref_recognizable(&self, vref: &str) -> Result<bool> {
        if self.vref_recognizers.borrow().contains_key(vref) {
            return Ok(true);
        }
        prefixed_keys_exist(&self.store, &format!("vom.ir.{}|", vref))
    }

    /// Remove `vref` from every weak collection that recognizes it. A bare
    /// base ref of a multi-facet cohort covers each of its facets.
    pub fn cease_recognition(&self, rt: &Rc<RuntimeInner>, vref: &str) -> Result<bool> {
        let parsed = parse_vat_slot(vref)?;
        if parsed.allocated_by_vat && parsed.is_stored() && parsed.facet.is_none() {
            if let Some(names) = self.facet_names(parsed.id) {
                let mut do_more = false;
                for i in 0..names.len() {
                    do_more = self.cease_recognition(rt, &make_facet_ref(vref, i))? || do_more;
                }
                return Ok(do_more);
            }
        }
        let mut do_more = false;

        let tables = self.vref_recognizers.borrow_mut().remove(vref);
        for table in tables.into_iter().flat_map(BTreeMap::into_values) {
            if let Some(table) = table.upgrade() {
                do_more = table.forget(vref) || do_more;
            }
        }

        for key in enumerate_keys_with_prefix(&self.store, &format!("vom.ir.{}|", vref))? {
            self.store.delete(&key)?;
            let collection_id = key
                .rsplit('|')
                .next()
                .and_then(|id| id.parse::<u64>().ok())
                .ok_or_else(|| StoreError::Storage(format!("bad recognizer key {}", key)))?;
            do_more = rt.collections.delete_collection_entry(collection_id, vref)? || do_more;
        }
        Ok(do_more)
    }

    // ------------------------------------------------------------------
    // Collection bookkeeping
    // ------------------------------------------------------------------

    pub fn add_to_possibly_dead(&self, base_ref: &str) {
        self.possibly_dead.borrow_mut().insert(base_ref.to_string());
    }

    pub fn take_possibly_dead(&self) -> BTreeSet<String> {
        std::mem::take(&mut *self.possibly_dead.borrow_mut())
    }

    pub fn take_possibly_retired(&self) -> BTreeSet<String> {
        std::mem::take(&mut *self.possibly_retired.borrow_mut())
    }

    pub fn has_possibly_dead(&self) -> bool {
        !self.possibly_dead.borrow().is_empty()
    }

    pub fn retention_stats(&self) -> RetentionStats {
        RetentionStats {
            remotable_refcounts: self.remotable_refcounts.borrow().len(),
            possibly_dead: self.possibly_dead.borrow().len(),
            possibly_retired: self.possibly_retired.borrow().len(),
            kinds: self.kinds.borrow().len(),
        }
    }
}
