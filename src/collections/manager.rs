//! Store kinds, collection creation and deletion, and the per-collection
//! core that all typed store wrappers delegate to.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap};
use std::rc::{Rc, Weak};

use serde_json::{Map, Value as Json};
use tracing::{Level, event};

use crate::core::{Result, StoreError, Value, make_base_ref, parse_vat_slot};
use crate::handle::{Handle, HandleBody};
use crate::marshal::{
    CapData, decode_key, encode_key, encode_remotable_key, is_encoded_remotable, zero_pad,
};
use crate::pattern::Pattern;
use crate::runtime::RuntimeInner;
use crate::storage::{Cache, CacheBacking, KeyRange, VatStore, enumerate_keys_with_prefix};
use crate::vrm::{IdKind, KindBackend, Recognizer};

/// The eight flavors of collection, each with its own persisted kind id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StoreKind {
    MapStore,
    WeakMapStore,
    SetStore,
    WeakSetStore,
    DurableMapStore,
    DurableWeakMapStore,
    DurableSetStore,
    DurableWeakSetStore,
}

impl StoreKind {
    pub const ALL: [StoreKind; 8] = [
        Self::MapStore,
        Self::WeakMapStore,
        Self::SetStore,
        Self::WeakSetStore,
        Self::DurableMapStore,
        Self::DurableWeakMapStore,
        Self::DurableSetStore,
        Self::DurableWeakSetStore,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::MapStore => "scalarMapStore",
            Self::WeakMapStore => "scalarWeakMapStore",
            Self::SetStore => "scalarSetStore",
            Self::WeakSetStore => "scalarWeakSetStore",
            Self::DurableMapStore => "scalarDurableMapStore",
            Self::DurableWeakMapStore => "scalarDurableWeakMapStore",
            Self::DurableSetStore => "scalarDurableSetStore",
            Self::DurableWeakSetStore => "scalarDurableWeakSetStore",
        }
    }

    pub fn is_durable(&self) -> bool {
        matches!(
            self,
            Self::DurableMapStore
                | Self::DurableWeakMapStore
                | Self::DurableSetStore
                | Self::DurableWeakSetStore
        )
    }

    pub fn has_weak_keys(&self) -> bool {
        matches!(
            self,
            Self::WeakMapStore
                | Self::WeakSetStore
                | Self::DurableWeakMapStore
                | Self::DurableWeakSetStore
        )
    }

    pub fn is_set(&self) -> bool {
        matches!(
            self,
            Self::SetStore | Self::WeakSetStore | Self::DurableSetStore | Self::DurableWeakSetStore
        )
    }

    pub(crate) fn select(set: bool, weak: bool, durable: bool) -> Self {
        match (set, weak, durable) {
            (false, false, false) => Self::MapStore,
            (false, true, false) => Self::WeakMapStore,
            (true, false, false) => Self::SetStore,
            (true, true, false) => Self::WeakSetStore,
            (false, false, true) => Self::DurableMapStore,
            (false, true, true) => Self::DurableWeakMapStore,
            (true, false, true) => Self::DurableSetStore,
            (true, true, true) => Self::DurableWeakSetStore,
        }
    }
}

#[derive(Clone)]
struct Schema {
    key_shape: Pattern,
    value_shape: Option<Pattern>,
    label: String,
    capdata: CapData,
}

struct SchemaBacking {
    rt: Weak<RuntimeInner>,
    store: VatStore,
}

impl SchemaBacking {
    fn key(collection_id: &str, suffix: &str) -> String {
        format!("vc.{}.|{}", collection_id, suffix)
    }
}

impl CacheBacking<Schema> for SchemaBacking {
    fn read(&self, collection_id: &str) -> Result<Option<Schema>> {
        let Some(raw) = self.store.get(&Self::key(collection_id, "schemata"))? else {
            return Ok(None);
        };
        let rt = self
            .rt
            .upgrade()
            .ok_or_else(|| StoreError::Invariant("runtime dropped".to_string()))?;
        let capdata = CapData::from_json(&raw)?;
        let decoded = rt.unserialize(&capdata)?;
        let shapes = decoded
            .as_list()
            .ok_or_else(|| StoreError::Serialization(format!("bad schemata for collection {}", collection_id)))?;
        let key_shape = match shapes.first() {
            Some(shape) => Pattern::from_value(shape)?,
            None => Pattern::Scalar,
        };
        let value_shape = shapes.get(1).map(Pattern::from_value).transpose()?;
        let label = self
            .store
            .get(&Self::key(collection_id, "label"))?
            .unwrap_or_default();
        Ok(Some(Schema {
            key_shape,
            value_shape,
            label,
            capdata,
        }))
    }

    fn write(&self, collection_id: &str, schema: &Schema) -> Result<()> {
        self.store
            .set(&Self::key(collection_id, "schemata"), &schema.capdata.to_json()?)?;
        self.store.set(&Self::key(collection_id, "label"), &schema.label)
    }

    fn delete(&self, collection_id: &str) -> Result<()> {
        self.store.delete(&Self::key(collection_id, "schemata"))?;
        self.store.delete(&Self::key(collection_id, "label"))
    }
}

struct CollectionKindBackend;

impl KindBackend for CollectionKindBackend {
    fn reanimate(&self, rt: &Rc<RuntimeInner>, base_ref: &str) -> Result<Handle> {
        rt.collections.reanimate_collection(base_ref)
    }

    fn delete_stored(&self, rt: &Rc<RuntimeInner>, base_ref: &str) -> Result<bool> {
        rt.collections.delete_collection(base_ref)
    }
}

pub(crate) struct CollectionManager {
    rt: Weak<RuntimeInner>,
    store: VatStore,
    max_key_length: usize,
    kind_ids: RefCell<BTreeMap<StoreKind, u64>>,
    kinds_by_id: RefCell<HashMap<u64, StoreKind>>,
    schema_cache: RefCell<Cache<Schema>>,
    /// Virtual collections of this incarnation, by collection id.
    virtual_collections: RefCell<BTreeMap<u64, String>>,
}

impl CollectionManager {
    pub fn new(rt: Weak<RuntimeInner>, store: VatStore, max_key_length: usize) -> Self {
        let backing = SchemaBacking {
            rt: rt.clone(),
            store: store.clone(),
        };
        Self {
            rt,
            store,
            max_key_length,
            kind_ids: RefCell::new(BTreeMap::new()),
            kinds_by_id: RefCell::new(HashMap::new()),
            schema_cache: RefCell::new(Cache::new(backing)),
            virtual_collections: RefCell::new(BTreeMap::new()),
        }
    }

    fn runtime(&self) -> Result<Rc<RuntimeInner>> {
        self.rt
            .upgrade()
            .ok_or_else(|| StoreError::Invariant("runtime dropped".to_string()))
    }

    /// Assign (or reload) the kind id of every store kind and register
    /// each one with the reference manager.
    pub fn initialize_store_kinds(&self, rt: &RuntimeInner) -> Result<()> {
        let mut table: Map<String, Json> = match self.store.get("storeKindIDTable")? {
            Some(raw) => serde_json::from_str(&raw)?,
            None => Map::new(),
        };
        let backend: Rc<dyn KindBackend> = Rc::new(CollectionKindBackend);
        for kind in StoreKind::ALL {
            let kind_id = match table.get(kind.name()).and_then(Json::as_u64) {
                Some(id) => id,
                None => {
                    let id = rt.vrm.allocate_next_id(IdKind::Export)?;
                    table.insert(kind.name().to_string(), Json::from(id));
                    id
                }
            };
            self.kind_ids.borrow_mut().insert(kind, kind_id);
            self.kinds_by_id.borrow_mut().insert(kind_id, kind);
            rt.vrm.register_kind(kind_id, Rc::clone(&backend), kind.is_durable());
        }
        self.store
            .set("storeKindIDTable", &serde_json::to_string(&table)?)
    }

    fn kind_id(&self, kind: StoreKind) -> Result<u64> {
        self.kind_ids
            .borrow()
            .get(&kind)
            .copied()
            .ok_or_else(|| StoreError::Invariant(format!("store kind {} not initialized", kind.name())))
    }

    fn kind_for_id(&self, kind_id: u64) -> Result<StoreKind> {
        self.kinds_by_id
            .borrow()
            .get(&kind_id)
            .copied()
            .ok_or_else(|| StoreError::UnknownReference(format!("kind {} is not a store kind", kind_id)))
    }

    fn schema(&self, collection_id: u64) -> Result<Option<Schema>> {
        self.schema_cache
            .try_borrow_mut()
            .map_err(|_| StoreError::Invariant("re-entrant schema lookup".to_string()))?
            .get(&collection_id.to_string())
    }

    pub fn flush_schema_cache(&self) -> Result<()> {
        self.schema_cache.borrow_mut().flush()
    }

    pub fn make_collection(
        &self,
        rt: &Rc<RuntimeInner>,
        label: &str,
        kind: StoreKind,
        key_shape: Option<Pattern>,
        value_shape: Option<Pattern>,
    ) -> Result<Handle> {
        let key_shape = key_shape.unwrap_or(Pattern::Scalar);
        let mut shapes = vec![key_shape.to_value()];
        if let Some(shape) = &value_shape {
            shapes.push(shape.to_value());
        }
        let capdata = rt.serialize(&Value::List(shapes))?;
        if kind.is_durable() {
            for (i, vref) in capdata.slots.iter().enumerate() {
                if !rt.vrm.is_durable(vref)? {
                    return Err(StoreError::NotDurable(format!(
                        "schema for collection \"{}\" is not durable: slot {} of {}",
                        label, i, capdata.body
                    )));
                }
            }
        }

        let collection_id = rt.vrm.allocate_next_id(IdKind::Collection)?;
        let base_ref = make_base_ref(self.kind_id(kind)?, collection_id, kind.is_durable());
        let prefix = format!("vc.{}.", collection_id);
        self.store.set(&format!("{}|nextOrdinal", prefix), "1")?;
        if !kind.has_weak_keys() {
            self.store.set(&format!("{}|entryCount", prefix), "0")?;
        }
        let schema = Schema {
            key_shape,
            value_shape,
            label: label.to_string(),
            capdata,
        };
        self.schema_cache
            .borrow_mut()
            .set(&collection_id.to_string(), schema.clone());
        if !kind.is_durable() {
            self.virtual_collections
                .borrow_mut()
                .insert(collection_id, base_ref.clone());
        }
        event!(Level::DEBUG, base_ref = %base_ref, label = %label, kind = kind.name(), "collection created");

        let handle = self.summon(collection_id, kind, schema);
        rt.register_value(&base_ref, &handle)?;
        Ok(handle)
    }

    fn summon(&self, collection_id: u64, kind: StoreKind, schema: Schema) -> Handle {
        let core = CollectionCore {
            rt: self.rt.clone(),
            store: self.store.clone(),
            max_key_length: self.max_key_length,
            collection_id,
            kind,
            label: schema.label,
            key_shape: schema.key_shape,
            value_shape: schema.value_shape,
            generation: Cell::new(0),
        };
        Handle::new(kind.name(), HandleBody::Store(Rc::new(core)))
    }

    fn reanimate_collection(&self, base_ref: &str) -> Result<Handle> {
        let parsed = parse_vat_slot(base_ref)?;
        let kind = self.kind_for_id(parsed.id)?;
        let collection_id = parsed
            .subid
            .ok_or_else(|| StoreError::UnknownReference(format!("{} is not a collection", base_ref)))?;
        let schema = self
            .schema(collection_id)?
            .ok_or_else(|| StoreError::UnknownReference(format!("collection {} does not exist", base_ref)))?;
        Ok(self.summon(collection_id, kind, schema))
    }

    /// Delete a collection with all its entries and metadata. Returns
    /// false without doing anything if the collection is already gone.
    pub fn delete_collection(&self, base_ref: &str) -> Result<bool> {
        let parsed = parse_vat_slot(base_ref)?;
        let kind = self.kind_for_id(parsed.id)?;
        let collection_id = parsed
            .subid
            .ok_or_else(|| StoreError::UnknownReference(format!("{} is not a collection", base_ref)))?;
        let Some(schema) = self.schema(collection_id)? else {
            return Ok(false);
        };

        let handle = self.summon(collection_id, kind, schema);
        let HandleBody::Store(core) = handle.body() else {
            return Err(StoreError::Invariant("summoned collection has no core".to_string()));
        };
        let do_more = core.clear_all(true)?;
        for key in enumerate_keys_with_prefix(&self.store, &format!("vc.{}.|", collection_id))? {
            self.store.delete(&key)?;
        }
        self.schema_cache
            .borrow_mut()
            .delete(&collection_id.to_string());
        self.virtual_collections.borrow_mut().remove(&collection_id);
        event!(Level::DEBUG, base_ref = %base_ref, "collection deleted");
        Ok(do_more)
    }

    /// Remove the entry keyed by `vref` from weak collection
    /// `collection_id`, as part of retiring that vref.
    pub fn delete_collection_entry(&self, collection_id: u64, vref: &str) -> Result<bool> {
        let rt = self.runtime()?;
        let ordinal_key = format!("vc.{}.|{}", collection_id, vref);
        let Some(raw_ordinal) = self.store.get(&ordinal_key)? else {
            return Ok(false);
        };
        self.store.delete(&ordinal_key)?;
        let ordinal: u64 = raw_ordinal
            .parse()
            .map_err(|_| StoreError::Storage(format!("bad ordinal {:?}", raw_ordinal)))?;
        let record_key = format!("vc.{}.r{}:{}", collection_id, zero_pad(ordinal), vref);
        let mut do_more = false;
        if let Some(raw) = self.store.get(&record_key)? {
            let value = CapData::from_json(&raw)?;
            for slot in &value.slots {
                do_more = rt.vrm.remove_reachable_vref(slot)? || do_more;
            }
            self.store.delete(&record_key)?;
        }
        Ok(do_more)
    }

    pub fn delete_all_virtual_collections(&self) -> Result<()> {
        let collections: Vec<String> = self.virtual_collections.borrow().values().cloned().collect();
        for base_ref in collections {
            self.delete_collection(&base_ref)?;
        }
        Ok(())
    }

    /// The root durable map, created on first use.
    pub fn provide_baggage(&self, rt: &Rc<RuntimeInner>) -> Result<Handle> {
        if let Some(vref) = self.store.get("baggageID")? {
            return rt.convert_slot_to_val(&vref, "");
        }
        let baggage = self.make_collection(
            rt,
            "baggage",
            StoreKind::DurableMapStore,
            Some(Pattern::string()),
            None,
        )?;
        let vref = rt.convert_val_to_slot(&baggage)?;
        self.store.set("baggageID", &vref)?;
        // pinned so it is never collected
        rt.vrm.add_reachable_vref(rt, &vref)?;
        Ok(baggage)
    }
}

/// Shared implementation behind every store wrapper.
pub(crate) struct CollectionCore {
    rt: Weak<RuntimeInner>,
    store: VatStore,
    max_key_length: usize,
    collection_id: u64,
    kind: StoreKind,
    label: String,
    key_shape: Pattern,
    value_shape: Option<Pattern>,
    /// Bumped on every insertion, to detect additions during iteration.
    generation: Cell<u64>,
}

impl CollectionCore {
    fn runtime(&self) -> Result<Rc<RuntimeInner>> {
        self.rt
            .upgrade()
            .ok_or_else(|| StoreError::Invariant("runtime dropped".to_string()))
    }

    pub fn kind(&self) -> StoreKind {
        self.kind
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    fn recognizer(&self) -> Recognizer {
        Recognizer::Collection(self.collection_id)
    }

    fn prefix(&self, suffix: &str) -> String {
        format!("vc.{}.{}", self.collection_id, suffix)
    }

    fn invalid_key_label(&self) -> String {
        format!("invalid key type for collection \"{}\"", self.label)
    }

    fn not_found(&self, key: &Value) -> StoreError {
        StoreError::KeyNotFound {
            key: key.to_string(),
            label: self.label.clone(),
        }
    }

    fn ordinal_of(&self, vref: &str) -> Result<Option<u64>> {
        match self.store.get(&self.prefix(&format!("|{}", vref)))? {
            Some(raw) => raw
                .parse()
                .map(Some)
                .map_err(|_| StoreError::Storage(format!("bad ordinal {:?}", raw))),
            None => Ok(None),
        }
    }

    fn next_ordinal(&self) -> Result<u64> {
        Ok(self
            .store
            .get(&self.prefix("|nextOrdinal"))?
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(1))
    }

    fn assign_ordinal(&self, vref: &str, ordinal: u64) -> Result<()> {
        self.store.set(&self.prefix(&format!("|{}", vref)), &ordinal.to_string())?;
        self.store
            .set(&self.prefix("|nextOrdinal"), &(ordinal + 1).to_string())
    }

    fn check_key_length(&self, encoded: &str, key: &Value) -> Result<()> {
        if encoded.len() >= self.max_key_length {
            return Err(StoreError::KeyTooLarge(format!(
                "{} bytes for key {}",
                encoded.len(),
                key
            )));
        }
        Ok(())
    }

    /// Storage key for `key`, or `None` for a reference that has never
    /// been used as a key here.
    fn db_key(&self, rt: &RuntimeInner, key: &Value) -> Result<Option<String>> {
        let mut missing = false;
        let encoded = encode_key(key, &mut |handle| {
            let vref = rt.convert_val_to_slot(handle)?;
            match self.ordinal_of(&vref)? {
                Some(ordinal) => Ok(encode_remotable_key(ordinal, &vref)),
                None => {
                    missing = true;
                    Ok(String::new())
                }
            }
        })?;
        if missing {
            return Ok(None);
        }
        self.check_key_length(&encoded, key)?;
        Ok(Some(self.prefix(&encoded)))
    }

    fn decode_db_key(&self, rt: &Rc<RuntimeInner>, db_key: &str) -> Result<Value> {
        let encoded = &db_key[self.prefix("").len()..];
        decode_key(encoded, &mut |vref| Ok(Value::Ref(rt.convert_slot_to_val(vref, "")?)))
    }

    fn check_value(&self, value: &Value) -> Result<()> {
        match &self.value_shape {
            Some(shape) => shape.must_match(
                value,
                &format!("invalid value type for collection \"{}\"", self.label),
            ),
            None => Ok(()),
        }
    }

    fn serialize_value(&self, rt: &RuntimeInner, value: &Value) -> Result<CapData> {
        self.check_value(value)?;
        let capdata = rt.serialize(value)?;
        if self.kind.is_durable() {
            for (i, vref) in capdata.slots.iter().enumerate() {
                if !rt.vrm.is_durable(vref)? {
                    return Err(StoreError::NotDurable(format!(
                        "value is not durable: {} at slot {} of {}",
                        value, i, capdata.body
                    )));
                }
            }
        }
        Ok(capdata)
    }

    fn update_entry_count(&self, delta: i64) -> Result<()> {
        if self.kind.has_weak_keys() {
            return Ok(());
        }
        let key = self.prefix("|entryCount");
        let count: i64 = self
            .store
            .get(&key)?
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(0);
        self.store.set(&key, &(count + delta).to_string())
    }

    pub fn has(&self, key: &Value) -> Result<bool> {
        if !self.key_shape.matches(key) {
            return Ok(false);
        }
        let rt = self.runtime()?;
        match self.db_key(&rt, key)? {
            Some(db_key) => self.store.has(&db_key),
            None => Ok(false),
        }
    }

    pub fn get(&self, key: &Value) -> Result<Value> {
        self.key_shape.must_match(key, &self.invalid_key_label())?;
        let rt = self.runtime()?;
        let db_key = self.db_key(&rt, key)?.ok_or_else(|| self.not_found(key))?;
        let raw = self.store.get(&db_key)?.ok_or_else(|| self.not_found(key))?;
        rt.unserialize(&CapData::from_json(&raw)?)
    }

    pub fn init(&self, key: &Value, value: &Value) -> Result<()> {
        self.key_shape.must_match(key, &self.invalid_key_label())?;
        if self.has(key)? {
            return Err(StoreError::KeyAlreadyRegistered {
                key: key.to_string(),
                label: self.label.clone(),
            });
        }
        let rt = self.runtime()?;
        let capdata = self.serialize_value(&rt, value)?;

        // everything is checked before the first write
        let (db_key, new_ref) = match key {
            Value::Ref(handle) => {
                let vref = rt.convert_val_to_slot(handle)?;
                if self.kind.is_durable() && !rt.vrm.is_durable(&vref)? {
                    return Err(StoreError::NotDurable(format!(
                        "key ({}) is not durable in {}",
                        key, value
                    )));
                }
                let ordinal = self.next_ordinal()?;
                let encoded = encode_remotable_key(ordinal, &vref);
                self.check_key_length(&encoded, key)?;
                (self.prefix(&encoded), Some((handle, vref, ordinal)))
            }
            _ => (self.db_key(&rt, key)?.ok_or_else(|| self.not_found(key))?, None),
        };

        self.generation.set(self.generation.get() + 1);
        if let Some((handle, vref, ordinal)) = new_ref {
            self.assign_ordinal(&vref, ordinal)?;
            if self.kind.has_weak_keys() {
                rt.vrm.add_recognizable_value(handle, &self.recognizer())?;
            } else {
                rt.vrm.add_reachable_vref(&rt, &vref)?;
            }
        }
        for vref in &capdata.slots {
            rt.vrm.add_reachable_vref(&rt, vref)?;
        }
        self.store.set(&db_key, &capdata.to_json()?)?;
        self.update_entry_count(1)
    }

    pub fn set(&self, key: &Value, value: &Value) -> Result<()> {
        self.key_shape.must_match(key, &self.invalid_key_label())?;
        let rt = self.runtime()?;
        let after = self.serialize_value(&rt, value)?;
        let db_key = self.db_key(&rt, key)?.ok_or_else(|| self.not_found(key))?;
        let raw = self.store.get(&db_key)?.ok_or_else(|| self.not_found(key))?;
        let before = CapData::from_json(&raw)?;
        rt.vrm.update_reference_counts(&rt, &before.slots, &after.slots)?;
        self.store.set(&db_key, &after.to_json()?)
    }

    fn delete_internal(&self, rt: &Rc<RuntimeInner>, key: &Value) -> Result<bool> {
        self.key_shape.must_match(key, &self.invalid_key_label())?;
        let db_key = self.db_key(rt, key)?.ok_or_else(|| self.not_found(key))?;
        let raw = self.store.get(&db_key)?.ok_or_else(|| self.not_found(key))?;
        let value = CapData::from_json(&raw)?;
        let mut do_more = false;
        for vref in &value.slots {
            do_more = rt.vrm.remove_reachable_vref(vref)? || do_more;
        }
        self.store.delete(&db_key)?;
        if let Value::Ref(handle) = key {
            let vref = rt.convert_val_to_slot(handle)?;
            self.store.delete(&self.prefix(&format!("|{}", vref)))?;
            if self.kind.has_weak_keys() {
                rt.vrm.remove_recognizable_vref(&vref, &self.recognizer())?;
            } else {
                do_more = rt.vrm.remove_reachable_vref(&vref)? || do_more;
            }
        }
        Ok(do_more)
    }

    pub fn delete(&self, key: &Value) -> Result<()> {
        let rt = self.runtime()?;
        self.delete_internal(&rt, key)?;
        self.update_entry_count(-1)
    }

    /// Remove every entry without decoding keys. Used both for an
    /// unfiltered `clear` and when the collection itself is deleted.
    fn clear_all(&self, deleting: bool) -> Result<bool> {
        let rt = self.runtime()?;
        let (start, end) = Pattern::Any.rank_cover();
        let mut range = KeyRange::new(&self.store, self.prefix(&start), self.prefix(&end));
        let entry_prefix_len = self.prefix("").len();
        let mut do_more = false;
        while let Some(db_key) = range.next_key()? {
            if let Some(raw) = self.store.get(&db_key)? {
                let value = CapData::from_json(&raw)?;
                for vref in &value.slots {
                    do_more = rt.vrm.remove_reachable_vref(vref)? || do_more;
                }
            }
            self.store.delete(&db_key)?;
            let encoded = &db_key[entry_prefix_len..];
            if is_encoded_remotable(encoded) {
                let vref = encoded
                    .split_once(':')
                    .map(|(_, vref)| vref.to_string())
                    .ok_or_else(|| StoreError::Storage(format!("bad reference key {}", db_key)))?;
                if self.kind.has_weak_keys() {
                    rt.vrm.remove_recognizable_vref(&vref, &self.recognizer())?;
                } else {
                    do_more = rt.vrm.remove_reachable_vref(&vref)? || do_more;
                }
                self.store.delete(&self.prefix(&format!("|{}", vref)))?;
            }
        }
        if !deleting && !self.kind.has_weak_keys() {
            self.store.set(&self.prefix("|entryCount"), "0")?;
        }
        Ok(do_more)
    }

    pub fn clear(self: &Rc<Self>, key_patt: &Pattern, value_patt: &Pattern) -> Result<()> {
        if matches!(key_patt, Pattern::Any) && matches!(value_patt, Pattern::Any) {
            self.clear_all(false)?;
            return Ok(());
        }
        let rt = self.runtime()?;
        let keys: Vec<Value> = self
            .walk(key_patt.clone(), value_patt.clone(), true, false)
            .map(|entry| entry.map(|(key, _)| key.unwrap_or(Value::Null)))
            .collect::<Result<_>>()?;
        for key in &keys {
            self.delete_internal(&rt, key)?;
        }
        self.update_entry_count(-(keys.len() as i64))
    }

    pub fn size(self: &Rc<Self>, key_patt: &Pattern, value_patt: &Pattern) -> Result<u64> {
        if matches!(key_patt, Pattern::Any) && matches!(value_patt, Pattern::Any) {
            let raw = self.store.get(&self.prefix("|entryCount"))?.unwrap_or_default();
            return raw
                .parse()
                .map_err(|_| StoreError::Storage(format!("bad entry count {:?}", raw)));
        }
        let mut count = 0;
        for entry in self.walk(key_patt.clone(), value_patt.clone(), true, false) {
            entry?;
            count += 1;
        }
        Ok(count)
    }

    pub(crate) fn walk(
        self: &Rc<Self>,
        key_patt: Pattern,
        value_patt: Pattern,
        yield_keys: bool,
        yield_values: bool,
    ) -> RawEntries {
        let (start, end) = key_patt.rank_cover();
        RawEntries {
            core: Rc::clone(self),
            range: KeyRange::new(&self.store, self.prefix(&start), self.prefix(&end)),
            generation_at_start: self.generation.get(),
            started: false,
            need_keys: yield_keys || !matches!(key_patt, Pattern::Any),
            need_values: yield_values || !matches!(value_patt, Pattern::Any),
            key_patt,
            value_patt,
        }
    }
}

/// Lazy walk over a collection's entries, filtered by patterns.
pub(crate) struct RawEntries {
    core: Rc<CollectionCore>,
    range: KeyRange,
    generation_at_start: u64,
    started: bool,
    need_keys: bool,
    need_values: bool,
    key_patt: Pattern,
    value_patt: Pattern,
}

impl RawEntries {
    fn step(&mut self) -> Result<Option<(Option<Value>, Option<Value>)>> {
        if self.started && self.core.generation.get() != self.generation_at_start {
            return Err(StoreError::ConcurrentModification);
        }
        self.started = true;
        let rt = self.core.runtime()?;
        while let Some(db_key) = self.range.next_key()? {
            let key = if self.need_keys {
                Some(self.core.decode_db_key(&rt, &db_key)?)
            } else {
                None
            };
            if let Some(key) = &key {
                if !self.key_patt.matches(key) {
                    continue;
                }
            }
            let value = if self.need_values {
                let raw = self
                    .core
                    .store
                    .get(&db_key)?
                    .ok_or_else(|| StoreError::Storage(format!("entry {} vanished", db_key)))?;
                Some(rt.unserialize(&CapData::from_json(&raw)?)?)
            } else {
                None
            };
            if let Some(value) = &value {
                if !self.value_patt.matches(value) {
                    continue;
                }
            }
            return Ok(Some((key, value)));
        }
        Ok(None)
    }
}

impl Iterator for RawEntries {
    type Item = Result<(Option<Value>, Option<Value>)>;

    fn next(&mut self) -> Option<Self::Item> {
        self.step().transpose()
    }
}
