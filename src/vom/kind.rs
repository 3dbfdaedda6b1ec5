//! Kinds and their instances.
//!
//! A [`KindDefinition`] owns the behavior, init and finish hooks of one
//! kind and serves as the reanimation backend for its stored instances.
//! Instance state lives in the manager's data cache as a record of
//! per-property capdata; method calls receive a [`Context`] built lazily
//! per instance per turn.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::{Rc, Weak};

use im::OrdMap;
use tracing::{Level, event};

use super::behavior::{Behavior, PropertyKey};
use crate::core::{Result, StoreError, Value, make_base_ref};
use crate::handle::{Handle, HandleBody};
use crate::marshal::CapData;
use crate::pattern::Pattern;
use crate::runtime::RuntimeInner;
use crate::storage::{Cache, CacheBacking, VatStore};
use crate::vrm::KindBackend;

pub type InitFn = Rc<dyn Fn(&[Value]) -> Result<Value>>;
pub type FinishFn = Rc<dyn Fn(&Context) -> Result<()>>;

/// Optional hooks and constraints for a kind.
#[derive(Clone, Default)]
pub struct KindOptions {
    pub(crate) finish: Option<FinishFn>,
    pub(crate) state_shape: Option<BTreeMap<String, Pattern>>,
}

impl KindOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called once with the new instance's context, right after creation.
    pub fn finish<F>(mut self, f: F) -> Self
    where
        F: Fn(&Context) -> Result<()> + 'static,
    {
        self.finish = Some(Rc::new(f));
        self
    }

    /// Restrict state to these properties, each matching its pattern.
    pub fn state_shape<K, I>(mut self, shape: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Pattern)>,
    {
        self.state_shape = Some(shape.into_iter().map(|(k, p)| (k.into(), p)).collect());
        self
    }
}

impl fmt::Debug for KindOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KindOptions")
            .field("finish", &self.finish.is_some())
            .field("state_shape", &self.state_shape)
            .finish()
    }
}

/// Cached state of one instance: serialized properties plus whatever has
/// been unserialized this turn.
#[derive(Clone, Default)]
pub(crate) struct StateRecord {
    capdatas: OrdMap<String, CapData>,
    values: OrdMap<String, Value>,
}

pub(crate) struct StateBacking {
    pub(crate) store: VatStore,
}

impl CacheBacking<StateRecord> for StateBacking {
    fn read(&self, base_ref: &str) -> Result<Option<StateRecord>> {
        let Some(raw) = self.store.get(&format!("vom.{}", base_ref))? else {
            return Ok(None);
        };
        let capdatas: OrdMap<String, CapData> = serde_json::from_str(&raw)?;
        Ok(Some(StateRecord {
            capdatas,
            values: OrdMap::new(),
        }))
    }

    fn write(&self, base_ref: &str, record: &StateRecord) -> Result<()> {
        self.store
            .set(&format!("vom.{}", base_ref), &serde_json::to_string(&record.capdatas)?)
    }

    fn delete(&self, base_ref: &str) -> Result<()> {
        self.store.delete(&format!("vom.{}", base_ref))
    }
}

struct ContextBacking {
    kind: Weak<KindDefinition>,
}

impl CacheBacking<Context> for ContextBacking {
    fn read(&self, base_ref: &str) -> Result<Option<Context>> {
        let kind = self
            .kind
            .upgrade()
            .ok_or_else(|| StoreError::Invariant("kind definition dropped".to_string()))?;
        let rt = kind.runtime()?;
        let cohort = rt.get_val_for_slot(base_ref).ok_or_else(|| {
            StoreError::Invariant(format!("no representative for {}", base_ref))
        })?;
        let target = match &kind.facet_names {
            Some(names) => ContextTarget::Multi(Facets {
                cohort,
                names: Rc::clone(names),
            }),
            None => ContextTarget::Single(cohort),
        };
        Ok(Some(Context {
            state: State {
                kind,
                base_ref: Rc::from(base_ref),
            },
            target,
        }))
    }

    // contexts are never written back
    fn write(&self, _base_ref: &str, _context: &Context) -> Result<()> {
        Ok(())
    }

    fn delete(&self, _base_ref: &str) -> Result<()> {
        Ok(())
    }
}

#[derive(Clone)]
enum ContextTarget {
    Single(Handle),
    Multi(Facets),
}

/// What a method sees: the instance state and either the instance itself
/// or its full set of facets.
#[derive(Clone)]
pub struct Context {
    state: State,
    target: ContextTarget,
}

impl Context {
    pub fn state(&self) -> &State {
        &self.state
    }

    /// The instance, for single-facet kinds.
    pub fn self_ref(&self) -> Option<&Handle> {
        match &self.target {
            ContextTarget::Single(handle) => Some(handle),
            ContextTarget::Multi(_) => None,
        }
    }

    /// All facets of the instance, for multi-facet kinds.
    pub fn facets(&self) -> Option<&Facets> {
        match &self.target {
            ContextTarget::Single(_) => None,
            ContextTarget::Multi(facets) => Some(facets),
        }
    }
}

/// The named facets of one multi-facet instance.
#[derive(Clone)]
pub struct Facets {
    cohort: Handle,
    names: Rc<[String]>,
}

impl Facets {
    pub fn get(&self, name: &str) -> Option<Handle> {
        let index = self.names.iter().position(|n| n == name)?;
        Some(self.cohort.with_facet(index))
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Handle)> + '_ {
        self.names
            .iter()
            .enumerate()
            .map(|(i, name)| (name.as_str(), self.cohort.with_facet(i)))
    }
}

impl fmt::Debug for Facets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Facets")
            .field("cohort", &self.cohort)
            .field("names", &self.names)
            .finish()
    }
}

/// Accessor for one instance's state properties.
///
/// Reads unserialize lazily and are memoized for the rest of the turn.
/// Writes are checked against the kind's state shape and, for durable
/// kinds, against the durability of every embedded reference.
#[derive(Clone)]
pub struct State {
    kind: Rc<KindDefinition>,
    base_ref: Rc<str>,
}

impl State {
    pub fn get(&self, prop: &str) -> Result<Value> {
        let rt = self.kind.runtime()?;
        let cached = rt.vom.with_state(&self.base_ref, |record| {
            match record.values.get(prop) {
                Some(value) => Ok(Some(value.clone())),
                None => match record.capdatas.get(prop) {
                    Some(capdata) => Err(capdata.clone()),
                    None => Ok(None),
                },
            }
        })?;
        let capdata = match cached {
            Ok(Some(value)) => return Ok(value),
            Ok(None) => return Err(self.no_such_prop(prop)),
            Err(capdata) => capdata,
        };
        let value = rt.unserialize(&capdata)?;
        self.kind.check_state_value(prop, &value)?;
        rt.vom.with_state(&self.base_ref, |record| {
            record.values.insert(prop.to_string(), value.clone());
        })?;
        Ok(value)
    }

    pub fn set(&self, prop: &str, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        let rt = self.kind.runtime()?;
        self.kind.check_state_value(prop, &value)?;
        let before = rt
            .vom
            .with_state(&self.base_ref, |record| record.capdatas.get(prop).cloned())?;
        let before = match before {
            Some(capdata) => capdata.slots,
            None if self.kind.state_shape.is_some() => Vec::new(),
            None => return Err(self.no_such_prop(prop)),
        };
        let after = self.kind.serialize_prop(&rt, prop, &value)?;
        rt.vrm.update_reference_counts(&rt, &before, &after.slots)?;
        rt.vom.update_state(&self.base_ref, |record| {
            record.capdatas.insert(prop.to_string(), after);
            record.values.insert(prop.to_string(), value);
        })
    }

    /// Names of the properties this instance currently holds.
    pub fn props(&self) -> Result<Vec<String>> {
        let rt = self.kind.runtime()?;
        rt.vom
            .with_state(&self.base_ref, |record| record.capdatas.keys().cloned().collect())
    }

    fn no_such_prop(&self, prop: &str) -> StoreError {
        StoreError::StateAccess(format!(
            "{} has no state property \"{}\"",
            self.kind.tag, prop
        ))
    }
}

impl fmt::Debug for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "State({})", self.base_ref)
    }
}

pub(crate) struct KindDefinition {
    rt: Weak<RuntimeInner>,
    this: Weak<KindDefinition>,
    kind_id: u64,
    tag: String,
    durable: bool,
    facet_names: Option<Rc<[String]>>,
    behavior: Behavior,
    init: Option<InitFn>,
    finish: Option<FinishFn>,
    state_shape: Option<BTreeMap<String, Pattern>>,
    label_instances: bool,
    context_cache: RefCell<Cache<Context>>,
}

pub(crate) struct KindParams {
    pub kind_id: u64,
    pub tag: String,
    pub durable: bool,
    pub facet_names: Option<Vec<String>>,
    pub behavior: Behavior,
    pub init: Option<InitFn>,
    pub options: KindOptions,
    pub label_instances: bool,
}

impl KindDefinition {
    pub(crate) fn new(rt: Weak<RuntimeInner>, params: KindParams) -> Rc<Self> {
        Rc::new_cyclic(|this| Self {
            rt,
            this: this.clone(),
            kind_id: params.kind_id,
            tag: params.tag,
            durable: params.durable,
            facet_names: params.facet_names.map(Rc::from),
            behavior: params.behavior,
            init: params.init,
            finish: params.options.finish,
            state_shape: params.options.state_shape,
            label_instances: params.label_instances,
            context_cache: RefCell::new(Cache::new(ContextBacking { kind: this.clone() })),
        })
    }

    fn runtime(&self) -> Result<Rc<RuntimeInner>> {
        self.rt
            .upgrade()
            .ok_or_else(|| StoreError::Invariant("runtime dropped".to_string()))
    }

    fn this(&self) -> Result<Rc<KindDefinition>> {
        self.this
            .upgrade()
            .ok_or_else(|| StoreError::Invariant("kind definition dropped".to_string()))
    }

    pub(crate) fn tag(&self) -> &str {
        &self.tag
    }

    pub(crate) fn flush_contexts(&self) -> Result<()> {
        let mut cache = self.context_cache.try_borrow_mut().map_err(|_| {
            StoreError::Invariant(format!("context cache of {} is busy", self.tag))
        })?;
        cache.flush()
    }

    fn context(&self, base_ref: &str) -> Result<Context> {
        let cached = self
            .context_cache
            .try_borrow_mut()
            .map_err(|_| StoreError::Invariant(format!("context cache of {} is busy", self.tag)))?
            .get(base_ref)?;
        cached.ok_or_else(|| StoreError::Invariant(format!("no context for {}", base_ref)))
    }

    fn check_state_value(&self, prop: &str, value: &Value) -> Result<()> {
        let Some(shape) = &self.state_shape else {
            return Ok(());
        };
        match shape.get(prop) {
            Some(pattern) => pattern.must_match(value, prop),
            None => Err(StoreError::StateAccess(format!(
                "State must only have fields described by stateShape: [{}]",
                shape.keys().cloned().collect::<Vec<_>>().join(",")
            ))),
        }
    }

    fn serialize_prop(&self, rt: &RuntimeInner, prop: &str, value: &Value) -> Result<CapData> {
        let capdata = rt.serialize(value)?;
        if self.durable {
            for (i, vref) in capdata.slots.iter().enumerate() {
                if !rt.vrm.is_durable(vref)? {
                    return Err(StoreError::NotDurable(format!(
                        "value for \"{}\" is not durable: slot {} of {}",
                        prop, i, capdata.body
                    )));
                }
            }
        }
        Ok(capdata)
    }

    fn make_representative(&self, base_ref: &str) -> Result<Handle> {
        let iface = if self.label_instances {
            format!("{}#{}", self.tag, base_ref)
        } else {
            self.tag.clone()
        };
        Ok(Handle::new(iface, HandleBody::Instance(self.this()?)))
    }

    /// Create, store and register a new instance. Returns its cohort.
    pub(crate) fn make_new_instance(&self, args: &[Value]) -> Result<Handle> {
        let rt = self.runtime()?;
        let instance_id = rt.vom.next_instance_id(self.kind_id, self.durable)?;
        let base_ref = make_base_ref(self.kind_id, instance_id, self.durable);

        let initial = match &self.init {
            Some(init) => init(args)?,
            None => Value::Record(BTreeMap::new()),
        };
        let Value::Record(props) = initial else {
            return Err(StoreError::InvalidBehavior(format!(
                "initial data must be a record, not {}",
                initial
            )));
        };

        let mut record = StateRecord::default();
        for (prop, value) in props {
            self.check_state_value(&prop, &value)?;
            let capdata = self.serialize_prop(&rt, &prop, &value)?;
            record.capdatas.insert(prop.clone(), capdata);
            record.values.insert(prop, value);
        }
        for capdata in record.capdatas.values() {
            for vref in &capdata.slots {
                rt.vrm.add_reachable_vref(&rt, vref)?;
            }
        }
        rt.vom.set_state(&base_ref, record)?;

        let cohort = self.make_representative(&base_ref)?;
        rt.register_value(&base_ref, &cohort)?;
        event!(Level::TRACE, base_ref = %base_ref, tag = %self.tag, "instance created");

        if let Some(finish) = &self.finish {
            let context = self.context(&base_ref)?;
            finish(&context)?;
        }
        Ok(cohort)
    }

    /// Route a method call on `receiver` to the matching behavior entry.
    pub(crate) fn invoke(
        &self,
        receiver: &Handle,
        key: &PropertyKey,
        args: &[Value],
    ) -> Result<Value> {
        let bag = match (&self.facet_names, receiver.facet()) {
            (None, None) => &self.behavior,
            (Some(names), Some(index)) => names
                .get(index)
                .and_then(|name| self.behavior.facet_bag(name))
                .ok_or_else(|| {
                    StoreError::Invariant(format!("{} has no facet {}", self.tag, index))
                })?,
            (Some(_), None) => {
                return Err(StoreError::Method(format!(
                    "{} cohort has no methods; call a facet",
                    self.tag
                )));
            }
            (None, Some(index)) => {
                return Err(StoreError::Invariant(format!(
                    "{} is unfaceted but got facet {}",
                    self.tag, index
                )));
            }
        };
        let method = bag.lookup_method(key).cloned().ok_or_else(|| {
            StoreError::Method(format!("{} has no method {}", receiver.iface(), key))
        })?;
        let base_ref = receiver.base_ref().ok_or_else(|| {
            StoreError::Invariant(format!("{} instance without a vref", self.tag))
        })?;
        let context = self.context(&base_ref)?;
        method(&context, args)
    }

    /// `Some(facet)` when `handle` is an instance of this kind.
    fn membership(&self, handle: &Handle) -> Option<Option<usize>> {
        match handle.body() {
            HandleBody::Instance(kind) if std::ptr::eq(Rc::as_ptr(kind), self) => {
                Some(handle.facet())
            }
            _ => None,
        }
    }
}

impl KindBackend for KindDefinition {
    fn reanimate(&self, _rt: &Rc<RuntimeInner>, base_ref: &str) -> Result<Handle> {
        self.make_representative(base_ref)
    }

    fn delete_stored(&self, rt: &Rc<RuntimeInner>, base_ref: &str) -> Result<bool> {
        let slots: Vec<String> = rt
            .vom
            .with_state(base_ref, |record| {
                record
                    .capdatas
                    .values()
                    .flat_map(|capdata| capdata.slots.iter().cloned())
                    .collect()
            })?;
        let mut do_more = false;
        for vref in &slots {
            do_more = rt.vrm.remove_reachable_vref(vref)? || do_more;
        }
        rt.vom.delete_state(base_ref)?;
        Ok(do_more)
    }
}

/// Maker returned from a kind definition.
#[derive(Clone)]
pub struct KindMaker {
    kind: Rc<KindDefinition>,
}

impl KindMaker {
    pub(crate) fn new(kind: Rc<KindDefinition>) -> Self {
        Self { kind }
    }

    pub fn tag(&self) -> &str {
        self.kind.tag()
    }

    pub fn is_multifaceted(&self) -> bool {
        self.kind.facet_names.is_some()
    }

    /// Make an instance of a single-facet kind.
    pub fn make(&self, args: &[Value]) -> Result<Handle> {
        if self.is_multifaceted() {
            return Err(StoreError::InvalidBehavior(format!(
                "{} is multi-faceted; use make_kit",
                self.kind.tag
            )));
        }
        self.kind.make_new_instance(args)
    }

    /// Make an instance of a multi-facet kind and return all its facets.
    pub fn make_kit(&self, args: &[Value]) -> Result<Facets> {
        let Some(names) = &self.kind.facet_names else {
            return Err(StoreError::InvalidBehavior(format!(
                "{} is single-faceted; use make",
                self.kind.tag
            )));
        };
        let cohort = self.kind.make_new_instance(args)?;
        Ok(Facets {
            cohort,
            names: Rc::clone(names),
        })
    }

    /// Recover every facet of the instance `facet` belongs to.
    pub fn amplify(&self, facet: &Handle) -> Result<Facets> {
        let Some(names) = &self.kind.facet_names else {
            return Err(StoreError::InvalidBehavior(format!(
                "only multi-faceted kinds can amplify, not \"{}\"",
                self.kind.tag
            )));
        };
        match self.kind.membership(facet) {
            Some(Some(index)) if index < names.len() => Ok(Facets {
                cohort: facet.cohort(),
                names: Rc::clone(names),
            }),
            _ => Err(StoreError::FacetMismatch(format!(
                "Must be a facet of \"{}\": {}",
                self.kind.tag,
                facet.iface()
            ))),
        }
    }

    /// Whether `handle` is an instance of this kind. For multi-facet kinds
    /// `facet_name` narrows the check to one facet.
    pub fn is_instance(&self, handle: &Handle, facet_name: Option<&str>) -> Result<bool> {
        let membership = self.kind.membership(handle);
        match (&self.kind.facet_names, facet_name) {
            (None, None) => Ok(membership == Some(None)),
            (None, Some(_)) => Err(StoreError::InvalidBehavior(format!(
                "facet name can only be used with multi-faceted kind, not \"{}\"",
                self.kind.tag
            ))),
            (Some(names), None) => Ok(matches!(membership, Some(Some(i)) if i < names.len())),
            (Some(names), Some(name)) => {
                let wanted = names.iter().position(|n| n == name).ok_or_else(|| {
                    StoreError::InvalidBehavior(format!(
                        "kind \"{}\" has no facet named \"{}\"",
                        self.kind.tag, name
                    ))
                })?;
                Ok(membership == Some(Some(wanted)))
            }
        }
    }
}

impl fmt::Debug for KindMaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KindMaker")
            .field("tag", &self.kind.tag)
            .field("kind_id", &self.kind.kind_id)
            .field("durable", &self.kind.durable)
            .finish()
    }
}
