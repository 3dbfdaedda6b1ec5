//! In-memory references to objects.
//!
//! A [`Handle`] is what user code holds: a local far object, an imported
//! presence, a promise, a virtual object representative, or a store.
//! Identity is pointer identity of the shared inner allocation, plus the
//! facet index for members of a multi-facet cohort.
//!
//! When the last clone of an inner allocation goes away, its base ref is
//! pushed onto the runtime's finalization queue. The next collection pass
//! picks it up from there.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::{Rc, Weak};

use crate::collections::CollectionCore;
use crate::core::{Result, StoreError, Value, make_facet_ref};
use crate::vom::{KindDefinition, PropertyKey};

pub type FarMethod = Rc<dyn Fn(&[Value]) -> Result<Value>>;

/// Method table of an ordinary in-memory object.
#[derive(Clone, Default)]
pub struct FarBehavior {
    methods: BTreeMap<String, FarMethod>,
}

impl FarBehavior {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn method<F>(mut self, name: &str, f: F) -> Self
    where
        F: Fn(&[Value]) -> Result<Value> + 'static,
    {
        self.methods.insert(name.to_string(), Rc::new(f));
        self
    }

    fn get(&self, name: &str) -> Option<&FarMethod> {
        self.methods.get(name)
    }
}

pub(crate) enum HandleBody {
    Far(FarBehavior),
    Presence,
    Promise,
    Device,
    Instance(Rc<KindDefinition>),
    Store(Rc<CollectionCore>),
    KindHandle { kind_id: u64 },
}

pub(crate) type FinalizationQueue = Rc<RefCell<Vec<String>>>;

struct FinalizerRegistration {
    queue: Weak<RefCell<Vec<String>>>,
    base_ref: String,
}

pub(crate) struct HandleInner {
    iface: String,
    body: HandleBody,
    slot: RefCell<Option<String>>,
    finalizer: RefCell<Option<FinalizerRegistration>>,
}

impl Drop for HandleInner {
    fn drop(&mut self) {
        if let Some(reg) = self.finalizer.get_mut().take() {
            if let Some(queue) = reg.queue.upgrade() {
                if let Ok(mut queue) = queue.try_borrow_mut() {
                    queue.push(reg.base_ref);
                }
            }
        }
    }
}

#[derive(Clone)]
pub struct Handle {
    inner: Rc<HandleInner>,
    facet: Option<usize>,
}

impl Handle {
    pub(crate) fn new(iface: impl Into<String>, body: HandleBody) -> Self {
        Self {
            inner: Rc::new(HandleInner {
                iface: iface.into(),
                body,
                slot: RefCell::new(None),
                finalizer: RefCell::new(None),
            }),
            facet: None,
        }
    }

    /// A local object that answers the methods in `behavior`.
    pub fn far(iface: &str, behavior: FarBehavior) -> Self {
        Self::new(iface, HandleBody::Far(behavior))
    }

    /// A promise allocated by this process.
    pub fn promise() -> Self {
        Self::new("Promise", HandleBody::Promise)
    }

    pub(crate) fn from_inner(inner: Rc<HandleInner>, facet: Option<usize>) -> Self {
        Self { inner, facet }
    }

    pub(crate) fn downgrade(&self) -> Weak<HandleInner> {
        Rc::downgrade(&self.inner)
    }

    pub(crate) fn with_facet(&self, facet: usize) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
            facet: Some(facet),
        }
    }

    /// The cohort this facet belongs to, or `self` for unfaceted handles.
    pub(crate) fn cohort(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
            facet: None,
        }
    }

    pub(crate) fn body(&self) -> &HandleBody {
        &self.inner.body
    }

    pub fn iface(&self) -> &str {
        &self.inner.iface
    }

    pub fn is_promise(&self) -> bool {
        matches!(self.inner.body, HandleBody::Promise)
    }

    pub fn facet(&self) -> Option<usize> {
        self.facet
    }

    /// True when both handles share one underlying object, regardless of
    /// which facet each one names.
    pub fn same_cohort(&self, other: &Handle) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn base_ref(&self) -> Option<String> {
        self.inner.slot.borrow().clone()
    }

    /// The vref this handle is known by, if it has been assigned one.
    pub fn vref(&self) -> Option<String> {
        let base = self.base_ref()?;
        Some(match self.facet {
            Some(facet) => make_facet_ref(&base, facet),
            None => base,
        })
    }

    pub(crate) fn set_base_ref(&self, base_ref: &str) {
        *self.inner.slot.borrow_mut() = Some(base_ref.to_string());
    }

    pub(crate) fn register_finalizer(&self, queue: &FinalizationQueue, base_ref: &str) {
        *self.inner.finalizer.borrow_mut() = Some(FinalizerRegistration {
            queue: Rc::downgrade(queue),
            base_ref: base_ref.to_string(),
        });
    }

    pub fn invoke(&self, method: &str, args: &[Value]) -> Result<Value> {
        self.dispatch(&PropertyKey::Name(method.to_string()), args)
    }

    /// Invoke a method keyed by a symbol rather than a string name.
    pub fn invoke_symbol(&self, symbol: &str, args: &[Value]) -> Result<Value> {
        self.dispatch(&PropertyKey::Symbol(symbol.to_string()), args)
    }

    fn dispatch(&self, key: &PropertyKey, args: &[Value]) -> Result<Value> {
        match &self.inner.body {
            HandleBody::Far(behavior) => {
                let method = match key {
                    PropertyKey::Name(name) => behavior.get(name),
                    PropertyKey::Symbol(_) => None,
                };
                match method {
                    Some(f) => f(args),
                    None => Err(self.no_method(key)),
                }
            }
            HandleBody::Instance(kind) => kind.invoke(self, key, args),
            _ => Err(self.no_method(key)),
        }
    }

    fn no_method(&self, key: &PropertyKey) -> StoreError {
        StoreError::Method(format!("{} has no method {}", self.iface(), key))
    }
}

impl PartialEq for Handle {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner) && self.facet == other.facet
    }
}

impl Eq for Handle {}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.vref() {
            Some(vref) => write!(f, "Handle({}, {})", self.iface(), vref),
            None => write!(f, "Handle({})", self.iface()),
        }
    }
}
