use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use super::kind::Context;
use crate::core::{Result, Value};

/// Method of a virtual object. Receives the instance context (state plus
/// self or facets) and the call arguments.
pub type Method = Rc<dyn Fn(&Context, &[Value]) -> Result<Value>>;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PropertyKey {
    Name(String),
    Symbol(String),
}

impl fmt::Display for PropertyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Name(name) => write!(f, "{:?}", name),
            Self::Symbol(symbol) => write!(f, "[Symbol({})]", symbol),
        }
    }
}

#[derive(Clone)]
pub enum BehaviorEntry {
    Method(Method),
    Facet(Behavior),
    Data(Value),
}

/// A bag of methods, or for multi-facet kinds a bag of named facet bags.
#[derive(Clone, Default)]
pub struct Behavior {
    entries: BTreeMap<PropertyKey, BehaviorEntry>,
}

impl Behavior {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn method<F>(mut self, name: &str, f: F) -> Self
    where
        F: Fn(&Context, &[Value]) -> Result<Value> + 'static,
    {
        self.entries
            .insert(PropertyKey::Name(name.to_string()), BehaviorEntry::Method(Rc::new(f)));
        self
    }

    pub fn symbol_method<F>(mut self, symbol: &str, f: F) -> Self
    where
        F: Fn(&Context, &[Value]) -> Result<Value> + 'static,
    {
        self.entries
            .insert(PropertyKey::Symbol(symbol.to_string()), BehaviorEntry::Method(Rc::new(f)));
        self
    }

    pub fn facet(mut self, name: &str, behavior: Behavior) -> Self {
        self.entries
            .insert(PropertyKey::Name(name.to_string()), BehaviorEntry::Facet(behavior));
        self
    }

    /// A non-function property. Kinds reject behaviors containing these.
    pub fn data(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.entries
            .insert(PropertyKey::Name(name.to_string()), BehaviorEntry::Data(value.into()));
        self
    }

    pub fn entries(&self) -> impl Iterator<Item = (&PropertyKey, &BehaviorEntry)> {
        self.entries.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn lookup_method(&self, key: &PropertyKey) -> Option<&Method> {
        match self.entries.get(key) {
            Some(BehaviorEntry::Method(method)) => Some(method),
            _ => None,
        }
    }

    pub(crate) fn facet_bag(&self, name: &str) -> Option<&Behavior> {
        match self.entries.get(&PropertyKey::Name(name.to_string())) {
            Some(BehaviorEntry::Facet(bag)) => Some(bag),
            _ => None,
        }
    }

    /// String-keyed entry names, sorted.
    pub(crate) fn names(&self) -> Vec<String> {
        self.entries
            .keys()
            .filter_map(|key| match key {
                PropertyKey::Name(name) => Some(name.clone()),
                PropertyKey::Symbol(_) => None,
            })
            .collect()
    }
}

impl fmt::Debug for Behavior {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let keys: Vec<String> = self.entries.keys().map(|k| k.to_string()).collect();
        f.debug_struct("Behavior").field("entries", &keys).finish()
    }
}
