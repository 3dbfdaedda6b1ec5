//! Typed store handles.
//!
//! Each wrapper owns the store's [`Handle`], so holding a wrapper keeps the
//! store's representative alive just like holding any other reference.

use std::rc::Rc;

use super::manager::{CollectionCore, RawEntries, StoreKind};
use crate::core::{Result, StoreError, Value};
use crate::handle::{Handle, HandleBody};
use crate::pattern::Pattern;

/// Options for creating a store.
#[derive(Debug, Clone, Default)]
pub struct StoreOptions {
    pub key_shape: Option<Pattern>,
    pub value_shape: Option<Pattern>,
    pub durable: bool,
}

impl StoreOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    pub fn key_shape(mut self, shape: Pattern) -> Self {
        self.key_shape = Some(shape);
        self
    }

    pub fn value_shape(mut self, shape: Pattern) -> Self {
        self.value_shape = Some(shape);
        self
    }
}

fn core_of(handle: &Handle, set: bool, weak: bool) -> Result<Rc<CollectionCore>> {
    match handle.body() {
        HandleBody::Store(core)
            if core.kind().is_set() == set && core.kind().has_weak_keys() == weak =>
        {
            Ok(Rc::clone(core))
        }
        _ => Err(StoreError::TypeMismatch(format!(
            "{} is not a {}",
            handle.iface(),
            StoreKind::select(set, weak, false).name()
        ))),
    }
}

macro_rules! store_common {
    ($name:ident, $set:expr, $weak:expr) => {
        impl $name {
            pub(crate) fn from_handle(handle: Handle) -> Result<Self> {
                let core = core_of(&handle, $set, $weak)?;
                Ok(Self { handle, core })
            }

            pub fn handle(&self) -> &Handle {
                &self.handle
            }

            pub fn label(&self) -> &str {
                self.core.label()
            }

            pub fn is_durable(&self) -> bool {
                self.core.kind().is_durable()
            }

            pub fn has(&self, key: impl Into<Value>) -> Result<bool> {
                self.core.has(&key.into())
            }
        }

        impl From<$name> for Value {
            fn from(store: $name) -> Value {
                Value::Ref(store.handle)
            }
        }

        impl From<&$name> for Value {
            fn from(store: &$name) -> Value {
                Value::Ref(store.handle.clone())
            }
        }

        impl TryFrom<Value> for $name {
            type Error = StoreError;

            fn try_from(value: Value) -> Result<Self> {
                match value {
                    Value::Ref(handle) => Self::from_handle(handle),
                    other => Err(StoreError::TypeMismatch(format!(
                        "{} {} is not a store",
                        other.type_name(),
                        other
                    ))),
                }
            }
        }
    };
}

/// Ordered map from scalar keys to values.
#[derive(Clone)]
pub struct MapStore {
    handle: Handle,
    core: Rc<CollectionCore>,
}

store_common!(MapStore, false, false);

impl MapStore {
    pub fn get(&self, key: impl Into<Value>) -> Result<Value> {
        self.core.get(&key.into())
    }

    pub fn init(&self, key: impl Into<Value>, value: impl Into<Value>) -> Result<()> {
        self.core.init(&key.into(), &value.into())
    }

    pub fn set(&self, key: impl Into<Value>, value: impl Into<Value>) -> Result<()> {
        self.core.set(&key.into(), &value.into())
    }

    pub fn delete(&self, key: impl Into<Value>) -> Result<()> {
        self.core.delete(&key.into())
    }

    pub fn size(&self) -> Result<u64> {
        self.core.size(&Pattern::Any, &Pattern::Any)
    }

    pub fn size_matching(&self, key_patt: &Pattern, value_patt: &Pattern) -> Result<u64> {
        self.core.size(key_patt, value_patt)
    }

    pub fn keys(&self) -> Keys {
        self.keys_matching(Pattern::Any, Pattern::Any)
    }

    pub fn keys_matching(&self, key_patt: Pattern, value_patt: Pattern) -> Keys {
        Keys {
            _handle: self.handle.clone(),
            raw: self.core.walk(key_patt, value_patt, true, false),
        }
    }

    pub fn values(&self) -> Values {
        self.values_matching(Pattern::Any, Pattern::Any)
    }

    pub fn values_matching(&self, key_patt: Pattern, value_patt: Pattern) -> Values {
        Values {
            _handle: self.handle.clone(),
            raw: self.core.walk(key_patt, value_patt, false, true),
        }
    }

    pub fn entries(&self) -> Entries {
        self.entries_matching(Pattern::Any, Pattern::Any)
    }

    pub fn entries_matching(&self, key_patt: Pattern, value_patt: Pattern) -> Entries {
        Entries {
            _handle: self.handle.clone(),
            raw: self.core.walk(key_patt, value_patt, true, true),
        }
    }

    pub fn clear(&self) -> Result<()> {
        self.core.clear(&Pattern::Any, &Pattern::Any)
    }

    pub fn clear_matching(&self, key_patt: &Pattern, value_patt: &Pattern) -> Result<()> {
        self.core.clear(key_patt, value_patt)
    }

    pub fn snapshot(&self) -> Result<Vec<(Value, Value)>> {
        self.entries().collect()
    }
}

/// Map whose keys are held weakly: entries vanish when their key is
/// retired. Not iterable.
#[derive(Clone)]
pub struct WeakMapStore {
    handle: Handle,
    core: Rc<CollectionCore>,
}

store_common!(WeakMapStore, false, true);

impl WeakMapStore {
    pub fn get(&self, key: impl Into<Value>) -> Result<Value> {
        self.core.get(&key.into())
    }

    pub fn init(&self, key: impl Into<Value>, value: impl Into<Value>) -> Result<()> {
        self.core.init(&key.into(), &value.into())
    }

    pub fn set(&self, key: impl Into<Value>, value: impl Into<Value>) -> Result<()> {
        self.core.set(&key.into(), &value.into())
    }

    pub fn delete(&self, key: impl Into<Value>) -> Result<()> {
        self.core.delete(&key.into())
    }
}

/// Ordered set of scalar keys.
#[derive(Clone)]
pub struct SetStore {
    handle: Handle,
    core: Rc<CollectionCore>,
}

store_common!(SetStore, true, false);

impl SetStore {
    pub fn add(&self, key: impl Into<Value>) -> Result<()> {
        let key = key.into();
        if !self.core.has(&key)? {
            self.core.init(&key, &Value::Null)?;
        }
        Ok(())
    }

    pub fn add_all<I, K>(&self, keys: I) -> Result<()>
    where
        I: IntoIterator<Item = K>,
        K: Into<Value>,
    {
        for key in keys {
            self.add(key)?;
        }
        Ok(())
    }

    pub fn delete(&self, key: impl Into<Value>) -> Result<()> {
        self.core.delete(&key.into())
    }

    pub fn size(&self) -> Result<u64> {
        self.core.size(&Pattern::Any, &Pattern::Any)
    }

    pub fn keys(&self) -> Keys {
        self.keys_matching(Pattern::Any)
    }

    pub fn keys_matching(&self, key_patt: Pattern) -> Keys {
        Keys {
            _handle: self.handle.clone(),
            raw: self.core.walk(key_patt, Pattern::Any, true, false),
        }
    }

    pub fn clear(&self) -> Result<()> {
        self.core.clear(&Pattern::Any, &Pattern::Any)
    }

    pub fn clear_matching(&self, key_patt: &Pattern) -> Result<()> {
        self.core.clear(key_patt, &Pattern::Any)
    }

    pub fn snapshot(&self) -> Result<Vec<Value>> {
        self.keys().collect()
    }
}

/// Set whose members are held weakly. Not iterable.
#[derive(Clone)]
pub struct WeakSetStore {
    handle: Handle,
    core: Rc<CollectionCore>,
}

store_common!(WeakSetStore, true, true);

impl WeakSetStore {
    pub fn add(&self, key: impl Into<Value>) -> Result<()> {
        let key = key.into();
        if !self.core.has(&key)? {
            self.core.init(&key, &Value::Null)?;
        }
        Ok(())
    }

    pub fn add_all<I, K>(&self, keys: I) -> Result<()>
    where
        I: IntoIterator<Item = K>,
        K: Into<Value>,
    {
        for key in keys {
            self.add(key)?;
        }
        Ok(())
    }

    pub fn delete(&self, key: impl Into<Value>) -> Result<()> {
        self.core.delete(&key.into())
    }
}

fn missing_half() -> StoreError {
    StoreError::Invariant("collection walk did not produce the requested half".to_string())
}

/// Keys of a store in rank order.
pub struct Keys {
    _handle: Handle,
    raw: RawEntries,
}

impl Iterator for Keys {
    type Item = Result<Value>;

    fn next(&mut self) -> Option<Self::Item> {
        self.raw
            .next()
            .map(|entry| entry.and_then(|(key, _)| key.ok_or_else(missing_half)))
    }
}

/// Values of a store, in the rank order of their keys.
pub struct Values {
    _handle: Handle,
    raw: RawEntries,
}

impl Iterator for Values {
    type Item = Result<Value>;

    fn next(&mut self) -> Option<Self::Item> {
        self.raw
            .next()
            .map(|entry| entry.and_then(|(_, value)| value.ok_or_else(missing_half)))
    }
}

pub struct Entries {
    _handle: Handle,
    raw: RawEntries,
}

impl Iterator for Entries {
    type Item = Result<(Value, Value)>;

    fn next(&mut self) -> Option<Self::Item> {
        self.raw.next().map(|entry| {
            entry.and_then(|(key, value)| match (key, value) {
                (Some(key), Some(value)) => Ok((key, value)),
                _ => Err(missing_half()),
            })
        })
    }
}
