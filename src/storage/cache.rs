//! Per-turn write-back cache.
//!
//! A key is read from its backing at most once per turn. Writes and
//! deletes only mark the key dirty; `flush` pushes dirty keys to the
//! backing in sorted order and then forgets everything, so the next turn
//! starts cold.

use std::collections::{BTreeSet, HashMap};

use crate::core::{Result, StoreError};

pub trait CacheBacking<V> {
    fn read(&self, key: &str) -> Result<Option<V>>;
    fn write(&self, key: &str, value: &V) -> Result<()>;
    fn delete(&self, key: &str) -> Result<()>;
}

pub struct Cache<V> {
    stash: HashMap<String, Option<V>>,
    dirty: BTreeSet<String>,
    backing: Box<dyn CacheBacking<V>>,
}

impl<V: Clone> Cache<V> {
    pub fn new(backing: impl CacheBacking<V> + 'static) -> Self {
        Self {
            stash: HashMap::new(),
            dirty: BTreeSet::new(),
            backing: Box::new(backing),
        }
    }

    fn load(&mut self, key: &str) -> Result<()> {
        if self.stash.contains_key(key) || self.dirty.contains(key) {
            return Ok(());
        }
        let value = self.backing.read(key)?;
        self.stash.insert(key.to_string(), value);
        Ok(())
    }

    pub fn get(&mut self, key: &str) -> Result<Option<V>> {
        self.load(key)?;
        Ok(self.stash.get(key).cloned().flatten())
    }

    /// Run `f` on the cached entry in place. The key is not marked dirty.
    pub fn with_entry<R>(&mut self, key: &str, f: impl FnOnce(&mut V) -> R) -> Result<Option<R>> {
        self.load(key)?;
        Ok(match self.stash.get_mut(key) {
            Some(Some(value)) => Some(f(value)),
            _ => None,
        })
    }

    pub fn set(&mut self, key: &str, value: V) {
        self.stash.insert(key.to_string(), Some(value));
        self.dirty.insert(key.to_string());
    }

    pub fn delete(&mut self, key: &str) {
        self.stash.remove(key);
        self.dirty.insert(key.to_string());
    }

    pub fn flush(&mut self) -> Result<()> {
        let dirty = std::mem::take(&mut self.dirty);
        for key in &dirty {
            match self.stash.get(key) {
                Some(Some(value)) => self.backing.write(key, value)?,
                _ => self.backing.delete(key)?,
            }
        }
        self.stash.clear();
        Ok(())
    }

    pub fn insist_clear(&self) -> Result<()> {
        if !self.dirty.is_empty() || !self.stash.is_empty() {
            return Err(StoreError::Invariant(format!(
                "cache not clear: {} dirty, {} stashed",
                self.dirty.len(),
                self.stash.len()
            )));
        }
        Ok(())
    }

    pub fn is_dirty(&self, key: &str) -> bool {
        self.dirty.contains(key)
    }

    pub fn len(&self) -> usize {
        self.stash.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stash.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::BTreeMap;
    use std::rc::Rc;

    #[derive(Debug, Clone, PartialEq)]
    enum Op {
        Read(String),
        Write(String, i64),
        Delete(String),
    }

    #[derive(Clone, Default)]
    struct Recording {
        data: Rc<RefCell<BTreeMap<String, i64>>>,
        ops: Rc<RefCell<Vec<Op>>>,
    }

    impl CacheBacking<i64> for Recording {
        fn read(&self, key: &str) -> Result<Option<i64>> {
            self.ops.borrow_mut().push(Op::Read(key.to_string()));
            Ok(self.data.borrow().get(key).copied())
        }

        fn write(&self, key: &str, value: &i64) -> Result<()> {
            self.ops.borrow_mut().push(Op::Write(key.to_string(), *value));
            self.data.borrow_mut().insert(key.to_string(), *value);
            Ok(())
        }

        fn delete(&self, key: &str) -> Result<()> {
            self.ops.borrow_mut().push(Op::Delete(key.to_string()));
            self.data.borrow_mut().remove(key);
            Ok(())
        }
    }

    #[test]
    fn test_reads_backing_once_per_turn() {
        let backing = Recording::default();
        backing.data.borrow_mut().insert("a".to_string(), 1);
        let mut cache: Cache<i64> = Cache::new(backing.clone());

        assert_eq!(cache.get("a").unwrap(), Some(1));
        assert_eq!(cache.get("a").unwrap(), Some(1));
        assert_eq!(cache.get("missing").unwrap(), None);
        assert_eq!(cache.get("missing").unwrap(), None);
        assert_eq!(
            *backing.ops.borrow(),
            vec![Op::Read("a".to_string()), Op::Read("missing".to_string())]
        );

        cache.flush().unwrap();
        assert_eq!(cache.get("a").unwrap(), Some(1));
        assert_eq!(backing.ops.borrow().len(), 3);
    }

    #[test]
    fn test_set_is_visible_without_backing_write() {
        let backing = Recording::default();
        let mut cache: Cache<i64> = Cache::new(backing.clone());
        cache.set("k", 5);
        assert_eq!(cache.get("k").unwrap(), Some(5));
        assert!(backing.ops.borrow().is_empty());
    }

    #[test]
    fn test_pending_delete_shadows_backing() {
        let backing = Recording::default();
        backing.data.borrow_mut().insert("k".to_string(), 9);
        let mut cache: Cache<i64> = Cache::new(backing.clone());
        cache.delete("k");
        assert_eq!(cache.get("k").unwrap(), None);
        assert!(backing.ops.borrow().is_empty());
    }

    #[test]
    fn test_flush_writes_dirty_keys_in_sorted_order() {
        let backing = Recording::default();
        backing.data.borrow_mut().insert("b".to_string(), 2);
        let mut cache: Cache<i64> = Cache::new(backing.clone());
        cache.set("c", 3);
        cache.set("a", 1);
        cache.delete("b");
        cache.flush().unwrap();

        assert_eq!(
            *backing.ops.borrow(),
            vec![
                Op::Write("a".to_string(), 1),
                Op::Delete("b".to_string()),
                Op::Write("c".to_string(), 3),
            ]
        );
        assert!(cache.insist_clear().is_ok());
    }

    #[test]
    fn test_insist_clear_detects_uncommitted_state() {
        let mut cache: Cache<i64> = Cache::new(Recording::default());
        cache.set("x", 1);
        assert!(matches!(cache.insist_clear(), Err(StoreError::Invariant(_))));
    }

    #[test]
    fn test_with_entry_does_not_dirty() {
        let backing = Recording::default();
        backing.data.borrow_mut().insert("k".to_string(), 1);
        let mut cache: Cache<i64> = Cache::new(backing.clone());
        let seen = cache.with_entry("k", |v| *v).unwrap();
        assert_eq!(seen, Some(1));
        assert!(!cache.is_dirty("k"));
        cache.flush().unwrap();
        assert_eq!(*backing.ops.borrow(), vec![Op::Read("k".to_string())]);
    }
}
