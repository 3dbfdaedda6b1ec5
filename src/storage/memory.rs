use std::cell::RefCell;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::rc::Rc;

use super::persistence::KvSnapshot;
use super::syscall::Syscall;
use crate::core::Result;

pub type SharedKv = Rc<RefCell<BTreeMap<String, String>>>;

/// One recorded syscall, in the order it was made.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyscallRecord {
    Get(String),
    GetNextKey(String),
    Set(String, String),
    Delete(String),
    DropImports(Vec<String>),
    RetireImports(Vec<String>),
    RetireExports(Vec<String>),
    AbandonExports(Vec<String>),
}

impl SyscallRecord {
    pub fn is_gc_action(&self) -> bool {
        matches!(
            self,
            Self::DropImports(_)
                | Self::RetireImports(_)
                | Self::RetireExports(_)
                | Self::AbandonExports(_)
        )
    }
}

/// In-memory sorted store backed by a `BTreeMap`.
///
/// Clones share the same map and log, so a test can keep one clone to
/// inspect what the engine did with the other, and a later incarnation can
/// be started on the same data.
#[derive(Clone, Default)]
pub struct MemorySyscall {
    kv: SharedKv,
    log: Rc<RefCell<Vec<SyscallRecord>>>,
}

impl MemorySyscall {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_kv(kv: SharedKv) -> Self {
        Self {
            kv,
            log: Rc::new(RefCell::new(Vec::new())),
        }
    }

    pub fn from_snapshot(snapshot: KvSnapshot) -> Self {
        Self::with_kv(Rc::new(RefCell::new(snapshot.entries)))
    }

    pub fn kv(&self) -> SharedKv {
        self.kv.clone()
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.kv.borrow().get(key).cloned()
    }

    pub fn contents(&self) -> BTreeMap<String, String> {
        self.kv.borrow().clone()
    }

    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.kv
            .borrow()
            .range::<str, _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect()
    }

    pub fn snapshot(&self) -> KvSnapshot {
        KvSnapshot::new(self.contents())
    }

    pub fn log(&self) -> Vec<SyscallRecord> {
        self.log.borrow().clone()
    }

    pub fn take_log(&self) -> Vec<SyscallRecord> {
        std::mem::take(&mut *self.log.borrow_mut())
    }

    /// The GC notifications recorded so far, draining the whole log.
    pub fn take_gc_actions(&self) -> Vec<SyscallRecord> {
        self.take_log()
            .into_iter()
            .filter(SyscallRecord::is_gc_action)
            .collect()
    }

    fn record(&self, entry: SyscallRecord) {
        self.log.borrow_mut().push(entry);
    }
}

impl Syscall for MemorySyscall {
    fn vatstore_get(&mut self, key: &str) -> Result<Option<String>> {
        self.record(SyscallRecord::Get(key.to_string()));
        Ok(self.kv.borrow().get(key).cloned())
    }

    fn vatstore_get_next_key(&mut self, prior_key: &str) -> Result<Option<String>> {
        self.record(SyscallRecord::GetNextKey(prior_key.to_string()));
        let kv = self.kv.borrow();
        let next = kv
            .range::<str, _>((Bound::Excluded(prior_key), Bound::Unbounded))
            .next()
            .map(|(k, _)| k.clone());
        Ok(next)
    }

    fn vatstore_set(&mut self, key: &str, value: &str) -> Result<()> {
        self.record(SyscallRecord::Set(key.to_string(), value.to_string()));
        self.kv.borrow_mut().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn vatstore_delete(&mut self, key: &str) -> Result<()> {
        self.record(SyscallRecord::Delete(key.to_string()));
        self.kv.borrow_mut().remove(key);
        Ok(())
    }

    fn drop_imports(&mut self, vrefs: &[String]) -> Result<()> {
        self.record(SyscallRecord::DropImports(vrefs.to_vec()));
        Ok(())
    }

    fn retire_imports(&mut self, vrefs: &[String]) -> Result<()> {
        self.record(SyscallRecord::RetireImports(vrefs.to_vec()));
        Ok(())
    }

    fn retire_exports(&mut self, vrefs: &[String]) -> Result<()> {
        self.record(SyscallRecord::RetireExports(vrefs.to_vec()));
        Ok(())
    }

    fn abandon_exports(&mut self, vrefs: &[String]) -> Result<()> {
        self.record(SyscallRecord::AbandonExports(vrefs.to_vec()));
        Ok(())
    }
}
