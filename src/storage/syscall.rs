use std::cell::RefCell;
use std::rc::Rc;

use crate::core::{Result, StoreError};

/// The host surface the engine talks to.
///
/// The first four methods form a sorted string key-value store; the rest
/// are notifications about references this process no longer holds.
pub trait Syscall {
    fn vatstore_get(&mut self, key: &str) -> Result<Option<String>>;

    /// Smallest key strictly greater than `prior_key`.
    fn vatstore_get_next_key(&mut self, prior_key: &str) -> Result<Option<String>>;

    fn vatstore_set(&mut self, key: &str, value: &str) -> Result<()>;

    fn vatstore_delete(&mut self, key: &str) -> Result<()>;

    fn drop_imports(&mut self, vrefs: &[String]) -> Result<()>;

    fn retire_imports(&mut self, vrefs: &[String]) -> Result<()>;

    fn retire_exports(&mut self, vrefs: &[String]) -> Result<()>;

    fn abandon_exports(&mut self, vrefs: &[String]) -> Result<()>;
}

/// Shared access to the process's syscall object.
///
/// Every call takes the borrow only for its own duration, so no borrow is
/// ever held across user code.
#[derive(Clone)]
pub struct VatStore {
    syscall: Rc<RefCell<dyn Syscall>>,
}

impl VatStore {
    pub fn new<S: Syscall + 'static>(syscall: S) -> Self {
        Self {
            syscall: Rc::new(RefCell::new(syscall)),
        }
    }

    fn with<R>(&self, f: impl FnOnce(&mut dyn Syscall) -> Result<R>) -> Result<R> {
        let mut syscall = self
            .syscall
            .try_borrow_mut()
            .map_err(|_| StoreError::Invariant("re-entrant syscall".to_string()))?;
        f(&mut *syscall)
    }

    pub fn get(&self, key: &str) -> Result<Option<String>> {
        self.with(|s| s.vatstore_get(key))
    }

    pub fn get_next_key(&self, prior_key: &str) -> Result<Option<String>> {
        self.with(|s| s.vatstore_get_next_key(prior_key))
    }

    pub fn set(&self, key: &str, value: &str) -> Result<()> {
        self.with(|s| s.vatstore_set(key, value))
    }

    pub fn delete(&self, key: &str) -> Result<()> {
        self.with(|s| s.vatstore_delete(key))
    }

    pub fn has(&self, key: &str) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    pub fn drop_imports(&self, vrefs: &[String]) -> Result<()> {
        self.with(|s| s.drop_imports(vrefs))
    }

    pub fn retire_imports(&self, vrefs: &[String]) -> Result<()> {
        self.with(|s| s.retire_imports(vrefs))
    }

    pub fn retire_exports(&self, vrefs: &[String]) -> Result<()> {
        self.with(|s| s.retire_exports(vrefs))
    }

    pub fn abandon_exports(&self, vrefs: &[String]) -> Result<()> {
        self.with(|s| s.abandon_exports(vrefs))
    }
}
