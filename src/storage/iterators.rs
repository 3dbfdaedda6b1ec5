use super::syscall::VatStore;
use crate::core::Result;

/// Lazy walk over the keys in `[start, end)`.
///
/// Each step asks the store for the key after the previous one, so keys
/// deleted between steps are simply not seen and the walk may delete
/// the key it just returned.
pub struct KeyRange {
    store: VatStore,
    start: String,
    end: String,
    last: Option<String>,
    done: bool,
}

impl KeyRange {
    pub fn new(store: &VatStore, start: impl Into<String>, end: impl Into<String>) -> Self {
        Self {
            store: store.clone(),
            start: start.into(),
            end: end.into(),
            last: None,
            done: false,
        }
    }

    pub fn next_key(&mut self) -> Result<Option<String>> {
        if self.done {
            return Ok(None);
        }
        let candidate = match &self.last {
            Some(prev) => self.store.get_next_key(prev)?,
            None => {
                if self.store.has(&self.start)? {
                    Some(self.start.clone())
                } else {
                    self.store.get_next_key(&self.start)?
                }
            }
        };
        match candidate {
            Some(key) if key < self.end => {
                self.last = Some(key.clone());
                Ok(Some(key))
            }
            _ => {
                self.done = true;
                Ok(None)
            }
        }
    }
}

pub fn enumerate_keys_with_prefix(store: &VatStore, prefix: &str) -> Result<Vec<String>> {
    let mut keys = Vec::new();
    let mut key = prefix.to_string();
    while let Some(next) = store.get_next_key(&key)? {
        if !next.starts_with(prefix) {
            break;
        }
        keys.push(next.clone());
        key = next;
    }
    Ok(keys)
}

pub fn prefixed_keys_exist(store: &VatStore, prefix: &str) -> Result<bool> {
    Ok(store
        .get_next_key(prefix)?
        .is_some_and(|key| key.starts_with(prefix)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemorySyscall;

    fn store_with(keys: &[&str]) -> VatStore {
        let sys = MemorySyscall::new();
        {
            let kv = sys.kv();
            let mut kv = kv.borrow_mut();
            for key in keys {
                kv.insert(key.to_string(), "x".to_string());
            }
        }
        VatStore::new(sys)
    }

    #[test]
    fn test_key_range_bounds() {
        let store = store_with(&["vc.1.sa", "vc.1.sb", "vc.1.|label", "vc.2.sa"]);
        let mut range = KeyRange::new(&store, "vc.1.", "vc.1.{");
        assert_eq!(range.next_key().unwrap().as_deref(), Some("vc.1.sa"));
        assert_eq!(range.next_key().unwrap().as_deref(), Some("vc.1.sb"));
        assert_eq!(range.next_key().unwrap(), None);
        assert_eq!(range.next_key().unwrap(), None);
    }

    #[test]
    fn test_key_range_includes_start_key() {
        let store = store_with(&["vc.1.sa", "vc.1.sb"]);
        let mut range = KeyRange::new(&store, "vc.1.sb", "vc.1.sc");
        assert_eq!(range.next_key().unwrap().as_deref(), Some("vc.1.sb"));
        assert_eq!(range.next_key().unwrap(), None);
    }

    #[test]
    fn test_prefix_helpers() {
        let store = store_with(&["vom.ir.o-1|3", "vom.ir.o-1|4", "vom.ir.o-10|1"]);
        assert_eq!(
            enumerate_keys_with_prefix(&store, "vom.ir.o-1|").unwrap(),
            vec!["vom.ir.o-1|3", "vom.ir.o-1|4"]
        );
        assert!(prefixed_keys_exist(&store, "vom.ir.o-10|").unwrap());
        assert!(!prefixed_keys_exist(&store, "vom.ir.o-2|").unwrap());
    }
}
