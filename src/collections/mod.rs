mod manager;
mod store;

pub(crate) use manager::{CollectionCore, CollectionManager};
pub use manager::StoreKind;
pub use store::{Entries, Keys, MapStore, SetStore, StoreOptions, Values, WeakMapStore, WeakSetStore};
