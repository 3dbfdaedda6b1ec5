// ============================================================================
// vobjstore Library
// ============================================================================
//
// Virtual objects and keyed collections whose state lives in a sorted
// string key-value store instead of memory. Reference counts kept next to
// the data decide when stored objects can be reclaimed, and durable kinds
// and collections survive a restart of the process.

pub mod config;
pub mod core;
pub mod marshal;
pub mod pattern;
pub mod storage;

mod collections;
mod handle;
mod runtime;
mod vom;
mod vrm;

pub use crate::config::{MAX_DBKEY_LENGTH, RuntimeConfig};
pub use crate::core::{PassStyle, Result, StoreError, Value};
pub use crate::marshal::CapData;
pub use crate::pattern::Pattern;
pub use crate::storage::{
    KvSnapshot, MemorySyscall, SharedKv, SnapshotManager, Syscall, SyscallRecord,
};

// ============================================================================
// Runtime API
// ============================================================================

pub use collections::{
    Entries, Keys, MapStore, SetStore, StoreKind, StoreOptions, Values, WeakMapStore,
    WeakSetStore,
};
pub use handle::{FarBehavior, FarMethod, Handle};
pub use runtime::{GcReport, VirtualRuntime};
pub use vom::{
    Behavior, BehaviorEntry, Context, DurableKindDescriptor, Facets, Facetiousness, KindMaker,
    KindOptions, Method, PropertyKey, State, VoAwareWeakMap, VoAwareWeakSet,
    assess_facetiousness,
};
pub use vrm::RetentionStats;
