pub mod cache;
pub mod iterators;
pub mod memory;
pub mod persistence;
pub mod syscall;

pub use cache::{Cache, CacheBacking};
pub use iterators::{KeyRange, enumerate_keys_with_prefix, prefixed_keys_exist};
pub use memory::{MemorySyscall, SharedKv, SyscallRecord};
pub use persistence::{KvSnapshot, SnapshotManager};
pub use syscall::{Syscall, VatStore};
