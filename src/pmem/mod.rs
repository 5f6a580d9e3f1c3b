//! Persistent memory regions and the flushes which make stores to them durable.

use crate::sync::AtomicU64;
use core::fmt::Debug;

#[cfg(not(feature = "shuttle"))]
mod file;
pub mod flush;
mod heap;

#[cfg(not(feature = "shuttle"))]
pub use file::FileRegion;
pub use heap::HeapRegion;

pub(crate) use flush::{persist_word, persist_words};

/// A contiguous run of 8-byte words which a pool lays itself out in.
///
/// Stores only become durable once the words holding them are passed to [persist_word] or
/// [persist_words]; a region merely provides the memory.
pub trait Region: Debug + Send + Sync {
    fn words(&self) -> &[AtomicU64];

    /// Ask the backing store to write everything back, e.g. before a clean shutdown.
    fn sync(&self) -> std::io::Result<()>;
}
