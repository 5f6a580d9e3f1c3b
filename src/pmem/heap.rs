use crate::pmem::Region;
use crate::sync::AtomicU64;
use core::fmt::{Debug, Formatter};

/// A zero-filled region on the heap. Nothing survives the process, so a pool built on it never
/// needs recovery; it backs volatile pools and model-checking tests.
pub struct HeapRegion {
    words: Box<[AtomicU64]>,
}

impl HeapRegion {
    pub fn new(len: usize) -> Self {
        Self {
            words: (0..len).map(|_| AtomicU64::new(0)).collect(),
        }
    }
}

impl Region for HeapRegion {
    fn words(&self) -> &[AtomicU64] {
        &self.words
    }

    fn sync(&self) -> std::io::Result<()> {
        Ok(())
    }
}

impl Debug for HeapRegion {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HeapRegion")
            .field("len", &self.words.len())
            .finish()
    }
}
