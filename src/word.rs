//! Persistent words and the single-word persistent CAS built on them.

use crate::pmem::persist_word;
use crate::sync::{AtomicU64, Ordering};
use crate::types::{
    SequenceNum, SlotIndex, DESCRIPTOR_FLAG, DIRTY_FLAG, RESERVED_BITS, SEQUENCE_BIT_LENGTH,
    SEQUENCE_MASK,
};
use tracing::trace;

/// Identifies one use of one descriptor slot. Encoded into a word, it tells other threads that the
/// word is claimed by that descriptor.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct DescriptorRef {
    pub slot: SlotIndex,
    pub sequence: SequenceNum,
}

impl DescriptorRef {
    pub(crate) fn new(slot: SlotIndex, sequence: SequenceNum) -> Self {
        Self { slot, sequence }
    }

    /// The raw word value which claims a word for this descriptor, without the dirty flag.
    pub(crate) fn marker(&self) -> u64 {
        DESCRIPTOR_FLAG | (self.slot as u64) << SEQUENCE_BIT_LENGTH | (self.sequence & SEQUENCE_MASK)
    }

    fn from_marker(raw: u64) -> Self {
        let without_flags: u64 = raw & !RESERVED_BITS;
        Self {
            slot: (without_flags >> SEQUENCE_BIT_LENGTH) as SlotIndex,
            sequence: without_flags & SEQUENCE_MASK,
        }
    }
}

/// The decoded contents of a persistent word.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WordState {
    /// A durable application value.
    Stable(u64),
    /// An application value which has been written but may not have been flushed yet.
    Dirty(u64),
    /// The word is claimed by an in-flight descriptor.
    Claimed {
        descriptor: DescriptorRef,
        dirty: bool,
    },
}

impl WordState {
    pub fn decode(raw: u64) -> Self {
        let dirty: bool = raw & DIRTY_FLAG != 0;
        if raw & DESCRIPTOR_FLAG != 0 {
            WordState::Claimed {
                descriptor: DescriptorRef::from_marker(raw),
                dirty,
            }
        } else if dirty {
            WordState::Dirty(raw & !DIRTY_FLAG)
        } else {
            WordState::Stable(raw)
        }
    }

    pub fn encode(&self) -> u64 {
        match *self {
            WordState::Stable(value) => value,
            WordState::Dirty(value) => value | DIRTY_FLAG,
            WordState::Claimed { descriptor, dirty } => {
                descriptor.marker() | if dirty { DIRTY_FLAG } else { 0 }
            }
        }
    }
}

pub(crate) fn uses_reserved_bits(value: u64) -> bool {
    value & RESERVED_BITS != 0
}

/// Flush `word` if `observed` is a dirty value and clear the flag. Returns the value with the flag
/// cleared, whether this thread or another one cleared it.
pub(crate) fn stabilize(word: &AtomicU64, observed: u64) -> u64 {
    if observed & DIRTY_FLAG == 0 {
        return observed;
    }
    persist_word(word);
    let clean: u64 = observed & !DIRTY_FLAG;
    // A failed CAS means another thread already cleared the flag or moved the word on; either way
    // `observed` has been made durable.
    let _ = word.compare_exchange(observed, clean, Ordering::AcqRel, Ordering::Acquire);
    clean
}

/// Load `word`, making sure the returned value is durable. The result can still be a descriptor
/// marker; resolving those is up to the descriptor layer.
pub(crate) fn pread(word: &AtomicU64) -> u64 {
    let observed: u64 = word.load(Ordering::Acquire);
    stabilize(word, observed)
}

/// Persistent compare-and-swap of a single word.
///
/// `expected` and `desired` must not use the reserved bits. Returns the value which was observed
/// instead of `expected` on failure; a dirty value equal to `expected` is stabilized and the CAS is
/// retried rather than failing.
pub(crate) fn pcas(word: &AtomicU64, expected: u64, desired: u64) -> Result<(), u64> {
    loop {
        match word.compare_exchange(
            expected,
            desired | DIRTY_FLAG,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                persist_word(word);
                // Losing this CAS means a reader already cleared the flag for us.
                let _ = word.compare_exchange(
                    desired | DIRTY_FLAG,
                    desired,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
                return Ok(());
            }
            Err(actual) => {
                let clean: u64 = stabilize(word, actual);
                if clean != expected {
                    trace!("pcas expected {expected:#x} but found {actual:#x}");
                    return Err(clean);
                }
                trace!("pcas found a dirty {expected:#x}, retrying");
            }
        }
    }
}
