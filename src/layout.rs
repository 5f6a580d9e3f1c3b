//! Where the header, the undo log, the descriptor slots and the word array live inside a region.
//!
//! Every area starts on a cache line so that persisting one slot never drags a neighbor's line
//! along with it.

use crate::config::PoolConfig;
use crate::err::Error;
use crate::pmem::{persist_word, persist_words};
use crate::sync::{AtomicU64, Ordering};
use crate::types::SlotIndex;

/// "PMWCAS" followed by two zero bytes, read as a big-endian number.
const MAGIC: u64 = 0x504d_5743_4153_0000;
const VERSION: u64 = 1;

const WORDS_PER_CACHE_LINE: usize = 8;
const HEADER_WORDS: usize = WORDS_PER_CACHE_LINE;

const HEADER_MAGIC: usize = 0;
const HEADER_VERSION: usize = 1;
const HEADER_TAG: usize = 2;
const HEADER_CAPACITY: usize = 3;
const HEADER_SLOTS: usize = 4;
const HEADER_MAX_TARGETS: usize = 5;

const SLOT_STATUS: usize = 0;
const SLOT_COUNT: usize = 1;
const SLOT_ENTRIES: usize = 2;
const WORDS_PER_SLOT_ENTRY: usize = 3;

const UNDO_STATE: usize = 0;
const UNDO_COUNT: usize = 1;
const UNDO_ENTRIES: usize = 2;
const WORDS_PER_UNDO_ENTRY: usize = 2;

pub(crate) const UNDO_IDLE: u64 = 0;
pub(crate) const UNDO_ACTIVE: u64 = 1;

fn round_up_to_cache_line(words: usize) -> usize {
    (words + WORDS_PER_CACHE_LINE - 1) / WORDS_PER_CACHE_LINE * WORDS_PER_CACHE_LINE
}

/// FNV-1a, so that pools of different competitors can't be mistaken for one another.
fn hash_tag(tag: &str) -> u64 {
    tag.bytes().fold(0xcbf2_9ce4_8422_2325, |hash, byte| {
        (hash ^ byte as u64).wrapping_mul(0x0100_0000_01b3)
    })
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct Layout {
    pub(crate) capacity: usize,
    pub(crate) descriptor_slots: usize,
    pub(crate) max_targets: usize,
    slot_words: usize,
    undo_log_offset: usize,
    slots_offset: usize,
    words_offset: usize,
    pub(crate) total_words: usize,
}

impl Layout {
    pub(crate) fn new(config: &PoolConfig) -> Self {
        let undo_log_words: usize =
            round_up_to_cache_line(UNDO_ENTRIES + WORDS_PER_UNDO_ENTRY * config.max_targets);
        let slot_words: usize =
            round_up_to_cache_line(SLOT_ENTRIES + WORDS_PER_SLOT_ENTRY * config.max_targets);

        let undo_log_offset: usize = HEADER_WORDS;
        let slots_offset: usize = undo_log_offset + undo_log_words;
        let words_offset: usize = slots_offset + slot_words * config.descriptor_slots;
        let total_words: usize = words_offset + round_up_to_cache_line(config.capacity);
        Self {
            capacity: config.capacity,
            descriptor_slots: config.descriptor_slots,
            max_targets: config.max_targets,
            slot_words,
            undo_log_offset,
            slots_offset,
            words_offset,
            total_words,
        }
    }

    pub(crate) fn data<'r>(&self, region: &'r [AtomicU64]) -> &'r [AtomicU64] {
        &region[self.words_offset..self.words_offset + self.capacity]
    }

    pub(crate) fn slot<'r>(&self, region: &'r [AtomicU64], slot: SlotIndex) -> SlotWords<'r> {
        let start: usize = self.slots_offset + slot * self.slot_words;
        SlotWords {
            words: &region[start..start + self.slot_words],
        }
    }

    pub(crate) fn undo_log<'r>(&self, region: &'r [AtomicU64]) -> UndoLogWords<'r> {
        UndoLogWords {
            words: &region[self.undo_log_offset..self.slots_offset],
        }
    }

    fn expected_header(&self, tag: &str) -> [(usize, &'static str, u64); 5] {
        [
            (HEADER_VERSION, "version", VERSION),
            (HEADER_TAG, "layout tag", hash_tag(tag)),
            (HEADER_CAPACITY, "capacity", self.capacity as u64),
            (HEADER_SLOTS, "descriptor slot count", self.descriptor_slots as u64),
            (HEADER_MAX_TARGETS, "max targets", self.max_targets as u64),
        ]
    }

    /// Write the header of a new pool. The magic number goes last, so a crash halfway through
    /// leaves a pool which is initialized again on the next open.
    pub(crate) fn initialize_header(&self, region: &[AtomicU64], tag: &str) {
        let header: &[AtomicU64] = &region[..HEADER_WORDS];
        for (index, _, value) in self.expected_header(tag) {
            header[index].store(value, Ordering::Release);
        }
        persist_words(header);
        header[HEADER_MAGIC].store(MAGIC, Ordering::Release);
        persist_word(&header[HEADER_MAGIC]);
    }

    /// Returns false if the region has never been initialized, or an error if it was initialized
    /// with a different layout.
    pub(crate) fn validate_header(&self, region: &[AtomicU64], tag: &str) -> Result<bool, Error> {
        if region.len() < HEADER_WORDS {
            return Err(self.length_mismatch(region));
        }
        let header: &[AtomicU64] = &region[..HEADER_WORDS];
        let magic: u64 = header[HEADER_MAGIC].load(Ordering::Acquire);
        if magic == 0 {
            return Ok(false);
        }
        if magic != MAGIC {
            return Err(Error::LayoutMismatch {
                field: "magic number",
                expected: MAGIC,
                actual: magic,
            });
        }
        for (index, field, expected) in self.expected_header(tag) {
            let actual: u64 = header[index].load(Ordering::Acquire);
            if actual != expected {
                return Err(Error::LayoutMismatch {
                    field,
                    expected,
                    actual,
                });
            }
        }
        if region.len() != self.total_words {
            return Err(self.length_mismatch(region));
        }
        Ok(true)
    }

    fn length_mismatch(&self, region: &[AtomicU64]) -> Error {
        Error::LayoutMismatch {
            field: "length in words",
            expected: self.total_words as u64,
            actual: region.len() as u64,
        }
    }
}

/// The persistent words of one descriptor slot.
#[derive(Clone, Copy, Debug)]
pub(crate) struct SlotWords<'r> {
    words: &'r [AtomicU64],
}

impl<'r> SlotWords<'r> {
    pub(crate) fn status(&self) -> &'r AtomicU64 {
        &self.words[SLOT_STATUS]
    }

    pub(crate) fn count(&self) -> &'r AtomicU64 {
        &self.words[SLOT_COUNT]
    }

    pub(crate) fn position(&self, entry: usize) -> &'r AtomicU64 {
        &self.words[SLOT_ENTRIES + entry * WORDS_PER_SLOT_ENTRY]
    }

    pub(crate) fn expected(&self, entry: usize) -> &'r AtomicU64 {
        &self.words[SLOT_ENTRIES + entry * WORDS_PER_SLOT_ENTRY + 1]
    }

    pub(crate) fn desired(&self, entry: usize) -> &'r AtomicU64 {
        &self.words[SLOT_ENTRIES + entry * WORDS_PER_SLOT_ENTRY + 2]
    }

    /// The count and the first `entries` entries.
    pub(crate) fn body(&self, entries: usize) -> &'r [AtomicU64] {
        &self.words[SLOT_COUNT..SLOT_ENTRIES + entries * WORDS_PER_SLOT_ENTRY]
    }
}

/// The persistent undo log of the lock-based competitor.
#[derive(Clone, Copy, Debug)]
pub(crate) struct UndoLogWords<'r> {
    words: &'r [AtomicU64],
}

impl<'r> UndoLogWords<'r> {
    pub(crate) fn state(&self) -> &'r AtomicU64 {
        &self.words[UNDO_STATE]
    }

    pub(crate) fn count(&self) -> &'r AtomicU64 {
        &self.words[UNDO_COUNT]
    }

    pub(crate) fn position(&self, entry: usize) -> &'r AtomicU64 {
        &self.words[UNDO_ENTRIES + entry * WORDS_PER_UNDO_ENTRY]
    }

    pub(crate) fn old_value(&self, entry: usize) -> &'r AtomicU64 {
        &self.words[UNDO_ENTRIES + entry * WORDS_PER_UNDO_ENTRY + 1]
    }

    /// The count and the first `entries` entries.
    pub(crate) fn body(&self, entries: usize) -> &'r [AtomicU64] {
        &self.words[UNDO_COUNT..UNDO_ENTRIES + entries * WORDS_PER_UNDO_ENTRY]
    }
}
