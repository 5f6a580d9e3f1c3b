use crate::pmem::persist_word;
use crate::sync::{AtomicU64, Ordering};
use crate::types::DIRTY_FLAG;
use crate::word::stabilize;
use tracing::trace;

/// Replace `marker` in `word` with `final_value`, persisting the new value before the dirty flag is
/// cleared.
///
/// Returns false if the word no longer holds the marker, which happens when another thread already
/// finalized it. Finalizing the same word twice is therefore harmless.
pub(crate) fn finalize_word(word: &AtomicU64, marker: u64, final_value: u64) -> bool {
    loop {
        match word.compare_exchange(
            marker,
            final_value | DIRTY_FLAG,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                persist_word(word);
                let _ = word.compare_exchange(
                    final_value | DIRTY_FLAG,
                    final_value,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
                return true;
            }
            // the marker itself has not been flushed yet
            Err(actual) if actual == marker | DIRTY_FLAG => {
                stabilize(word, actual);
            }
            Err(actual) => {
                trace!("word no longer holds marker {marker:#x} but {actual:#x}");
                return false;
            }
        }
    }
}
