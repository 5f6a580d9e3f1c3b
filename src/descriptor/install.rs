use crate::descriptor::help::{resolve_claim, Claim};
use crate::descriptor::TargetEntry;
use crate::err::Error;
use crate::pmem::persist_word;
use crate::pool::Pool;
use crate::sync::{spin_wait, AtomicU64, Ordering};
use crate::types::DIRTY_FLAG;
use crate::word::{stabilize, DescriptorRef, WordState};
use tracing::{instrument, trace};

/// Claim every target word for `descriptor`, in the order of `entries`, which is ascending by
/// position. Taking words in one global order means two descriptors never wait on each other.
///
/// Stops at the first word which does not hold its expected value and returns how many words were
/// claimed, all of which form a prefix of `entries`.
#[instrument(skip(pool, entries))]
pub(super) fn install(
    pool: &Pool,
    descriptor: DescriptorRef,
    entries: &[TargetEntry],
) -> Result<usize, Error> {
    let marker: u64 = descriptor.marker();
    for (installed, entry) in entries.iter().enumerate() {
        let word: &AtomicU64 = pool.word(entry.position)?;
        if !claim_word(pool, word, entry, descriptor, marker)? {
            return Ok(installed);
        }
    }
    Ok(entries.len())
}

fn claim_word(
    pool: &Pool,
    word: &AtomicU64,
    entry: &TargetEntry,
    descriptor: DescriptorRef,
    marker: u64,
) -> Result<bool, Error> {
    let position = entry.position;
    let mut attempt: usize = 0;
    loop {
        let actual: u64 = match word.compare_exchange(
            entry.expected,
            marker | DIRTY_FLAG,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                persist_word(word);
                let _ = word.compare_exchange(
                    marker | DIRTY_FLAG,
                    marker,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
                return Ok(true);
            }
            Err(actual) => actual,
        };

        match WordState::decode(actual) {
            WordState::Dirty(value) if value == entry.expected => {
                trace!("position {position}: expected value is dirty, flushing it");
                stabilize(word, actual);
            }
            WordState::Stable(_) | WordState::Dirty(_) => {
                trace!(
                    "position {position}: expected {} but found {actual:#x}",
                    entry.expected
                );
                return Ok(false);
            }
            WordState::Claimed { descriptor: owner, .. } if owner == descriptor => {
                // a dirty marker of our own can only be left by the CAS above
                stabilize(word, actual);
                return Ok(true);
            }
            WordState::Claimed { descriptor: owner, .. } => {
                match resolve_claim(pool, position, word, actual, owner)? {
                    Claim::Pending { .. } => {
                        spin_wait(
                            attempt,
                            pool.config().spin_retries,
                            pool.config().backoff,
                        );
                        attempt += 1;
                    }
                    Claim::Resolved => {}
                }
            }
        }
    }
}
