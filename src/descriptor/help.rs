use crate::descriptor::finalize_word;
use crate::err::{Error, FatalError};
use crate::layout::SlotWords;
use crate::pmem::persist_word;
use crate::pool::Pool;
use crate::sync::{AtomicU64, Ordering};
use crate::types::{
    extract_sequence_from_status_and_sequence, extract_status_from_status_and_sequence, Position,
    Status, StatusAndSequence,
};
use crate::word::{stabilize, DescriptorRef};
use tracing::trace;

/// What a thread found out about a word claimed by another descriptor.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Claim {
    /// The owner has not decided yet. Until it does, the word's logical value is `expected`.
    Pending { expected: u64 },
    /// The claim is gone, or was just finalized by this thread. The word should be read again.
    Resolved,
}

/// Deal with a word at `position` which was observed holding `raw`, a marker of `descriptor`.
///
/// A dirty marker is flushed first. If the owner has already decided, this thread finalizes the
/// word on its behalf; an undecided owner is never driven forward, only reported as pending.
pub(crate) fn resolve_claim(
    pool: &Pool,
    position: Position,
    word: &AtomicU64,
    raw: u64,
    descriptor: DescriptorRef,
) -> Result<Claim, Error> {
    stabilize(word, raw);
    let slots: usize = pool.layout().descriptor_slots;
    if descriptor.slot >= slots {
        return Err(FatalError::MarkerSlotOutOfBounds {
            position,
            slot: descriptor.slot,
            slots,
        }
        .into());
    }

    let slot: SlotWords = pool.slot(descriptor.slot);
    let status_and_sequence: StatusAndSequence = slot.status().load(Ordering::Acquire);
    if extract_sequence_from_status_and_sequence(status_and_sequence) != descriptor.sequence {
        // the slot moved on, so the marker has already been replaced
        return Ok(Claim::Resolved);
    }

    let status: Status = extract_status_from_status_and_sequence(status_and_sequence)?;
    let entry: usize = match status {
        Status::Finalized => return Ok(Claim::Resolved),
        _ => find_entry(pool, slot, position).ok_or(FatalError::MissingTargetEntry {
            position,
            slot: descriptor.slot,
        })?,
    };

    match status {
        Status::Undecided => {
            let expected: u64 = slot.expected(entry).load(Ordering::Acquire);
            // the entry is only trustworthy if the slot was not reused while reading it
            if slot.status().load(Ordering::Acquire) != status_and_sequence {
                return Ok(Claim::Resolved);
            }
            trace!("position {position}: slot {} is undecided", descriptor.slot);
            Ok(Claim::Pending { expected })
        }
        _ => {
            // the decision may not be durable yet if the owner has not flushed it
            persist_word(slot.status());
            let final_value: u64 = if status == Status::Succeeded {
                slot.desired(entry).load(Ordering::Acquire)
            } else {
                slot.expected(entry).load(Ordering::Acquire)
            };
            if finalize_word(word, descriptor.marker(), final_value) {
                trace!(
                    "position {position}: finalized on behalf of slot {} ({status})",
                    descriptor.slot
                );
            }
            Ok(Claim::Resolved)
        }
    }
}

/// Binary search the slot's targets, which were persisted in ascending position order.
fn find_entry(pool: &Pool, slot: SlotWords, position: Position) -> Option<usize> {
    let count: usize = (slot.count().load(Ordering::Acquire) as usize).min(pool.layout().max_targets);
    let (mut low, mut high) = (0usize, count);
    while low < high {
        let middle: usize = low + (high - low) / 2;
        let candidate: u64 = slot.position(middle).load(Ordering::Acquire);
        match candidate.cmp(&(position as u64)) {
            core::cmp::Ordering::Equal => return Some(middle),
            core::cmp::Ordering::Less => low = middle + 1,
            core::cmp::Ordering::Greater => high = middle,
        }
    }
    None
}

#[cfg(all(test, not(feature = "shuttle")))]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::pmem::flush::persisted;
    use crate::types::{construct_status_and_sequence, DIRTY_FLAG};
    use test_log::test;

    fn claim_slot(pool: &Pool, slot: usize, status: Status, entries: &[(u64, u64, u64)]) {
        let words: SlotWords = pool.slot(slot);
        for (index, (position, expected, desired)) in entries.iter().enumerate() {
            words.position(index).store(*position, Ordering::Release);
            words.expected(index).store(*expected, Ordering::Release);
            words.desired(index).store(*desired, Ordering::Release);
        }
        words.count().store(entries.len() as u64, Ordering::Release);
        words
            .status()
            .store(construct_status_and_sequence(status, 5), Ordering::Release);
    }

    #[test]
    fn test_undecided_claim_is_pending() {
        let pool: Pool = Pool::create_volatile(PoolConfig::new(8)).unwrap();
        claim_slot(&pool, 1, Status::Undecided, &[(2, 20, 21), (6, 60, 61)]);
        let marker: u64 = DescriptorRef::new(1, 5).marker();
        let word: &AtomicU64 = &pool.words()[6];
        word.store(marker | DIRTY_FLAG, Ordering::Release);

        let claim: Claim =
            resolve_claim(&pool, 6, word, marker | DIRTY_FLAG, DescriptorRef::new(1, 5)).unwrap();
        assert_eq!(claim, Claim::Pending { expected: 60 });
        // the marker was flushed but is still there
        assert_eq!(word.load(Ordering::Acquire), marker);
    }

    #[test]
    fn test_decided_claim_is_finalized() {
        let pool: Pool = Pool::create_volatile(PoolConfig::new(8)).unwrap();
        claim_slot(&pool, 1, Status::Failed, &[(2, 20, 21), (6, 60, 61)]);
        let marker: u64 = DescriptorRef::new(1, 5).marker();
        let word: &AtomicU64 = &pool.words()[2];
        word.store(marker, Ordering::Release);

        let claim: Claim = resolve_claim(&pool, 2, word, marker, DescriptorRef::new(1, 5)).unwrap();
        assert_eq!(claim, Claim::Resolved);
        assert_eq!(word.load(Ordering::Acquire), 20);
    }

    #[test]
    fn test_decision_is_persisted_before_finalizing() {
        let pool: Pool = Pool::create_volatile(PoolConfig::new(8)).unwrap();
        claim_slot(&pool, 1, Status::Succeeded, &[(2, 20, 21), (6, 60, 61)]);
        let marker: u64 = DescriptorRef::new(1, 5).marker();
        let word: &AtomicU64 = &pool.words()[6];
        word.store(marker, Ordering::Release);

        persisted::take();
        let claim: Claim = resolve_claim(&pool, 6, word, marker, DescriptorRef::new(1, 5)).unwrap();
        assert_eq!(claim, Claim::Resolved);
        assert_eq!(word.load(Ordering::Acquire), 61);

        let log: Vec<usize> = persisted::take();
        let status_flushed: usize = persisted::index_of(&log, pool.slot(1).status()).unwrap();
        let word_flushed: usize = persisted::index_of(&log, word).unwrap();
        assert!(status_flushed < word_flushed, "{log:?}");
    }

    #[test]
    fn test_stale_sequence_is_resolved() {
        let pool: Pool = Pool::create_volatile(PoolConfig::new(8)).unwrap();
        claim_slot(&pool, 1, Status::Succeeded, &[(2, 20, 21)]);
        let stale: u64 = DescriptorRef::new(1, 4).marker();
        let word: &AtomicU64 = &pool.words()[2];
        word.store(stale, Ordering::Release);

        let claim: Claim = resolve_claim(&pool, 2, word, stale, DescriptorRef::new(1, 4)).unwrap();
        assert_eq!(claim, Claim::Resolved);
        assert_eq!(word.load(Ordering::Acquire), stale);
    }

    #[test]
    fn test_missing_entry_is_fatal() {
        let pool: Pool = Pool::create_volatile(PoolConfig::new(8)).unwrap();
        claim_slot(&pool, 0, Status::Undecided, &[(2, 20, 21)]);
        let marker: u64 = DescriptorRef::new(0, 5).marker();
        let word: &AtomicU64 = &pool.words()[3];
        word.store(marker, Ordering::Release);

        let result = resolve_claim(&pool, 3, word, marker, DescriptorRef::new(0, 5));
        assert!(matches!(
            result,
            Err(Error::Fatal(FatalError::MissingTargetEntry {
                position: 3,
                slot: 0
            }))
        ));
    }

    #[test]
    fn test_marker_slot_out_of_bounds_is_fatal() {
        let pool: Pool =
            Pool::create_volatile(PoolConfig::new(8).with_descriptor_slots(2)).unwrap();
        let marker: u64 = DescriptorRef::new(2, 0).marker();
        let word: &AtomicU64 = &pool.words()[0];
        word.store(marker, Ordering::Release);

        let result = resolve_claim(&pool, 0, word, marker, DescriptorRef::new(2, 0));
        assert!(matches!(
            result,
            Err(Error::Fatal(FatalError::MarkerSlotOutOfBounds { slot: 2, .. }))
        ));
    }
}
