//! The persistent multi-word CAS descriptor.
//!
//! A commit moves a descriptor slot through these steps, flushing after each one:
//! 1. the staged targets and an `Undecided` status are written into the slot,
//! 2. every target word is claimed with the descriptor's marker, in ascending position order,
//! 3. the status becomes `Succeeded` or `Failed`, which decides the operation even across a crash,
//! 4. every claimed word receives its final value,
//! 5. the status becomes `Finalized` and the slot is handed back to the pool.

use crate::err::{Error, FatalError};
use crate::pmem::{persist_word, persist_words};
use crate::pool::Pool;
use crate::session::{check_value, Session};
use crate::sync::{AtomicU64, Ordering};
use crate::types::{
    construct_status_and_sequence, extract_sequence_from_status_and_sequence, next_sequence,
    Position, SequenceNum, SlotIndex, Status, StatusAndSequence,
};
use crate::word::DescriptorRef;
use crossbeam_epoch::Guard;
use tracing::{debug, instrument, trace};

mod finalize;
pub(crate) mod help;
mod install;

pub(crate) use finalize::finalize_word;

/// One word a descriptor wants to swap.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TargetEntry {
    pub position: Position,
    pub expected: u64,
    pub desired: u64,
}

/// Where a commit stops early in crash tests, as if the process had died there.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum CrashPoint {
    /// The slot holds the targets and an undecided status; no word is claimed.
    AfterStage,
    /// Every target word is claimed, the status is still undecided.
    AfterInstall,
    /// The outcome is persisted, no word is finalized.
    AfterStatus,
    /// About half of the claimed words are finalized.
    DuringFinalize,
}

/// A multi-word CAS in preparation, owning one descriptor slot of the pool.
///
/// Targets are staged with [Descriptor::stage] and swapped together by [Descriptor::commit].
/// Dropping a descriptor without committing it frees its slot without touching any word.
pub struct Descriptor<'s, 'p> {
    session: &'s Session<'p>,
    slot: SlotIndex,
    sequence: SequenceNum,
    /// Sorted by position.
    entries: Vec<TargetEntry>,
    guard: Guard,
    /// Whether other threads may have observed this slot's contents.
    published: bool,
    #[cfg(test)]
    crash_point: Option<CrashPoint>,
}

impl<'s, 'p> Descriptor<'s, 'p> {
    pub(crate) fn new(session: &'s Session<'p>, slot: SlotIndex) -> Self {
        let pool: &Pool = session.pool();
        let previous: StatusAndSequence = pool.slot(slot).status().load(Ordering::Acquire);
        Self {
            session,
            slot,
            sequence: next_sequence(extract_sequence_from_status_and_sequence(previous)),
            entries: Vec::with_capacity(pool.layout().max_targets),
            guard: session.pin(),
            published: false,
            #[cfg(test)]
            crash_point: None,
        }
    }

    pub fn targets(&self) -> &[TargetEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn descriptor_ref(&self) -> DescriptorRef {
        DescriptorRef::new(self.slot, self.sequence)
    }

    #[cfg(test)]
    pub(crate) fn crash_at(&mut self, crash_point: CrashPoint) {
        self.crash_point = Some(crash_point);
    }

    #[cfg(test)]
    fn should_crash(&self, crash_point: CrashPoint) -> bool {
        self.crash_point == Some(crash_point)
    }

    #[cfg(not(test))]
    #[inline(always)]
    fn should_crash(&self, _crash_point: CrashPoint) -> bool {
        false
    }

    /// Add a word to swap from `expected` to `desired`. Nothing is written until commit.
    ///
    /// The target is rejected, and the descriptor left as it was, if `position` is already staged,
    /// outside of the pool, or if the descriptor is full.
    pub fn stage(&mut self, position: Position, expected: u64, desired: u64) -> Result<(), Error> {
        check_value(expected)?;
        check_value(desired)?;
        let pool: &Pool = self.session.pool();
        if position >= pool.capacity() {
            return Err(Error::PositionOutOfBounds {
                position,
                capacity: pool.capacity(),
            });
        }

        let index: usize = match self
            .entries
            .binary_search_by_key(&position, |entry| entry.position)
        {
            Ok(_) => return Err(Error::DuplicateTarget { position }),
            Err(index) => index,
        };
        let max_targets: usize = pool.layout().max_targets;
        if self.entries.len() >= max_targets {
            return Err(Error::TooManyTargets { max_targets });
        }
        self.entries.insert(
            index,
            TargetEntry {
                position,
                expected,
                desired,
            },
        );
        Ok(())
    }

    /// Swap every staged word from its expected to its desired value, or none of them.
    ///
    /// Returns `Ok(false)` if at least one word did not hold its expected value; the caller should
    /// read fresh values and try again with a new descriptor.
    #[instrument(skip(self), fields(slot = self.slot, sequence = self.sequence, targets = self.entries.len()))]
    pub fn commit(mut self) -> Result<bool, Error> {
        if self.entries.is_empty() {
            return Err(Error::NoTargets);
        }
        let pool: &Pool = self.session.pool();
        let descriptor: DescriptorRef = self.descriptor_ref();

        self.persist_entries();
        self.published = true;
        if self.should_crash(CrashPoint::AfterStage) {
            return Ok(false);
        }

        let installed: usize = install::install(pool, descriptor, &self.entries)?;
        let succeeded: bool = installed == self.entries.len();
        trace!("installed {installed} of {} targets", self.entries.len());
        if self.should_crash(CrashPoint::AfterInstall) {
            return Ok(false);
        }

        let outcome: Status = if succeeded {
            Status::Succeeded
        } else {
            Status::Failed
        };
        self.change_status(Status::Undecided, outcome)?;
        debug!("decided {outcome}");
        if self.should_crash(CrashPoint::AfterStatus) {
            return Ok(false);
        }

        let mut to_finalize: usize = installed;
        if self.should_crash(CrashPoint::DuringFinalize) {
            to_finalize = (installed + 1) / 2;
        }
        for entry in &self.entries[..to_finalize] {
            let final_value: u64 = if succeeded {
                entry.desired
            } else {
                entry.expected
            };
            finalize_word(pool.word(entry.position)?, descriptor.marker(), final_value);
        }
        if to_finalize < installed {
            return Ok(false);
        }

        self.change_status(outcome, Status::Finalized)?;
        pool.release_slot_deferred(&self.guard, self.slot);
        Ok(succeeded)
    }

    /// Write the targets, then the undecided status, into the slot.
    fn persist_entries(&self) {
        let slot = self.session.pool().slot(self.slot);
        for (index, entry) in self.entries.iter().enumerate() {
            slot.position(index)
                .store(entry.position as u64, Ordering::Relaxed);
            slot.expected(index).store(entry.expected, Ordering::Relaxed);
            slot.desired(index).store(entry.desired, Ordering::Relaxed);
        }
        slot.count()
            .store(self.entries.len() as u64, Ordering::Relaxed);
        persist_words(slot.body(self.entries.len()));

        let status: &AtomicU64 = slot.status();
        status.store(
            construct_status_and_sequence(Status::Undecided, self.sequence),
            Ordering::Release,
        );
        persist_word(status);
    }

    /// Only the owning thread writes a published slot's status, so a CAS failure here means the
    /// slot was corrupted.
    fn change_status(&self, from: Status, to: Status) -> Result<(), Error> {
        let status: &AtomicU64 = self.session.pool().slot(self.slot).status();
        let original: StatusAndSequence = construct_status_and_sequence(from, self.sequence);
        status
            .compare_exchange(
                original,
                construct_status_and_sequence(to, self.sequence),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map_err(|actual| FatalError::IllegalStatusChange {
                slot: self.slot,
                original,
                actual,
            })?;
        persist_word(status);
        Ok(())
    }
}

impl Drop for Descriptor<'_, '_> {
    fn drop(&mut self) {
        if !self.published {
            self.session.pool().release_slot_now(self.slot);
        }
    }
}

impl core::fmt::Debug for Descriptor<'_, '_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Descriptor")
            .field("slot", &self.slot)
            .field("sequence", &self.sequence)
            .field("entries", &self.entries)
            .finish()
    }
}

#[cfg(all(test, not(feature = "shuttle")))]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::types::DIRTY_FLAG;
    use test_log::test;

    fn pool(max_targets: usize) -> Pool {
        Pool::create_volatile(PoolConfig::new(16).with_max_targets(max_targets)).unwrap()
    }

    #[test]
    fn test_stage_keeps_targets_sorted() {
        let pool: Pool = pool(8);
        let session: Session = pool.session();
        let mut descriptor: Descriptor = session.descriptor().unwrap();
        for position in [9, 2, 14, 0, 5] {
            descriptor.stage(position, 0, 1).unwrap();
        }
        let positions: Vec<Position> = descriptor
            .targets()
            .iter()
            .map(|entry| entry.position)
            .collect();
        assert_eq!(positions, vec![0, 2, 5, 9, 14]);
    }

    #[test]
    fn test_stage_rejects_duplicates_without_overwriting() {
        let pool: Pool = pool(8);
        let session: Session = pool.session();
        let mut descriptor: Descriptor = session.descriptor().unwrap();
        descriptor.stage(3, 0, 1).unwrap();
        assert!(matches!(
            descriptor.stage(3, 5, 6),
            Err(Error::DuplicateTarget { position: 3 })
        ));
        assert_eq!(
            descriptor.targets(),
            &[TargetEntry {
                position: 3,
                expected: 0,
                desired: 1
            }]
        );
    }

    #[test]
    fn test_stage_boundary_at_max_targets() {
        let pool: Pool = pool(4);
        let session: Session = pool.session();
        let mut descriptor: Descriptor = session.descriptor().unwrap();
        for position in 0..4 {
            descriptor.stage(position, 0, 1).unwrap();
        }
        assert!(matches!(
            descriptor.stage(4, 0, 1),
            Err(Error::TooManyTargets { max_targets: 4 })
        ));
        assert_eq!(descriptor.len(), 4);
        assert!(descriptor.commit().unwrap());
        assert!((0..4).all(|position| session.read(position).unwrap() == 1));
        assert_eq!(session.read(4).unwrap(), 0);
    }

    #[test]
    fn test_stage_rejects_invalid_input() {
        let pool: Pool = pool(4);
        let session: Session = pool.session();
        let mut descriptor: Descriptor = session.descriptor().unwrap();
        assert!(matches!(
            descriptor.stage(16, 0, 1),
            Err(Error::PositionOutOfBounds { .. })
        ));
        assert!(matches!(
            descriptor.stage(0, DIRTY_FLAG, 1),
            Err(Error::ValueUsesReservedBits { .. })
        ));
        assert!(descriptor.is_empty());
    }

    #[test]
    fn test_commit_without_targets() {
        let pool: Pool = pool(4);
        let session: Session = pool.session();
        let descriptor: Descriptor = session.descriptor().unwrap();
        assert!(matches!(descriptor.commit(), Err(Error::NoTargets)));
        assert_eq!(pool.reserved_slots(), 0);
    }

    #[test]
    fn test_failed_commit_changes_nothing() {
        let pool: Pool = pool(4);
        let session: Session = pool.session();
        assert!(session.pcas(2, 0, 7).unwrap());

        let mut descriptor: Descriptor = session.descriptor().unwrap();
        descriptor.stage(1, 0, 10).unwrap();
        descriptor.stage(2, 0, 20).unwrap();
        descriptor.stage(3, 0, 30).unwrap();
        assert!(!descriptor.commit().unwrap());

        assert_eq!(session.read(1).unwrap(), 0);
        assert_eq!(session.read(2).unwrap(), 7);
        assert_eq!(session.read(3).unwrap(), 0);
        assert!(pool
            .words()
            .iter()
            .all(|word| word.load(Ordering::Acquire) & crate::types::RESERVED_BITS == 0));
    }

    #[test]
    fn test_read_during_undecided_descriptor_returns_expected_value() {
        let pool: Pool = pool(4);
        let session: Session = pool.session();
        let mut descriptor: Descriptor = session.descriptor().unwrap();
        descriptor.stage(1, 0, 10).unwrap();
        descriptor.stage(2, 0, 20).unwrap();
        descriptor.crash_at(CrashPoint::AfterInstall);
        assert!(!descriptor.commit().unwrap());

        let reader: Session = pool.session();
        assert_eq!(reader.read(1).unwrap(), 0);
        assert_eq!(reader.read(2).unwrap(), 0);
    }

    #[test]
    fn test_read_finalizes_decided_descriptor() {
        let pool: Pool = pool(4);
        let session: Session = pool.session();
        let mut descriptor: Descriptor = session.descriptor().unwrap();
        descriptor.stage(1, 0, 10).unwrap();
        descriptor.stage(2, 0, 20).unwrap();
        descriptor.crash_at(CrashPoint::AfterStatus);
        assert!(!descriptor.commit().unwrap());

        let reader: Session = pool.session();
        assert_eq!(reader.read(2).unwrap(), 20);
        assert_eq!(pool.words()[2].load(Ordering::Acquire), 20);
        assert_eq!(reader.read(1).unwrap(), 10);

        // a later operation on the helped words goes through
        let mut next: Descriptor = reader.descriptor().unwrap();
        next.stage(1, 10, 11).unwrap();
        next.stage(2, 20, 21).unwrap();
        assert!(next.commit().unwrap());
        assert_eq!(reader.read(1).unwrap(), 11);
    }
}
