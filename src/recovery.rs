//! Bringing a pool back to a consistent state after the previous process stopped mid-operation.
//!
//! Recovery runs single-threaded before any session exists:
//! 1. an active undo log of the lock-based competitor is rolled back,
//! 2. every descriptor which did not reach `Finalized` is finalized: rolled forward if it had
//!    persisted `Succeeded`, rolled back otherwise,
//! 3. the word array is swept, flushing dirty values. A descriptor marker surviving step 2 means the
//!    pool is corrupt.
//!
//! Every step can be interrupted and repeated, so a crash during recovery is recovered the same way.

use crate::descriptor::finalize_word;
use crate::err::{Error, FatalError};
use crate::layout::{SlotWords, UndoLogWords, UNDO_ACTIVE, UNDO_IDLE};
use crate::pmem::persist_word;
use crate::pool::Pool;
use crate::sync::{AtomicU64, Ordering};
use crate::types::{
    construct_status_and_sequence, extract_sequence_from_status_and_sequence,
    extract_status_from_status_and_sequence, SequenceNum, SlotIndex, Status, StatusAndSequence,
};
use crate::word::{stabilize, DescriptorRef, WordState};
use tracing::{debug, instrument};

/// What recovery changed while opening a pool.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RecoveryReport {
    /// Descriptors which had persisted `Succeeded` and were completed.
    pub rolled_forward: usize,
    /// Descriptors which were `Undecided` or `Failed` and were undone.
    pub rolled_back: usize,
    /// Words which still held a descriptor marker and received their final value.
    pub words_finalized: usize,
    /// Plain values which were left dirty and have been flushed.
    pub dirty_words_cleared: usize,
    /// Words restored from the lock-based competitor's undo log.
    pub undo_entries_restored: usize,
}

impl RecoveryReport {
    /// Whether the pool was shut down cleanly.
    pub fn is_clean(&self) -> bool {
        *self == RecoveryReport::default()
    }
}

#[instrument(skip(pool))]
pub(crate) fn recover(pool: &Pool) -> Result<RecoveryReport, Error> {
    let mut report: RecoveryReport = RecoveryReport::default();
    report.undo_entries_restored = roll_back_undo_log(pool)?;
    for slot in 0..pool.layout().descriptor_slots {
        recover_slot(pool, slot, &mut report)?;
    }
    sweep_words(pool, &mut report)?;
    Ok(report)
}

fn roll_back_undo_log(pool: &Pool) -> Result<usize, Error> {
    let undo_log: UndoLogWords = pool.undo_log();
    if undo_log.state().load(Ordering::Acquire) != UNDO_ACTIVE {
        return Ok(0);
    }

    let count: u64 = undo_log.count().load(Ordering::Acquire);
    let max_targets: usize = pool.layout().max_targets;
    if count > max_targets as u64 {
        return Err(FatalError::CorruptUndoLog { count, max_targets }.into());
    }
    for entry in 0..count as usize {
        let position: u64 = undo_log.position(entry).load(Ordering::Acquire);
        let word: &AtomicU64 = pool
            .word(position as usize)
            .map_err(|_| FatalError::CorruptUndoLogPosition(position))?;
        word.store(
            undo_log.old_value(entry).load(Ordering::Acquire),
            Ordering::Release,
        );
        persist_word(word);
    }

    undo_log.state().store(UNDO_IDLE, Ordering::Release);
    persist_word(undo_log.state());
    debug!("rolled back {count} words from the undo log");
    Ok(count as usize)
}

fn recover_slot(pool: &Pool, slot: SlotIndex, report: &mut RecoveryReport) -> Result<(), Error> {
    let words: SlotWords = pool.slot(slot);
    let status_and_sequence: StatusAndSequence = words.status().load(Ordering::Acquire);
    let status: Status = extract_status_from_status_and_sequence(status_and_sequence)?;
    if status == Status::Finalized {
        return Ok(());
    }
    let sequence: SequenceNum = extract_sequence_from_status_and_sequence(status_and_sequence);

    let count: u64 = words.count().load(Ordering::Acquire);
    let max_targets: usize = pool.layout().max_targets;
    if count > max_targets as u64 {
        return Err(FatalError::CorruptTargetCount {
            slot,
            count,
            max_targets,
        }
        .into());
    }

    // an undecided descriptor never reached the point where its outcome became durable
    let succeeded: bool = status == Status::Succeeded;
    let marker: u64 = DescriptorRef::new(slot, sequence).marker();
    for entry in 0..count as usize {
        let position: u64 = words.position(entry).load(Ordering::Acquire);
        let word: &AtomicU64 = pool
            .word(position as usize)
            .map_err(|_| FatalError::CorruptTargetPosition { slot, position })?;
        let final_value: u64 = if succeeded {
            words.desired(entry).load(Ordering::Acquire)
        } else {
            words.expected(entry).load(Ordering::Acquire)
        };
        if finalize_word(word, marker, final_value) {
            report.words_finalized += 1;
        }
    }

    words.status().store(
        construct_status_and_sequence(Status::Finalized, sequence),
        Ordering::Release,
    );
    persist_word(words.status());
    if succeeded {
        report.rolled_forward += 1;
    } else {
        report.rolled_back += 1;
    }
    debug!("slot {slot}: finalized {status} descriptor with sequence {sequence}");
    Ok(())
}

fn sweep_words(pool: &Pool, report: &mut RecoveryReport) -> Result<(), Error> {
    for (position, word) in pool.words().iter().enumerate() {
        let raw: u64 = word.load(Ordering::Acquire);
        match WordState::decode(raw) {
            WordState::Stable(_) => {}
            WordState::Dirty(_) => {
                stabilize(word, raw);
                report.dirty_words_cleared += 1;
            }
            WordState::Claimed { descriptor, .. } => {
                let slots: usize = pool.layout().descriptor_slots;
                let fatal_error: FatalError = if descriptor.slot >= slots {
                    FatalError::MarkerSlotOutOfBounds {
                        position,
                        slot: descriptor.slot,
                        slots,
                    }
                } else {
                    FatalError::OrphanedDescriptorMarker {
                        position,
                        slot: descriptor.slot,
                        sequence: descriptor.sequence,
                    }
                };
                return Err(fatal_error.into());
            }
        }
    }
    Ok(())
}
