use crate::err::StatusOutOfBoundsError;
use core::fmt::{Display, Formatter};

/// The index of a persistent word inside a pool's word array.
pub(crate) type Position = usize;

/// The index of a descriptor slot inside a pool's descriptor area.
pub(crate) type SlotIndex = usize;

/// A counter which identifies one use of a descriptor slot.
///
/// Every allocation of a slot advances its sequence number, so a marker left in a word by an
/// earlier use of the same slot can be told apart from the current one. Only equality matters, so
/// the counter wraps around after [SEQUENCE_BIT_LENGTH] bits.
pub(crate) type SequenceNum = u64;

/// A u64 which combines a [Status] in the [STATUS_BIT_LENGTH] most significant bits and a
/// [SequenceNum] in the [SEQUENCE_BIT_LENGTH] least significant bits. This is the persistent status
/// word of a descriptor slot; storing both in one word lets recovery trust them together.
pub(crate) type StatusAndSequence = u64;

/// Set while a value has been written but not yet flushed to persistent memory.
pub(crate) const DIRTY_FLAG: u64 = 1 << 63;

/// Set while a word is claimed by an in-flight descriptor.
pub(crate) const DESCRIPTOR_FLAG: u64 = 1 << 62;

/// Bits which application values may not use.
pub(crate) const RESERVED_BITS: u64 = DIRTY_FLAG | DESCRIPTOR_FLAG;

pub(crate) const SEQUENCE_BIT_LENGTH: u32 = 40;

pub(crate) const SEQUENCE_MASK: u64 = (1 << SEQUENCE_BIT_LENGTH) - 1;

/// Bits left for the slot index in a descriptor marker once the two flags and the sequence number
/// are accounted for.
pub(crate) const SLOT_INDEX_BIT_LENGTH: u32 = 64 - 2 - SEQUENCE_BIT_LENGTH;

pub(crate) const MAX_DESCRIPTOR_SLOTS: usize = 1 << SLOT_INDEX_BIT_LENGTH;

/// The total number of bits a [Status] takes up in a [StatusAndSequence].
pub(crate) const STATUS_BIT_LENGTH: u32 = 3;

/// The persistent status of a descriptor slot.
///
/// `Finalized` can transition to `Undecided` when the slot is published by a new operation.
/// `Undecided` can transition to either `Succeeded` or `Failed`; that store is the durability
/// point of the operation.
/// `Succeeded` and `Failed` transition to `Finalized` once every target word holds a plain value
/// again, either through the owning thread or through recovery.
///
/// `Finalized` is zero so that a freshly created, zero-filled pool has nothing to recover.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Status {
    /// The slot is idle: its last operation, if any, left no descriptor markers behind.
    Finalized = 0,
    /// The slot's operation is installing markers and has not decided its outcome yet.
    Undecided = 1,
    /// The slot's operation succeeded; claimed words must end up with the desired values.
    Succeeded = 2,
    /// The slot's operation failed; claimed words must end up with the expected values.
    Failed = 3,
}

impl Display for Status {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        write!(f, "{self:?}")
    }
}

impl TryFrom<u64> for Status {
    type Error = StatusOutOfBoundsError;

    fn try_from(status: u64) -> Result<Self, StatusOutOfBoundsError> {
        match status {
            i if i == Status::Finalized as u64 => Ok(Status::Finalized),
            i if i == Status::Undecided as u64 => Ok(Status::Undecided),
            i if i == Status::Succeeded as u64 => Ok(Status::Succeeded),
            i if i == Status::Failed as u64 => Ok(Status::Failed),
            i => Err(StatusOutOfBoundsError(i)),
        }
    }
}

/// Construct a number containing both a [Status] and a sequence number.
pub(crate) fn construct_status_and_sequence(
    status: Status,
    sequence: SequenceNum,
) -> StatusAndSequence {
    (status as u64) << (u64::BITS - STATUS_BIT_LENGTH) | (sequence & SEQUENCE_MASK)
}

/// Extract the [Status] out of a number which holds both a status and a sequence number.
pub(crate) fn extract_status_from_status_and_sequence(
    status_and_sequence: StatusAndSequence,
) -> Result<Status, StatusOutOfBoundsError> {
    Status::try_from(status_and_sequence >> (u64::BITS - STATUS_BIT_LENGTH))
}

/// Extract the sequence number out of a number which holds both a status and a sequence number.
pub(crate) fn extract_sequence_from_status_and_sequence(
    status_and_sequence: StatusAndSequence,
) -> SequenceNum {
    status_and_sequence & SEQUENCE_MASK
}

/// The sequence number for the next use of a slot, rolling over at [SEQUENCE_BIT_LENGTH] bits.
pub(crate) fn next_sequence(sequence: SequenceNum) -> SequenceNum {
    (sequence + 1) & SEQUENCE_MASK
}
