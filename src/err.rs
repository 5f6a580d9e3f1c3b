use crate::types::{Position, SequenceNum, SlotIndex};
use displaydoc::Display;

/// Any error which can occur while opening a pool or performing an operation on it.
///
/// A CAS which loses to a concurrent writer is not an error: [crate::Descriptor::commit] and
/// [crate::Session::pcas] report it as `Ok(false)`.
#[derive(Debug, Display)]
pub enum Error {
    /// An unrecoverable error occurred and in-flight changes may not have been cleaned up: {0}
    Fatal(FatalError),

    /// Failed to create, size or map the pool file: {0}
    Io(std::io::Error),

    /// The pool file's {field} is {actual}, but {expected} was expected.
    LayoutMismatch {
        field: &'static str,
        expected: u64,
        actual: u64,
    },

    /// Every descriptor slot is in use and none became free after retrying.
    DescriptorPoolExhausted,

    /// A descriptor cannot be committed without at least one target.
    NoTargets,

    /// A descriptor already holds the maximum of {max_targets} targets.
    TooManyTargets { max_targets: usize },

    /// Position {position} was already staged in this descriptor.
    DuplicateTarget { position: Position },

    /// Position {position} is outside of the pool's {capacity} words.
    PositionOutOfBounds { position: Position, capacity: usize },

    /// Value {value:#x} uses the two most significant bits, which are reserved for internal flags.
    ValueUsesReservedBits { value: u64 },

    /// This competitor cannot update {0} words in one operation.
    UnsupportedArity(usize),

    /// Invalid pool configuration: {0}
    InvalidConfig(&'static str),
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Fatal(fatal_error) => Some(fatal_error),
            Error::Io(io_error) => Some(io_error),
            _ => None,
        }
    }
}

impl From<FatalError> for Error {
    fn from(fatal_error: FatalError) -> Self {
        Error::Fatal(fatal_error)
    }
}

impl From<std::io::Error> for Error {
    fn from(io_error: std::io::Error) -> Self {
        Error::Io(io_error)
    }
}

impl From<StatusOutOfBoundsError> for Error {
    fn from(status_out_of_bounds_error: StatusOutOfBoundsError) -> Self {
        Error::Fatal(status_out_of_bounds_error.into())
    }
}

/// An unrecoverable error.
#[derive(Debug, Display, Eq, PartialEq)]
pub enum FatalError {
    /// Tried to deserialize a number as a status, but it does not correlate to a valid status: {0}
    StatusOutOfBounds(u64),

    /// Descriptor slot {slot} claims {count} targets, more than the pool's maximum of {max_targets}.
    CorruptTargetCount {
        slot: SlotIndex,
        count: u64,
        max_targets: usize,
    },

    /// Descriptor slot {slot} names position {position}, which is outside of the word array.
    CorruptTargetPosition { slot: SlotIndex, position: u64 },

    /** Position {position} still refers to descriptor slot {slot} with sequence {sequence} after
        every descriptor was finalized, which should not be possible.
    */
    OrphanedDescriptorMarker {
        position: Position,
        slot: SlotIndex,
        sequence: SequenceNum,
    },

    /// Position {position} refers to descriptor slot {slot}, but the pool only has {slots} slots.
    MarkerSlotOutOfBounds {
        position: Position,
        slot: SlotIndex,
        slots: usize,
    },

    /// The undo log claims {count} entries, more than the pool's maximum of {max_targets}.
    CorruptUndoLog { count: u64, max_targets: usize },

    /// The undo log names position {0}, which is outside of the word array.
    CorruptUndoLogPosition(u64),

    /// Descriptor slot {slot} moved from {original} to {actual} while it was still owned.
    IllegalStatusChange {
        slot: SlotIndex,
        original: u64,
        actual: u64,
    },

    /** Position {position} holds a marker of descriptor slot {slot}, but that descriptor does not
        list the position as one of its targets.
    */
    MissingTargetEntry { position: Position, slot: SlotIndex },
}

impl std::error::Error for FatalError {}

impl From<StatusOutOfBoundsError> for FatalError {
    fn from(status_out_of_bounds_error: StatusOutOfBoundsError) -> Self {
        FatalError::StatusOutOfBounds(status_out_of_bounds_error.0)
    }
}

/// Attempted to convert a u64 into a Status but it was out of bounds: {0}
#[derive(Debug, Display, Eq, PartialEq)]
pub struct StatusOutOfBoundsError(pub(crate) u64);
