use crate::err::Error;
use crate::types::Position;

/// The distinct positions one benchmark operation updates together, in ascending order once
/// [Operation::sort_targets] has been called.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Operation {
    targets: Vec<Position>,
}

impl Operation {
    pub fn with_capacity(arity: usize) -> Self {
        Self {
            targets: Vec::with_capacity(arity),
        }
    }

    /// Build an operation from explicit positions, which must not repeat.
    pub fn from_positions(positions: impl IntoIterator<Item = Position>) -> Result<Self, Error> {
        let mut operation: Operation = Operation::default();
        for position in positions {
            if !operation.push_if_unique(position) {
                return Err(Error::DuplicateTarget { position });
            }
        }
        operation.sort_targets();
        Ok(operation)
    }

    /// Add `position` unless the operation already targets it.
    pub fn push_if_unique(&mut self, position: Position) -> bool {
        if self.targets.contains(&position) {
            return false;
        }
        self.targets.push(position);
        true
    }

    pub fn sort_targets(&mut self) {
        self.targets.sort_unstable();
    }

    pub fn positions(&self) -> &[Position] {
        &self.targets
    }

    pub fn position(&self, index: usize) -> Option<Position> {
        self.targets.get(index).copied()
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}
