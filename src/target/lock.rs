use crate::err::Error;
use crate::layout::{UndoLogWords, UNDO_ACTIVE, UNDO_IDLE};
use crate::operation::Operation;
use crate::pmem::{persist_word, persist_words};
use crate::pool::Pool;
use crate::session::check_value;
use crate::sync::{AtomicU64, Mutex, Ordering};
use crate::word::pread;
use std::sync::PoisonError;

/// The lock-based competitor: one mutex serializes every operation on the pool, and an undo log
/// makes each operation atomic across crashes.
#[derive(Debug)]
pub struct LockTarget {
    pool: Pool,
    lock: Mutex<()>,
}

impl LockTarget {
    pub fn new(pool: Pool) -> Self {
        Self {
            pool,
            lock: Mutex::new(()),
        }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Increment every targeted word by one.
    ///
    /// The old values are logged and flushed before the first word changes. Recovery restores them
    /// if the process stops before the log is retired.
    pub fn execute(&self, operation: &Operation) -> Result<usize, Error> {
        let max_targets: usize = self.pool.layout().max_targets;
        if operation.is_empty() {
            return Err(Error::NoTargets);
        }
        if operation.len() > max_targets {
            return Err(Error::TooManyTargets { max_targets });
        }
        let words: Vec<&AtomicU64> = operation
            .positions()
            .iter()
            .map(|&position| self.pool.word(position))
            .collect::<Result<_, _>>()?;

        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let old_values: Vec<u64> = words.iter().map(|word| pread(word)).collect();
        for &old_value in &old_values {
            check_value(old_value + 1)?;
        }

        let undo_log: UndoLogWords = self.pool.undo_log();
        for (entry, (&position, &old_value)) in
            operation.positions().iter().zip(&old_values).enumerate()
        {
            undo_log
                .position(entry)
                .store(position as u64, Ordering::Relaxed);
            undo_log.old_value(entry).store(old_value, Ordering::Relaxed);
        }
        undo_log
            .count()
            .store(operation.len() as u64, Ordering::Relaxed);
        persist_words(undo_log.body(operation.len()));
        undo_log.state().store(UNDO_ACTIVE, Ordering::Release);
        persist_word(undo_log.state());

        for (word, &old_value) in words.iter().zip(&old_values) {
            word.store(old_value + 1, Ordering::Release);
            persist_word(word);
        }

        undo_log.state().store(UNDO_IDLE, Ordering::Release);
        persist_word(undo_log.state());
        Ok(1)
    }
}

#[cfg(all(test, not(feature = "shuttle")))]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use test_log::test;

    #[test]
    fn test_undo_log_is_retired() {
        let target: LockTarget =
            LockTarget::new(Pool::create_volatile(PoolConfig::new(8)).unwrap());
        let operation: Operation = Operation::from_positions([1, 4]).unwrap();
        assert_eq!(target.execute(&operation).unwrap(), 1);

        let undo_log: UndoLogWords = target.pool().undo_log();
        assert_eq!(undo_log.state().load(Ordering::Acquire), UNDO_IDLE);
        assert_eq!(undo_log.count().load(Ordering::Acquire), 2);
        assert_eq!(undo_log.position(1).load(Ordering::Acquire), 4);
        assert_eq!(target.pool().read(4).unwrap(), 1);
    }

    #[test]
    fn test_rejects_operations_before_writing() {
        let target: LockTarget =
            LockTarget::new(Pool::create_volatile(PoolConfig::new(8).with_max_targets(2)).unwrap());
        assert!(matches!(
            target.execute(&Operation::from_positions([0, 1, 2]).unwrap()),
            Err(Error::TooManyTargets { max_targets: 2 })
        ));
        assert!(matches!(
            target.execute(&Operation::from_positions([0, 8]).unwrap()),
            Err(Error::PositionOutOfBounds { position: 8, .. })
        ));
        assert_eq!(target.pool().read(0).unwrap(), 0);
    }
}
