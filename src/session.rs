use crate::descriptor::help::{resolve_claim, Claim};
use crate::descriptor::Descriptor;
use crate::err::Error;
use crate::pool::Pool;
use crate::sync::{spin_wait, AtomicU64, Ordering};
use crate::types::{Position, SlotIndex};
use crate::word::{pcas, stabilize, uses_reserved_bits, WordState};
use core::cell::Cell;
use core::fmt::{Debug, Formatter};
use crossbeam_epoch::{Guard, LocalHandle};
use tracing::{instrument, trace, warn};

/// A thread's handle on a [Pool].
///
/// A session is registered with the pool's epoch collector and is therefore tied to the thread
/// which created it. Create one session per worker thread and reuse it for every operation.
pub struct Session<'p> {
    pool: &'p Pool,
    handle: LocalHandle,
    /// Where the next descriptor slot search starts.
    hint: Cell<SlotIndex>,
}

impl<'p> Session<'p> {
    pub(crate) fn new(pool: &'p Pool, hint: SlotIndex) -> Self {
        Self {
            pool,
            handle: pool.collector().register(),
            hint: Cell::new(hint),
        }
    }

    pub fn pool(&self) -> &'p Pool {
        self.pool
    }

    pub(crate) fn pin(&self) -> Guard {
        self.handle.pin()
    }

    /// Read the logical value at `position`.
    ///
    /// A word claimed by an undecided descriptor reads as that descriptor's expected value, since
    /// the descriptor has not taken effect yet. A word claimed by a decided descriptor is finalized
    /// on the descriptor's behalf before reading it again.
    pub fn read(&self, position: Position) -> Result<u64, Error> {
        let word: &AtomicU64 = self.pool.word(position)?;
        let _guard: Guard = self.pin();
        loop {
            let raw: u64 = word.load(Ordering::Acquire);
            match WordState::decode(raw) {
                WordState::Stable(value) => return Ok(value),
                WordState::Dirty(_) => return Ok(stabilize(word, raw)),
                WordState::Claimed { descriptor, .. } => {
                    match resolve_claim(self.pool, position, word, raw, descriptor)? {
                        Claim::Pending { expected } => return Ok(expected),
                        Claim::Resolved => trace!("position {position}: claim resolved, rereading"),
                    }
                }
            }
        }
    }

    /// Persistent single-word CAS, bypassing the descriptor protocol.
    ///
    /// Returns `Ok(false)` if the logical value at `position` was not `expected`. A word claimed by
    /// a descriptor is waited on or finalized first, so this is safe to mix with descriptors on the
    /// same pool.
    #[instrument(skip(self))]
    pub fn pcas(&self, position: Position, expected: u64, desired: u64) -> Result<bool, Error> {
        check_value(expected)?;
        check_value(desired)?;
        let word: &AtomicU64 = self.pool.word(position)?;
        let _guard: Guard = self.pin();

        let mut attempt: usize = 0;
        loop {
            let actual: u64 = match pcas(word, expected, desired) {
                Ok(()) => return Ok(true),
                Err(actual) => actual,
            };
            let WordState::Claimed { descriptor, .. } = WordState::decode(actual) else {
                return Ok(false);
            };
            if let Claim::Pending { .. } =
                resolve_claim(self.pool, position, word, actual, descriptor)?
            {
                spin_wait(
                    attempt,
                    self.pool.config().spin_retries,
                    self.pool.config().backoff,
                );
                attempt += 1;
            }
        }
    }

    /// Reserve a descriptor slot for a new multi-word operation.
    ///
    /// If every slot is taken, finished descriptors are given a chance to be reclaimed and the
    /// reservation is retried up to [crate::PoolConfig::allocation_retries] times.
    pub fn descriptor(&self) -> Result<Descriptor<'_, 'p>, Error> {
        let slots: usize = self.pool.layout().descriptor_slots;
        let mut attempt: usize = 0;
        loop {
            if let Some(slot) = self.pool.try_reserve_slot(self.hint.get()) {
                self.hint.set((slot + 1) % slots);
                return Ok(Descriptor::new(self, slot));
            }
            if attempt >= self.pool.config().allocation_retries {
                warn!("no descriptor slot became free after {attempt} retries");
                return Err(Error::DescriptorPoolExhausted);
            }
            trace!("all descriptor slots are reserved, flushing deferred releases");
            self.handle.pin().flush();
            spin_wait(
                attempt,
                self.pool.config().spin_retries,
                self.pool.config().backoff,
            );
            attempt += 1;
        }
    }
}

pub(crate) fn check_value(value: u64) -> Result<(), Error> {
    if uses_reserved_bits(value) {
        return Err(Error::ValueUsesReservedBits { value });
    }
    Ok(())
}

impl Debug for Session<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Session")
            .field("hint", &self.hint.get())
            .finish()
    }
}

#[cfg(all(test, not(feature = "shuttle")))]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::types::DIRTY_FLAG;
    use test_log::test;

    #[test]
    fn test_read_stabilizes_dirty_word() {
        let pool: Pool = Pool::create_volatile(PoolConfig::new(4)).unwrap();
        pool.words()[2].store(7 | DIRTY_FLAG, Ordering::Release);

        let session: Session = pool.session();
        assert_eq!(session.read(2).unwrap(), 7);
        assert_eq!(pool.words()[2].load(Ordering::Acquire), 7);
    }

    #[test]
    fn test_pcas_rejects_bad_input() {
        let pool: Pool = Pool::create_volatile(PoolConfig::new(4)).unwrap();
        let session: Session = pool.session();
        assert!(matches!(
            session.pcas(0, 0, DIRTY_FLAG),
            Err(Error::ValueUsesReservedBits { .. })
        ));
        assert!(matches!(
            session.pcas(4, 0, 1),
            Err(Error::PositionOutOfBounds { .. })
        ));
        assert!(session.pcas(0, 0, 1).unwrap());
        assert!(!session.pcas(0, 0, 2).unwrap());
        assert_eq!(session.read(0).unwrap(), 1);
    }

    #[test]
    fn test_descriptor_pool_exhaustion() {
        let config: PoolConfig = PoolConfig::new(4)
            .with_descriptor_slots(2)
            .with_allocation_retries(3)
            .with_backoff(core::time::Duration::ZERO);
        let pool: Pool = Pool::create_volatile(config).unwrap();
        let session: Session = pool.session();

        let first: Descriptor = session.descriptor().unwrap();
        let second: Descriptor = session.descriptor().unwrap();
        assert!(matches!(
            session.descriptor(),
            Err(Error::DescriptorPoolExhausted)
        ));

        // an uncommitted descriptor gives its slot back as soon as it is dropped
        drop(second);
        let third: Descriptor = session.descriptor().unwrap();
        drop(first);
        drop(third);
        assert_eq!(pool.reserved_slots(), 0);
    }

    #[test]
    fn test_committed_slots_are_reclaimed() {
        let config: PoolConfig = PoolConfig::new(4)
            .with_descriptor_slots(2)
            .with_backoff(core::time::Duration::ZERO);
        let pool: Pool = Pool::create_volatile(config).unwrap();
        let session: Session = pool.session();

        for value in 0..100 {
            let mut descriptor: Descriptor = session.descriptor().unwrap();
            descriptor.stage(1, value, value + 1).unwrap();
            assert!(descriptor.commit().unwrap());
        }
        assert_eq!(session.read(1).unwrap(), 100);
    }
}
