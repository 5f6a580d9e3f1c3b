use crate::config::PoolConfig;
use crate::err::Error;
use crate::layout::{Layout, SlotWords, UndoLogWords};
use crate::pmem::{HeapRegion, Region};
use crate::recovery::RecoveryReport;
use crate::session::Session;
use crate::sync::{Arc, AtomicBool, AtomicU64, AtomicUsize, Ordering};
use crate::types::{Position, SlotIndex};
use crossbeam_epoch::{Collector, Guard};

#[cfg(not(feature = "shuttle"))]
use crate::pmem::FileRegion;
#[cfg(not(feature = "shuttle"))]
use std::path::{Path, PathBuf};
#[cfg(not(feature = "shuttle"))]
use tracing::{debug, info, instrument, warn};

/// A region of persistent words together with the descriptor slots which coordinate updates to
/// them.
///
/// Threads operate on a pool through a [Session] each. Every session registers with the pool's
/// epoch collector, which decides when a finished descriptor's slot may be handed out again.
#[derive(Debug)]
pub struct Pool {
    region: Box<dyn Region>,
    layout: Layout,
    config: PoolConfig,

    /// Volatile ownership flags, one per descriptor slot. Shared with deferred epoch callbacks,
    /// which may outlive a borrow of the pool.
    reservations: Arc<Vec<AtomicBool>>,

    collector: Collector,

    /// The number of sessions ever created, used to spread sessions across the slots.
    sessions_created: AtomicUsize,

    recovery: Option<RecoveryReport>,
}

impl Pool {
    fn from_region(region: Box<dyn Region>, layout: Layout, config: PoolConfig) -> Self {
        let reservations: Vec<AtomicBool> = (0..layout.descriptor_slots)
            .map(|_| AtomicBool::new(false))
            .collect();
        Self {
            region,
            layout,
            config,
            reservations: Arc::new(reservations),
            collector: Collector::new(),
            sessions_created: AtomicUsize::new(0),
            recovery: None,
        }
    }

    /// Open the pool stored in the file named `layout_tag` inside `dir`, creating both if needed.
    ///
    /// An existing pool is recovered before it is returned: every descriptor which was in flight
    /// when the previous process stopped is rolled forward or back, and no word is left dirty.
    #[cfg(not(feature = "shuttle"))]
    #[instrument(skip(dir, config))]
    pub fn open(dir: impl AsRef<Path>, layout_tag: &str, config: PoolConfig) -> Result<Self, Error> {
        config.validate()?;
        let dir: &Path = dir.as_ref();
        std::fs::create_dir_all(dir)?;

        let layout: Layout = Layout::new(&config);
        let path: PathBuf = dir.join(layout_tag);
        let (mut region, existed) = FileRegion::open_or_create(&path, layout.total_words)?;
        let initialized: bool = existed && layout.validate_header(region.words(), layout_tag)?;
        if !initialized {
            if region.words().len() != layout.total_words {
                // creation was interrupted before the header was complete
                drop(region);
                region = FileRegion::create(&path, layout.total_words)?;
            }
            debug!("initializing a new pool at {}", path.display());
            layout.initialize_header(region.words(), layout_tag);
        }

        let mut pool: Pool = Self::from_region(Box::new(region), layout, config);
        if initialized {
            let report: RecoveryReport = crate::recovery::recover(&pool)?;
            if report.is_clean() {
                info!("opened existing pool, nothing to recover");
            } else {
                warn!("recovered pool after an unclean shutdown: {report:?}");
            }
            pool.recovery = Some(report);
        }
        Ok(pool)
    }

    /// Create a pool on the heap. Nothing survives the process, so there is nothing to recover.
    pub fn create_volatile(config: PoolConfig) -> Result<Self, Error> {
        config.validate()?;
        let layout: Layout = Layout::new(&config);
        let region: HeapRegion = HeapRegion::new(layout.total_words);
        layout.initialize_header(region.words(), "volatile");
        Ok(Self::from_region(Box::new(region), layout, config))
    }

    /// Create a session for the calling thread.
    pub fn session(&self) -> Session<'_> {
        let session_number: usize = self.sessions_created.fetch_add(1, Ordering::AcqRel);
        Session::new(self, session_number % self.layout.descriptor_slots)
    }

    /// Read the logical value at `position`. Prefer [Session::read] on hot paths, since this
    /// registers a new session with the epoch collector on every call.
    pub fn read(&self, position: Position) -> Result<u64, Error> {
        self.session().read(position)
    }

    /// Persistent single-word CAS. See [Session::pcas].
    pub fn pcas(&self, position: Position, expected: u64, desired: u64) -> Result<bool, Error> {
        self.session().pcas(position, expected, desired)
    }

    pub fn capacity(&self) -> usize {
        self.layout.capacity
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// What recovery did when this pool was opened, or `None` for a pool which was just created.
    pub fn last_recovery(&self) -> Option<&RecoveryReport> {
        self.recovery.as_ref()
    }

    /// The number of descriptor slots currently owned by a descriptor or awaiting reclamation.
    pub fn reserved_slots(&self) -> usize {
        self.reservations
            .iter()
            .filter(|reserved| reserved.load(Ordering::Acquire))
            .count()
    }

    /// Ask the backing store to write all words back.
    pub fn sync(&self) -> Result<(), Error> {
        Ok(self.region.sync()?)
    }

    pub(crate) fn layout(&self) -> &Layout {
        &self.layout
    }

    pub(crate) fn collector(&self) -> &Collector {
        &self.collector
    }

    pub(crate) fn words(&self) -> &[AtomicU64] {
        self.layout.data(self.region.words())
    }

    pub(crate) fn word(&self, position: Position) -> Result<&AtomicU64, Error> {
        self.words()
            .get(position)
            .ok_or(Error::PositionOutOfBounds {
                position,
                capacity: self.layout.capacity,
            })
    }

    pub(crate) fn slot(&self, slot: SlotIndex) -> SlotWords<'_> {
        self.layout.slot(self.region.words(), slot)
    }

    pub(crate) fn undo_log(&self) -> UndoLogWords<'_> {
        self.layout.undo_log(self.region.words())
    }

    /// Reserve the first free slot at or after `start`, wrapping around.
    pub(crate) fn try_reserve_slot(&self, start: SlotIndex) -> Option<SlotIndex> {
        let slots: usize = self.reservations.len();
        (0..slots)
            .map(|offset| (start + offset) % slots)
            .find(|&slot| {
                self.reservations[slot]
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
            })
    }

    /// Free `slot` once every thread which might still be inspecting it has unpinned.
    pub(crate) fn release_slot_deferred(&self, guard: &Guard, slot: SlotIndex) {
        let reservations: Arc<Vec<AtomicBool>> = self.reservations.clone();
        guard.defer(move || {
            reservations[slot].store(false, Ordering::Release);
        });
    }

    /// Free a slot which was never published to other threads.
    pub(crate) fn release_slot_now(&self, slot: SlotIndex) {
        self.reservations[slot].store(false, Ordering::Release);
    }
}
