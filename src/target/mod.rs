//! The competitors a benchmark can run, behind one interface which maps an [Operation] onto
//! persistent words.

use crate::err::Error;
use crate::operation::Operation;
use crate::pool::Pool;
use crate::session::Session;
use crate::types::Position;
use tracing::instrument;

#[cfg(not(feature = "shuttle"))]
use crate::config::PoolConfig;
#[cfg(not(feature = "shuttle"))]
use std::path::Path;

mod lock;
mod mwcas;
mod pcas;

pub use lock::LockTarget;

/// The strategies for updating several persistent words at once.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, clap::ValueEnum)]
pub enum Competitor {
    /// A pool-wide mutex and an undo log.
    #[value(name = "lock")]
    LockBased,
    /// The lock-free persistent multi-word CAS.
    #[value(name = "pmwcas")]
    DescriptorMwCas,
    /// Persistent single-word CAS, for operations with one target only.
    #[value(name = "pcas")]
    SingleWordCas,
}

impl Competitor {
    /// The name of the pool file, so that competitors can share one directory.
    pub fn layout_tag(self) -> &'static str {
        match self {
            Competitor::LockBased => "lock",
            Competitor::DescriptorMwCas => "pmwcas",
            Competitor::SingleWordCas => "pcas",
        }
    }
}

/// A pool driven by one competitor.
#[derive(Debug)]
pub enum Target {
    Lock(LockTarget),
    MwCas(Pool),
    Pcas(Pool),
}

impl Target {
    /// Open, and recover if needed, the pool of `competitor` inside `dir`.
    #[cfg(not(feature = "shuttle"))]
    pub fn open(
        competitor: Competitor,
        dir: impl AsRef<Path>,
        config: PoolConfig,
    ) -> Result<Self, Error> {
        let pool: Pool = Pool::open(dir, competitor.layout_tag(), config)?;
        Ok(Self::from_pool(competitor, pool))
    }

    pub fn from_pool(competitor: Competitor, pool: Pool) -> Self {
        match competitor {
            Competitor::LockBased => Target::Lock(LockTarget::new(pool)),
            Competitor::DescriptorMwCas => Target::MwCas(pool),
            Competitor::SingleWordCas => Target::Pcas(pool),
        }
    }

    pub fn competitor(&self) -> Competitor {
        match self {
            Target::Lock(_) => Competitor::LockBased,
            Target::MwCas(_) => Competitor::DescriptorMwCas,
            Target::Pcas(_) => Competitor::SingleWordCas,
        }
    }

    pub fn pool(&self) -> &Pool {
        match self {
            Target::Lock(lock_target) => lock_target.pool(),
            Target::MwCas(pool) | Target::Pcas(pool) => pool,
        }
    }

    /// Create a worker for the calling thread.
    pub fn worker(&self) -> Worker<'_> {
        match self {
            Target::Lock(lock_target) => Worker::Lock(lock_target),
            Target::MwCas(pool) => Worker::MwCas(pool.session()),
            Target::Pcas(pool) => Worker::Pcas(pool.session()),
        }
    }

    /// The current value of the word at `position`.
    pub fn value(&self, position: Position) -> Result<u64, Error> {
        self.pool().read(position)
    }
}

/// Executes operations against a [Target] on one thread.
#[derive(Debug)]
pub enum Worker<'t> {
    Lock(&'t LockTarget),
    MwCas(Session<'t>),
    Pcas(Session<'t>),
}

impl Worker<'_> {
    /// Increment every word `operation` targets by one, as a single atomic update, retrying until
    /// it goes through. Returns the number of operations executed, which is always one.
    #[instrument(skip(self), level = "trace")]
    pub fn execute(&self, operation: &Operation) -> Result<usize, Error> {
        match self {
            Worker::Lock(lock_target) => lock_target.execute(operation),
            Worker::MwCas(session) => mwcas::execute(session, operation),
            Worker::Pcas(session) => pcas::execute(session, operation),
        }
    }
}
