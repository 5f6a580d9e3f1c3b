//! A persistent multi-word compare-and-swap.
//!
//! A [Pool] is a region of persistent words plus a fixed number of descriptor slots. Threads take
//! a [Session] each and use it to read words, swap a single word with a persistent CAS, or stage
//! several swaps on a [Descriptor] and commit them as one atomic, durable update. If the process
//! stops at any point, reopening the pool rolls every interrupted update forward or back.
//!
//! ```no_run
//! use pmwcas::{Pool, PoolConfig};
//!
//! let pool = Pool::open("/mnt/pmem0/bench", "pmwcas", PoolConfig::new(1024))?;
//! let session = pool.session();
//!
//! let mut descriptor = session.descriptor()?;
//! for position in [3, 7] {
//!     let current = session.read(position)?;
//!     descriptor.stage(position, current, current + 1)?;
//! }
//! let swapped: bool = descriptor.commit()?;
//! # Ok::<(), pmwcas::err::Error>(())
//! ```

pub mod config;
mod descriptor;
pub mod engine;
pub mod err;
mod layout;
pub mod operation;
pub mod pmem;
mod pool;
pub mod recovery;
mod session;
mod sync;
pub mod target;
mod types;
pub mod word;

pub use config::PoolConfig;
pub use descriptor::{Descriptor, TargetEntry};
pub use engine::OperationEngine;
pub use err::{Error, FatalError};
pub use operation::Operation;
pub use pool::Pool;
pub use recovery::RecoveryReport;
pub use session::Session;
pub use target::{Competitor, Target, Worker};
pub use types::Status;
pub use word::{DescriptorRef, WordState};
