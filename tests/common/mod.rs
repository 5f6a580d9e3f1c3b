#![allow(dead_code)]

use pmwcas::err::Error;
use pmwcas::{Descriptor, Pool, Session};
use tracing::trace;

cfg_if::cfg_if! {
    if #[cfg(feature = "shuttle")] {
        pub(crate) use shuttle::sync::Arc;
        pub(crate) use shuttle::thread;
    } else {
        pub(crate) use std::sync::Arc;
        pub(crate) use std::thread;
    }
}

/// Atomically add one to every word in `positions`, retrying until the commit goes through.
pub(crate) fn increment(session: &Session, positions: &[usize]) -> Result<(), Error> {
    loop {
        let mut descriptor: Descriptor = session.descriptor()?;
        for &position in positions {
            let current: u64 = session.read(position)?;
            descriptor.stage(position, current, current + 1)?;
        }
        if descriptor.commit()? {
            return Ok(());
        }
        trace!("increment of {positions:?} lost a race, retrying");
    }
}

/// Commit a descriptor which swaps every word in `positions` with itself. It only succeeds if the
/// values read were all present at the same time, so it returns a consistent snapshot.
pub(crate) fn snapshot(session: &Session, positions: &[usize]) -> Result<Vec<u64>, Error> {
    loop {
        let mut descriptor: Descriptor = session.descriptor()?;
        let mut values: Vec<u64> = Vec::with_capacity(positions.len());
        for &position in positions {
            let current: u64 = session.read(position)?;
            descriptor.stage(position, current, current)?;
            values.push(current);
        }
        if descriptor.commit()? {
            return Ok(values);
        }
    }
}

/// Run `num_threads` threads which each increment all of `positions` together `increments` times,
/// then check that no increment was lost.
pub(crate) fn concurrency_test(
    pool: Arc<Pool>,
    num_threads: usize,
    increments: usize,
    positions: &[usize],
) {
    let join_handles: Vec<thread::JoinHandle<Result<(), Error>>> = (0..num_threads)
        .map(|_| {
            let pool: Arc<Pool> = pool.clone();
            let positions: Vec<usize> = positions.to_vec();
            thread::spawn(move || -> Result<(), Error> {
                let session: Session = pool.session();
                for _ in 0..increments {
                    increment(&session, &positions)?;
                }
                Ok(())
            })
        })
        .collect();

    join_handles.into_iter().for_each(|join_handle| {
        let result: Result<(), Error> = join_handle.join().expect("A thread panicked");
        assert!(result.is_ok(), "{result:?}");
    });

    let expected: u64 = (num_threads * increments) as u64;
    for &position in positions {
        assert_eq!(pool.read(position).unwrap(), expected);
    }
}
