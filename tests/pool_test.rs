#![cfg(not(feature = "shuttle"))]

mod common;

use common::{concurrency_test, increment, snapshot, Arc};
use pmwcas::err::Error;
use pmwcas::{
    Competitor, Descriptor, Operation, OperationEngine, Pool, PoolConfig, Session, Target, Worker,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use test_log::test;

#[test]
fn eight_threads_increment_one_word() {
    let dir = tempfile::tempdir().unwrap();
    let pool: Arc<Pool> = Arc::new(Pool::open(dir.path(), "pmwcas", PoolConfig::new(16)).unwrap());

    concurrency_test(pool, 8, 100_000, &[5]);
}

#[test]
fn overlapping_multi_word_increments() {
    let dir = tempfile::tempdir().unwrap();
    let pool: Pool = Pool::open(dir.path(), "pmwcas", PoolConfig::new(16)).unwrap();
    let target_sets: [&[usize]; 2] = [&[1, 2, 3, 4], &[8, 3, 12]];

    thread::scope(|scope| {
        for thread_number in 0..4 {
            let pool: &Pool = &pool;
            let positions: &[usize] = target_sets[thread_number % 2];
            scope.spawn(move || {
                let session: Session = pool.session();
                for _ in 0..5_000 {
                    increment(&session, positions).unwrap();
                }
            });
        }
    });

    // two threads per set, and position 3 is in both
    for position in [1, 2, 4, 8, 12] {
        assert_eq!(pool.read(position).unwrap(), 10_000);
    }
    assert_eq!(pool.read(3).unwrap(), 20_000);
    assert_eq!(pool.read(0).unwrap(), 0);
}

#[test]
fn readers_never_see_half_applied_operations() {
    let pool: Pool = Pool::create_volatile(PoolConfig::new(16)).unwrap();
    let positions: [usize; 3] = [2, 9, 15];
    let done: AtomicBool = AtomicBool::new(false);

    thread::scope(|scope| {
        for _ in 0..3 {
            scope.spawn(|| {
                let session: Session = pool.session();
                for _ in 0..5_000 {
                    increment(&session, &positions).unwrap();
                }
            });
        }
        scope.spawn(|| {
            let session: Session = pool.session();
            while !done.load(Ordering::Acquire) {
                let values: Vec<u64> = snapshot(&session, &positions).unwrap();
                assert!(values.iter().all(|&value| value == values[0]), "{values:?}");
            }
        });
        scope.spawn(|| {
            let session: Session = pool.session();
            let mut last: u64 = 0;
            while !done.load(Ordering::Acquire) {
                // a single word never goes backwards, even while it is claimed
                let value: u64 = session.read(9).unwrap();
                assert!(value >= last);
                last = value;
            }
        });

        // the writers are the first three threads; wait for them through the final value
        let session: Session = pool.session();
        while session.read(2).unwrap() < 15_000 {
            thread::yield_now();
        }
        done.store(true, Ordering::Release);
    });

    assert!(positions.iter().all(|&position| pool.read(position).unwrap() == 15_000));
}

#[test]
fn values_survive_reopening() {
    let dir = tempfile::tempdir().unwrap();
    let config: PoolConfig = PoolConfig::new(64).with_max_targets(4);
    {
        let pool: Pool = Pool::open(dir.path(), "pmwcas", config.clone()).unwrap();
        let session: Session = pool.session();
        for _ in 0..10 {
            increment(&session, &[0, 31, 63]).unwrap();
        }
    }

    let pool: Pool = Pool::open(dir.path(), "pmwcas", config).unwrap();
    assert!(pool.last_recovery().unwrap().is_clean());
    let session: Session = pool.session();
    assert_eq!(session.read(0).unwrap(), 10);
    assert_eq!(session.read(31).unwrap(), 10);
    assert_eq!(session.read(63).unwrap(), 10);
    assert_eq!(session.read(1).unwrap(), 0);
}

#[test]
fn competitors_share_a_directory() {
    let dir = tempfile::tempdir().unwrap();
    for competitor in [
        Competitor::LockBased,
        Competitor::DescriptorMwCas,
        Competitor::SingleWordCas,
    ] {
        let target: Target = Target::open(competitor, dir.path(), PoolConfig::new(8)).unwrap();
        target
            .worker()
            .execute(&Operation::from_positions([4]).unwrap())
            .unwrap();
        assert!(dir.path().join(competitor.layout_tag()).exists());
    }
    for competitor in [
        Competitor::LockBased,
        Competitor::DescriptorMwCas,
        Competitor::SingleWordCas,
    ] {
        let target: Target = Target::open(competitor, dir.path(), PoolConfig::new(8)).unwrap();
        assert_eq!(target.value(4).unwrap(), 1);
    }
}

#[test]
fn max_targets_is_the_boundary() {
    let pool: Pool = Pool::create_volatile(PoolConfig::new(16).with_max_targets(3)).unwrap();
    let session: Session = pool.session();

    increment(&session, &[0, 1, 2]).unwrap();
    assert!(matches!(
        increment(&session, &[0, 1, 2, 3]),
        Err(Error::TooManyTargets { max_targets: 3 })
    ));
    assert_eq!(session.read(0).unwrap(), 1);
    assert_eq!(session.read(3).unwrap(), 0);
}

#[test]
fn duplicate_targets_are_rejected() {
    let pool: Pool = Pool::create_volatile(PoolConfig::new(16)).unwrap();
    let session: Session = pool.session();
    let mut descriptor: Descriptor = session.descriptor().unwrap();
    descriptor.stage(7, 0, 1).unwrap();
    assert!(matches!(
        descriptor.stage(7, 0, 2),
        Err(Error::DuplicateTarget { position: 7 })
    ));
    assert!(descriptor.commit().unwrap());
    assert_eq!(session.read(7).unwrap(), 1);
}

#[test]
fn pcas_matches_single_target_descriptors() {
    let engine: OperationEngine = OperationEngine::new(32, 0.9, 11).unwrap();
    let operations: Vec<Operation> = engine.generate(2_000, 1, 12).unwrap();

    let run = |competitor: Competitor| -> Vec<u64> {
        let target: Target =
            Target::from_pool(competitor, Pool::create_volatile(PoolConfig::new(32)).unwrap());
        thread::scope(|scope| {
            for chunk in operations.chunks(500) {
                let target: &Target = &target;
                scope.spawn(move || {
                    let worker: Worker = target.worker();
                    for operation in chunk {
                        assert_eq!(worker.execute(operation).unwrap(), 1);
                    }
                });
            }
        });
        (0..32).map(|position| target.value(position).unwrap()).collect()
    };

    let through_pcas: Vec<u64> = run(Competitor::SingleWordCas);
    let through_descriptors: Vec<u64> = run(Competitor::DescriptorMwCas);
    assert_eq!(through_pcas, through_descriptors);
    assert_eq!(through_pcas.iter().sum::<u64>(), 2_000);
}

#[test]
fn lock_based_competitor_under_contention() {
    let dir = tempfile::tempdir().unwrap();
    let engine: OperationEngine = OperationEngine::new(8, 0.0, 3).unwrap();
    {
        let target: Target =
            Target::open(Competitor::LockBased, dir.path(), PoolConfig::new(8)).unwrap();
        thread::scope(|scope| {
            for thread_number in 0..4 {
                let target: &Target = &target;
                let operations: Vec<Operation> = engine.generate(1_000, 3, thread_number).unwrap();
                scope.spawn(move || {
                    let worker: Worker = target.worker();
                    for operation in &operations {
                        worker.execute(operation).unwrap();
                    }
                });
            }
        });
    }

    let target: Target =
        Target::open(Competitor::LockBased, dir.path(), PoolConfig::new(8)).unwrap();
    assert!(target.pool().last_recovery().unwrap().is_clean());
    let total: u64 = (0..8).map(|position| target.value(position).unwrap()).sum();
    assert_eq!(total, 4 * 1_000 * 3);
}
