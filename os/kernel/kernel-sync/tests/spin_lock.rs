use kernel_sync::{SpinLock, lock_pair};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::{panic, thread};

#[test]
fn basic_lock_and_raii() {
    let l = SpinLock::new(0_u32);

    {
        let mut g = l.lock();
        *g = 41;
        assert!(l.is_locked());
    }

    // previous drop must have unlocked
    assert!(!l.is_locked());
    let mut g = l.lock();
    *g += 1;
    assert_eq!(*g, 42);
}

#[test]
fn try_lock_fails_while_held() {
    let l = SpinLock::new(1u8);

    let g1 = l.try_lock();
    assert!(g1.is_some());
    assert!(l.try_lock().is_none());

    drop(g1);
    assert!(l.try_lock().is_some());
}

#[test]
fn lock_is_released_on_panic() {
    let l = SpinLock::new(0u32);

    let res = panic::catch_unwind(panic::AssertUnwindSafe(|| {
        l.with_lock(|v| {
            *v = 123;
            panic!("boom");
        });
    }));
    assert!(res.is_err(), "expected panic");

    assert_eq!(l.with_lock(|v| *v), 123);
}

#[test]
fn contended_increments_are_exact_and_exclusive() {
    let threads = 8;
    let iters = 5_000;

    let lock = Arc::new(SpinLock::new(0usize));
    let in_cs = Arc::new(AtomicUsize::new(0));
    let start = Arc::new(Barrier::new(threads));

    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let lock = Arc::clone(&lock);
            let in_cs = Arc::clone(&in_cs);
            let start = Arc::clone(&start);
            thread::spawn(move || {
                start.wait();
                for _ in 0..iters {
                    lock.with_lock(|v| {
                        let prev = in_cs.fetch_add(1, Ordering::SeqCst);
                        assert_eq!(prev, 0, "mutual exclusion violated");
                        *v += 1;
                        in_cs.fetch_sub(1, Ordering::SeqCst);
                    });
                    thread::yield_now();
                }
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(lock.with_lock(|v| *v), threads * iters);
}

#[test]
fn lock_pair_orders_by_key_and_returns_in_argument_order() {
    let a = SpinLock::new("a");
    let b = SpinLock::new("b");

    let (ga, gb) = lock_pair((&a, 10), (&b, 2));
    assert_eq!((*ga, *gb), ("a", "b"));
    assert!(a.is_locked() && b.is_locked());
    drop((ga, gb));
    assert!(!a.is_locked() && !b.is_locked());
}

#[test]
fn crossed_lock_pairs_do_not_deadlock() {
    let a = Arc::new(SpinLock::new(0u64));
    let b = Arc::new(SpinLock::new(0u64));
    let start = Arc::new(Barrier::new(2));

    let spawn = |first_is_a: bool| {
        let (a, b, start) = (Arc::clone(&a), Arc::clone(&b), Arc::clone(&start));
        thread::spawn(move || {
            start.wait();
            for _ in 0..2_000 {
                if first_is_a {
                    let (mut x, mut y) = lock_pair((&*a, 1), (&*b, 2));
                    *x += 1;
                    *y += 1;
                } else {
                    let (mut y, mut x) = lock_pair((&*b, 2), (&*a, 1));
                    *x += 1;
                    *y += 1;
                }
            }
        })
    };

    let t1 = spawn(true);
    let t2 = spawn(false);
    t1.join().unwrap();
    t2.join().unwrap();
    assert_eq!(*a.lock(), 4_000);
    assert_eq!(*b.lock(), 4_000);
}

#[test]
#[should_panic(expected = "same lock twice")]
fn lock_pair_rejects_equal_keys() {
    let a = SpinLock::new(());
    let b = SpinLock::new(());
    let _ = lock_pair((&a, 5), (&b, 5));
}

#[test]
fn waiters_relax_until_the_holder_releases() {
    let lock = Arc::new(SpinLock::new(0_u32));
    let relaxed = Arc::new(AtomicUsize::new(0));
    let guard = lock.lock();

    let waiter = thread::spawn({
        let (lock, relaxed) = (lock.clone(), relaxed.clone());
        move || {
            let mut g = lock.lock_with(|| {
                relaxed.fetch_add(1, Ordering::Relaxed);
            });
            *g += 1;
        }
    });
    while relaxed.load(Ordering::Relaxed) == 0 {
        std::hint::spin_loop();
    }
    drop(guard);
    waiter.join().unwrap();
    assert_eq!(*lock.lock(), 1);
}

/// Spot-check a concrete instantiation compiles as Sync.
#[test]
fn spinlock_is_sync_for_send_t() {
    fn takes_sync<S: Sync>(_s: &S) {}
    let l = SpinLock::new(0u8);
    takes_sync(&l);
}
