use kernel_sync::{IrqSpinLock, SpinLock, SyncOnceCell};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::{panic, thread};

#[test]
fn guard_releases_on_drop() {
    let l = SpinLock::new(0_u32);
    {
        let mut g = l.lock();
        *g = 41;
        assert!(l.is_locked());
    }
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
fn with_lock_returns_closure_result() {
    let l = SpinLock::new(String::from("a"));
    let len = l.with_lock(|s| {
        s.push('b');
        s.len()
    });
    assert_eq!(len, 2);
    assert_eq!(l.into_inner(), "ab");
}

#[test]
fn get_mut_bypasses_locking() {
    let mut l = SpinLock::new(vec![1, 2, 3]);
    l.get_mut().push(4);
    assert_eq!(l.lock().as_slice(), &[1, 2, 3, 4]);
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
fn irq_lock_serializes_threads() {
    let lock = Arc::new(IrqSpinLock::new(Vec::new()));
    let handles: Vec<_> = (0..4)
        .map(|t| {
            let lock = Arc::clone(&lock);
            thread::spawn(move || {
                for i in 0..100 {
                    lock.lock().push(t * 100 + i);
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    let mut all = lock.with_lock(std::mem::take);
    all.sort_unstable();
    assert_eq!(all, (0..400).collect::<Vec<_>>());
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
    assert!(res.is_err());
    assert_eq!(l.with_lock(|v| *v), 123);
}

#[test]
fn once_cell_has_a_single_winner() {
    let cell = Arc::new(SyncOnceCell::new());
    let start = Arc::new(Barrier::new(8));
    let handles: Vec<_> = (0..8)
        .map(|i| {
            let cell = Arc::clone(&cell);
            let start = Arc::clone(&start);
            thread::spawn(move || {
                start.wait();
                *cell.get_or_init(|| i)
            })
        })
        .collect();

    let seen: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert!(seen.windows(2).all(|w| w[0] == w[1]));
    assert_eq!(cell.get(), Some(&seen[0]));
}

#[test]
fn spinlock_is_sync_for_send_t() {
    fn takes_sync<S: Sync>(_s: &S) {}
    takes_sync(&SpinLock::new(0u8));
    takes_sync(&IrqSpinLock::new(0u8));
}
