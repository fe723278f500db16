//! Fiber synchronization primitives driven on a worker pool: lock hand-off
//! order, condition signal/broadcast, event reset flavors.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use strand::fiber::{Condition, Event, Mutex, Semaphore};
use strand::sched::{self, Scheduler, WorkerPool};

/// Bumps the shared sequence counter and returns its new value.
fn step(seq: &AtomicUsize) -> usize {
    seq.fetch_add(1, Ordering::SeqCst) + 1
}

#[test]
fn mutex_basic() {
    let pool = WorkerPool::new();
    let mutex = Arc::new(Mutex::new(0));
    let m = mutex.clone();
    pool.schedule(move || {
        *m.lock() += 1;
    });
    pool.dispatch();
    assert_eq!(*mutex.try_lock().unwrap(), 1);
}

#[test]
fn mutex_contention_serves_waiters_in_enqueue_order() {
    let pool = WorkerPool::new();
    let mutex = Arc::new(Mutex::new(()));
    let seq = Arc::new(AtomicUsize::new(0));

    let m = mutex.clone();
    let s = seq.clone();
    pool.schedule(move || {
        let sched = Scheduler::current();
        let guard = m.lock();

        for i in 1..=3usize {
            let m = m.clone();
            let s = s.clone();
            sched.schedule(move || {
                assert_eq!(step(&s), i);
                let _guard = m.lock();
                // Critical sections are entered in enqueue order.
                assert_eq!(step(&s), i + 4);
            });
        }

        // Let all three contenders run up to the lock and park.
        sched::reschedule();
        assert_eq!(step(&s), 4);
        drop(guard);

        while s.load(Ordering::SeqCst) < 7 {
            sched::reschedule();
        }
        assert_eq!(step(&s), 8);
    });
    pool.dispatch();
    assert_eq!(seq.load(Ordering::SeqCst), 8);
}

#[test]
#[should_panic(expected = "not recursive")]
fn mutex_is_not_recursive() {
    let pool = WorkerPool::new();
    let outcome = Arc::new(StdMutex::new(None));
    let o = outcome.clone();
    pool.schedule(move || {
        let mutex = Mutex::new(());
        let _guard = mutex.lock();
        // This must panic; the harness re-raises it below.
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _second = mutex.lock();
        }));
        *o.lock().unwrap() = Some(result);
    });
    pool.dispatch();
    let result = outcome.lock().unwrap().take().expect("fiber ran");
    std::panic::resume_unwind(result.unwrap_err());
}

#[test]
fn unlock_if_not_unique_only_releases_under_contention() {
    let pool = WorkerPool::new();
    let done = Arc::new(AtomicUsize::new(0));

    let d = done.clone();
    pool.schedule(move || {
        let sched = Scheduler::current();
        let mutex = Arc::new(Mutex::new(()));

        let guard = mutex.lock();
        // Nobody is waiting: the lock is kept.
        let guard = Mutex::unlock_if_not_unique(guard).expect("no contention yet");

        let m = mutex.clone();
        let d2 = d.clone();
        sched.schedule(move || {
            let _guard = m.lock();
            d2.fetch_add(1, Ordering::SeqCst);
        });
        sched::reschedule();

        // The other fiber is parked on the lock now.
        assert!(Mutex::unlock_if_not_unique(guard).is_none());
        while d.load(Ordering::SeqCst) == 0 {
            sched::reschedule();
        }
    });
    pool.dispatch();
    assert_eq!(done.load(Ordering::SeqCst), 1);
}

#[test]
fn condition_signal_wakes_the_waiter() {
    let pool = WorkerPool::new();
    let seq = Arc::new(AtomicUsize::new(0));

    let s = seq.clone();
    pool.schedule(move || {
        let sched = Scheduler::current();
        let mutex = Arc::new(Mutex::new(()));
        let cond = Arc::new(Condition::new(&mutex));

        let c = cond.clone();
        let s2 = s.clone();
        sched.schedule(move || {
            assert_eq!(step(&s2), 2);
            c.signal();
        });

        let guard = mutex.lock();
        assert_eq!(step(&s), 1);
        let guard = cond.wait(guard);
        assert_eq!(step(&s), 3);
        drop(guard);
    });
    pool.dispatch();
    assert_eq!(seq.load(Ordering::SeqCst), 3);
}

#[test]
fn condition_broadcast_requeues_every_waiter_once() {
    let pool = WorkerPool::new();
    let wake_order = Arc::new(StdMutex::new(Vec::new()));
    let parked = Arc::new(AtomicUsize::new(0));

    let order = wake_order.clone();
    let p = parked.clone();
    pool.schedule(move || {
        let sched = Scheduler::current();
        let mutex = Arc::new(Mutex::new(()));
        let cond = Arc::new(Condition::new(&mutex));

        for i in 1..=3usize {
            let m = mutex.clone();
            let c = cond.clone();
            let order = order.clone();
            let p = p.clone();
            sched.schedule(move || {
                let guard = m.lock();
                p.fetch_add(1, Ordering::SeqCst);
                let guard = c.wait(guard);
                order.lock().unwrap().push(i);
                drop(guard);
            });
        }

        while p.load(Ordering::SeqCst) < 3 {
            sched::reschedule();
        }
        cond.broadcast();
        while order.lock().unwrap().len() < 3 {
            sched::reschedule();
        }
    });
    pool.dispatch();
    // All waiters re-acquired the mutex exactly once, in wait order.
    assert_eq!(*wake_order.lock().unwrap(), vec![1, 2, 3]);
}

#[test]
fn event_auto_reset_wakes_one_and_clears() {
    let pool = WorkerPool::new();
    let seq = Arc::new(AtomicUsize::new(0));

    let s = seq.clone();
    pool.schedule(move || {
        let sched = Scheduler::current();
        let event = Arc::new(Event::new());

        let e = event.clone();
        let s2 = s.clone();
        sched.schedule(move || {
            assert_eq!(step(&s2), 2);
            e.set();
        });

        assert_eq!(step(&s), 1);
        event.wait();
        assert_eq!(step(&s), 3);

        // Setting with nobody parked latches the signal for the next wait.
        event.set();
        event.wait();
        assert_eq!(step(&s), 4);
        assert!(!event.is_set());
    });
    pool.dispatch();
    assert_eq!(seq.load(Ordering::SeqCst), 4);
}

#[test]
fn event_manual_reset_wakes_all_and_stays_set() {
    let pool = WorkerPool::new();
    let woken = Arc::new(AtomicUsize::new(0));

    let w = woken.clone();
    pool.schedule(move || {
        let sched = Scheduler::current();
        let event = Arc::new(Event::manual());

        for _ in 0..3 {
            let e = event.clone();
            let w = w.clone();
            sched.schedule(move || {
                e.wait();
                w.fetch_add(1, Ordering::SeqCst);
            });
        }
        sched::reschedule();
        assert_eq!(w.load(Ordering::SeqCst), 0);

        event.set();
        while w.load(Ordering::SeqCst) < 3 {
            sched::reschedule();
        }

        // Still set: waits fall straight through until reset.
        event.wait();
        event.wait();
        assert!(event.is_set());
        event.reset();
        assert!(!event.is_set());
    });
    pool.dispatch();
    assert_eq!(woken.load(Ordering::SeqCst), 3);
}

#[test]
fn semaphore_hands_permits_to_waiters_in_order() {
    let pool = WorkerPool::new();
    let order = Arc::new(StdMutex::new(Vec::new()));

    let o = order.clone();
    pool.schedule(move || {
        let sched = Scheduler::current();
        let sem = Arc::new(Semaphore::new(0));

        for i in 1..=3usize {
            let sem = sem.clone();
            let o = o.clone();
            sched.schedule(move || {
                sem.wait();
                o.lock().unwrap().push(i);
            });
        }
        sched::reschedule();
        assert!(o.lock().unwrap().is_empty());

        for _ in 0..3 {
            sem.notify();
        }
        while o.lock().unwrap().len() < 3 {
            sched::reschedule();
        }

        // A permit released with nobody waiting accumulates.
        sem.notify();
        assert!(sem.try_wait());
        assert!(!sem.try_wait());
    });
    pool.dispatch();
    assert_eq!(*order.lock().unwrap(), vec![1, 2, 3]);
}
