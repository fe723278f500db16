//! Scheduler behavior: dispatch draining, fairness yields, fiber reuse,
//! stop lifecycle, multi-threaded pools and parallel_do.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use strand::sched::{self, parallel_do, Scheduler, WorkerPool};

#[test]
fn dispatch_runs_queued_closures_in_order() {
    let pool = WorkerPool::new();
    let trace = Arc::new(StdMutex::new(Vec::new()));
    for i in 0..5 {
        let t = trace.clone();
        pool.schedule(move || t.lock().unwrap().push(i));
    }
    pool.dispatch();
    assert_eq!(*trace.lock().unwrap(), vec![0, 1, 2, 3, 4]);
}

#[test]
fn dispatch_returns_with_nothing_queued() {
    let pool = WorkerPool::new();
    pool.dispatch();
    pool.dispatch();
}

#[test]
fn work_scheduled_by_fibers_runs_in_the_same_dispatch() {
    let pool = WorkerPool::new();
    let hits = Arc::new(AtomicUsize::new(0));
    let h = hits.clone();
    pool.schedule(move || {
        let sched = Scheduler::current();
        let h2 = h.clone();
        sched.schedule(move || {
            h2.fetch_add(10, Ordering::SeqCst);
        });
        h.fetch_add(1, Ordering::SeqCst);
    });
    pool.dispatch();
    assert_eq!(hits.load(Ordering::SeqCst), 11);
}

#[test]
fn reschedule_interleaves_fibers() {
    let pool = WorkerPool::new();
    let trace = Arc::new(StdMutex::new(Vec::new()));

    for name in ["a", "b"] {
        let t = trace.clone();
        pool.schedule(move || {
            for round in 0..3 {
                t.lock().unwrap().push(format!("{}{}", name, round));
                sched::reschedule();
            }
        });
    }
    pool.dispatch();
    assert_eq!(
        *trace.lock().unwrap(),
        vec!["a0", "b0", "a1", "b1", "a2", "b2"]
    );
}

#[test]
fn stop_rejects_work_after_draining() {
    let pool = WorkerPool::new();
    let hits = Arc::new(AtomicUsize::new(0));

    let h = hits.clone();
    pool.schedule(move || {
        h.fetch_add(1, Ordering::SeqCst);
    });
    pool.dispatch();
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    pool.stop();
    pool.dispatch(); // drains nothing, marks the scheduler stopped

    let h = hits.clone();
    pool.schedule(move || {
        h.fetch_add(1, Ordering::SeqCst);
    });
    pool.dispatch();
    assert_eq!(hits.load(Ordering::SeqCst), 1, "work after stop must not run");
}

#[test]
fn background_threads_drain_the_queue_without_dispatch() {
    let pool = WorkerPool::with_threads(2, false);
    let hits = Arc::new(AtomicUsize::new(0));
    for _ in 0..32 {
        let h = hits.clone();
        pool.schedule(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
    }
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
    while hits.load(Ordering::SeqCst) < 32 {
        assert!(std::time::Instant::now() < deadline, "workers stalled");
        std::thread::sleep(std::time::Duration::from_millis(1));
    }
}

#[test]
fn thread_hinted_work_only_runs_on_that_thread() {
    let pool = WorkerPool::new();
    let dispatcher = std::thread::current().id();
    let seen = Arc::new(StdMutex::new(None));

    let s = seen.clone();
    pool.schedule_on(dispatcher, move || {
        *s.lock().unwrap() = Some(std::thread::current().id());
    });
    pool.dispatch();
    assert_eq!(*seen.lock().unwrap(), Some(dispatcher));
}

#[test]
fn fiber_panic_is_contained() {
    let pool = WorkerPool::new();
    let hits = Arc::new(AtomicUsize::new(0));

    pool.schedule(|| panic!("scheduled closures may fail"));
    let h = hits.clone();
    pool.schedule(move || {
        h.fetch_add(1, Ordering::SeqCst);
    });
    pool.dispatch();
    // The panic is logged, the scheduler keeps going.
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[test]
fn parallel_do_waits_for_every_job() {
    let pool = WorkerPool::new();
    let done = Arc::new(AtomicUsize::new(0));

    let d = done.clone();
    pool.schedule(move || {
        let sched = Scheduler::current();
        let counter = Arc::new(AtomicUsize::new(0));
        let jobs: Vec<Box<dyn FnOnce() + Send>> = (0..4)
            .map(|_| {
                let c = counter.clone();
                Box::new(move || {
                    c.fetch_add(1, Ordering::SeqCst);
                }) as Box<dyn FnOnce() + Send>
            })
            .collect();
        parallel_do(&sched, jobs);
        assert_eq!(counter.load(Ordering::SeqCst), 4);
        d.fetch_add(1, Ordering::SeqCst);
    });
    pool.dispatch();
    assert_eq!(done.load(Ordering::SeqCst), 1);
}

#[test]
fn parallel_do_reraises_the_first_failure() {
    let pool = WorkerPool::new();
    let outcome = Arc::new(StdMutex::new(None));

    let o = outcome.clone();
    pool.schedule(move || {
        let sched = Scheduler::current();
        let jobs: Vec<Box<dyn FnOnce() + Send>> = vec![
            Box::new(|| {}),
            Box::new(|| panic!("job two failed")),
            Box::new(|| {}),
        ];
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            parallel_do(&sched, jobs);
        }));
        *o.lock().unwrap() = Some(result.is_err());
    });
    pool.dispatch();
    assert_eq!(*outcome.lock().unwrap(), Some(true));
}
