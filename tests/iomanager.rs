//! Reactor behavior: timers through dispatch, readiness wake-ups on real
//! descriptors, registration cancellation, and the dedicated event thread
//! versus busy workers.

use std::io::Read;
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use strand::clock;
use strand::coio::CoIoStream;
use strand::reactor::{Event, IoConfig, IoManager};
use strand::sched;
use strand::stream::Stream;

#[test]
fn immediate_timer_fires_during_dispatch() {
    let io = IoManager::new().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    let h = hits.clone();
    io.register_timer(Duration::ZERO, move || {
        h.fetch_add(1, Ordering::SeqCst);
    });
    assert_eq!(hits.load(Ordering::SeqCst), 0);
    io.dispatch();
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[test]
fn delayed_timer_blocks_dispatch_until_due() {
    let io = IoManager::new().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    let h = hits.clone();
    let start = clock::now();
    io.register_timer(Duration::from_millis(80), move || {
        h.fetch_add(1, Ordering::SeqCst);
    });
    io.dispatch();
    let elapsed_us = clock::now() - start;
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert!(elapsed_us >= 80_000, "fired after {}us", elapsed_us);
}

#[test]
fn recurring_timer_period_is_a_lower_bound() {
    let io = IoManager::new().unwrap();
    let handle = io.handle();
    let fire_times = Arc::new(std::sync::Mutex::new(Vec::new()));

    let t0 = clock::now();
    let ft = fire_times.clone();
    let timer = io.register_recurring_timer(Duration::from_millis(10), move || {
        ft.lock().unwrap().push(clock::now());
    });
    // Cancelling from a fiber lets dispatch drain once the test window
    // closes (a recurring timer otherwise counts as outstanding work
    // forever).
    io.schedule(move || {
        handle.sleep(Duration::from_millis(65));
        timer.cancel();
    });
    io.dispatch();

    let times = fire_times.lock().unwrap();
    assert!(times.len() >= 4, "only {} firings in 65ms", times.len());
    for (k, &t) in times.iter().enumerate() {
        // k-th firing no earlier than t0 + k * period.
        assert!(t >= t0 + k as u64 * 10_000);
    }
}

#[test]
fn readiness_wakes_a_parked_reader() {
    let io = IoManager::new().unwrap();
    let handle = io.handle();
    let got = Arc::new(AtomicUsize::new(0));

    let (a, b) = CoIoStream::pair(&handle).unwrap();
    let g = got.clone();
    io.schedule(move || {
        let mut buf = [0u8; 4];
        let n = Stream::read(&a, &mut buf).unwrap();
        g.store(n + buf[0] as usize, Ordering::SeqCst);
    });
    io.schedule(move || {
        Stream::write_all(&b, &[7u8]).unwrap();
    });
    io.dispatch();
    assert_eq!(got.load(Ordering::SeqCst), 1 + 7);
}

#[test]
fn write_blocks_until_the_peer_drains() {
    let io = IoManager::new().unwrap();
    let handle = io.handle();
    let total = Arc::new(AtomicUsize::new(0));

    let (client, server) = UnixStream::pair().unwrap();
    let a = CoIoStream::new(&handle, client).unwrap();

    // Write more than any socket buffer will take in one gulp.
    let payload = vec![0x5a_u8; 4 * 1024 * 1024];
    let t = total.clone();
    io.schedule(move || {
        Stream::write_all(&a, &payload).unwrap();
        t.store(payload.len(), Ordering::SeqCst);
    });

    let reader = std::thread::spawn(move || {
        let mut server = server;
        let mut sink = [0u8; 64 * 1024];
        let mut seen = 0usize;
        while seen < 4 * 1024 * 1024 {
            match server.read(&mut sink) {
                Ok(0) => break,
                Ok(n) => seen += n,
                Err(e) => panic!("peer read failed: {}", e),
            }
        }
        seen
    });

    io.dispatch();
    assert_eq!(reader.join().unwrap(), 4 * 1024 * 1024);
    assert_eq!(total.load(Ordering::SeqCst), 4 * 1024 * 1024);
}

#[test]
fn registered_callback_fires_on_readiness() {
    let io = IoManager::new().unwrap();
    let handle = io.handle();
    let fired = Arc::new(AtomicBool::new(false));

    let (a, b) = CoIoStream::pair(&handle).unwrap();
    let f = fired.clone();
    handle
        .register_event(a.as_raw_fd(), Event::READ, move || {
            f.store(true, Ordering::SeqCst);
        })
        .unwrap();
    Stream::write_all(&b, b"x").unwrap();
    io.dispatch();
    assert!(fired.load(Ordering::SeqCst));
}

#[test]
fn unregister_wins_before_delivery() {
    let io = IoManager::new().unwrap();
    let handle = io.handle();
    let fired = Arc::new(AtomicBool::new(false));

    let (a, _b) = CoIoStream::pair(&handle).unwrap();
    let f = fired.clone();
    handle
        .register_event(a.as_raw_fd(), Event::READ, move || {
            f.store(true, Ordering::SeqCst);
        })
        .unwrap();
    assert!(handle.unregister_event(a.as_raw_fd(), Event::READ));
    // Unregistering again reports the loss.
    assert!(!handle.unregister_event(a.as_raw_fd(), Event::READ));
    io.dispatch();
    assert!(!fired.load(Ordering::SeqCst));
}

#[test]
fn cancel_event_fires_without_readiness() {
    let io = IoManager::new().unwrap();
    let handle = io.handle();
    let fired = Arc::new(AtomicBool::new(false));

    let (a, _b) = CoIoStream::pair(&handle).unwrap();
    let f = fired.clone();
    handle
        .register_event(a.as_raw_fd(), Event::READ, move || {
            f.store(true, Ordering::SeqCst);
        })
        .unwrap();
    assert!(handle.cancel_event(a.as_raw_fd(), Event::READ));
    io.dispatch();
    assert!(fired.load(Ordering::SeqCst));
}

#[test]
fn read_timeout_elapses_without_data() {
    let io = IoManager::new().unwrap();
    let handle = io.handle();
    let outcome = Arc::new(AtomicU64::new(0));

    let (a, _b) = CoIoStream::pair(&handle).unwrap();
    let o = outcome.clone();
    io.schedule(move || {
        let start = clock::now();
        let mut buf = [0u8; 1];
        let err = a
            .read_with_timeout(&mut buf, Some(Duration::from_millis(50)))
            .unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::TimedOut);
        o.store(clock::now() - start, Ordering::SeqCst);
    });
    io.dispatch();
    let waited = outcome.load(Ordering::SeqCst);
    assert!(waited >= 50_000, "timed out after only {}us", waited);
}

#[test]
fn fiber_sleep_suspends_only_the_fiber() {
    let io = IoManager::new().unwrap();
    let handle = io.handle();
    let order = Arc::new(std::sync::Mutex::new(Vec::new()));

    let h = handle.clone();
    let o = order.clone();
    io.schedule(move || {
        o.lock().unwrap().push("sleeper-start");
        h.sleep(Duration::from_millis(30));
        o.lock().unwrap().push("sleeper-end");
    });
    let o = order.clone();
    io.schedule(move || {
        o.lock().unwrap().push("other");
    });
    io.dispatch();
    assert_eq!(
        *order.lock().unwrap(),
        vec!["sleeper-start", "other", "sleeper-end"]
    );
}

/// Spin (cooperatively) for at least `us` microseconds.
fn busy_execute(us: u64) {
    let start = clock::now();
    while clock::now() < start + us {
        sched::reschedule();
    }
}

#[test]
fn busy_worker_delays_timers_without_event_thread() {
    let io = IoManager::new().unwrap();
    let delay = Arc::new(AtomicU64::new(0));

    io.schedule(|| busy_execute(300_000));
    let d = delay.clone();
    let registered = clock::now();
    io.register_timer(Duration::from_millis(50), move || {
        d.store(clock::now() - registered, Ordering::SeqCst);
    });
    io.dispatch();
    // The only worker never went idle, so the timer had to wait for the
    // busy fiber to finish.
    assert!(delay.load(Ordering::SeqCst) >= 300_000);
}

#[test]
fn event_thread_keeps_timers_on_time_despite_busy_workers() {
    let io = IoManager::with_config(IoConfig {
        threads: 1,
        use_caller: true,
        event_thread: true,
    })
    .unwrap();
    let delay = Arc::new(AtomicU64::new(0));

    io.schedule(|| busy_execute(300_000));
    let d = delay.clone();
    let registered = clock::now();
    io.register_timer(Duration::from_millis(50), move || {
        d.store(clock::now() - registered, Ordering::SeqCst);
    });
    io.dispatch();
    let seen = delay.load(Ordering::SeqCst);
    assert!(seen >= 50_000);
    assert!(
        seen < 250_000,
        "timer was starved for {}us despite the event thread",
        seen
    );
}
