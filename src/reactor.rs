//! The I/O reactor: a scheduler whose idle procedure is an event loop.
//!
//! [`IoManager`] composes three things: a [`Scheduler`] for fibers, a
//! [`TimerManager`] for deadlines, and an OS readiness poller (epoll on
//! Linux, kqueue on macOS/BSD). When a worker runs out of fibers it blocks
//! in the kernel wait, bounded by the earliest timer; readiness events and
//! expired timers turn into fiber wake-ups posted back onto the scheduler.
//!
//! Registrations are one-shot at the design level: delivery consumes the
//! interest, re-registration is explicit. At most one waiter may be
//! registered per `(fd, direction)`.
//!
//! # The dedicated event thread
//!
//! By default every worker enters the event loop when it has nothing to
//! run. In a busy system that can starve I/O: if all workers are executing
//! CPU-bound fibers, nobody polls, and expired timers and readiness events
//! sit undelivered for as long as the fibers keep running. Setting
//! [`IoConfig::event_thread`] spawns one extra, scheduler-invisible thread
//! that runs the reactor loop continuously; worker idle procedures then
//! just sleep on a semaphore. Choose it whenever worker fibers may compute
//! for long stretches without yielding.

use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::thread;
use std::time::Duration;

use crate::error::Result;
use crate::fiber::{self, Fiber};
use crate::sched::{self, Idle, Notifier, Scheduler};
use crate::timer::{Timer, TimerManager};

#[cfg(any(target_os = "linux", target_os = "android"))]
#[path = "reactor/epoll.rs"]
mod poller;

#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
#[path = "reactor/kqueue.rs"]
mod poller;

use poller::Poller;

bitflags::bitflags! {
    /// Readiness conditions a registration can wait for.
    pub struct Event: u32 {
        const READ  = 0x0001;
        const WRITE = 0x0004;
        /// Peer hangup. On kqueue this is folded into read interest.
        const CLOSE = 0x2000;
    }
}

impl Event {
    fn assert_single(self) {
        assert_eq!(
            self.bits().count_ones(),
            1,
            "exactly one event per registration"
        );
    }
}

impl Default for Event {
    fn default() -> Self {
        Event::empty()
    }
}

/// Construction options for an [`IoManager`].
#[derive(Debug, Clone)]
pub struct IoConfig {
    /// Total worker count, the caller included when `use_caller`.
    pub threads: usize,
    /// Whether the constructing thread will donate itself via
    /// [`IoManager::dispatch`].
    pub use_caller: bool,
    /// Run the reactor on a dedicated, scheduler-invisible thread. See the
    /// module docs.
    pub event_thread: bool,
}

impl Default for IoConfig {
    fn default() -> Self {
        IoConfig {
            threads: 1,
            use_caller: true,
            event_thread: false,
        }
    }
}

enum Wake {
    Fiber(Arc<Fiber>),
    Job(Box<dyn FnOnce() + Send + 'static>),
}

struct Waiter {
    sched: Scheduler,
    wake: Wake,
}

impl Waiter {
    fn post(self) {
        match self.wake {
            Wake::Fiber(f) => self.sched.schedule_fiber(f),
            Wake::Job(j) => self.sched.schedule(j),
        }
    }
}

/// Per-fd registration record. One slot per direction.
#[derive(Default)]
struct FdState {
    registered: Event,
    read: Option<Waiter>,
    write: Option<Waiter>,
    close: Option<Waiter>,
}

impl FdState {
    fn slot(&mut self, event: Event) -> &mut Option<Waiter> {
        match event {
            Event::READ => &mut self.read,
            Event::WRITE => &mut self.write,
            Event::CLOSE => &mut self.close,
            _ => unreachable!("single event expected"),
        }
    }

    fn is_idle(&self) -> bool {
        self.registered.is_empty()
    }
}

pub(crate) struct IoInner {
    poller: Poller,
    fd_states: StdMutex<HashMap<RawFd, Arc<StdMutex<FdState>>>>,
    pending_events: AtomicUsize,
    timers: TimerManager,
    /// Serializes the kernel wait: one worker polls, the rest sleep on the
    /// fallback semaphore.
    poll_lock: StdMutex<()>,
    fallback: Notifier,
    event_thread_mode: bool,
    stop: AtomicBool,
}

impl IoInner {
    /// One reactor cycle: block until readiness or the earliest timer, then
    /// deliver whatever came due.
    fn poll_cycle(&self) {
        let timeout = self.timers.next_timeout();
        let mut events = Vec::new();
        if let Err(e) = self.poller.wait(timeout, &mut events) {
            log::error!("reactor wait failed: {}", e);
            return;
        }
        if self.timers.process_expired() > 0 {
            // A timer may have been the last outstanding work; let sleeping
            // dispatchers re-evaluate their exit condition.
            self.fallback.post();
        }
        for (fd, fired) in events {
            self.trigger(fd, fired);
        }
    }

    /// Delivers `fired` readiness on `fd`: consumes the matching
    /// registrations and posts their wake-ups.
    fn trigger(&self, fd: RawFd, fired: Event) {
        let state = match self.fd_states.lock().unwrap().get(&fd) {
            Some(s) => s.clone(),
            // Raced with unregistration.
            None => return,
        };

        let mut wakes = Vec::new();
        {
            let mut st = state.lock().unwrap();
            let old = st.registered;
            for event in [Event::READ, Event::WRITE, Event::CLOSE] {
                if fired.contains(event) && st.registered.contains(event) {
                    if let Some(waiter) = st.slot(event).take() {
                        st.registered -= event;
                        self.pending_events.fetch_sub(1, Ordering::AcqRel);
                        wakes.push(waiter);
                    }
                }
            }
            if old != st.registered {
                if let Err(e) = self.poller.update(fd, old, st.registered) {
                    // The fd may have been closed under us.
                    log::debug!("rearming fd {} failed: {}", fd, e);
                }
            }
        }
        self.cleanup(fd, &state);

        for waiter in wakes {
            waiter.post();
        }
    }

    fn register_waiter(&self, fd: RawFd, event: Event, waiter: Waiter) -> io::Result<()> {
        event.assert_single();
        let state = self
            .fd_states
            .lock()
            .unwrap()
            .entry(fd)
            .or_insert_with(|| Arc::new(StdMutex::new(FdState::default())))
            .clone();

        let mut st = state.lock().unwrap();
        assert!(
            !st.registered.contains(event),
            "event {:?} already registered for fd {}",
            event,
            fd
        );
        let old = st.registered;
        st.registered |= event;
        if let Err(e) = self.poller.update(fd, old, st.registered) {
            st.registered = old;
            return Err(e);
        }
        *st.slot(event) = Some(waiter);
        self.pending_events.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Removes the registration; `fire` additionally posts the stored
    /// wake-up as if the event had happened. Returns whether a registration
    /// was still there to act on.
    fn deregister(&self, fd: RawFd, event: Event, fire: bool) -> bool {
        event.assert_single();
        let state = match self.fd_states.lock().unwrap().get(&fd) {
            Some(s) => s.clone(),
            None => return false,
        };

        let waiter = {
            let mut st = state.lock().unwrap();
            match st.slot(event).take() {
                Some(waiter) => {
                    let old = st.registered;
                    st.registered -= event;
                    self.pending_events.fetch_sub(1, Ordering::AcqRel);
                    if let Err(e) = self.poller.update(fd, old, st.registered) {
                        log::debug!("deregistering fd {} failed: {}", fd, e);
                    }
                    Some(waiter)
                }
                None => None,
            }
        };
        self.cleanup(fd, &state);

        match waiter {
            Some(waiter) => {
                if fire {
                    waiter.post();
                }
                true
            }
            None => false,
        }
    }

    /// Drops the per-fd record once nothing is registered on it.
    fn cleanup(&self, fd: RawFd, state: &Arc<StdMutex<FdState>>) {
        let mut map = self.fd_states.lock().unwrap();
        if state.lock().unwrap().is_idle() {
            map.remove(&fd);
        }
    }

    fn has_work(&self) -> bool {
        self.pending_events.load(Ordering::Acquire) > 0 || !self.timers.is_empty()
    }
}

struct ReactorIdle {
    io: Arc<IoInner>,
}

impl Idle for ReactorIdle {
    fn idle(&self) {
        if self.io.event_thread_mode {
            self.io.fallback.wait();
        } else if let Ok(_guard) = self.io.poll_lock.try_lock() {
            self.io.poll_cycle();
        } else {
            // Someone else is in the kernel wait; sleep until work shows up.
            self.io.fallback.wait();
        }
    }

    fn notify(&self) {
        self.io.poller.tickle();
        self.io.fallback.post();
    }

    fn notify_all(&self) {
        self.io.poller.tickle();
        self.io.fallback.post_all();
    }

    fn has_work(&self) -> bool {
        self.io.has_work()
    }
}

////////////////////////////////////////////////////////////////////////////////
// IoHandle
////////////////////////////////////////////////////////////////////////////////

/// Cheap-clone handle to a running [`IoManager`]: event registration,
/// timers, sleeping, and (through `Deref`) scheduling.
#[derive(Clone)]
pub struct IoHandle {
    sched: Scheduler,
    io: Arc<IoInner>,
}

impl IoHandle {
    pub fn scheduler(&self) -> &Scheduler {
        &self.sched
    }

    /// Registers a one-shot wake-up: when `event` fires on `fd`, `callback`
    /// is scheduled (on the caller's scheduler when called from a worker,
    /// otherwise on this reactor's own).
    pub fn register_event<F>(&self, fd: RawFd, event: Event, callback: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let sched = Scheduler::try_current().unwrap_or_else(|| self.sched.clone());
        self.io
            .register_waiter(
                fd,
                event,
                Waiter {
                    sched,
                    wake: Wake::Job(Box::new(callback)),
                },
            )
            .map_err(Into::into)
    }

    /// Removes a registration before it fires; the stored wake-up is
    /// dropped. Returns whether the removal won the race with delivery.
    pub fn unregister_event(&self, fd: RawFd, event: Event) -> bool {
        self.io.deregister(fd, event, false)
    }

    /// Forces a registration to fire now, as a cancellation. Returns
    /// whether there was still a registration to fire.
    pub fn cancel_event(&self, fd: RawFd, event: Event) -> bool {
        self.io.deregister(fd, event, true)
    }

    /// Parks the current fiber until `event` fires on `fd`.
    pub fn wait_event(&self, fd: RawFd, event: Event) -> Result<()> {
        match self.wait_event_timeout(fd, event, None)? {
            true => Ok(()),
            false => unreachable!("no timeout was set"),
        }
    }

    /// Parks the current fiber until `event` fires on `fd` or the timeout
    /// elapses. `Ok(true)` = readiness, `Ok(false)` = timed out.
    pub fn wait_event_timeout(
        &self,
        fd: RawFd,
        event: Event,
        timeout: Option<Duration>,
    ) -> Result<bool> {
        let sched = Scheduler::current();
        let me = fiber::current();

        let timed_out = Arc::new(AtomicBool::new(false));
        let timer_fired = Arc::new(AtomicBool::new(false));
        let timer = timeout.map(|delay| {
            let io = self.clone();
            let fired = timer_fired.clone();
            let flag = timed_out.clone();
            self.register_timer(delay, move || {
                fired.store(true, Ordering::SeqCst);
                // Only report a timeout when the cancellation actually beat
                // the readiness delivery.
                if io.cancel_event(fd, event) {
                    flag.store(true, Ordering::SeqCst);
                }
            })
        });

        let mut register_error = None;
        {
            // Everything the closure touches after the registration
            // publishes the fiber must be owned: the fiber may resume on
            // another thread immediately, popping this frame.
            let io = self.io.clone();
            let err = &mut register_error;
            let fired = timer_fired.clone();
            let flag = timed_out.clone();
            let sched2 = sched.clone();
            let me2 = me.clone();
            sched::park_with(move || {
                let waiter = Waiter {
                    sched: sched2.clone(),
                    wake: Wake::Fiber(me2.clone()),
                };
                match io.register_waiter(fd, event, waiter) {
                    Ok(()) => {
                        // The timer may have fired before the registration
                        // existed, missing its cancellation; complete it
                        // here or the fiber would wait forever.
                        if fired.load(Ordering::SeqCst) && io.deregister(fd, event, true) {
                            flag.store(true, Ordering::SeqCst);
                        }
                    }
                    Err(e) => {
                        *err = Some(e);
                        sched2.schedule_fiber(me2);
                    }
                }
            });
        }

        if let Some(timer) = timer {
            timer.cancel();
        }
        if let Some(e) = register_error {
            return Err(e.into());
        }
        Ok(!timed_out.load(Ordering::SeqCst))
    }

    /// Registers a one-shot timer. The callback runs in the reactor loop;
    /// keep it short and non-blocking.
    pub fn register_timer<F>(&self, delay: Duration, callback: F) -> Timer
    where
        F: FnMut() + Send + 'static,
    {
        let (timer, at_front) = self.io.timers.register(delay, callback, false);
        if at_front {
            self.io.poller.tickle();
        }
        timer
    }

    /// Registers a recurring timer with period `delay`; the next expiry is
    /// computed at fire time.
    pub fn register_recurring_timer<F>(&self, delay: Duration, callback: F) -> Timer
    where
        F: FnMut() + Send + 'static,
    {
        let (timer, at_front) = self.io.timers.register(delay, callback, true);
        if at_front {
            self.io.poller.tickle();
        }
        timer
    }

    /// Puts the current fiber to sleep for at least `delay`.
    pub fn sleep(&self, delay: Duration) {
        let sched = Scheduler::current();
        let me = fiber::current();
        // Owned handle: once the timer is armed the fiber may resume (and
        // pop its frame) at any moment.
        let handle = self.clone();
        sched::park_with(move || {
            let mut slot = Some((sched, me));
            handle.register_timer(delay, move || {
                if let Some((sched, fiber)) = slot.take() {
                    sched.schedule_fiber(fiber);
                }
            });
        });
    }
}

impl std::ops::Deref for IoHandle {
    type Target = Scheduler;

    fn deref(&self) -> &Scheduler {
        &self.sched
    }
}

////////////////////////////////////////////////////////////////////////////////
// IoManager
////////////////////////////////////////////////////////////////////////////////

/// The owning side of the reactor: worker threads, the optional event
/// thread, and teardown. Dereferences to [`IoHandle`].
pub struct IoManager {
    handle: IoHandle,
    threads: Vec<thread::JoinHandle<()>>,
    event_thread: Option<thread::JoinHandle<()>>,
    use_caller: bool,
}

impl IoManager {
    /// A single-worker reactor driven by the calling thread's
    /// [`dispatch`](Self::dispatch).
    pub fn new() -> Result<Self> {
        Self::with_config(IoConfig::default())
    }

    pub fn with_config(config: IoConfig) -> Result<Self> {
        assert!(config.threads > 0, "a reactor needs at least one worker");

        let io = Arc::new(IoInner {
            poller: Poller::new()?,
            fd_states: StdMutex::new(HashMap::new()),
            pending_events: AtomicUsize::new(0),
            timers: TimerManager::new(),
            poll_lock: StdMutex::new(()),
            fallback: Notifier::default(),
            event_thread_mode: config.event_thread,
            stop: AtomicBool::new(false),
        });
        let sched = Scheduler::with_idle(Box::new(ReactorIdle { io: io.clone() }));
        let handle = IoHandle {
            sched: sched.clone(),
            io: io.clone(),
        };

        let spawn = config.threads - config.use_caller as usize;
        let threads = (0..spawn)
            .map(|i| {
                let sched = sched.clone();
                thread::Builder::new()
                    .name(format!("strand-io-worker-{}", i))
                    .spawn(move || sched::worker_loop(&sched, false))
                    .expect("failed to spawn a worker thread")
            })
            .collect();

        let event_thread = if config.event_thread {
            let io = io.clone();
            Some(
                thread::Builder::new()
                    .name("strand-io-events".into())
                    .spawn(move || {
                        while !io.stop.load(Ordering::Acquire) {
                            let _guard = io.poll_lock.lock().unwrap();
                            io.poll_cycle();
                        }
                    })
                    .expect("failed to spawn the event thread"),
            )
        } else {
            None
        };

        Ok(IoManager {
            handle,
            threads,
            event_thread,
            use_caller: config.use_caller,
        })
    }

    pub fn handle(&self) -> IoHandle {
        self.handle.clone()
    }

    /// Donates the calling thread as a worker until the run queue is empty,
    /// no fiber is executing, no readiness registration is outstanding and
    /// no timer is armed. Requires `use_caller`.
    pub fn dispatch(&self) {
        assert!(
            self.use_caller,
            "dispatch requires a reactor built with use_caller"
        );
        sched::worker_loop(&self.handle.sched, true);
    }

    pub fn stop(&self) {
        self.handle.io.stop.store(true, Ordering::Release);
        self.handle.sched.stop();
        self.handle.io.poller.tickle();
    }
}

impl std::ops::Deref for IoManager {
    type Target = IoHandle;

    fn deref(&self) -> &IoHandle {
        &self.handle
    }
}

impl Drop for IoManager {
    fn drop(&mut self) {
        self.stop();
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
        if let Some(handle) = self.event_thread.take() {
            let _ = handle.join();
        }
    }
}
