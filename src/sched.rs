//! Fiber scheduler and worker pool.
//!
//! A [`Scheduler`] owns a FIFO of runnable entries — already-built fibers or
//! plain closures, each with an optional target-thread hint — and hands them
//! to worker threads. Workers resume one fiber at a time; a fiber that
//! suspends without rescheduling itself stays parked until some other party
//! (a sync primitive, the reactor, a timer) posts it back.
//!
//! [`WorkerPool`] is the plain concrete scheduler: its idle procedure sleeps
//! on a semaphore. [`IoManager`](crate::reactor::IoManager) plugs the
//! reactor event loop in as the idle procedure instead.
//!
//! A thread that constructed a pool with `use_caller = true` can donate
//! itself as a worker with [`WorkerPool::dispatch`], which runs until the
//! queue drains and no outstanding work remains.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex as StdMutex};
use std::thread;
use std::thread::ThreadId;

use crate::fiber::{self, Fiber, FiberState};

/// How many finished fibers a scheduler keeps around for reuse by
/// closure entries.
const FREE_FIBER_CACHE: usize = 64;

////////////////////////////////////////////////////////////////////////////////
// Scheduler
////////////////////////////////////////////////////////////////////////////////

pub(crate) enum Task {
    Fiber(Arc<Fiber>),
    Job(Box<dyn FnOnce() + Send + 'static>),
}

pub(crate) struct Entry {
    task: Task,
    hint: Option<ThreadId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum RunState {
    Running = 0,
    Stopping = 1,
    Stopped = 2,
}

/// Idle strategy of a scheduler: what a worker does when the queue is empty,
/// and how to wake it from another thread.
pub(crate) trait Idle: Send + Sync + 'static {
    /// Blocks the calling worker until [`Idle::notify`] (or internal work)
    /// wakes it. Spurious returns are fine.
    fn idle(&self);
    /// Wakes one idle worker.
    fn notify(&self);
    /// Wakes every idle worker.
    fn notify_all(&self);
    /// Work the idle strategy itself is still tracking (registered events,
    /// armed timers). Keeps `dispatch` from returning early.
    fn has_work(&self) -> bool {
        false
    }
}

pub(crate) struct SchedInner {
    queue: StdMutex<VecDeque<Entry>>,
    state: AtomicU8,
    /// Fibers currently in `Exec` on some worker.
    active: AtomicUsize,
    idle: Box<dyn Idle>,
    free_fibers: StdMutex<Vec<Arc<Fiber>>>,
}

/// Cheap-clone handle to a scheduler. Safe to use from any thread; wake-ups
/// posted from timers, the reactor and sync primitives go through this.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedInner>,
}

thread_local! {
    static CURRENT_SCHED: RefCell<Option<Scheduler>> = RefCell::new(None);
    static AFTER_SWITCH: RefCell<Option<Box<dyn FnOnce() + 'static>>> = RefCell::new(None);
}

impl Scheduler {
    pub(crate) fn with_idle(idle: Box<dyn Idle>) -> Self {
        Scheduler {
            inner: Arc::new(SchedInner {
                queue: StdMutex::new(VecDeque::new()),
                state: AtomicU8::new(RunState::Running as u8),
                active: AtomicUsize::new(0),
                idle,
                free_fibers: StdMutex::new(Vec::new()),
            }),
        }
    }

    /// The scheduler driving the current thread.
    ///
    /// Panics outside a worker loop; fiber-blocking operations are only
    /// legal inside scheduled fibers.
    pub fn current() -> Scheduler {
        Self::try_current().expect("not running on a scheduler worker")
    }

    pub fn try_current() -> Option<Scheduler> {
        CURRENT_SCHED.with(|s| s.borrow().clone())
    }

    /// Enqueues a closure; it will run as a fiber on some worker. Closures
    /// are adapted to fibers on demand, reusing finished fibers when
    /// possible.
    pub fn schedule<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.push(Entry {
            task: Task::Job(Box::new(f)),
            hint: None,
        });
    }

    /// Enqueues a closure that may only run on the given worker thread.
    pub fn schedule_on<F>(&self, thread: ThreadId, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.push(Entry {
            task: Task::Job(Box::new(f)),
            hint: Some(thread),
        });
    }

    /// Posts a suspended fiber back onto the run queue.
    pub fn schedule_fiber(&self, fiber: Arc<Fiber>) {
        fiber.set_state(FiberState::Ready);
        self.push(Entry {
            task: Task::Fiber(fiber),
            hint: None,
        });
    }

    pub(crate) fn push(&self, entry: Entry) {
        if self.run_state() == RunState::Stopped {
            log::warn!("work scheduled on a stopped scheduler was dropped");
            return;
        }
        self.inner.queue.lock().unwrap().push_back(entry);
        self.inner.idle.notify();
    }

    /// Requests an asynchronous stop: queued and executing fibers run to
    /// completion (or to their next suspension), then worker loops return.
    /// Once everything drains, further scheduling is rejected.
    pub fn stop(&self) {
        let _ = self.inner.state.compare_exchange(
            RunState::Running as u8,
            RunState::Stopping as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        self.inner.idle.notify_all();
    }

    pub fn is_stopping(&self) -> bool {
        self.run_state() != RunState::Running
    }

    fn run_state(&self) -> RunState {
        match self.inner.state.load(Ordering::Acquire) {
            0 => RunState::Running,
            1 => RunState::Stopping,
            _ => RunState::Stopped,
        }
    }

    /// Queue empty and nothing executing. The bar for workers to exit after
    /// `stop`.
    fn drained(&self) -> bool {
        self.inner.queue.lock().unwrap().is_empty()
            && self.inner.active.load(Ordering::Acquire) == 0
    }

    /// [`Self::drained`] plus the idle strategy tracking nothing — the bar
    /// for `dispatch` to return.
    fn drained_fully(&self) -> bool {
        self.drained() && !self.inner.idle.has_work()
    }

    fn pop_for(&self, me: ThreadId) -> Option<Entry> {
        let mut queue = self.inner.queue.lock().unwrap();
        let idx = queue
            .iter()
            .position(|e| e.hint.map_or(true, |t| t == me))?;
        queue.remove(idx)
    }

    fn fiber_for_job(&self, job: Box<dyn FnOnce() + Send + 'static>) -> Arc<Fiber> {
        let cached = self.inner.free_fibers.lock().unwrap().pop();
        match cached {
            Some(fiber) => {
                fiber.reset(job);
                fiber
            }
            None => Fiber::new("worker-job", job),
        }
    }

    fn recycle(&self, fiber: Arc<Fiber>) {
        debug_assert_eq!(fiber.state(), FiberState::Term);
        let mut cache = self.inner.free_fibers.lock().unwrap();
        if cache.len() < FREE_FIBER_CACHE {
            cache.push(fiber);
        }
    }

    fn run_entry(&self, entry: Entry) {
        let fiber = match entry.task {
            Task::Fiber(f) => f,
            Task::Job(job) => self.fiber_for_job(job),
        };

        self.inner.active.fetch_add(1, Ordering::AcqRel);
        fiber.resume();

        // A fiber that parked through `park_with` left its publication step
        // for us; run it now that its context is fully saved. This happens
        // while `active` still counts us, so a requeue cannot race with a
        // dispatcher concluding the queue has drained.
        let deferred = AFTER_SWITCH.with(|c| c.borrow_mut().take());
        if let Some(op) = deferred {
            op();
        }
        self.inner.active.fetch_sub(1, Ordering::AcqRel);

        match fiber.state() {
            FiberState::Term => self.recycle(fiber),
            FiberState::Except => {
                if let Some(payload) = fiber.take_panic() {
                    log::error!(
                        "fiber '{}' panicked: {}",
                        fiber.name(),
                        panic_message(&payload)
                    );
                }
            }
            // Suspended voluntarily; it either requeued itself or waits for
            // an external wake-up.
            _ => {}
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "<non-string panic payload>"
    }
}

/// Requeues the current fiber at the tail of its scheduler's queue and
/// returns to the worker loop; other ready fibers get to run first.
pub fn reschedule() {
    let sched = Scheduler::current();
    let me = fiber::current();
    park_with(move || {
        sched.schedule_fiber(me);
    });
}

/// Suspends the current fiber and runs `publish` on the worker's own stack
/// once the fiber's context is fully saved. Wait lists and run queues must
/// only learn about a parked fiber through `publish`: publishing earlier
/// would let another thread resume the fiber while it is still switching
/// out.
pub(crate) fn park_with<F: FnOnce()>(publish: F) {
    let op: Box<dyn FnOnce() + '_> = Box::new(publish);
    // SAFETY: the worker loop invokes the closure right after the switch,
    // while the parked fiber's frame is frozen on its own stack, so borrows
    // of that frame stay valid up to the closure's publication step. The
    // moment the closure makes the fiber discoverable (wait-list insert,
    // queue push, reactor registration) another thread may resume it and
    // unwind the frame — everything the closure touches after that point
    // must be owned by the closure, and callers are written that way.
    let op: Box<dyn FnOnce() + 'static> = unsafe { mem::transmute(op) };
    AFTER_SWITCH.with(|c| {
        let mut slot = c.borrow_mut();
        debug_assert!(slot.is_none(), "nested park_with");
        *slot = Some(op);
    });
    fiber::suspend();
}

/// The worker loop. `drain_mode` is the `dispatch` variant: return as soon
/// as no work remains instead of idling through quiet periods.
pub(crate) fn worker_loop(sched: &Scheduler, drain_mode: bool) {
    let prev = CURRENT_SCHED.with(|s| s.borrow_mut().replace(sched.clone()));
    let me = thread::current().id();

    loop {
        match sched.pop_for(me) {
            Some(entry) => {
                sched.run_entry(entry);
                // Let a blocked dispatcher re-evaluate its exit condition.
                if sched.inner.queue.lock().unwrap().is_empty() {
                    sched.inner.idle.notify();
                }
            }
            None => {
                if sched.run_state() != RunState::Running && sched.drained() {
                    let _ = sched.inner.state.compare_exchange(
                        RunState::Stopping as u8,
                        RunState::Stopped as u8,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    );
                    break;
                }
                if drain_mode && sched.drained_fully() {
                    break;
                }
                sched.inner.idle.idle();
            }
        }
    }

    CURRENT_SCHED.with(|s| *s.borrow_mut() = prev);
}

////////////////////////////////////////////////////////////////////////////////
// Notifier
////////////////////////////////////////////////////////////////////////////////

/// A counting semaphore on an OS mutex + condvar. The `WorkerPool` idle
/// procedure, and the fallback idle of the reactor, sleep here.
#[derive(Default)]
pub(crate) struct Notifier {
    permits: StdMutex<usize>,
    cv: Condvar,
}

impl Notifier {
    pub(crate) fn wait(&self) {
        let mut permits = self.permits.lock().unwrap();
        while *permits == 0 {
            permits = self.cv.wait(permits).unwrap();
        }
        *permits -= 1;
    }

    pub(crate) fn post(&self) {
        *self.permits.lock().unwrap() += 1;
        self.cv.notify_one();
    }

    pub(crate) fn post_all(&self) {
        // Enough permits that every sleeper gets out.
        *self.permits.lock().unwrap() += 1024;
        self.cv.notify_all();
    }
}

struct SemaphoreIdle {
    notifier: Notifier,
}

impl Idle for SemaphoreIdle {
    fn idle(&self) {
        self.notifier.wait();
    }

    fn notify(&self) {
        self.notifier.post();
    }

    fn notify_all(&self) {
        self.notifier.post_all();
    }
}

////////////////////////////////////////////////////////////////////////////////
// WorkerPool
////////////////////////////////////////////////////////////////////////////////

/// A scheduler whose workers sleep on a semaphore when there is nothing to
/// run.
///
/// ```
/// use std::sync::Arc;
/// use std::sync::atomic::{AtomicUsize, Ordering};
/// use strand::sched::WorkerPool;
///
/// let pool = WorkerPool::new();
/// let hits = Arc::new(AtomicUsize::new(0));
/// let h = hits.clone();
/// pool.schedule(move || {
///     h.fetch_add(1, Ordering::SeqCst);
/// });
/// pool.dispatch();
/// assert_eq!(hits.load(Ordering::SeqCst), 1);
/// ```
pub struct WorkerPool {
    sched: Scheduler,
    threads: Vec<thread::JoinHandle<()>>,
    use_caller: bool,
}

impl WorkerPool {
    /// One worker, donated by the calling thread during
    /// [`dispatch`](Self::dispatch).
    pub fn new() -> Self {
        Self::with_threads(1, true)
    }

    /// `threads` workers in total; with `use_caller` the constructing thread
    /// counts as one of them (donated during `dispatch`), so `threads - 1`
    /// OS threads are spawned.
    pub fn with_threads(threads: usize, use_caller: bool) -> Self {
        assert!(threads > 0, "a scheduler needs at least one worker");
        let sched = Scheduler::with_idle(Box::new(SemaphoreIdle {
            notifier: Notifier::default(),
        }));

        let spawn = threads - use_caller as usize;
        let threads = (0..spawn)
            .map(|i| {
                let sched = sched.clone();
                thread::Builder::new()
                    .name(format!("strand-worker-{}", i))
                    .spawn(move || worker_loop(&sched, false))
                    .expect("failed to spawn a worker thread")
            })
            .collect();

        WorkerPool {
            sched,
            threads,
            use_caller,
        }
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.sched
    }

    /// Donates the calling thread as a worker until the queue drains and no
    /// fiber is executing. Requires `use_caller`.
    pub fn dispatch(&self) {
        assert!(
            self.use_caller,
            "dispatch requires a pool built with use_caller"
        );
        worker_loop(&self.sched, true);
    }

    pub fn stop(&self) {
        self.sched.stop();
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new()
    }
}

impl std::ops::Deref for WorkerPool {
    type Target = Scheduler;

    fn deref(&self) -> &Scheduler {
        &self.sched
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.sched.stop();
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// parallel_do
////////////////////////////////////////////////////////////////////////////////

/// Runs every job as its own fiber and suspends the calling fiber until all
/// of them finish. If any job panicked, the first captured payload is
/// re-raised in the caller once the rest have completed.
///
/// Must be called from a fiber running on a scheduler (the wait suspends).
pub fn parallel_do(sched: &Scheduler, jobs: Vec<Box<dyn FnOnce() + Send + 'static>>) {
    if jobs.is_empty() {
        return;
    }

    struct Shared {
        remaining: AtomicUsize,
        done: fiber::Event,
        failure: StdMutex<Option<Box<dyn std::any::Any + Send>>>,
    }

    let shared = Arc::new(Shared {
        remaining: AtomicUsize::new(jobs.len()),
        done: fiber::Event::new(),
        failure: StdMutex::new(None),
    });

    for job in jobs {
        let shared = shared.clone();
        sched.schedule(move || {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(job)) {
                let mut failure = shared.failure.lock().unwrap();
                if failure.is_none() {
                    *failure = Some(payload);
                }
            }
            if shared.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                shared.done.set();
            }
        });
    }

    shared.done.wait();
    let failure = shared.failure.lock().unwrap().take();
    if let Some(payload) = failure {
        panic::resume_unwind(payload);
    }
}
