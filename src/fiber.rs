//! Cooperative multitasking module.
//!
//! A fiber is a set of instructions executed with cooperative multitasking:
//! it owns its stack, runs until it voluntarily suspends, and is resumed by
//! whoever holds a handle to it. Fibers are multiplexed onto OS threads by a
//! [`Scheduler`](crate::sched::Scheduler); any thread may resume a suspended
//! fiber, but only one thread at a time may be executing it.
//!
//! With this module you can:
//! - create and manually drive [fibers](Fiber) with [`Fiber::resume`] and
//!   [`suspend`],
//! - reuse a finished fiber for a new entry with [`Fiber::reset`],
//! - use the synchronization primitives in [`sync`], which suspend the
//!   calling fiber instead of blocking its thread.
//!
//! Machine contexts are switched with `swapcontext(3)`; stacks are
//! guard-paged `mmap` regions (see [`Fiber::with_stack_size`]).

use std::any::Any;
use std::cell::RefCell;
use std::cell::UnsafeCell;
use std::fmt;
use std::mem::MaybeUninit;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Mutex as StdMutex;
use std::sync::{Arc, Weak};

mod stack;
pub mod sync;

pub use sync::{Condition, Event, Mutex, MutexGuard, Semaphore};

use stack::FiberStack;

/// Default usable stack size for a new fiber.
pub const DEFAULT_STACK_SIZE: usize = 256 * 1024;

////////////////////////////////////////////////////////////////////////////////
// FiberState
////////////////////////////////////////////////////////////////////////////////

/// Lifecycle of a [`Fiber`].
///
/// ```text
/// Init -> Ready -> Exec <-> Hold
///                   |
///                   +-> Term   (entry returned)
///                   +-> Except (entry panicked)
/// Term -> Init                 (via reset)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FiberState {
    /// Created (or reset), never resumed.
    Init = 0,
    /// Sitting in a scheduler run queue.
    Ready = 1,
    /// Executing on some thread right now.
    Exec = 2,
    /// Suspended; owns no thread.
    Hold = 3,
    /// Entry closure returned.
    Term = 4,
    /// Entry closure panicked; the payload is held for the next resumer.
    Except = 5,
}

impl FiberState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Init,
            1 => Self::Ready,
            2 => Self::Exec,
            3 => Self::Hold,
            4 => Self::Term,
            5 => Self::Except,
            _ => unreachable!("corrupt fiber state"),
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// Fiber
////////////////////////////////////////////////////////////////////////////////

type Entry = Box<dyn FnOnce() + Send + 'static>;
type Payload = Box<dyn Any + Send + 'static>;

/// A stackful coroutine.
///
/// Exactly one thread may have a fiber in [`FiberState::Exec`] at any moment;
/// a fiber that is not executing owns no thread and may be resumed from any
/// thread. That invariant is what makes `Fiber` `Send + Sync`.
///
/// Example:
/// ```
/// use strand::fiber::{self, Fiber};
///
/// let fiber = Fiber::new("greeter", || println!("hello from a fiber"));
/// fiber.resume();
/// assert_eq!(fiber.state(), fiber::FiberState::Term);
/// ```
pub struct Fiber {
    name: String,
    state: AtomicU8,
    /// `None` for a thread's implicit main fiber, which runs on the thread's
    /// own stack.
    stack: Option<FiberStack>,
    ctx: Box<UnsafeCell<MaybeUninit<libc::ucontext_t>>>,
    entry: StdMutex<Option<Entry>>,
    /// The fiber that last resumed this one; `suspend` returns to it.
    parent: StdMutex<Option<Arc<Fiber>>>,
    /// Panic payload captured from the entry closure.
    panic: StdMutex<Option<Payload>>,
    /// Payload to raise inside the fiber at its suspension point.
    injected: StdMutex<Option<Payload>>,
    /// Self-reference; fibers always live behind an `Arc`.
    me: Weak<Fiber>,
}

// SAFETY: the machine context is only touched by the thread that currently
// has the fiber in Exec (resume/suspend serialize on the state machine); all
// other mutable fields are behind mutexes.
unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

impl fmt::Debug for Fiber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fiber")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

thread_local! {
    static CURRENT: RefCell<Option<Arc<Fiber>>> = RefCell::new(None);
}

/// The fiber currently executing on this thread.
///
/// The first call on a thread materializes the thread's implicit main fiber,
/// which represents the thread's own stack and cannot be `reset` or resumed
/// from elsewhere.
pub fn current() -> Arc<Fiber> {
    CURRENT.with(|c| {
        let mut slot = c.borrow_mut();
        if slot.is_none() {
            *slot = Some(Arc::new_cyclic(|me| Fiber::main_for_thread(me.clone())));
        }
        slot.as_ref().unwrap().clone()
    })
}

/// Suspends the current fiber, returning control to the fiber that resumed
/// it. The caller is responsible for arranging a future wake-up; nothing
/// reschedules the fiber automatically.
///
/// Panics when called on a thread's main fiber (it has no parent).
pub fn suspend() {
    let me = current();
    let parent = me
        .parent
        .lock()
        .unwrap()
        .clone()
        .expect("cannot suspend a thread's main fiber");
    me.set_state(FiberState::Hold);
    switch(&me, &parent);
}

impl Fiber {
    /// Creates a fiber with the default stack size. The entry closure does
    /// not run until the first [`resume`](Self::resume).
    pub fn new<F>(name: impl Into<String>, f: F) -> Arc<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        Self::with_stack_size(name, DEFAULT_STACK_SIZE, f)
    }

    /// Creates a fiber with an explicit usable stack size (rounded up to
    /// whole pages; a guard page is added on top).
    pub fn with_stack_size<F>(name: impl Into<String>, stack_size: usize, f: F) -> Arc<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        let stack = FiberStack::alloc(stack_size).expect("failed to allocate a fiber stack");
        let fiber = Arc::new_cyclic(|me| Fiber {
            name: name.into(),
            state: AtomicU8::new(FiberState::Init as u8),
            stack: Some(stack),
            ctx: Box::new(UnsafeCell::new(MaybeUninit::uninit())),
            entry: StdMutex::new(Some(Box::new(f))),
            parent: StdMutex::new(None),
            panic: StdMutex::new(None),
            injected: StdMutex::new(None),
            me: me.clone(),
        });
        fiber.init_context();
        fiber
    }

    fn main_for_thread(me: Weak<Fiber>) -> Self {
        Fiber {
            name: format!(
                "thread-main/{}",
                std::thread::current().name().unwrap_or("?")
            ),
            state: AtomicU8::new(FiberState::Exec as u8),
            stack: None,
            ctx: Box::new(UnsafeCell::new(MaybeUninit::uninit())),
            entry: StdMutex::new(None),
            parent: StdMutex::new(None),
            panic: StdMutex::new(None),
            injected: StdMutex::new(None),
            me,
        }
    }

    /// The owning `Arc` of this fiber.
    fn arc(&self) -> Arc<Fiber> {
        self.me.upgrade().expect("fibers always live behind an Arc")
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> FiberState {
        FiberState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: FiberState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// `true` once the entry closure has returned or panicked.
    pub fn is_done(&self) -> bool {
        matches!(self.state(), FiberState::Term | FiberState::Except)
    }

    /// Suspends the calling fiber and switches to `self`, recording the
    /// caller as the parent that [`suspend`] returns to. Returns when `self`
    /// suspends or finishes.
    ///
    /// Panics if `self` is already executing or already finished.
    pub fn resume(&self) {
        let target = self.arc();
        let caller = current();
        assert!(
            !Arc::ptr_eq(&caller, &target),
            "a fiber cannot resume itself"
        );
        match self.state() {
            FiberState::Init | FiberState::Ready | FiberState::Hold => {}
            FiberState::Exec => panic!("fiber '{}' is already executing", self.name),
            FiberState::Term | FiberState::Except => {
                panic!("fiber '{}' has already finished", self.name)
            }
        }

        *self.parent.lock().unwrap() = Some(caller.clone());
        caller.set_state(FiberState::Hold);
        self.set_state(FiberState::Exec);
        switch(&caller, &target);
        caller.set_state(FiberState::Exec);
    }

    /// Reinstalls a new entry closure. Only legal in `Init` or `Term`; the
    /// fiber returns to `Init` and can be resumed again.
    pub fn reset<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        assert!(
            matches!(self.state(), FiberState::Init | FiberState::Term),
            "reset is only legal on an Init or Term fiber (fiber '{}' is {:?})",
            self.name,
            self.state()
        );
        assert!(self.stack.is_some(), "cannot reset a thread's main fiber");
        *self.entry.lock().unwrap() = Some(Box::new(f));
        *self.panic.lock().unwrap() = None;
        *self.injected.lock().unwrap() = None;
        self.init_context();
        self.set_state(FiberState::Init);
    }

    /// Saves a payload that will be raised (via `resume_unwind`) inside this
    /// fiber at its suspension point the next time it is resumed.
    pub fn inject(&self, payload: Payload) {
        *self.injected.lock().unwrap() = Some(payload);
    }

    /// Takes the panic payload captured when the entry closure panicked.
    pub fn take_panic(&self) -> Option<Payload> {
        self.panic.lock().unwrap().take()
    }

    fn ctx_ptr(&self) -> *mut libc::ucontext_t {
        self.ctx.get() as *mut libc::ucontext_t
    }

    fn init_context(&self) {
        let stack = self.stack.as_ref().expect("entry fibers always have a stack");
        unsafe {
            let ctx = self.ctx_ptr();
            if libc::getcontext(ctx) != 0 {
                panic!("getcontext failed: {}", std::io::Error::last_os_error());
            }
            (*ctx).uc_link = ptr::null_mut();
            (*ctx).uc_stack.ss_sp = stack.sp();
            (*ctx).uc_stack.ss_size = stack.usable_len();
            (*ctx).uc_stack.ss_flags = 0;
            libc::makecontext(ctx, fiber_main, 0);
        }
    }
}

/// Entry point of every non-main fiber, running on the fiber's own stack.
extern "C" fn fiber_main() {
    let fiber = current();
    let entry = fiber
        .entry
        .lock()
        .unwrap()
        .take()
        .expect("fiber resumed without an entry closure");

    match panic::catch_unwind(AssertUnwindSafe(entry)) {
        Ok(()) => fiber.set_state(FiberState::Term),
        Err(payload) => {
            *fiber.panic.lock().unwrap() = Some(payload);
            fiber.set_state(FiberState::Except);
        }
    }

    let parent = fiber
        .parent
        .lock()
        .unwrap()
        .take()
        .expect("finished fiber has no parent to return to");
    switch(&fiber, &parent);
    unreachable!("a finished fiber was resumed");
}

/// Switches machine context from `from` (the currently executing fiber) to
/// `to`. Returns when something switches back into `from`; at that point an
/// injected payload, if any, is raised.
fn switch(from: &Arc<Fiber>, to: &Arc<Fiber>) {
    CURRENT.with(|c| *c.borrow_mut() = Some(to.clone()));
    let rc = unsafe { libc::swapcontext(from.ctx_ptr(), to.ctx_ptr()) };
    assert_eq!(rc, 0, "swapcontext failed");

    // Control is back in `from`.
    if let Some(payload) = from.injected.lock().unwrap().take() {
        panic::resume_unwind(payload);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn runs_to_completion() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let fiber = Fiber::new("t", move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(fiber.state(), FiberState::Init);
        fiber.resume();
        assert_eq!(fiber.state(), FiberState::Term);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn suspend_and_resume_interleave() {
        let trace = Arc::new(StdMutex::new(Vec::new()));
        let t = trace.clone();
        let fiber = Fiber::new("t", move || {
            t.lock().unwrap().push("a");
            suspend();
            t.lock().unwrap().push("c");
        });
        fiber.resume();
        trace.lock().unwrap().push("b");
        assert_eq!(fiber.state(), FiberState::Hold);
        fiber.resume();
        assert_eq!(fiber.state(), FiberState::Term);
        assert_eq!(*trace.lock().unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn reset_reuses_the_fiber() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let fiber = Fiber::new("t", move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        fiber.resume();
        let h = hits.clone();
        fiber.reset(move || {
            h.fetch_add(10, Ordering::SeqCst);
        });
        assert_eq!(fiber.state(), FiberState::Init);
        fiber.resume();
        assert_eq!(hits.load(Ordering::SeqCst), 11);
    }

    #[test]
    fn panic_is_captured_not_propagated() {
        let fiber = Fiber::new("t", || panic!("boom"));
        fiber.resume();
        assert_eq!(fiber.state(), FiberState::Except);
        let payload = fiber.take_panic().unwrap();
        assert_eq!(payload.downcast_ref::<&str>(), Some(&"boom"));
    }

    #[test]
    fn injected_payload_raises_at_suspension_point() {
        let observed = Arc::new(StdMutex::new(None));
        let o = observed.clone();
        let fiber = Fiber::new("t", move || {
            let caught = panic::catch_unwind(|| suspend());
            *o.lock().unwrap() = Some(caught.is_err());
        });
        fiber.resume();
        fiber.inject(Box::new("cancelled"));
        fiber.resume();
        assert_eq!(fiber.state(), FiberState::Term);
        assert_eq!(*observed.lock().unwrap(), Some(true));
    }

    #[test]
    fn resume_from_another_thread() {
        let fiber = Fiber::new("t", || {
            suspend();
        });
        fiber.resume();
        let f = fiber.clone();
        std::thread::spawn(move || f.resume()).join().unwrap();
        assert_eq!(fiber.state(), FiberState::Term);
    }
}
