//! Synchronization primitives for fibers.
//!
//! All of them share one pattern: a short critical section under an OS
//! mutex decides whether the current fiber may proceed; if not, the pair
//! `(scheduler, fiber)` is appended to a wait list and the fiber parks. A
//! later signal pops the list head and posts the fiber back to the
//! scheduler it was captured on. The OS mutex is only ever held across
//! pointer shuffling, never across a suspension or I/O.
//!
//! Waiting on any of these outside a scheduler fiber is a programmer error
//! and panics.

use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::fmt;
use std::mem;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex as StdMutex};

use crate::fiber::{self, Fiber};
use crate::sched::{park_with, Scheduler};

type Waiter = (Scheduler, Arc<Fiber>);

fn wake(waiter: Waiter) {
    let (sched, fiber) = waiter;
    sched.schedule_fiber(fiber);
}

////////////////////////////////////////////////////////////////////////////////
// Mutex
////////////////////////////////////////////////////////////////////////////////

struct MutexState {
    owner: Option<Arc<Fiber>>,
    waiters: VecDeque<Waiter>,
}

pub(crate) struct MutexShared {
    state: StdMutex<MutexState>,
}

impl MutexShared {
    /// Releases ownership and hands the lock to the next waiter, if any.
    /// Must be called with `state` already locked, on behalf of the owning
    /// fiber (ownership is asserted by the callers, which know who that is).
    fn unlock_locked(state: &mut MutexState) {
        debug_assert!(state.owner.is_some(), "fiber mutex unlocked while free");
        state.owner = None;
        if let Some((sched, next)) = state.waiters.pop_front() {
            state.owner = Some(next.clone());
            sched.schedule_fiber(next);
        }
    }
}

/// A mutual exclusion primitive for fibers, protecting its data like
/// [`std::sync::Mutex`] but suspending the calling fiber instead of
/// blocking its thread.
///
/// Non-recursive: locking it again from the owning fiber panics. Waiters
/// are served in arrival order.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use strand::fiber::Mutex;
/// use strand::sched::WorkerPool;
///
/// let pool = WorkerPool::new();
/// let shared = Arc::new(Mutex::new(0));
/// let s = shared.clone();
/// pool.schedule(move || {
///     *s.lock() += 1;
/// });
/// pool.dispatch();
/// assert_eq!(*shared.try_lock().unwrap(), 1);
/// ```
pub struct Mutex<T: ?Sized> {
    shared: Arc<MutexShared>,
    data: UnsafeCell<T>,
}

// SAFETY: access to `data` is serialized by fiber-level ownership.
unsafe impl<T: ?Sized + Send> Send for Mutex<T> {}
unsafe impl<T: ?Sized + Send> Sync for Mutex<T> {}

impl<T> Mutex<T> {
    /// Creates a new mutex in an unlocked state ready for use.
    pub fn new(t: T) -> Mutex<T> {
        Mutex {
            shared: Arc::new(MutexShared {
                state: StdMutex::new(MutexState {
                    owner: None,
                    waiters: VecDeque::new(),
                }),
            }),
            data: UnsafeCell::new(t),
        }
    }

    /// Consumes this mutex, returning the underlying data.
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> Mutex<T> {
    /// Acquires the mutex, suspending the current fiber until it is
    /// available. Returns a RAII guard; the mutex unlocks when the guard
    /// drops.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        let sched = Scheduler::current();
        let me = fiber::current();

        let mut state = self.shared.state.lock().unwrap();
        if state.owner.is_none() {
            state.owner = Some(me);
            drop(state);
        } else {
            let recursive = state.owner.as_ref().map_or(false, |o| Arc::ptr_eq(o, &me));
            if recursive {
                // Release the OS lock before panicking so the mutex itself
                // stays usable by other fibers.
                drop(state);
                panic!("fiber mutex is not recursive");
            }
            park_with(move || {
                state.waiters.push_back((sched, me));
                drop(state);
            });
            // The fiber that released the lock made us the owner before
            // posting us back.
            #[cfg(debug_assertions)]
            {
                let state = self.shared.state.lock().unwrap();
                debug_assert!(state
                    .owner
                    .as_ref()
                    .map_or(false, |o| Arc::ptr_eq(o, &fiber::current())));
            }
        }

        MutexGuard {
            lock: self,
            released: false,
        }
    }

    /// Attempts to acquire the mutex without suspending. Does not require a
    /// scheduler.
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        let mut state = self.shared.state.lock().unwrap();
        if state.owner.is_some() {
            return None;
        }
        state.owner = Some(fiber::current());
        Some(MutexGuard {
            lock: self,
            released: false,
        })
    }

    /// Immediately drops the guard, and consequently unlocks the mutex.
    pub fn unlock(guard: MutexGuard<'_, T>) {
        drop(guard);
    }

    /// Releases the lock only if another fiber is waiting for it, handing
    /// it over directly. Returns the guard back when the holder remains
    /// sole interested party.
    ///
    /// Lets a holder keep a cheaply-reacquired lock until contended.
    pub fn unlock_if_not_unique(guard: MutexGuard<'_, T>) -> Option<MutexGuard<'_, T>> {
        let lock = guard.lock;
        let mut state = lock.shared.state.lock().unwrap();
        if state.waiters.is_empty() {
            drop(state);
            Some(guard)
        } else {
            MutexShared::unlock_locked(&mut state);
            drop(state);
            mem::forget(guard);
            None
        }
    }

    /// Returns a mutable reference to the underlying data; no locking is
    /// needed since the borrow is exclusive.
    pub fn get_mut(&mut self) -> &mut T {
        unsafe { &mut *self.data.get() }
    }
}

impl<T> From<T> for Mutex<T> {
    fn from(t: T) -> Self {
        Mutex::new(t)
    }
}

impl<T: Default> Default for Mutex<T> {
    fn default() -> Mutex<T> {
        Mutex::new(Default::default())
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for Mutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("Mutex");
        match self.try_lock() {
            Some(guard) => {
                d.field("data", &&*guard);
            }
            None => {
                struct LockedPlaceholder;
                impl fmt::Debug for LockedPlaceholder {
                    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                        f.write_str("<locked>")
                    }
                }
                d.field("data", &LockedPlaceholder);
            }
        }
        d.finish_non_exhaustive()
    }
}

////////////////////////////////////////////////////////////////////////////////
// MutexGuard
////////////////////////////////////////////////////////////////////////////////

pub struct MutexGuard<'a, T: ?Sized + 'a> {
    lock: &'a Mutex<T>,
    released: bool,
}

impl<'a, T: ?Sized + 'a> Drop for MutexGuard<'a, T> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let mut state = self.lock.shared.state.lock().unwrap();
        debug_assert!(
            state
                .owner
                .as_ref()
                .map_or(false, |o| Arc::ptr_eq(o, &fiber::current())),
            "fiber mutex unlocked by a non-owner"
        );
        MutexShared::unlock_locked(&mut state);
    }
}

impl<T: ?Sized> Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for MutexGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

////////////////////////////////////////////////////////////////////////////////
// Condition
////////////////////////////////////////////////////////////////////////////////

/// A condition variable bound to a fiber [`Mutex`] at construction.
///
/// `signal` and `broadcast` move waiters directly onto the mutex's wait
/// list when it is held, granting the lock in arrival order without waking
/// everyone just to contend.
pub struct Condition {
    mutex: Arc<MutexShared>,
    waiters: StdMutex<VecDeque<Waiter>>,
}

impl Condition {
    pub fn new<T: ?Sized>(mutex: &Mutex<T>) -> Self {
        Condition {
            mutex: mutex.shared.clone(),
            waiters: StdMutex::new(VecDeque::new()),
        }
    }

    /// Atomically releases the mutex and suspends the current fiber until
    /// signalled; returns with the mutex re-acquired.
    pub fn wait<'a, T: ?Sized>(&self, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
        assert!(
            Arc::ptr_eq(&self.mutex, &guard.lock.shared),
            "condition waited with a guard of a different mutex"
        );
        let sched = Scheduler::current();
        let me = fiber::current();
        let lock = guard.lock;
        // The unlock happens inside the park closure below.
        mem::forget(guard);

        park_with(move || {
            let mut waiters = self.waiters.lock().unwrap();
            let mut state = self.mutex.state.lock().unwrap();
            debug_assert!(state
                .owner
                .as_ref()
                .map_or(false, |o| Arc::ptr_eq(o, &me)));
            MutexShared::unlock_locked(&mut state);
            waiters.push_back((sched, me));
        });

        // The signaller made us the mutex owner before posting us back.
        MutexGuard {
            lock,
            released: false,
        }
    }

    /// Wakes the longest-waiting fiber, if any. The lock is handed to it
    /// directly (or it is queued on the mutex if the lock is held).
    pub fn signal(&self) {
        let next = self.waiters.lock().unwrap().pop_front();
        if let Some(waiter) = next {
            self.grant(waiter);
        }
    }

    /// Wakes every waiter; each re-acquires the mutex exactly once, in wait
    /// order.
    pub fn broadcast(&self) {
        let drained: Vec<Waiter> = self.waiters.lock().unwrap().drain(..).collect();
        for waiter in drained {
            self.grant(waiter);
        }
    }

    fn grant(&self, waiter: Waiter) {
        let mut state = self.mutex.state.lock().unwrap();
        debug_assert!(state
            .owner
            .as_ref()
            .map_or(true, |o| !Arc::ptr_eq(o, &waiter.1)));
        if state.owner.is_none() {
            state.owner = Some(waiter.1.clone());
            drop(state);
            wake(waiter);
        } else {
            state.waiters.push_back(waiter);
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// Semaphore
////////////////////////////////////////////////////////////////////////////////

struct SemState {
    permits: usize,
    waiters: VecDeque<Waiter>,
}

/// A counting semaphore for fibers.
pub struct Semaphore {
    state: StdMutex<SemState>,
}

impl Semaphore {
    pub fn new(permits: usize) -> Self {
        Semaphore {
            state: StdMutex::new(SemState {
                permits,
                waiters: VecDeque::new(),
            }),
        }
    }

    /// Takes a permit, suspending the current fiber until one is available.
    pub fn wait(&self) {
        let sched = Scheduler::current();
        let me = fiber::current();

        let mut state = self.state.lock().unwrap();
        if state.permits > 0 {
            state.permits -= 1;
            return;
        }
        park_with(move || {
            state.waiters.push_back((sched, me));
            drop(state);
        });
    }

    /// Takes a permit if one is available, without suspending.
    pub fn try_wait(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.permits > 0 {
            state.permits -= 1;
            true
        } else {
            false
        }
    }

    /// Releases a permit: the longest-waiting fiber receives it, or the
    /// counter grows.
    pub fn notify(&self) {
        let waiter = {
            let mut state = self.state.lock().unwrap();
            match state.waiters.pop_front() {
                Some(w) => Some(w),
                None => {
                    state.permits += 1;
                    None
                }
            }
        };
        if let Some(waiter) = waiter {
            wake(waiter);
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// Event
////////////////////////////////////////////////////////////////////////////////

struct EventState {
    signalled: bool,
    waiters: VecDeque<Waiter>,
}

/// A wakeup flag for fibers.
///
/// The default, auto-reset flavor wakes exactly one waiter per [`set`] and
/// clears itself; the manual-reset flavor ([`Event::manual`]) wakes every
/// waiter and stays set until [`reset`].
///
/// [`set`]: Self::set
/// [`reset`]: Self::reset
pub struct Event {
    auto_reset: bool,
    state: StdMutex<EventState>,
}

impl Event {
    /// An auto-reset event.
    pub fn new() -> Self {
        Self::with_reset(true)
    }

    /// A manual-reset event.
    pub fn manual() -> Self {
        Self::with_reset(false)
    }

    fn with_reset(auto_reset: bool) -> Self {
        Event {
            auto_reset,
            state: StdMutex::new(EventState {
                signalled: false,
                waiters: VecDeque::new(),
            }),
        }
    }

    /// Suspends the current fiber until the event is set. Returns
    /// immediately when already set (consuming the signal in auto-reset
    /// mode).
    pub fn wait(&self) {
        let sched = Scheduler::current();
        let me = fiber::current();

        let mut state = self.state.lock().unwrap();
        if state.signalled {
            if self.auto_reset {
                state.signalled = false;
            }
            return;
        }
        park_with(move || {
            state.waiters.push_back((sched, me));
            drop(state);
        });
    }

    pub fn set(&self) {
        let woken: Vec<Waiter> = {
            let mut state = self.state.lock().unwrap();
            if !self.auto_reset {
                state.signalled = true;
                state.waiters.drain(..).collect()
            } else if let Some(waiter) = state.waiters.pop_front() {
                vec![waiter]
            } else {
                state.signalled = true;
                Vec::new()
            }
        };
        for waiter in woken {
            wake(waiter);
        }
    }

    pub fn reset(&self) {
        self.state.lock().unwrap().signalled = false;
    }

    pub fn is_set(&self) -> bool {
        self.state.lock().unwrap().signalled
    }
}

impl Default for Event {
    fn default() -> Self {
        Self::new()
    }
}
