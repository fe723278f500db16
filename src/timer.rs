//! Timer management.
//!
//! A [`TimerManager`] keeps timers totally ordered by `(expiry, insertion
//! sequence)` — equal expiries fire in registration order. It does not own
//! a thread: whoever embeds it (the reactor idle loop, a test) is expected
//! to call [`TimerManager::process_expired`] periodically and to use
//! [`TimerManager::next_timeout`] as the bound for its blocking wait.
//!
//! Callbacks run with the manager mutex released; a callback that panics is
//! logged and does not disturb the remaining timers.

use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use crate::clock;

type Callback = Box<dyn FnMut() + Send + 'static>;

struct TimerState {
    /// Absolute expiry in microseconds of monotonic time; 0 once cancelled
    /// (or fired, for one-shot timers).
    next: AtomicU64,
    /// Re-arm interval for recurring timers, in microseconds.
    period_us: u64,
    recurring: bool,
    seq: u64,
    callback: StdMutex<Callback>,
}

struct TimerInner {
    timers: StdMutex<BTreeMap<(u64, u64), Arc<TimerState>>>,
    seq: AtomicU64,
}

/// An ordered collection of one-shot and recurring timers.
#[derive(Clone)]
pub struct TimerManager {
    inner: Arc<TimerInner>,
}

/// Handle to a registered timer. Dropping the handle does not cancel the
/// timer; call [`Timer::cancel`] for that.
pub struct Timer {
    state: Arc<TimerState>,
    manager: Weak<TimerInner>,
}

impl TimerManager {
    pub fn new() -> Self {
        TimerManager {
            inner: Arc::new(TimerInner {
                timers: StdMutex::new(BTreeMap::new()),
                seq: AtomicU64::new(0),
            }),
        }
    }

    /// Registers a timer firing `delay` from now (and every `delay` after
    /// that when `recurring`; a recurring timer's next expiry is computed
    /// at fire time). The second return value tells whether the new timer
    /// became the earliest one — owners blocked on the old earliest
    /// deadline need a wake-up then.
    pub fn register<F>(&self, delay: Duration, callback: F, recurring: bool) -> (Timer, bool)
    where
        F: FnMut() + Send + 'static,
    {
        let seq = self.inner.seq.fetch_add(1, Ordering::Relaxed);
        let expiry = clock::deadline(delay);
        let state = Arc::new(TimerState {
            next: AtomicU64::new(expiry),
            period_us: delay.as_micros().min(u64::MAX as u128) as u64,
            recurring,
            seq,
            callback: StdMutex::new(Box::new(callback)),
        });

        let mut timers = self.inner.timers.lock().unwrap();
        timers.insert((expiry, seq), state.clone());
        let at_front = timers.keys().next() == Some(&(expiry, seq));

        (
            Timer {
                state,
                manager: Arc::downgrade(&self.inner),
            },
            at_front,
        )
    }

    /// Time until the earliest timer expires: `None` when no timers are
    /// registered, zero when one is already due.
    pub fn next_timeout(&self) -> Option<Duration> {
        let timers = self.inner.timers.lock().unwrap();
        let (&(expiry, _), _) = timers.iter().next()?;
        let now = clock::now();
        if expiry <= now {
            Some(Duration::ZERO)
        } else {
            Some(Duration::from_micros(expiry - now))
        }
    }

    pub fn is_empty(&self) -> bool {
        self.inner.timers.lock().unwrap().is_empty()
    }

    /// Fires every timer whose expiry is in the past. Recurring timers are
    /// re-armed (at `now + period`) before any callback runs, under the
    /// same lock as the expiry snapshot; the callbacks themselves run
    /// unlocked. Returns the number of callbacks invoked.
    pub fn process_expired(&self) -> usize {
        let now = clock::now();
        let mut expired: Vec<Arc<TimerState>> = Vec::new();
        {
            let mut timers = self.inner.timers.lock().unwrap();
            loop {
                let key = match timers.keys().next() {
                    Some(&key) if key.0 <= now => key,
                    _ => break,
                };
                expired.push(timers.remove(&key).unwrap());
            }
            for state in &expired {
                if state.recurring && state.next.load(Ordering::Acquire) != 0 {
                    let next = now + state.period_us;
                    state.next.store(next, Ordering::Release);
                    timers.insert((next, state.seq), state.clone());
                }
            }
        }

        let mut fired = 0;
        for state in expired {
            // A timer cancelled between the snapshot and this point must
            // not fire.
            if state.recurring {
                if state.next.load(Ordering::Acquire) == 0 {
                    continue;
                }
            } else if state.next.swap(0, Ordering::AcqRel) == 0 {
                continue;
            }

            fired += 1;
            let mut callback = state.callback.lock().unwrap();
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| (&mut **callback)())) {
                let msg = payload
                    .downcast_ref::<&str>()
                    .copied()
                    .or_else(|| payload.downcast_ref::<String>().map(|s| s.as_str()))
                    .unwrap_or("<non-string panic payload>");
                log::error!("timer callback panicked: {}", msg);
            }
        }
        fired
    }
}

impl Default for TimerManager {
    fn default() -> Self {
        Self::new()
    }
}

impl Timer {
    /// Cancels the timer. A cancelled timer never fires again; if its
    /// callback is executing right now, that invocation is unaffected.
    pub fn cancel(&self) {
        let inner = match self.manager.upgrade() {
            Some(inner) => inner,
            None => return,
        };
        let mut timers = inner.timers.lock().unwrap();
        let next = self.state.next.swap(0, Ordering::AcqRel);
        if next != 0 {
            timers.remove(&(next, self.state.seq));
        }
    }
}
