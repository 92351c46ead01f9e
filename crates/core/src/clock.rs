//! Output timeline and cancellable pacing waits.
//!
//! All block times (`pts`, `dts`) are microseconds on a [`Clock`]'s
//! timeline. The send thread of every RTP session waits for each packet's
//! release time through [`Clock::wait_until`], which returns early when the
//! session is destroyed.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, TryRecvError};

/// Monotonic microsecond clock with a cancellable deadline wait.
pub trait Clock: Send + Sync {
    /// Current time in microseconds.
    fn now(&self) -> i64;

    /// Block until `deadline` or until `cancel` fires.
    ///
    /// `cancel` fires when it receives a message or when every sender is
    /// dropped. Returns `false` if the wait was cancelled.
    fn wait_until(&self, deadline: i64, cancel: &Receiver<()>) -> bool;
}

/// Wall-clock pacing backed by [`Instant`].
///
/// Time zero is the moment the clock was created.
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> i64 {
        self.origin.elapsed().as_micros() as i64
    }

    fn wait_until(&self, deadline: i64, cancel: &Receiver<()>) -> bool {
        let at = self.origin + Duration::from_micros(deadline.max(0) as u64);
        if at <= Instant::now() {
            return matches!(cancel.try_recv(), Err(TryRecvError::Empty));
        }
        matches!(cancel.recv_deadline(at), Err(RecvTimeoutError::Timeout))
    }
}

/// Clock that only moves when told to. Waits never sleep.
///
/// Used by tests so pacing is deterministic.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(start: i64) -> Self {
        Self {
            now: AtomicI64::new(start),
        }
    }

    pub fn set(&self, now: i64) {
        self.now.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, micros: i64) {
        self.now.fetch_add(micros, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }

    fn wait_until(&self, _deadline: i64, cancel: &Receiver<()>) -> bool {
        matches!(cancel.try_recv(), Err(TryRecvError::Empty))
    }
}
