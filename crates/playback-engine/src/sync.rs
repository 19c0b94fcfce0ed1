//! Small synchronization helpers shared by decoders and the engine.

use std::sync::{
    Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
};
use std::time::Duration;

pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn read<T>(l: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    l.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write<T>(l: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    l.write().unwrap_or_else(PoisonError::into_inner)
}

/// One-shot flag that interrupts timed sleeps.
#[derive(Default)]
pub(crate) struct Signal {
    raised: Mutex<bool>,
    cv: Condvar,
}

impl Signal {
    pub(crate) fn raise(&self) {
        *lock(&self.raised) = true;
        self.cv.notify_all();
    }

    #[cfg(test)]
    pub(crate) fn is_raised(&self) -> bool {
        *lock(&self.raised)
    }

    /// Sleep for `timeout` unless raised. Returns `true` if the signal was raised.
    pub(crate) fn wait_timeout(&self, timeout: Duration) -> bool {
        let g = lock(&self.raised);
        let (g, _) = self
            .cv
            .wait_timeout_while(g, timeout, |raised| !*raised)
            .unwrap_or_else(PoisonError::into_inner);
        *g
    }
}

/// Caps how many decoders may be open (or opening) at once.
///
/// A decoder takes a permit before probing its source and holds it until close.
pub(crate) struct OpenGate {
    active: Mutex<usize>,
    cv: Condvar,
    limit: usize,
}

pub(crate) struct OpenPermit {
    gate: Arc<OpenGate>,
}

impl OpenGate {
    pub(crate) fn new(limit: usize) -> Arc<Self> {
        Arc::new(Self {
            active: Mutex::new(0),
            cv: Condvar::new(),
            limit: limit.max(1),
        })
    }

    /// Wait for a free slot. Gives up (returning `None`) once `cancelled` is true.
    pub(crate) fn acquire(self: &Arc<Self>, cancelled: &dyn Fn() -> bool) -> Option<OpenPermit> {
        let mut active = lock(&self.active);
        loop {
            if cancelled() {
                return None;
            }
            if *active < self.limit {
                *active += 1;
                return Some(OpenPermit { gate: self.clone() });
            }
            let (next, _) = self
                .cv
                .wait_timeout(active, Duration::from_millis(100))
                .unwrap_or_else(PoisonError::into_inner);
            active = next;
        }
    }

    /// Wake every waiter so it can re-check its cancellation predicate.
    pub(crate) fn interrupt(&self) {
        self.cv.notify_all();
    }

    #[cfg(test)]
    pub(crate) fn active(&self) -> usize {
        *lock(&self.active)
    }
}

impl Drop for OpenPermit {
    fn drop(&mut self) {
        let mut active = lock(&self.gate.active);
        *active = active.saturating_sub(1);
        drop(active);
        self.gate.cv.notify_one();
    }
}
