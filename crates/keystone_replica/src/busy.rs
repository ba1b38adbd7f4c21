//! Spin busy-lock guarding replica shutdown.
//!
//! Operations enter before every I/O boundary and hold the guard across the
//! stage; shutdown blocks new entries and spins until in-flight holders
//! drain. The whole state packs into one atomic: the high bit is the
//! blocked flag, the rest counts holders.

use std::sync::atomic::{AtomicU64, Ordering};

const BLOCKED: u64 = 1 << 63;
const COUNT_MASK: u64 = BLOCKED - 1;

#[derive(Debug, Default)]
pub struct BusyLock {
    state: AtomicU64,
}

/// RAII holder token; dropping it leaves the busy section.
#[must_use = "dropping the guard immediately leaves the busy section"]
pub struct BusyGuard<'a> {
    lock: &'a BusyLock,
}

impl BusyLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to enter a busy section; `None` once the lock is blocked.
    pub fn enter(&self) -> Option<BusyGuard<'_>> {
        loop {
            let state = self.state.load(Ordering::Acquire);
            if state & BLOCKED != 0 {
                return None;
            }
            debug_assert!(state & COUNT_MASK < COUNT_MASK);
            if self
                .state
                .compare_exchange_weak(state, state + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Some(BusyGuard { lock: self });
            }
        }
    }

    /// Block new entries and spin until every holder has left.
    pub fn block(&self) {
        self.state.fetch_or(BLOCKED, Ordering::AcqRel);
        while self.state.load(Ordering::Acquire) & COUNT_MASK != 0 {
            std::thread::yield_now();
        }
    }

    pub fn is_blocked(&self) -> bool {
        self.state.load(Ordering::Acquire) & BLOCKED != 0
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        let prev = self.lock.state.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev & COUNT_MASK > 0);
    }
}
