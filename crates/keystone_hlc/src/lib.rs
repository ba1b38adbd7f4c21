//! Hybrid logical clock and safe-time tracking for Keystone replication groups.
//!
//! A [`HybridTimestamp`] combines a coarse physical component (milliseconds
//! since the Unix epoch, 48 bits) with a logical counter (16 bits) so that
//! timestamps taken on one node are totally ordered even when the wall clock
//! stalls. [`HybridClock`] hands them out monotonically; [`SafeTimeTracker`]
//! is the per-partition watermark readers wait on before serving a snapshot.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Number of bits reserved for the logical counter in the packed form.
pub const LOGICAL_BITS: u32 = 16;

const LOGICAL_MASK: u64 = (1 << LOGICAL_BITS) - 1;

/// A hybrid logical timestamp: `(physical millis, logical counter)`.
///
/// The packed `u64` form (`as_u64`/`from_u64`) keeps the total order of the
/// pair and is what replicated commands and transaction ids carry on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct HybridTimestamp {
    physical: u64,
    logical: u32,
}

impl HybridTimestamp {
    /// The smallest representable timestamp.
    pub const MIN: HybridTimestamp = HybridTimestamp {
        physical: 0,
        logical: 0,
    };

    /// The largest representable timestamp; used for latest-visible reads.
    pub const MAX: HybridTimestamp = HybridTimestamp {
        physical: (1 << (64 - LOGICAL_BITS)) - 1,
        logical: LOGICAL_MASK as u32,
    };

    pub fn new(physical: u64, logical: u32) -> Self {
        debug_assert!(physical < (1 << (64 - LOGICAL_BITS)));
        debug_assert!(u64::from(logical) <= LOGICAL_MASK);
        Self { physical, logical }
    }

    /// Physical component in milliseconds since the Unix epoch.
    pub fn physical(&self) -> u64 {
        self.physical
    }

    /// Logical tie-breaker within one physical millisecond.
    pub fn logical(&self) -> u32 {
        self.logical
    }

    /// Pack into a single order-preserving `u64`.
    pub fn as_u64(&self) -> u64 {
        (self.physical << LOGICAL_BITS) | u64::from(self.logical)
    }

    /// Inverse of [`HybridTimestamp::as_u64`].
    pub fn from_u64(packed: u64) -> Self {
        Self {
            physical: packed >> LOGICAL_BITS,
            logical: (packed & LOGICAL_MASK) as u32,
        }
    }

    /// The immediate successor in the total order.
    pub fn tick(&self) -> Self {
        Self::from_u64(self.as_u64().saturating_add(1))
    }
}

impl fmt::Display for HybridTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.physical, self.logical)
    }
}

/// Monotone hybrid clock.
///
/// `now()` returns `max(wall_clock, last + 1)`, so successive calls are
/// strictly increasing on one node regardless of wall-clock behavior. The
/// packed last-issued value lives in a single atomic; readers race through a
/// CAS loop instead of a mutex.
#[derive(Debug, Default)]
pub struct HybridClock {
    last: AtomicU64,
}

impl HybridClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current physical time in milliseconds since the Unix epoch.
    fn physical_now() -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis().min(u128::from(u64::MAX)) as u64)
            .unwrap_or(0)
    }

    /// Take a fresh, strictly increasing timestamp.
    pub fn now(&self) -> HybridTimestamp {
        let wall = Self::physical_now() << LOGICAL_BITS;

        loop {
            let last = self.last.load(Ordering::Acquire);
            let next = wall.max(last.saturating_add(1));

            if self
                .last
                .compare_exchange_weak(last, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return HybridTimestamp::from_u64(next);
            }
        }
    }

    /// Fold a timestamp observed from another node into the clock so that
    /// subsequent `now()` calls are ordered after it.
    pub fn observe(&self, remote: HybridTimestamp) {
        let observed = remote.as_u64();

        loop {
            let last = self.last.load(Ordering::Acquire);
            if observed <= last {
                return;
            }
            if self
                .last
                .compare_exchange_weak(last, observed, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
        }
    }
}

/// Monotone per-partition safe-time watermark with async waiters.
///
/// Replication advances the watermark; snapshot readers park in `wait_for`
/// until it reaches their read timestamp. Advancing never moves backwards:
/// a stale advance is silently ignored.
#[derive(Debug)]
pub struct SafeTimeTracker {
    tx: watch::Sender<HybridTimestamp>,
}

impl Default for SafeTimeTracker {
    fn default() -> Self {
        Self::new(HybridTimestamp::MIN)
    }
}

impl SafeTimeTracker {
    pub fn new(initial: HybridTimestamp) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    /// Current watermark value.
    pub fn current(&self) -> HybridTimestamp {
        *self.tx.borrow()
    }

    /// Advance the watermark to `ts` if it is ahead of the current value.
    pub fn advance(&self, ts: HybridTimestamp) {
        self.tx.send_if_modified(|cur| {
            if ts > *cur {
                *cur = ts;
                true
            } else {
                false
            }
        });
    }

    /// Wait until the watermark reaches `ts`.
    pub async fn wait_for(&self, ts: HybridTimestamp) {
        let mut rx = self.tx.subscribe();
        // wait_for returns immediately when the predicate already holds; the
        // sender half lives as long as this tracker, so the only error case
        // is a dropped tracker, which means a stopped replica.
        let _ = rx.wait_for(|cur| *cur >= ts).await;
    }
}
