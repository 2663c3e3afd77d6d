//! Kernel spinlock.
//!
//! A spinlock is a single word, free or held, acquired with an atomic
//! compare-exchange and released with a plain store-release. Acquisition
//! raises the IRQL first: the raise excludes every context on the same core
//! that could contend at or below the new level, and the compare-exchange
//! excludes the other cores. Dropping either half reintroduces a race.
//!
//! Callers hold these locks only for short, bounded critical sections; a
//! busy lock spins the physical core, it never blocks on a wait object.

use core::sync::atomic::{AtomicBool, Ordering};

use crate::irql::{Irql, DISPATCH_LEVEL, SYNCH_LEVEL};
use crate::pcr::Pcr;

/// A spinlock word. Free when `false`, held when `true`.
#[repr(C)]
pub struct SpinLock {
    locked: AtomicBool,
}

impl SpinLock {
    /// Create a new, free spinlock.
    pub const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
        }
    }

    /// Raise IRQL to DISPATCH_LEVEL and spin until the lock is taken.
    ///
    /// Returns the pre-raise IRQL; the caller hands it back to
    /// [`release`](Self::release).
    #[inline]
    pub fn acquire(&self, pcr: &Pcr) -> Irql {
        let old_irql = pcr.raise_irql(DISPATCH_LEVEL);
        self.acquire_at_dpc_level();
        old_irql
    }

    /// Like [`acquire`](Self::acquire), but raises to SYNCH_LEVEL. Used when
    /// the protected data is also touched by interrupt code running above
    /// DISPATCH_LEVEL.
    #[inline]
    pub fn acquire_raise_to_synch(&self, pcr: &Pcr) -> Irql {
        let old_irql = pcr.raise_irql(SYNCH_LEVEL);
        self.acquire_at_dpc_level();
        old_irql
    }

    /// Release the lock, then lower IRQL to `old_irql`.
    ///
    /// The lock word must be reset before the IRQL drops; the reverse order
    /// would let a lower-priority waiter run while the releasing core still
    /// owns the critical section.
    #[inline]
    pub fn release(&self, pcr: &Pcr, old_irql: Irql) {
        self.release_from_dpc_level();
        pcr.lower_irql(old_irql);
    }

    /// Spin for the lock without touching the IRQL. The caller is already
    /// at or above DISPATCH_LEVEL.
    #[inline]
    pub fn acquire_at_dpc_level(&self) {
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            // Spin on a plain load so contended acquires do not hammer the
            // cache line with write attempts.
            while self.locked.load(Ordering::Relaxed) {
                core::hint::spin_loop();
            }
        }
    }

    /// Release the lock without touching the IRQL.
    #[inline]
    pub fn release_from_dpc_level(&self) {
        self.locked.store(false, Ordering::Release);
    }

    /// Single acquisition attempt, no spin, no IRQL change.
    #[inline]
    pub fn try_acquire_at_dpc_level(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Whether the lock is currently held.
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }
}

impl Default for SpinLock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::irql::PASSIVE_LEVEL;
    use core::cell::UnsafeCell;

    struct RacyCounter(UnsafeCell<u64>);

    // Writes are guarded by the spinlock under test.
    unsafe impl Sync for RacyCounter {}

    #[test]
    fn acquire_raises_to_dispatch_and_release_restores() {
        let pcr = Pcr::new(0);
        let lock = SpinLock::new();
        let old = lock.acquire(&pcr);
        assert_eq!(old, PASSIVE_LEVEL);
        assert_eq!(pcr.current_irql(), DISPATCH_LEVEL);
        assert!(lock.is_locked());
        lock.release(&pcr, old);
        assert_eq!(pcr.current_irql(), PASSIVE_LEVEL);
        assert!(!lock.is_locked());
    }

    #[test]
    fn acquire_raise_to_synch_uses_synch_level() {
        let pcr = Pcr::new(0);
        let lock = SpinLock::new();
        let old = lock.acquire_raise_to_synch(&pcr);
        assert_eq!(old, PASSIVE_LEVEL);
        assert_eq!(pcr.current_irql(), SYNCH_LEVEL);
        lock.release(&pcr, old);
        assert_eq!(pcr.current_irql(), PASSIVE_LEVEL);
    }

    #[test]
    fn try_acquire_fails_while_held() {
        let lock = SpinLock::new();
        assert!(lock.try_acquire_at_dpc_level());
        assert!(!lock.try_acquire_at_dpc_level());
        lock.release_from_dpc_level();
        assert!(lock.try_acquire_at_dpc_level());
        lock.release_from_dpc_level();
    }

    #[test]
    fn contended_increments_never_lose_updates() {
        const THREADS: u32 = 4;
        const ITERATIONS: u64 = 10_000;

        let lock = SpinLock::new();
        let counter = RacyCounter(UnsafeCell::new(0));
        let pcrs: Vec<Pcr> = (0..THREADS).map(Pcr::new).collect();

        std::thread::scope(|s| {
            for pcr in &pcrs {
                let lock = &lock;
                let counter = &counter;
                s.spawn(move || {
                    for _ in 0..ITERATIONS {
                        let old = lock.acquire(pcr);
                        unsafe { *counter.0.get() += 1 };
                        lock.release(pcr, old);
                    }
                });
            }
        });

        assert_eq!(unsafe { *counter.0.get() }, u64::from(THREADS) * ITERATIONS);
    }
}
