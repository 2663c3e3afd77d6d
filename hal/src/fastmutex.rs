//! Fast mutex.
//!
//! An APC-level-gated lock for critical sections that outlive what a
//! DISPATCH_LEVEL spinlock should protect. The count starts at 1 (free);
//! acquire raises IRQL to APC_LEVEL and swaps the count to 0, release
//! restores the count and lowers. The saved IRQL lives in the mutex itself.
//!
//! Acquisition still spins rather than blocking; the lock is "fast" because
//! contention is expected to be rare and short.

use core::sync::atomic::{AtomicI32, AtomicU8, Ordering};

use crate::irql::{APC_LEVEL, PASSIVE_LEVEL};
use crate::pcr::Pcr;

/// A fast mutex. Count 1 = free, 0 = held.
#[repr(C)]
pub struct FastMutex {
    count: AtomicI32,
    owner_irql: AtomicU8,
}

impl FastMutex {
    /// Create a new, free fast mutex.
    pub const fn new() -> Self {
        Self {
            count: AtomicI32::new(1),
            owner_irql: AtomicU8::new(PASSIVE_LEVEL),
        }
    }

    /// Raise IRQL to APC_LEVEL and spin until the mutex is owned.
    pub fn acquire(&self, pcr: &Pcr) {
        let old_irql = pcr.raise_irql(APC_LEVEL);
        while self
            .count
            .compare_exchange_weak(1, 0, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.count.load(Ordering::Relaxed) != 1 {
                core::hint::spin_loop();
            }
        }
        self.owner_irql.store(old_irql, Ordering::Relaxed);
    }

    /// Release the mutex and lower IRQL to the level saved at acquire.
    pub fn release(&self, pcr: &Pcr) {
        // Read the saved level before the count flips; another core may
        // acquire and overwrite it the moment the mutex is free.
        let old_irql = self.owner_irql.load(Ordering::Relaxed);
        self.count.store(1, Ordering::Release);
        pcr.lower_irql(old_irql);
    }

    /// Single acquisition attempt. On failure the IRQL is lowered back
    /// before returning, so both branches pair the raise symmetrically.
    pub fn try_acquire(&self, pcr: &Pcr) -> bool {
        let old_irql = pcr.raise_irql(APC_LEVEL);
        if self
            .count
            .compare_exchange(1, 0, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            self.owner_irql.store(old_irql, Ordering::Relaxed);
            true
        } else {
            pcr.lower_irql(old_irql);
            false
        }
    }

    /// Whether the mutex is currently held.
    #[inline]
    pub fn is_held(&self) -> bool {
        self.count.load(Ordering::Relaxed) != 1
    }
}

impl Default for FastMutex {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_raises_to_apc_and_release_restores() {
        let pcr = Pcr::new(0);
        let mutex = FastMutex::new();
        mutex.acquire(&pcr);
        assert_eq!(pcr.current_irql(), APC_LEVEL);
        assert!(mutex.is_held());
        mutex.release(&pcr);
        assert_eq!(pcr.current_irql(), PASSIVE_LEVEL);
        assert!(!mutex.is_held());
    }

    #[test]
    fn failed_try_acquire_leaves_no_elevation() {
        let holder = Pcr::new(0);
        let contender = Pcr::new(1);
        let mutex = FastMutex::new();

        mutex.acquire(&holder);
        assert!(!mutex.try_acquire(&contender));
        assert_eq!(contender.current_irql(), PASSIVE_LEVEL);

        mutex.release(&holder);
        assert!(mutex.try_acquire(&contender));
        assert_eq!(contender.current_irql(), APC_LEVEL);
        mutex.release(&contender);
        assert_eq!(contender.current_irql(), PASSIVE_LEVEL);
    }
}
