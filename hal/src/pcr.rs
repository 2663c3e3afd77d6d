//! Per-processor control region.
//!
//! Every logical processor owns one `Pcr` holding the state the rest of the
//! subsystem consults and mutates: the current IRQL, the stack of interrupt
//! IDs being serviced, the DPC-pending flag, and the queue nodes used by
//! numbered queued spinlocks.
//!
//! The region is an explicit context structure passed by reference, so a
//! test process can drive several simulated cores side by side. On real
//! aarch64 hardware the current processor's region is also reachable
//! through `TPIDR_EL1`, the same way the per-CPU base is carried on that
//! architecture.
//!
//! IRQL discipline: the level only moves through `raise_irql`/`lower_irql`,
//! and only the owning core mutates it. Raising below the current level, or
//! lowering above it, is a fatal logic error.

use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, AtomicUsize, Ordering};

use conquer_once::spin::OnceCell;

use crate::bugcheck::{bug_check, BugCheckCode};
use crate::irql::{Irql, DISPATCH_LEVEL, PASSIVE_LEVEL};
use crate::qspinlock::{LockQueue, LockQueueNumber, LOCK_QUEUE_COUNT};

/// Maximum number of logical processors.
pub const MAX_CPUS: usize = 8;

/// Maximum interrupt nesting depth. One slot per IRQL covers the worst
/// case of a strictly-ascending interrupt stack.
const MAX_INTERRUPT_NESTING: usize = 16;

/// Routine invoked at DISPATCH_LEVEL to drain queued deferred procedure
/// calls. The queue itself lives outside this subsystem.
pub type DpcRetireRoutine = fn(&Pcr);

static DPC_RETIRE_ROUTINE: OnceCell<DpcRetireRoutine> = OnceCell::uninit();

/// Register the kernel's DPC retire routine. Only the first registration
/// takes effect.
pub fn register_dpc_retire_routine(routine: DpcRetireRoutine) {
    let _ = DPC_RETIRE_ROUTINE.try_init_once(|| routine);
}

/// Per-processor control region.
#[repr(C, align(64))]
pub struct Pcr {
    /// Processor number, fixed at bring-up.
    number: u32,
    /// Current IRQL. Mutated only by the owning core.
    irql: AtomicU8,
    /// Deferred work is pending for this core.
    dpc_pending: AtomicBool,
    /// LIFO of raw acknowledge values for interrupts being serviced.
    in_service: [AtomicU32; MAX_INTERRUPT_NESTING],
    /// Depth of `in_service`.
    in_service_depth: AtomicUsize,
    /// Queue nodes for the numbered queued spinlocks.
    lock_queues: [LockQueue; LOCK_QUEUE_COUNT],
}

impl Pcr {
    /// Create the control region for one processor, idle at PASSIVE_LEVEL.
    pub const fn new(number: u32) -> Self {
        Self {
            number,
            irql: AtomicU8::new(PASSIVE_LEVEL),
            dpc_pending: AtomicBool::new(false),
            in_service: [const { AtomicU32::new(0) }; MAX_INTERRUPT_NESTING],
            in_service_depth: AtomicUsize::new(0),
            lock_queues: [const { LockQueue::new() }; LOCK_QUEUE_COUNT],
        }
    }

    /// Processor number this region belongs to.
    #[inline]
    pub fn processor_number(&self) -> u32 {
        self.number
    }

    /// Current IRQL of this processor. Pure read.
    #[inline]
    pub fn current_irql(&self) -> Irql {
        self.irql.load(Ordering::Acquire)
    }

    /// Raise the IRQL and return the prior level.
    ///
    /// Raising to a level below the current one indicates a logic error
    /// that could invert priorities; the system is halted.
    #[inline]
    pub fn raise_irql(&self, new_irql: Irql) -> Irql {
        let old_irql = self.irql.load(Ordering::Acquire);
        if new_irql < old_irql {
            bug_check(BugCheckCode::IrqlNotGreaterOrEqual);
        }
        self.irql.store(new_irql, Ordering::Release);
        old_irql
    }

    /// Lower the IRQL to the value returned by the matching raise.
    ///
    /// Lowering to a level above the current one is fatal. When the level
    /// drops below DISPATCH_LEVEL with deferred work pending, the
    /// registered retire routine runs at DISPATCH_LEVEL before the final
    /// level is adopted.
    #[inline]
    pub fn lower_irql(&self, new_irql: Irql) {
        let current = self.irql.load(Ordering::Acquire);
        if new_irql > current {
            bug_check(BugCheckCode::IrqlNotLessOrEqual);
        }
        if current >= DISPATCH_LEVEL && new_irql < DISPATCH_LEVEL {
            if let Ok(retire) = DPC_RETIRE_ROUTINE.try_get() {
                if self.dpc_pending.swap(false, Ordering::AcqRel) {
                    self.irql.store(DISPATCH_LEVEL, Ordering::Release);
                    retire(self);
                }
            }
        }
        self.irql.store(new_irql, Ordering::Release);
    }

    /// Mark this core as having deferred work queued.
    #[inline]
    pub fn set_dpc_pending(&self) {
        self.dpc_pending.store(true, Ordering::Release);
    }

    /// True while an interrupt acknowledged on this core awaits its EOI.
    #[inline]
    pub fn in_interrupt(&self) -> bool {
        self.in_service_depth.load(Ordering::Relaxed) > 0
    }

    /// Record an acknowledged interrupt. The raw acknowledge value is kept
    /// so the matching EOI carries exactly the ID the controller handed
    /// out, including the source-CPU bits of a software interrupt.
    pub(crate) fn push_in_service(&self, acknowledge: u32) {
        let depth = self.in_service_depth.load(Ordering::Relaxed);
        debug_assert!(depth < MAX_INTERRUPT_NESTING, "interrupt nesting overflow");
        if depth < MAX_INTERRUPT_NESTING {
            self.in_service[depth].store(acknowledge, Ordering::Relaxed);
            self.in_service_depth.store(depth + 1, Ordering::Relaxed);
        }
    }

    /// Pop the most recently acknowledged interrupt, if any.
    pub(crate) fn pop_in_service(&self) -> Option<u32> {
        let depth = self.in_service_depth.load(Ordering::Relaxed);
        if depth == 0 {
            return None;
        }
        self.in_service_depth.store(depth - 1, Ordering::Relaxed);
        Some(self.in_service[depth - 1].load(Ordering::Relaxed))
    }

    /// Queue node owned by this processor for a numbered queued spinlock.
    pub(crate) fn lock_queue(&self, number: LockQueueNumber) -> &LockQueue {
        &self.lock_queues[number as usize]
    }
}

/// Publish `pcr` as the current processor's control region.
///
/// # Safety
///
/// Must run once per core during bring-up, before anything reads
/// [`current`] on that core.
#[cfg(target_arch = "aarch64")]
pub unsafe fn set_current(pcr: &'static Pcr) {
    core::arch::asm!(
        "msr tpidr_el1, {}",
        in(reg) pcr as *const Pcr as u64,
        options(nomem, nostack)
    );
}

/// Control region of the calling processor. Valid only after
/// [`set_current`] ran on this core.
#[cfg(target_arch = "aarch64")]
pub fn current() -> &'static Pcr {
    let base: u64;
    unsafe {
        core::arch::asm!("mrs {}, tpidr_el1", out(reg) base, options(nomem, nostack));
        &*(base as *const Pcr)
    }
}
