//! ARM64 hardware abstraction layer: IRQL-ordered synchronization and
//! GICv2 interrupt delivery.
//!
//! The subsystem is built around one per-core rule: the IRQL (interrupt
//! request level) on a core only ever pairs a raise with a matching lower,
//! and every lock and interrupt path rides that discipline. Spinlocks raise
//! before they spin, interrupts deliver at the level their vector was
//! programmed for, and deferred work drains when the level falls back below
//! DISPATCH_LEVEL.
//!
//! Per-core state lives in an explicit [`pcr::Pcr`] passed by reference, so
//! the whole subsystem can be exercised as a host process with simulated
//! cores and simulated controller registers.

#![cfg_attr(not(test), no_std)]

pub mod bugcheck;
pub mod fastmutex;
pub mod gic;
pub mod interrupts;
pub mod irql;
pub mod pcr;
pub mod platform;
pub mod qspinlock;
pub mod spinlock;
pub mod timer;

pub use bugcheck::{bug_check, BugCheckCode};
pub use fastmutex::FastMutex;
pub use gic::Gic;
pub use interrupts::{
    begin_system_interrupt, disable_system_interrupt, enable_system_interrupt,
    end_system_interrupt, handle_interrupt, register_handler, InterruptMode, ServicedInterrupt,
};
pub use irql::Irql;
pub use pcr::Pcr;
pub use qspinlock::{
    acquire_in_stack_queued_spinlock, acquire_queued_spinlock, release_in_stack_queued_spinlock,
    release_queued_spinlock, LockQueueHandle, LockQueueNumber, QueuedSpinLock,
};
pub use spinlock::SpinLock;
