//! Interrupt Request Level (IRQL) definitions.
//!
//! An IRQL is an ordered priority integer gating which execution contexts
//! may run on a given core. The ARM64 mapping uses a 4-bit range so each
//! level projects onto the upper nibble of a GIC priority byte.

/// IRQL type.
pub type Irql = u8;

/// Passive level, normal thread execution, no interrupt vectors are masked.
pub const PASSIVE_LEVEL: Irql = 0;
/// APC interrupt level.
pub const APC_LEVEL: Irql = 1;
/// Dispatcher level, thread preemption disabled, DPCs run here.
pub const DISPATCH_LEVEL: Irql = 2;
/// First device interrupt level. Device vectors occupy 3..=12.
pub const DEVICE_LEVEL: Irql = 3;
/// Interval clock level.
pub const CLOCK_LEVEL: Irql = 13;
/// Synchronization level, protects data also touched above DISPATCH_LEVEL.
pub const SYNCH_LEVEL: Irql = 13;
/// Interprocessor interrupt level.
pub const IPI_LEVEL: Irql = 14;
/// Highest interrupt level, everything masked.
pub const HIGH_LEVEL: Irql = 15;
