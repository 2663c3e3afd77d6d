//! Fatal system errors.
//!
//! An IRQL invariant violation is not a recoverable condition: continuing
//! would risk silent corruption of state protected by the IRQL contract.
//! `bug_check` records the stop code and never returns; in a kernel image
//! the panic lands in the panic handler, which halts the machine.

/// Stop codes surfaced by this subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum BugCheckCode {
    /// IRQL lowered to a level above the current one.
    IrqlNotLessOrEqual = 0x0000_000A,
    /// IRQL raised to a level below the current one.
    IrqlNotGreaterOrEqual = 0x0000_0009,
    /// A HAL service was used before its one-time initialization.
    HalInitializationFailed = 0x0000_005C,
}

/// Halt the system with a stop code.
pub fn bug_check(code: BugCheckCode) -> ! {
    log::error!("*** STOP: {:#010x} ({:?})", code as u32, code);
    panic!("bug check {:?} ({:#010x})", code, code as u32);
}
