//! ARM Generic Interrupt Controller (GICv2) driver.
//!
//! The GIC has two register windows:
//! - GICD (Distributor): per-interrupt enable, pending, priority, and
//!   trigger configuration, shared by all cores.
//! - GICC (CPU Interface): per-core priority mask, binary point, and the
//!   acknowledge / end-of-interrupt ports.
//!
//! IRQL-to-priority mapping: the controller treats a *lower* priority byte
//! as *more* urgent, so an IRQL maps onto `(15 - irql) << 4`. The inverse
//! transform recovers the IRQL a vector was enabled at from its priority
//! byte, which is what interrupt delivery uses.
//!
//! Per-interrupt state machine: Disabled → (enable) → Enabled/Idle →
//! (assert + acknowledge) → Active → (EOI) → Enabled/Idle. An ID left
//! Active without an EOI never re-asserts; begin/end must always pair.

use crate::interrupts::InterruptMode;
use crate::irql::{Irql, HIGH_LEVEL};
use crate::pcr::MAX_CPUS;

// Distributor register offsets.

/// Distributor Control Register.
const GICD_CTLR: usize = 0x000;
/// Interrupt Controller Type Register.
const GICD_TYPER: usize = 0x004;
/// Interrupt Set-Enable Registers (1 bit per ID).
const GICD_ISENABLER: usize = 0x100;
/// Interrupt Clear-Enable Registers (1 bit per ID).
const GICD_ICENABLER: usize = 0x180;
/// Interrupt Set-Pending Registers.
const GICD_ISPENDR: usize = 0x200;
/// Interrupt Clear-Pending Registers.
const GICD_ICPENDR: usize = 0x280;
/// Interrupt Priority Registers (8 bits per ID).
const GICD_IPRIORITYR: usize = 0x400;
/// Interrupt Configuration Registers (2 bits per ID).
const GICD_ICFGR: usize = 0xC00;
/// Software Generated Interrupt Register.
const GICD_SGIR: usize = 0xF00;

// CPU interface register offsets.

/// CPU Interface Control Register.
const GICC_CTLR: usize = 0x000;
/// Interrupt Priority Mask Register.
const GICC_PMR: usize = 0x004;
/// Binary Point Register.
const GICC_BPR: usize = 0x008;
/// Interrupt Acknowledge Register.
const GICC_IAR: usize = 0x00C;
/// End of Interrupt Register.
const GICC_EOIR: usize = 0x010;

/// Number of interrupt IDs this HAL manages.
pub const MAX_INTERRUPT_VECTORS: usize = 256;

/// Default priority for interrupts never explicitly enabled.
const DEFAULT_PRIORITY: u8 = 0xA0;
/// Priority mask admitting every priority.
const PRIORITY_ACCEPT_ALL: u8 = 0xFF;

/// Controller priority byte for an IRQL. Lower byte = more urgent.
#[inline]
pub const fn priority_from_irql(irql: Irql) -> u8 {
    (HIGH_LEVEL - irql) << 4
}

/// IRQL a priority byte was derived from. Exact inverse of
/// [`priority_from_irql`] over the 0..=15 range.
#[inline]
pub const fn irql_from_priority(priority: u8) -> Irql {
    HIGH_LEVEL - (priority >> 4)
}

/// GICv2 instance, owning the two register windows.
pub struct Gic {
    dist_base: usize,
    cpu_base: usize,
}

// The register windows are device memory shared by all cores; the
// distributor serializes its own accesses.
unsafe impl Send for Gic {}
unsafe impl Sync for Gic {}

impl Gic {
    /// Create a driver over mapped distributor and CPU-interface windows.
    ///
    /// # Safety
    ///
    /// Both addresses must point at valid, mapped GICv2 register blocks
    /// for the lifetime of the value.
    pub const unsafe fn new(dist_base: usize, cpu_base: usize) -> Self {
        Self { dist_base, cpu_base }
    }

    #[inline]
    fn gicd_read(&self, offset: usize) -> u32 {
        unsafe { core::ptr::read_volatile((self.dist_base + offset) as *const u32) }
    }

    #[inline]
    fn gicd_write(&self, offset: usize, value: u32) {
        unsafe { core::ptr::write_volatile((self.dist_base + offset) as *mut u32, value) }
    }

    #[inline]
    fn gicc_read(&self, offset: usize) -> u32 {
        unsafe { core::ptr::read_volatile((self.cpu_base + offset) as *const u32) }
    }

    #[inline]
    fn gicc_write(&self, offset: usize, value: u32) {
        unsafe { core::ptr::write_volatile((self.cpu_base + offset) as *mut u32, value) }
    }

    /// Number of interrupt lines the distributor implements.
    /// ITLinesNumber encodes (N + 1) * 32.
    fn supported_lines(&self) -> u32 {
        let typer = self.gicd_read(GICD_TYPER);
        ((typer & 0x1F) + 1) * 32
    }

    /// Bring the controller to a known state and enable it.
    ///
    /// Ordering is load-bearing: the distributor is disabled before any
    /// per-ID state is touched, so nothing fires mid-configuration.
    pub fn initialize(&self) {
        self.gicd_write(GICD_CTLR, 0);

        let lines = self.supported_lines();
        let enable_regs = (lines as usize + 31) / 32;
        for i in 0..enable_regs {
            self.gicd_write(GICD_ICENABLER + i * 4, 0xFFFF_FFFF);
        }
        for i in 0..enable_regs {
            self.gicd_write(GICD_ICPENDR + i * 4, 0xFFFF_FFFF);
        }

        // Default every priority byte so an ID enabled behind our back
        // still lands at a sane mid priority.
        let fill = u32::from(DEFAULT_PRIORITY) * 0x0101_0101;
        for i in 0..MAX_INTERRUPT_VECTORS / 4 {
            self.gicd_write(GICD_IPRIORITYR + i * 4, fill);
        }

        dsb_sy();
        self.gicd_write(GICD_CTLR, 1);

        self.gicc_write(GICC_PMR, u32::from(PRIORITY_ACCEPT_ALL));
        self.gicc_write(GICC_BPR, 0);
        self.gicc_write(GICC_CTLR, 1);
        dsb_sy();

        log::info!(
            "gic: distributor and cpu interface enabled, {} interrupt lines",
            lines
        );
    }

    /// Program a vector's priority from its IRQL, configure its trigger
    /// mode, and enable it.
    pub fn enable_interrupt(&self, vector: u32, irql: Irql, mode: InterruptMode) {
        debug_assert!((vector as usize) < MAX_INTERRUPT_VECTORS);
        debug_assert!(irql <= HIGH_LEVEL);

        self.set_priority(vector, priority_from_irql(irql));

        // 2 configuration bits per ID; bit 1 of the pair selects edge.
        let cfg_offset = GICD_ICFGR + (vector as usize / 16) * 4;
        let shift = (vector as usize % 16) * 2;
        let mut cfg = self.gicd_read(cfg_offset);
        cfg &= !(0b11 << shift);
        if mode == InterruptMode::Latched {
            cfg |= 0b10 << shift;
        }
        self.gicd_write(cfg_offset, cfg);

        self.gicd_write(
            GICD_ISENABLER + (vector as usize / 32) * 4,
            1 << (vector % 32),
        );
        dsb_sy();
    }

    /// Disable a vector.
    pub fn disable_interrupt(&self, vector: u32) {
        debug_assert!((vector as usize) < MAX_INTERRUPT_VECTORS);
        self.gicd_write(
            GICD_ICENABLER + (vector as usize / 32) * 4,
            1 << (vector % 32),
        );
        dsb_sy();
    }

    /// Read the acknowledge register. Returns the raw value; the low 10
    /// bits are the interrupt ID, 0x3FF meaning nothing is pending.
    #[inline]
    pub fn acknowledge(&self) -> u32 {
        self.gicc_read(GICC_IAR)
    }

    /// Signal end of interrupt. `acknowledge` must be the raw value the
    /// matching acknowledge read returned.
    #[inline]
    pub fn end_of_interrupt(&self, acknowledge: u32) {
        self.gicc_write(GICC_EOIR, acknowledge);
    }

    /// Priority byte currently programmed for a vector.
    pub fn priority_of(&self, vector: u32) -> u8 {
        let word = self.gicd_read(GICD_IPRIORITYR + (vector as usize / 4) * 4);
        ((word >> ((vector % 4) * 8)) & 0xFF) as u8
    }

    /// IRQL a vector delivers at, recovered from its priority byte.
    #[inline]
    pub fn vector_irql(&self, vector: u32) -> Irql {
        irql_from_priority(self.priority_of(vector))
    }

    fn set_priority(&self, vector: u32, priority: u8) {
        let offset = GICD_IPRIORITYR + (vector as usize / 4) * 4;
        let shift = (vector % 4) * 8;
        let mut word = self.gicd_read(offset);
        word &= !(0xFFu32 << shift);
        word |= u32::from(priority) << shift;
        self.gicd_write(offset, word);
    }

    /// Whether a vector's pending bit is set.
    pub fn is_pending(&self, vector: u32) -> bool {
        let word = self.gicd_read(GICD_ISPENDR + (vector as usize / 32) * 4);
        word & (1 << (vector % 32)) != 0
    }

    /// Set a vector pending in software.
    pub fn set_pending(&self, vector: u32) {
        self.gicd_write(
            GICD_ISPENDR + (vector as usize / 32) * 4,
            1 << (vector % 32),
        );
    }

    /// Send a software generated interrupt (SGIs are IDs 0-15) to one
    /// target core.
    pub fn request_software_interrupt(&self, sgi: u32, target_cpu: u32) {
        if sgi > 15 || target_cpu as usize >= MAX_CPUS {
            log::warn!("gic: rejecting sgi {} to cpu {}", sgi, target_cpu);
            return;
        }
        let target_mask = 1u32 << (16 + target_cpu);
        self.gicd_write(GICD_SGIR, target_mask | sgi);
    }
}

/// Data synchronization barrier; ensures configuration writes have landed
/// before the controller is relied on.
#[cfg(target_arch = "aarch64")]
#[inline]
fn dsb_sy() {
    use aarch64_cpu::asm::barrier;
    barrier::dsb(barrier::SY);
}

#[cfg(not(target_arch = "aarch64"))]
#[inline]
fn dsb_sy() {}

/// Simulated register windows for driving the driver in a host process.
#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    pub(crate) struct TestController {
        _dist: Box<[u32]>,
        _cpu: Box<[u32]>,
        dist_base: usize,
        cpu_base: usize,
    }

    impl TestController {
        pub(crate) fn new() -> Self {
            let mut dist = vec![0u32; 1024].into_boxed_slice();
            let mut cpu = vec![0u32; 64].into_boxed_slice();
            let dist_base = dist.as_mut_ptr() as usize;
            let cpu_base = cpu.as_mut_ptr() as usize;
            Self {
                _dist: dist,
                _cpu: cpu,
                dist_base,
                cpu_base,
            }
        }

        pub(crate) fn gic(&self) -> Gic {
            unsafe { Gic::new(self.dist_base, self.cpu_base) }
        }

        pub(crate) fn dist_word(&self, offset: usize) -> u32 {
            unsafe { core::ptr::read_volatile((self.dist_base + offset) as *const u32) }
        }

        pub(crate) fn cpu_word(&self, offset: usize) -> u32 {
            unsafe { core::ptr::read_volatile((self.cpu_base + offset) as *const u32) }
        }

        /// Plant a value in the acknowledge register, as if the controller
        /// had an interrupt asserted.
        pub(crate) fn seed_acknowledge(&self, value: u32) {
            unsafe { core::ptr::write_volatile((self.cpu_base + GICC_IAR) as *mut u32, value) }
        }

        pub(crate) fn last_eoi(&self) -> u32 {
            self.cpu_word(GICC_EOIR)
        }
    }
}
