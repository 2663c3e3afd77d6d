//! Platform wiring for the QEMU virt machine.
//!
//! Holds the board's controller addresses and the process-wide GIC
//! instance. The instance is installed once during bring-up; consumers that
//! run before installation hit a fatal initialization bug check, because no
//! interrupt path can work without the controller.

use conquer_once::spin::OnceCell;

use crate::bugcheck::{bug_check, BugCheckCode};
use crate::gic::Gic;
use crate::timer;

/// GIC distributor base on the QEMU virt board.
pub const QEMU_VIRT_GICD_BASE: usize = 0x0800_0000;
/// GIC CPU interface base on the QEMU virt board.
pub const QEMU_VIRT_GICC_BASE: usize = 0x0801_0000;

static GIC: OnceCell<Gic> = OnceCell::uninit();

/// Install the controller for the given register windows and bring it up.
/// Later calls are ignored.
///
/// # Safety
///
/// The addresses must point at mapped GICv2 register blocks, and must stay
/// valid for the rest of the process lifetime.
pub unsafe fn install_gic(dist_base: usize, cpu_base: usize) {
    let installed = GIC.try_init_once(|| Gic::new(dist_base, cpu_base)).is_ok();
    if installed {
        gic().initialize();
    } else {
        log::warn!("platform: gic already installed, ignoring reinstall");
    }
}

/// Install the controller at the QEMU virt addresses and start the clock.
///
/// # Safety
///
/// The virt MMIO ranges must be identity-mapped (or mapped at these
/// virtual addresses) before this runs.
pub unsafe fn init(processor_count: u32) {
    install_gic(QEMU_VIRT_GICD_BASE, QEMU_VIRT_GICC_BASE);
    timer::start(gic());
    log::info!("platform: interrupt subsystem up, {} cpus", processor_count);
}

/// The installed controller, if bring-up has run.
pub fn try_gic() -> Option<&'static Gic> {
    GIC.get()
}

/// The installed controller. Fatal if bring-up has not run.
pub fn gic() -> &'static Gic {
    match GIC.get() {
        Some(gic) => gic,
        None => bug_check(BugCheckCode::HalInitializationFailed),
    }
}
