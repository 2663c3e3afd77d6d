//! Virtual timer clock source.
//!
//! The per-core virtual timer (PPI 27) drives the clock tick. Each tick
//! runs at CLOCK_LEVEL, counts up, marks deferred work pending, and re-arms
//! the compare register one interval ahead. The line is level-sensitive:
//! the timer holds it asserted until the compare register moves past the
//! counter, so re-arming inside the handler is what deasserts it.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::gic::Gic;
use crate::interrupts::{enable_system_interrupt, register_handler, InterruptMode};
use crate::irql::CLOCK_LEVEL;
use crate::pcr::Pcr;

/// Interrupt ID of the per-core virtual timer.
pub const TIMER_VECTOR: u32 = 27;

/// Clock tick rate.
pub const TIMER_HZ: u64 = 200;

/// Counter frequency assumed when the hardware register is unavailable.
const FALLBACK_COUNTER_HZ: u64 = 62_500_000;

static TICKS: AtomicU64 = AtomicU64::new(0);

/// Ticks elapsed since the timer was started.
#[inline]
pub fn tick_count() -> u64 {
    TICKS.load(Ordering::Relaxed)
}

/// Milliseconds elapsed since the timer was started.
#[inline]
pub fn uptime_ms() -> u64 {
    tick_count() * (1000 / TIMER_HZ)
}

#[cfg(target_arch = "aarch64")]
mod hw {
    pub fn counter_frequency() -> u64 {
        let freq: u64;
        unsafe {
            core::arch::asm!("mrs {}, cntfrq_el0", out(reg) freq, options(nomem, nostack));
        }
        freq
    }

    pub fn arm(interval: u64) {
        unsafe {
            core::arch::asm!(
                "msr cntv_tval_el0, {interval}",
                // ENABLE set, IMASK clear.
                "msr cntv_ctl_el0, {ctl}",
                interval = in(reg) interval,
                ctl = in(reg) 1u64,
                options(nomem, nostack)
            );
        }
    }
}

#[cfg(not(target_arch = "aarch64"))]
mod hw {
    use core::sync::atomic::{AtomicU64, Ordering};

    pub(super) static LAST_INTERVAL: AtomicU64 = AtomicU64::new(0);

    pub fn counter_frequency() -> u64 {
        super::FALLBACK_COUNTER_HZ
    }

    pub fn arm(interval: u64) {
        LAST_INTERVAL.store(interval, Ordering::Relaxed);
    }
}

/// Counter increments per tick at the current frequency.
fn tick_interval() -> u64 {
    let freq = hw::counter_frequency();
    if freq == 0 {
        FALLBACK_COUNTER_HZ / TIMER_HZ
    } else {
        freq / TIMER_HZ
    }
}

/// Clock tick handler. Runs at CLOCK_LEVEL.
fn timer_tick(pcr: &Pcr, _vector: u32) {
    TICKS.fetch_add(1, Ordering::Relaxed);
    // Expired-timer and quantum work runs later, at DISPATCH_LEVEL.
    pcr.set_dpc_pending();
    hw::arm(tick_interval());
}

/// Register the tick handler, enable the timer line at CLOCK_LEVEL, and
/// arm the first interval.
pub fn start(gic: &Gic) {
    register_handler(TIMER_VECTOR, timer_tick);
    enable_system_interrupt(gic, TIMER_VECTOR, CLOCK_LEVEL, InterruptMode::LevelSensitive);
    hw::arm(tick_interval());
    log::info!(
        "timer: vector {} armed at {} Hz (counter {} Hz)",
        TIMER_VECTOR,
        TIMER_HZ,
        hw::counter_frequency()
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gic::testing::TestController;
    use crate::interrupts::handle_interrupt;
    use crate::irql::PASSIVE_LEVEL;

    #[test]
    fn tick_counts_and_marks_deferred_work() {
        let tc = TestController::new();
        let gic = tc.gic();
        let pcr = Pcr::new(5);
        gic.initialize();
        start(&gic);

        assert_eq!(gic.vector_irql(TIMER_VECTOR), CLOCK_LEVEL);
        let armed = hw::LAST_INTERVAL.load(Ordering::Relaxed);
        assert_eq!(armed, FALLBACK_COUNTER_HZ / TIMER_HZ);

        let before = tick_count();
        tc.seed_acknowledge(TIMER_VECTOR);
        assert_eq!(handle_interrupt(&gic, &pcr), Some(TIMER_VECTOR));
        assert_eq!(tick_count(), before + 1);
        assert_eq!(tc.last_eoi(), TIMER_VECTOR);
        assert_eq!(pcr.current_irql(), PASSIVE_LEVEL);
    }
}
