//! End-to-end interrupt and synchronization flows over simulated GICv2
//! register windows.

use hal::gic::Gic;
use hal::interrupts::{
    begin_system_interrupt, disable_system_interrupt, enable_system_interrupt,
    end_system_interrupt, handle_interrupt, register_handler, InterruptMode,
};
use hal::irql::{DISPATCH_LEVEL, PASSIVE_LEVEL, SYNCH_LEVEL};
use hal::pcr::Pcr;
use hal::spinlock::SpinLock;

const GICD_CTLR: usize = 0x000;
const GICD_ISENABLER: usize = 0x100;
const GICD_ICENABLER: usize = 0x180;
const GICD_IPRIORITYR: usize = 0x400;
const GICC_CTLR: usize = 0x000;
const GICC_PMR: usize = 0x004;
const GICC_IAR: usize = 0x00C;
const GICC_EOIR: usize = 0x010;

/// Word buffers standing in for the distributor and CPU interface.
struct FakeController {
    _dist: Box<[u32]>,
    _cpu: Box<[u32]>,
    dist_base: usize,
    cpu_base: usize,
}

impl FakeController {
    fn new() -> Self {
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

    fn gic(&self) -> Gic {
        unsafe { Gic::new(self.dist_base, self.cpu_base) }
    }

    fn dist_word(&self, offset: usize) -> u32 {
        unsafe { std::ptr::read_volatile((self.dist_base + offset) as *const u32) }
    }

    fn cpu_word(&self, offset: usize) -> u32 {
        unsafe { std::ptr::read_volatile((self.cpu_base + offset) as *const u32) }
    }

    /// Make the next acknowledge read return `value`.
    fn assert_line(&self, value: u32) {
        unsafe { std::ptr::write_volatile((self.cpu_base + GICC_IAR) as *mut u32, value) }
    }

    fn last_eoi(&self) -> u32 {
        self.cpu_word(GICC_EOIR)
    }
}

#[test]
fn bring_up_leaves_controller_enabled_and_unmasked() {
    let fake = FakeController::new();
    let gic = fake.gic();
    gic.initialize();

    assert_eq!(fake.dist_word(GICD_CTLR), 1);
    assert_eq!(fake.cpu_word(GICC_CTLR), 1);
    assert_eq!(fake.cpu_word(GICC_PMR), 0xFF);
    // No lines enabled yet.
    assert_eq!(fake.dist_word(GICD_ISENABLER), 0);
}

#[test]
fn device_interrupt_full_cycle_eoi_matches_acknowledge() {
    let fake = FakeController::new();
    let gic = fake.gic();
    let pcr = Pcr::new(6);
    gic.initialize();

    enable_system_interrupt(&gic, 33, 12, InterruptMode::Latched);
    // Priority byte for IRQL 12 is (15 - 12) << 4.
    let word = fake.dist_word(GICD_IPRIORITYR + (33 / 4) * 4);
    assert_eq!((word >> ((33 % 4) * 8)) & 0xFF, 0x30);

    fake.assert_line(33);
    let serviced = begin_system_interrupt(&gic, &pcr).expect("interrupt pending");
    assert_eq!(serviced.vector, 33);
    assert_eq!(pcr.current_irql(), 12);

    end_system_interrupt(&gic, &pcr, serviced);
    assert_eq!(fake.last_eoi(), 33);
    assert_eq!(pcr.current_irql(), PASSIVE_LEVEL);

    disable_system_interrupt(&gic, 33);
    assert_eq!(fake.dist_word(GICD_ICENABLER + 4), 1 << 1);
}

#[test]
fn spurious_acknowledge_is_a_no_op() {
    let fake = FakeController::new();
    let gic = fake.gic();
    let pcr = Pcr::new(6);

    fake.assert_line(0x3FF);
    assert!(begin_system_interrupt(&gic, &pcr).is_none());
    assert_eq!(pcr.current_irql(), PASSIVE_LEVEL);
    assert_eq!(fake.last_eoi(), 0);
}

#[test]
fn synch_level_lock_excludes_interrupt_level_contenders() {
    // A SYNCH_LEVEL acquisition must sit at the top of the device range so
    // device interrupt delivery on the same core cannot preempt the
    // critical section.
    let pcr = Pcr::new(6);
    let lock = SpinLock::new();

    let old = lock.acquire_raise_to_synch(&pcr);
    assert_eq!(pcr.current_irql(), SYNCH_LEVEL);
    assert_eq!(SYNCH_LEVEL, 13);
    lock.release(&pcr, old);
    assert_eq!(pcr.current_irql(), PASSIVE_LEVEL);
}

#[test]
fn handler_runs_between_begin_and_end() {
    use std::sync::atomic::{AtomicU32, Ordering};
    static SEEN: AtomicU32 = AtomicU32::new(0);

    fn device_handler(pcr: &Pcr, vector: u32) {
        assert!(pcr.current_irql() >= DISPATCH_LEVEL);
        SEEN.store(vector, Ordering::SeqCst);
    }

    let fake = FakeController::new();
    let gic = fake.gic();
    let pcr = Pcr::new(6);
    gic.initialize();

    enable_system_interrupt(&gic, 44, 4, InterruptMode::LevelSensitive);
    register_handler(44, device_handler);

    fake.assert_line(44);
    assert_eq!(handle_interrupt(&gic, &pcr), Some(44));
    assert_eq!(SEEN.load(Ordering::SeqCst), 44);
    assert_eq!(fake.last_eoi(), 44);
    assert_eq!(pcr.current_irql(), PASSIVE_LEVEL);
}
