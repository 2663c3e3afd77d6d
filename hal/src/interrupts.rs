//! Interrupt delivery.
//!
//! Connects the trap layer to the controller: a trap handler calls
//! [`handle_interrupt`], which acknowledges the controller, raises the IRQL
//! to the level the vector was enabled at, dispatches the registered
//! handler, and unwinds with an end-of-interrupt plus an IRQL restore.
//!
//! Every acknowledged interrupt leaves exactly one acknowledge value on the
//! servicing core's in-service stack; `end_system_interrupt` consumes it so
//! the EOI write carries the exact value the controller handed out, even
//! across nested interrupts.

use spin::RwLock;

use crate::gic::{Gic, MAX_INTERRUPT_VECTORS};
use crate::irql::Irql;
use crate::pcr::Pcr;

/// Interrupt ID mask of a raw acknowledge value. The remaining bits carry
/// the source CPU of a software generated interrupt.
const ACKNOWLEDGE_ID_MASK: u32 = 0x3FF;

/// Acknowledge value meaning no interrupt was pending.
pub const SPURIOUS_INTERRUPT: u32 = 0x3FF;

/// Trigger mode of an interrupt line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptMode {
    /// Level-sensitive: asserted while the device holds the line.
    LevelSensitive,
    /// Edge-triggered: latched on assertion.
    Latched,
}

/// An interrupt accepted by [`begin_system_interrupt`], to be closed with
/// [`end_system_interrupt`].
#[derive(Debug, Clone, Copy)]
pub struct ServicedInterrupt {
    /// Interrupt ID, with the source-CPU bits stripped.
    pub vector: u32,
    /// IRQL to restore when servicing completes.
    pub old_irql: Irql,
}

/// Handler invoked for a vector, at the IRQL the vector was enabled at.
pub type InterruptHandler = fn(&Pcr, u32);

static HANDLERS: RwLock<[Option<InterruptHandler>; MAX_INTERRUPT_VECTORS]> =
    RwLock::new([None; MAX_INTERRUPT_VECTORS]);

/// Register `handler` for `vector`, replacing any previous registration.
pub fn register_handler(vector: u32, handler: InterruptHandler) {
    if (vector as usize) >= MAX_INTERRUPT_VECTORS {
        log::warn!("interrupts: handler registration for bad vector {}", vector);
        return;
    }
    HANDLERS.write()[vector as usize] = Some(handler);
}

/// Remove the handler for `vector`, if any.
pub fn unregister_handler(vector: u32) {
    if (vector as usize) < MAX_INTERRUPT_VECTORS {
        HANDLERS.write()[vector as usize] = None;
    }
}

/// Enable `vector` to deliver at `irql`.
pub fn enable_system_interrupt(gic: &Gic, vector: u32, irql: Irql, mode: InterruptMode) {
    gic.enable_interrupt(vector, irql, mode);
    log::debug!(
        "interrupts: vector {} enabled at irql {} ({:?})",
        vector,
        irql,
        mode
    );
}

/// Disable `vector`.
pub fn disable_system_interrupt(gic: &Gic, vector: u32) {
    gic.disable_interrupt(vector);
    log::debug!("interrupts: vector {} disabled", vector);
}

/// Acknowledge the highest-priority pending interrupt and raise the IRQL to
/// the level the vector delivers at.
///
/// Returns `None` for a spurious acknowledge, with no state change. On
/// `Some`, the caller owes a matching [`end_system_interrupt`].
pub fn begin_system_interrupt(gic: &Gic, pcr: &Pcr) -> Option<ServicedInterrupt> {
    let acknowledge = gic.acknowledge();
    let vector = acknowledge & ACKNOWLEDGE_ID_MASK;
    if vector == SPURIOUS_INTERRUPT {
        return None;
    }

    // The priority byte programmed at enable time is the single source of
    // truth for the vector's IRQL.
    let irql = gic.vector_irql(vector);
    let old_irql = pcr.raise_irql(irql);
    pcr.push_in_service(acknowledge);

    Some(ServicedInterrupt { vector, old_irql })
}

/// Complete servicing: signal EOI with the acknowledge value recorded by
/// the matching begin, then restore the IRQL.
///
/// An end with no outstanding begin is a driver bug; it is logged and the
/// EOI is skipped, but the IRQL is still restored so the core is not left
/// elevated.
pub fn end_system_interrupt(gic: &Gic, pcr: &Pcr, serviced: ServicedInterrupt) {
    match pcr.pop_in_service() {
        Some(acknowledge) => gic.end_of_interrupt(acknowledge),
        None => log::error!(
            "interrupts: unbalanced end for vector {} on cpu {}",
            serviced.vector,
            pcr.processor_number()
        ),
    }
    pcr.lower_irql(serviced.old_irql);
}

/// Full service cycle for one trap: begin, dispatch, end.
///
/// Returns the vector serviced, or `None` for a spurious acknowledge. A
/// vector with no registered handler is still acknowledged and completed,
/// with a warning, so a misbehaving line cannot wedge the controller.
pub fn handle_interrupt(gic: &Gic, pcr: &Pcr) -> Option<u32> {
    let serviced = begin_system_interrupt(gic, pcr)?;

    let handler = HANDLERS.read()[serviced.vector as usize];
    match handler {
        Some(handler) => handler(pcr, serviced.vector),
        None => log::warn!("interrupts: no handler for vector {}", serviced.vector),
    }

    end_system_interrupt(gic, pcr, serviced);
    Some(serviced.vector)
}
