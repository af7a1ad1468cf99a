//! Clock/reset gating for peripheral models.

use std::cell::Cell;
use std::rc::Rc;

/// Reports the clock-enable and reset state of a peripheral's clock domain.
///
/// Models consult this on every register access: a gated clock turns reads
/// into the bus sentinel value and swallows writes, and an asserted reset
/// (of the peripheral or of its upstream parent domain) drops writes
/// entirely.
pub trait ClockGate {
    fn clock_enabled(&self) -> bool;
    fn reset_asserted(&self) -> bool;
}

/// Gate for machines that do not model the clock/reset controller.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysOnGate;

impl ClockGate for AlwaysOnGate {
    fn clock_enabled(&self) -> bool {
        true
    }

    fn reset_asserted(&self) -> bool {
        false
    }
}

/// Hand-driven gate, shareable between the driver side (a clock-controller
/// model or a test) and the gated peripheral.
#[derive(Debug, Clone, Default)]
pub struct ManualGate {
    inner: Rc<GateCells>,
}

#[derive(Debug, Default)]
struct GateCells {
    clock_disabled: Cell<bool>,
    reset: Cell<bool>,
}

impl ManualGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_clock_enabled(&self, enabled: bool) {
        self.inner.clock_disabled.set(!enabled);
    }

    pub fn set_reset_asserted(&self, asserted: bool) {
        self.inner.reset.set(asserted);
    }
}

impl ClockGate for ManualGate {
    fn clock_enabled(&self) -> bool {
        !self.inner.clock_disabled.get()
    }

    fn reset_asserted(&self) -> bool {
        self.inner.reset.get()
    }
}
