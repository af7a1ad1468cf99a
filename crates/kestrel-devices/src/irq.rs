//! Interrupt line plumbing shared by the device models.

use std::cell::Cell;
use std::rc::Rc;

/// A single level-triggered interrupt line into the platform controller.
pub trait IrqLine {
    fn set_level(&self, high: bool);
}

/// Line that goes nowhere (unwired interrupt).
#[derive(Debug, Clone, Copy, Default)]
pub struct NoIrq;

impl IrqLine for NoIrq {
    fn set_level(&self, _high: bool) {}
}

/// Shared level line observable from outside the device, for wiring into an
/// interrupt-controller model or a test harness.
#[derive(Clone, Default)]
pub struct LevelIrqLine(Rc<Cell<bool>>);

impl LevelIrqLine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn level(&self) -> bool {
        self.0.get()
    }
}

impl IrqLine for LevelIrqLine {
    fn set_level(&self, high: bool) {
        self.0.set(high);
    }
}
