#![forbid(unsafe_code)]

pub mod clock;
pub mod irq;
pub mod vde;

pub use vde::bse::{BseConfig, BseEngine, BseKind, BseMmio, EngineFault, EngineState};
