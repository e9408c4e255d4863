pub mod fixed;
pub mod gates;
pub mod probe;

pub use fixed::FixedPin;
pub use gates::{Gate, GateKind};
pub use probe::{Probe, ProbeLog};
