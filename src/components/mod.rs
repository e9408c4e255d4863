//! Concrete devices: processors, memories, glue logic, clock sources,
//! timers and I/O peripherals.

pub mod clock;
pub mod cpu;
pub mod io;
pub mod logic;
pub mod memory;
pub mod timer;
