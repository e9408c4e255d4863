pub mod intel_8080;
pub mod processor;
pub mod z80_alu;
pub mod z80_decode;
pub mod zilog_z80;

pub use intel_8080::Intel8080;
pub use processor::{
    Disassembly, InterruptLatch, Opcode, Processor, ProcessorCore, StopReason, INTERRUPT_LEVELS,
};
pub use zilog_z80::ZilogZ80;
