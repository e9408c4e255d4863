pub mod mapped_memory;
pub mod simple_memory;

pub use mapped_memory::{MappedMemory, ReadListener, WriteListener};
pub use simple_memory::SimpleMemory;

/// Size of the full 16-bit address space
pub const MEMORY_SIZE: usize = 0x10000;
