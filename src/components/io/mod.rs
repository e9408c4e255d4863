pub mod intel_8255;
pub mod output_latch;

pub use intel_8255::Intel8255;
pub use output_latch::OutputLatch;
