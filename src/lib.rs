//! # Retro Sim
//!
//! Cycle-driven hardware simulation core for 8-bit machines built around
//! an Intel 8080A or a Zilog Z80.
//!
//! This library provides:
//! - Pins and wired-AND nodes with synchronous change notification
//! - A cycle-stamped event scheduler shared by every device
//! - Intel 8080A and Zilog Z80 processors with interrupt, breakpoint and
//!   stop-mask support
//! - A 256-port I/O dispatch table and a 64 KiB memory model
//! - Machine lifecycle: reset, nested suspension and JSON snapshots with
//!   run-length compacted memory blocks
//! - JSON machine descriptions assembled by a device registry

pub mod bus;
pub mod component;
pub mod components;
pub mod connection;
pub mod hardware;
pub mod pin;
pub mod ports;
pub mod scheduler;
pub mod snapshot;
pub mod system_config;
pub mod types;

// Re-export commonly used items for easier importing
pub use bus::Bus;
pub use component::{Device, IoElement, Memory, Signals};
pub use components::cpu::{Intel8080, Processor, StopReason, ZilogZ80};
pub use connection::{Net, WiringError};
pub use hardware::Hardware;
pub use pin::{Edge, PinId, PinValue};
pub use ports::{PortDirection, PortTable};
pub use scheduler::Scheduler;
pub use snapshot::{DeviceState, Snapshot, SnapshotError};
pub use system_config::{ConfigError, MachineConfig, MachineFactory};
pub use types::{DeviceId, InstructionKind, NodeId};
