//! Architecture-independent processor contract.
//!
//! A concrete CPU supplies instruction decode and execution; the exec loop,
//! interrupt latching, suspension, stop masks and breakpoints live here so
//! both instruction sets run through exactly the same driver.

use crate::bus::Bus;
use crate::component::Memory;
use crate::ports::PortTable;
use crate::snapshot::{DeviceState, SnapshotError};
use crate::types::{DeviceId, InstructionKind};
use log::{debug, trace};
use std::collections::HashSet;
use std::fmt;

pub const INTERRUPT_LEVELS: u8 = 8;

/// Why `exec` returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Budget,
    Breakpoint,
    Masked,   // Next instruction's kind intersects the stop mask
    Reset,    // A reset request was honoured
    Suspended,
}

/// Queued interrupt requests: one NMI slot, one reset slot and eight
/// maskable levels; level 0 has the highest priority
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InterruptLatch {
    pending: u8,
    nmi: bool,
    reset: bool,
}

impl InterruptLatch {
    pub fn request(&mut self, level: u8) {
        assert!(level < INTERRUPT_LEVELS, "interrupt level {} out of range", level);
        self.pending |= 1 << level;
    }

    pub fn request_nmi(&mut self) {
        self.nmi = true;
    }

    pub fn request_reset(&mut self) {
        self.reset = true;
    }

    /// Highest-priority pending maskable level
    pub fn highest(&self) -> Option<u8> {
        (self.pending != 0).then(|| self.pending.trailing_zeros() as u8)
    }

    pub fn acknowledge(&mut self, level: u8) {
        self.pending &= !(1 << level);
    }

    pub fn take_nmi(&mut self) -> bool {
        std::mem::take(&mut self.nmi)
    }

    pub fn take_reset(&mut self) -> bool {
        std::mem::take(&mut self.reset)
    }

    pub fn pending_mask(&self) -> u8 {
        self.pending
    }

    pub fn is_nmi_pending(&self) -> bool {
        self.nmi
    }

    pub fn clear(&mut self) {
        *self = InterruptLatch::default();
    }

    pub(crate) fn set_pending_mask(&mut self, mask: u8) {
        self.pending = mask;
    }
}

/// State every processor carries besides its registers
#[derive(Debug, Clone, Default)]
pub struct ProcessorCore {
    pub clock: u64,
    pub suspended: bool,
    pub ports: PortTable,
    pub interrupts: InterruptLatch,
}

impl ProcessorCore {
    pub fn new() -> Self {
        ProcessorCore::default()
    }

    pub fn marshal(&self, state: &mut DeviceState) {
        state.put("INT", self.interrupts.pending_mask());
        state.put("NMI", self.interrupts.is_nmi_pending() as u8);
    }

    pub fn unmarshal(&mut self, state: &DeviceState) -> Result<(), SnapshotError> {
        let mut pending = 0u8;
        let mut nmi = 0u8;
        state.restore("INT", &mut pending)?;
        state.restore("NMI", &mut nmi)?;
        self.interrupts.clear();
        self.interrupts.set_pending_mask(pending);
        if nmi != 0 {
            self.interrupts.request_nmi();
        }
        Ok(())
    }
}

/// Decode-table entry.
///
/// `parameters` is a template: `n` stands for an immediate byte, `nn` for
/// an immediate word, `e` for a relative jump target and `d` for an index
/// displacement. Register names are always upper case.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Opcode {
    pub mnemonic: &'static str,
    pub parameters: String,
    pub length: u8,
    pub kind: InstructionKind,
}

impl Opcode {
    pub fn new(mnemonic: &'static str, parameters: String, kind: InstructionKind) -> Self {
        let length = 1 + operand_length(&parameters);
        Opcode {
            mnemonic,
            parameters,
            length,
            kind,
        }
    }
}

/// Bytes taken by the placeholders of a parameter template
pub fn operand_length(template: &str) -> u8 {
    let bytes = template.as_bytes();
    let mut length = 0;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'n' if bytes.get(i + 1) == Some(&b'n') => {
                length += 2;
                i += 1;
            }
            b'n' | b'e' | b'd' => length += 1,
            _ => {}
        }
        i += 1;
    }
    length
}

/// Substitute operand bytes into a parameter template.
/// `next` is the address following the instruction, for relative jumps.
pub fn fill_template(template: &str, operands: &[u8], next: u16) -> String {
    let bytes = template.as_bytes();
    let mut out = String::with_capacity(template.len() + 4);
    let mut operands = operands.iter().copied();
    let mut take = || operands.next().unwrap_or(0);
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'n' if bytes.get(i + 1) == Some(&b'n') => {
                let low = take() as u16;
                let high = take() as u16;
                out.push_str(&format!("{:04X}", high << 8 | low));
                i += 1;
            }
            b'n' => out.push_str(&format!("{:02X}", take())),
            b'e' => {
                let offset = take() as i8;
                out.push_str(&format!("{:04X}", next.wrapping_add(offset as u16)));
            }
            b'd' => {
                let offset = take() as i8;
                if offset < 0 {
                    if out.ends_with('+') {
                        out.pop();
                    }
                    out.push_str(&format!("-{:02X}", offset.unsigned_abs()));
                } else {
                    out.push_str(&format!("{:02X}", offset));
                }
            }
            other => out.push(other as char),
        }
        i += 1;
    }
    out
}

/// One disassembled instruction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Disassembly {
    pub address: u16,
    pub bytes: Vec<u8>,
    pub prefix_length: usize,
    pub mnemonic: String,
    pub parameters: String,
    pub kind: InstructionKind,
}

impl Disassembly {
    pub fn length(&self) -> usize {
        self.bytes.len()
    }

    /// Mnemonic and parameters as one line, e.g. `MVI A,3E`
    pub fn simplified(&self) -> String {
        if self.parameters.is_empty() {
            self.mnemonic.clone()
        } else {
            format!("{} {}", self.mnemonic, self.parameters)
        }
    }

    pub fn hex_bytes(&self) -> String {
        self.bytes
            .iter()
            .map(|b| format!("{:02X}", b))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl fmt::Display for Disassembly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04X}  {:<12}{}",
            self.address,
            self.hex_bytes(),
            self.simplified()
        )
    }
}

/// Read `count` bytes from `address` without side effects
pub fn peek_bytes(memory: &dyn Memory, address: u16, count: usize) -> Vec<u8> {
    (0..count)
        .map(|offset| memory.peek(address.wrapping_add(offset as u16)))
        .collect()
}

pub trait Processor {
    fn name(&self) -> &str;

    fn core(&self) -> &ProcessorCore;
    fn core_mut(&mut self) -> &mut ProcessorCore;

    /// Registers to power-on state; the cycle counter keeps running
    fn reset(&mut self);

    fn pc(&self) -> u16;
    fn set_pc(&mut self, pc: u16);

    fn is_halted(&self) -> bool;

    /// Cycles burnt per loop iteration while halted
    fn halt_cycles(&self) -> u64;

    /// Accept a pending interrupt if the architecture allows it now.
    /// Returns the acknowledge cost when one was taken.
    fn service_interrupt(&mut self, bus: &mut Bus) -> Option<u64>;

    /// Execute the instruction at PC, returning its cost in cycles
    fn execute(&mut self, bus: &mut Bus) -> u64;

    /// Class flags of the instruction at PC, prefixes included
    fn kind_at(&self, bus: &Bus) -> InstructionKind;

    fn opcode(&self, byte: u8) -> &'static Opcode;

    fn disassemble(&self, memory: &dyn Memory, address: u16) -> Disassembly;

    fn state_string(&self) -> String;

    fn marshal(&self, state: &mut DeviceState);

    fn unmarshal(&mut self, state: &DeviceState) -> Result<(), SnapshotError>;

    fn system_clock(&self) -> u64 {
        self.core().clock
    }

    fn suspend(&mut self) {
        self.core_mut().suspended = true;
    }

    fn resume(&mut self) {
        self.core_mut().suspended = false;
    }

    fn is_suspended(&self) -> bool {
        self.core().suspended
    }

    fn ports(&self) -> &PortTable {
        &self.core().ports
    }

    fn ports_mut(&mut self) -> &mut PortTable {
        &mut self.core_mut().ports
    }

    fn add_io_input(&mut self, port: u8, element: DeviceId) {
        self.ports_mut().add_input(port, element);
    }

    fn add_io_output(&mut self, port: u8, element: DeviceId) {
        self.ports_mut().add_output(port, element);
    }

    fn remove_io_input(&mut self, port: u8, element: DeviceId) {
        self.ports_mut().remove_input(port, element);
    }

    fn remove_io_output(&mut self, port: u8, element: DeviceId) {
        self.ports_mut().remove_output(port, element);
    }

    fn clear_io_input(&mut self, port: u8) {
        self.ports_mut().clear_input(port);
    }

    fn clear_io_output(&mut self, port: u8) {
        self.ports_mut().clear_output(port);
    }

    /// Queue a maskable interrupt at `level` (0-7)
    fn request_interrupt(&mut self, level: u8) {
        trace!("{}: interrupt {} requested", self.name(), level);
        self.core_mut().interrupts.request(level);
    }

    fn request_nmi(&mut self) {
        trace!("{}: NMI requested", self.name());
        self.core_mut().interrupts.request_nmi();
    }

    fn request_reset(&mut self) {
        trace!("{}: reset requested", self.name());
        self.core_mut().interrupts.request_reset();
    }

    /// Run whole instructions until `cycles` are used up, PC hits a
    /// breakpoint, or the next instruction's kind intersects `mask`.
    /// The scheduler is left at the processor clock on return.
    fn exec(
        &mut self,
        bus: &mut Bus,
        cycles: u64,
        mask: InstructionKind,
        breakpoints: &HashSet<u16>,
    ) -> StopReason {
        let end = self.core().clock.saturating_add(cycles);
        let reason = loop {
            if self.core().suspended {
                break StopReason::Suspended;
            }
            bus.run_schedule(self.core().clock);

            if self.core_mut().interrupts.take_reset() {
                debug!("{}: reset", self.name());
                self.reset();
                break StopReason::Reset;
            }

            let cost = if let Some(cost) = self.service_interrupt(bus) {
                cost
            } else if self.is_halted() {
                self.halt_cycles()
            } else {
                if !mask.is_empty() && self.kind_at(bus).intersects(mask) {
                    break StopReason::Masked;
                }
                self.execute(bus)
            };
            self.core_mut().clock += cost;

            if breakpoints.contains(&self.pc()) {
                break StopReason::Breakpoint;
            }
            if self.core().clock >= end {
                break StopReason::Budget;
            }
        };
        bus.scheduler_mut().advance_to(self.core().clock);
        reason
    }

    /// Execute exactly one instruction
    fn step(&mut self, bus: &mut Bus) -> StopReason {
        self.exec(bus, 1, InstructionKind::NONE, &HashSet::new())
    }

    /// Execute for a cycle budget with no mask or breakpoints
    fn run(&mut self, bus: &mut Bus, cycles: u64) -> StopReason {
        self.exec(bus, cycles, InstructionKind::NONE, &HashSet::new())
    }

    /// Let `cycles` pass without executing anything
    fn idle(&mut self, bus: &mut Bus, cycles: u64) {
        if self.core().suspended {
            return;
        }
        self.core_mut().clock += cycles;
        bus.run_schedule(self.core().clock);
    }
}
