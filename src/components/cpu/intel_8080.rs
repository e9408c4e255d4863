//! Intel 8080A.
//!
//! All 256 opcodes including the undocumented aliases, with datasheet
//! state counts. HLT leaves PC on the HLT opcode; accepting an interrupt
//! steps past it. An accepted interrupt at level `n` executes `RST n`.

use super::processor::{
    fill_template, peek_bytes, Disassembly, Opcode, Processor, ProcessorCore,
};
use crate::bus::Bus;
use crate::component::Memory;
use crate::snapshot::{DeviceState, SnapshotError};
use crate::types::InstructionKind as K;
use log::warn;
use std::sync::OnceLock;

pub const SF: u8 = 0x80;
pub const ZF: u8 = 0x40;
pub const AF: u8 = 0x10; // Auxiliary carry
pub const PF: u8 = 0x04;
pub const ONE: u8 = 0x02; // Always set in the PSW
pub const CF: u8 = 0x01;

const FLAG_MASK: u8 = SF | ZF | AF | PF | CF;

const REGISTERS: [&str; 8] = ["B", "C", "D", "E", "H", "L", "M", "A"];
const PAIRS: [&str; 4] = ["B", "D", "H", "SP"];
const PAIRS_PSW: [&str; 4] = ["B", "D", "H", "PSW"];
const ALU: [&str; 8] = ["ADD", "ADC", "SUB", "SBB", "ANA", "XRA", "ORA", "CMP"];
const ALU_IMMEDIATE: [&str; 8] = ["ADI", "ACI", "SUI", "SBI", "ANI", "XRI", "ORI", "CPI"];
const ROTATES: [&str; 8] = ["RLC", "RRC", "RAL", "RAR", "DAA", "CMA", "STC", "CMC"];
const JUMPS: [&str; 8] = ["JNZ", "JZ", "JNC", "JC", "JPO", "JPE", "JP", "JM"];
const CALLS: [&str; 8] = ["CNZ", "CZ", "CNC", "CC", "CPO", "CPE", "CP", "CM"];
const RETURNS: [&str; 8] = ["RNZ", "RZ", "RNC", "RC", "RPO", "RPE", "RP", "RM"];

fn szp(value: u8) -> u8 {
    let mut flags = value & SF;
    if value == 0 {
        flags |= ZF;
    }
    if value.count_ones() % 2 == 0 {
        flags |= PF;
    }
    flags
}

fn decode(op: u8) -> Opcode {
    let y = ((op >> 3) & 7) as usize;
    let z = (op & 7) as usize;
    let p = y >> 1;
    let q = y & 1;

    let (mnemonic, parameters, kind): (&'static str, String, K) = match op >> 6 {
        0 => match z {
            0 if y == 0 => ("NOP", String::new(), K::NONE),
            0 => ("NOP", String::new(), K::UNDOCUMENTED),
            1 if q == 0 => ("LXI", format!("{},nn", PAIRS[p]), K::NONE),
            1 => ("DAD", PAIRS[p].to_string(), K::NONE),
            2 => match y {
                0 => ("STAX", "B".to_string(), K::MEMORY_WRITE),
                1 => ("LDAX", "B".to_string(), K::MEMORY_READ),
                2 => ("STAX", "D".to_string(), K::MEMORY_WRITE),
                3 => ("LDAX", "D".to_string(), K::MEMORY_READ),
                4 => ("SHLD", "nn".to_string(), K::MEMORY_WRITE),
                5 => ("LHLD", "nn".to_string(), K::MEMORY_READ),
                6 => ("STA", "nn".to_string(), K::MEMORY_WRITE),
                _ => ("LDA", "nn".to_string(), K::MEMORY_READ),
            },
            3 if q == 0 => ("INX", PAIRS[p].to_string(), K::NONE),
            3 => ("DCX", PAIRS[p].to_string(), K::NONE),
            4 | 5 => {
                let kind = if y == 6 {
                    K::MEMORY_READ | K::MEMORY_WRITE
                } else {
                    K::NONE
                };
                let mnemonic = if z == 4 { "INR" } else { "DCR" };
                (mnemonic, REGISTERS[y].to_string(), kind)
            }
            6 => {
                let kind = if y == 6 { K::MEMORY_WRITE } else { K::NONE };
                ("MVI", format!("{},n", REGISTERS[y]), kind)
            }
            _ => (ROTATES[y], String::new(), K::NONE),
        },
        1 if op == 0x76 => ("HLT", String::new(), K::HALT),
        1 => {
            let mut kind = K::NONE;
            if y == 6 {
                kind |= K::MEMORY_WRITE;
            }
            if z == 6 {
                kind |= K::MEMORY_READ;
            }
            ("MOV", format!("{},{}", REGISTERS[y], REGISTERS[z]), kind)
        }
        2 => {
            let kind = if z == 6 { K::MEMORY_READ } else { K::NONE };
            (ALU[y], REGISTERS[z].to_string(), kind)
        }
        _ => match z {
            0 => (RETURNS[y], String::new(), K::RETURN | K::MEMORY_READ),
            1 if q == 0 => ("POP", PAIRS_PSW[p].to_string(), K::MEMORY_READ),
            1 => match p {
                0 => ("RET", String::new(), K::RETURN | K::MEMORY_READ),
                1 => (
                    "RET",
                    String::new(),
                    K::RETURN | K::MEMORY_READ | K::UNDOCUMENTED,
                ),
                2 => ("PCHL", String::new(), K::JUMP),
                _ => ("SPHL", String::new(), K::NONE),
            },
            2 => (JUMPS[y], "nn".to_string(), K::JUMP),
            3 => match y {
                0 => ("JMP", "nn".to_string(), K::JUMP),
                1 => ("JMP", "nn".to_string(), K::JUMP | K::UNDOCUMENTED),
                2 => ("OUT", "n".to_string(), K::IO),
                3 => ("IN", "n".to_string(), K::IO),
                4 => ("XTHL", String::new(), K::MEMORY_READ | K::MEMORY_WRITE),
                5 => ("XCHG", String::new(), K::NONE),
                6 => ("DI", String::new(), K::NONE),
                _ => ("EI", String::new(), K::NONE),
            },
            4 => (CALLS[y], "nn".to_string(), K::CALL | K::MEMORY_WRITE),
            5 if q == 0 => ("PUSH", PAIRS_PSW[p].to_string(), K::MEMORY_WRITE),
            5 if p == 0 => ("CALL", "nn".to_string(), K::CALL | K::MEMORY_WRITE),
            5 => (
                "CALL",
                "nn".to_string(),
                K::CALL | K::MEMORY_WRITE | K::UNDOCUMENTED,
            ),
            6 => (ALU_IMMEDIATE[y], "n".to_string(), K::NONE),
            _ => ("RST", y.to_string(), K::CALL | K::MEMORY_WRITE),
        },
    };
    Opcode::new(mnemonic, parameters, kind)
}

fn opcode_table() -> &'static [Opcode] {
    static TABLE: OnceLock<Vec<Opcode>> = OnceLock::new();
    TABLE.get_or_init(|| (0..=255u8).map(decode).collect())
}

pub struct Intel8080 {
    name: String,
    core: ProcessorCore,
    pub a: u8,
    pub f: u8,
    pub b: u8,
    pub c: u8,
    pub d: u8,
    pub e: u8,
    pub h: u8,
    pub l: u8,
    pub sp: u16,
    pub pc: u16,
    pub ie: bool,       // Interrupts enabled
    pub ei_delay: bool, // EI was the last instruction
    pub halted: bool,
}

impl Intel8080 {
    pub fn new(name: &str) -> Self {
        Intel8080 {
            name: name.to_string(),
            core: ProcessorCore::new(),
            a: 0,
            f: ONE,
            b: 0,
            c: 0,
            d: 0,
            e: 0,
            h: 0,
            l: 0,
            sp: 0,
            pc: 0,
            ie: false,
            ei_delay: false,
            halted: false,
        }
    }

    pub fn bc(&self) -> u16 {
        u16::from_be_bytes([self.b, self.c])
    }

    pub fn de(&self) -> u16 {
        u16::from_be_bytes([self.d, self.e])
    }

    pub fn hl(&self) -> u16 {
        u16::from_be_bytes([self.h, self.l])
    }

    pub fn set_bc(&mut self, value: u16) {
        [self.b, self.c] = value.to_be_bytes();
    }

    pub fn set_de(&mut self, value: u16) {
        [self.d, self.e] = value.to_be_bytes();
    }

    pub fn set_hl(&mut self, value: u16) {
        [self.h, self.l] = value.to_be_bytes();
    }

    pub fn psw(&self) -> u16 {
        u16::from_be_bytes([self.a, (self.f & FLAG_MASK) | ONE])
    }

    pub fn set_psw(&mut self, value: u16) {
        let [a, f] = value.to_be_bytes();
        self.a = a;
        self.f = (f & FLAG_MASK) | ONE;
    }

    pub fn flag(&self, flag: u8) -> bool {
        self.f & flag != 0
    }

    fn set_flag(&mut self, flag: u8, on: bool) {
        if on {
            self.f |= flag;
        } else {
            self.f &= !flag;
        }
    }

    fn pair(&self, p: usize) -> u16 {
        match p {
            0 => self.bc(),
            1 => self.de(),
            2 => self.hl(),
            _ => self.sp,
        }
    }

    fn set_pair(&mut self, p: usize, value: u16) {
        match p {
            0 => self.set_bc(value),
            1 => self.set_de(value),
            2 => self.set_hl(value),
            _ => self.sp = value,
        }
    }

    fn condition(&self, cc: usize) -> bool {
        match cc {
            0 => !self.flag(ZF),
            1 => self.flag(ZF),
            2 => !self.flag(CF),
            3 => self.flag(CF),
            4 => !self.flag(PF),
            5 => self.flag(PF),
            6 => !self.flag(SF),
            _ => self.flag(SF),
        }
    }

    fn fetch(&mut self, bus: &mut Bus) -> u8 {
        let value = bus.read_byte(self.pc);
        self.pc = self.pc.wrapping_add(1);
        value
    }

    fn fetch_word(&mut self, bus: &mut Bus) -> u16 {
        let low = self.fetch(bus);
        let high = self.fetch(bus);
        u16::from_le_bytes([low, high])
    }

    fn read_word(bus: &mut Bus, address: u16) -> u16 {
        let low = bus.read_byte(address);
        let high = bus.read_byte(address.wrapping_add(1));
        u16::from_le_bytes([low, high])
    }

    fn write_word(bus: &mut Bus, address: u16, value: u16) {
        let [low, high] = value.to_le_bytes();
        bus.write_byte(address, low);
        bus.write_byte(address.wrapping_add(1), high);
    }

    fn push(&mut self, bus: &mut Bus, value: u16) {
        self.sp = self.sp.wrapping_sub(2);
        Self::write_word(bus, self.sp, value);
    }

    fn pop(&mut self, bus: &mut Bus) -> u16 {
        let value = Self::read_word(bus, self.sp);
        self.sp = self.sp.wrapping_add(2);
        value
    }

    fn read_reg(&mut self, bus: &mut Bus, r: usize) -> u8 {
        match r {
            0 => self.b,
            1 => self.c,
            2 => self.d,
            3 => self.e,
            4 => self.h,
            5 => self.l,
            6 => bus.read_byte(self.hl()),
            _ => self.a,
        }
    }

    fn write_reg(&mut self, bus: &mut Bus, r: usize, value: u8) {
        match r {
            0 => self.b = value,
            1 => self.c = value,
            2 => self.d = value,
            3 => self.e = value,
            4 => self.h = value,
            5 => self.l = value,
            6 => bus.write_byte(self.hl(), value),
            _ => self.a = value,
        }
    }

    fn add(&mut self, value: u8, carry: u8) {
        let sum = self.a as u16 + value as u16 + carry as u16;
        let result = sum as u8;
        let mut flags = szp(result) | ONE;
        if (self.a & 0x0f) + (value & 0x0f) + carry > 0x0f {
            flags |= AF;
        }
        if sum > 0xff {
            flags |= CF;
        }
        self.a = result;
        self.f = flags;
    }

    fn subtract(&mut self, value: u8, borrow: u8) -> u8 {
        let result = self.a.wrapping_sub(value).wrapping_sub(borrow);
        let mut flags = szp(result) | ONE;
        // 8080 subtracts by adding the complement; AC is that carry
        if (self.a & 0x0f) + (!value & 0x0f) + (1 - borrow) > 0x0f {
            flags |= AF;
        }
        if (self.a as u16) < value as u16 + borrow as u16 {
            flags |= CF;
        }
        self.f = flags;
        result
    }

    fn alu(&mut self, operation: usize, value: u8) {
        let carry = self.f & CF;
        match operation {
            0 => self.add(value, 0),
            1 => self.add(value, carry),
            2 => self.a = self.subtract(value, 0),
            3 => self.a = self.subtract(value, carry),
            4 => {
                let half = if (self.a | value) & 0x08 != 0 { AF } else { 0 };
                self.a &= value;
                self.f = szp(self.a) | ONE | half;
            }
            5 => {
                self.a ^= value;
                self.f = szp(self.a) | ONE;
            }
            6 => {
                self.a |= value;
                self.f = szp(self.a) | ONE;
            }
            _ => {
                self.subtract(value, 0);
            }
        }
    }

    fn daa(&mut self) {
        let low = self.a & 0x0f;
        let high = self.a >> 4;
        let mut correction = 0;
        let mut carry = self.flag(CF);
        if low > 9 || self.flag(AF) {
            correction |= 0x06;
        }
        if high > 9 || carry || (high >= 9 && low > 9) {
            correction |= 0x60;
            carry = true;
        }
        let result = self.a.wrapping_add(correction);
        let mut flags = szp(result) | ONE;
        if low + (correction & 0x0f) > 0x0f {
            flags |= AF;
        }
        if carry {
            flags |= CF;
        }
        self.a = result;
        self.f = flags;
    }

    fn rotate(&mut self, operation: usize) {
        let carry = self.flag(CF);
        match operation {
            0 => {
                self.set_flag(CF, self.a & 0x80 != 0);
                self.a = self.a.rotate_left(1);
            }
            1 => {
                self.set_flag(CF, self.a & 0x01 != 0);
                self.a = self.a.rotate_right(1);
            }
            2 => {
                self.set_flag(CF, self.a & 0x80 != 0);
                self.a = self.a << 1 | carry as u8;
            }
            3 => {
                self.set_flag(CF, self.a & 0x01 != 0);
                self.a = self.a >> 1 | (carry as u8) << 7;
            }
            4 => self.daa(),
            5 => self.a = !self.a,
            6 => self.set_flag(CF, true),
            _ => self.set_flag(CF, !carry),
        }
    }
}

impl Processor for Intel8080 {
    fn name(&self) -> &str {
        &self.name
    }

    fn core(&self) -> &ProcessorCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ProcessorCore {
        &mut self.core
    }

    fn reset(&mut self) {
        self.pc = 0;
        self.ie = false;
        self.ei_delay = false;
        self.halted = false;
        self.core.interrupts.clear();
    }

    fn pc(&self) -> u16 {
        self.pc
    }

    fn set_pc(&mut self, pc: u16) {
        self.pc = pc;
    }

    fn is_halted(&self) -> bool {
        self.halted
    }

    fn halt_cycles(&self) -> u64 {
        4
    }

    fn request_nmi(&mut self) {
        warn!("{}: the 8080 has no NMI input, request ignored", self.name);
    }

    fn service_interrupt(&mut self, bus: &mut Bus) -> Option<u64> {
        if !self.ie || self.ei_delay {
            return None;
        }
        let level = self.core.interrupts.highest()?;
        self.core.interrupts.acknowledge(level);
        self.ie = false;
        if self.halted {
            self.halted = false;
            self.pc = self.pc.wrapping_add(1);
        }
        self.push(bus, self.pc);
        self.pc = level as u16 * 8;
        Some(11)
    }

    fn execute(&mut self, bus: &mut Bus) -> u64 {
        self.ei_delay = false;
        let op = self.fetch(bus);
        let y = ((op >> 3) & 7) as usize;
        let z = (op & 7) as usize;
        let p = y >> 1;
        let q = y & 1;

        match op >> 6 {
            0 => match z {
                0 => 4,
                1 if q == 0 => {
                    let value = self.fetch_word(bus);
                    self.set_pair(p, value);
                    10
                }
                1 => {
                    let sum = self.hl() as u32 + self.pair(p) as u32;
                    self.set_flag(CF, sum > 0xffff);
                    self.set_hl(sum as u16);
                    10
                }
                2 => match y {
                    0 | 2 => {
                        let address = self.pair(p);
                        bus.write_byte(address, self.a);
                        7
                    }
                    1 | 3 => {
                        let address = self.pair(p);
                        self.a = bus.read_byte(address);
                        7
                    }
                    4 => {
                        let address = self.fetch_word(bus);
                        Self::write_word(bus, address, self.hl());
                        16
                    }
                    5 => {
                        let address = self.fetch_word(bus);
                        let value = Self::read_word(bus, address);
                        self.set_hl(value);
                        16
                    }
                    6 => {
                        let address = self.fetch_word(bus);
                        bus.write_byte(address, self.a);
                        13
                    }
                    _ => {
                        let address = self.fetch_word(bus);
                        self.a = bus.read_byte(address);
                        13
                    }
                },
                3 => {
                    let value = self.pair(p);
                    let value = if q == 0 {
                        value.wrapping_add(1)
                    } else {
                        value.wrapping_sub(1)
                    };
                    self.set_pair(p, value);
                    5
                }
                4 => {
                    let result = self.read_reg(bus, y).wrapping_add(1);
                    self.write_reg(bus, y, result);
                    let half = if result & 0x0f == 0 { AF } else { 0 };
                    self.f = (self.f & CF) | szp(result) | ONE | half;
                    if y == 6 {
                        10
                    } else {
                        5
                    }
                }
                5 => {
                    let result = self.read_reg(bus, y).wrapping_sub(1);
                    self.write_reg(bus, y, result);
                    let half = if result & 0x0f != 0x0f { AF } else { 0 };
                    self.f = (self.f & CF) | szp(result) | ONE | half;
                    if y == 6 {
                        10
                    } else {
                        5
                    }
                }
                6 => {
                    let value = self.fetch(bus);
                    self.write_reg(bus, y, value);
                    if y == 6 {
                        10
                    } else {
                        7
                    }
                }
                _ => {
                    self.rotate(y);
                    4
                }
            },
            1 if op == 0x76 => {
                self.halted = true;
                self.pc = self.pc.wrapping_sub(1);
                7
            }
            1 => {
                let value = self.read_reg(bus, z);
                self.write_reg(bus, y, value);
                if y == 6 || z == 6 {
                    7
                } else {
                    5
                }
            }
            2 => {
                let value = self.read_reg(bus, z);
                self.alu(y, value);
                if z == 6 {
                    7
                } else {
                    4
                }
            }
            _ => match z {
                0 => {
                    if self.condition(y) {
                        self.pc = self.pop(bus);
                        11
                    } else {
                        5
                    }
                }
                1 if q == 0 => {
                    let value = self.pop(bus);
                    if p == 3 {
                        self.set_psw(value);
                    } else {
                        self.set_pair(p, value);
                    }
                    10
                }
                1 => match p {
                    0 | 1 => {
                        self.pc = self.pop(bus);
                        10
                    }
                    2 => {
                        self.pc = self.hl();
                        5
                    }
                    _ => {
                        self.sp = self.hl();
                        5
                    }
                },
                2 => {
                    let address = self.fetch_word(bus);
                    if self.condition(y) {
                        self.pc = address;
                    }
                    10
                }
                3 => match y {
                    0 | 1 => {
                        self.pc = self.fetch_word(bus);
                        10
                    }
                    2 => {
                        let port = self.fetch(bus);
                        bus.port_output(&self.core.ports, port, self.a);
                        10
                    }
                    3 => {
                        let port = self.fetch(bus);
                        self.a = bus.port_input(&self.core.ports, port);
                        10
                    }
                    4 => {
                        let value = Self::read_word(bus, self.sp);
                        Self::write_word(bus, self.sp, self.hl());
                        self.set_hl(value);
                        18
                    }
                    5 => {
                        let de = self.de();
                        self.set_de(self.hl());
                        self.set_hl(de);
                        4
                    }
                    6 => {
                        self.ie = false;
                        4
                    }
                    _ => {
                        self.ie = true;
                        self.ei_delay = true;
                        4
                    }
                },
                4 => {
                    let address = self.fetch_word(bus);
                    if self.condition(y) {
                        self.push(bus, self.pc);
                        self.pc = address;
                        17
                    } else {
                        11
                    }
                }
                5 if q == 0 => {
                    let value = if p == 3 { self.psw() } else { self.pair(p) };
                    self.push(bus, value);
                    11
                }
                5 => {
                    let address = self.fetch_word(bus);
                    self.push(bus, self.pc);
                    self.pc = address;
                    17
                }
                6 => {
                    let value = self.fetch(bus);
                    self.alu(y, value);
                    7
                }
                _ => {
                    self.push(bus, self.pc);
                    self.pc = (y as u16) * 8;
                    11
                }
            },
        }
    }

    fn kind_at(&self, bus: &Bus) -> K {
        self.opcode(bus.peek(self.pc)).kind
    }

    fn opcode(&self, byte: u8) -> &'static Opcode {
        &opcode_table()[byte as usize]
    }

    fn disassemble(&self, memory: &dyn Memory, address: u16) -> Disassembly {
        let opcode = self.opcode(memory.peek(address));
        let bytes = peek_bytes(memory, address, opcode.length as usize);
        let next = address.wrapping_add(opcode.length as u16);
        Disassembly {
            address,
            parameters: fill_template(&opcode.parameters, &bytes[1..], next),
            bytes,
            prefix_length: 0,
            mnemonic: opcode.mnemonic.to_string(),
            kind: opcode.kind,
        }
    }

    fn state_string(&self) -> String {
        format!(
            "PC:{:04x} SP:{:04x} A:{:02x} F:{:02x} B:{:02x} C:{:02x} D:{:02x} E:{:02x} H:{:02x} L:{:02x} IE:{}",
            self.pc,
            self.sp,
            self.a,
            self.f,
            self.b,
            self.c,
            self.d,
            self.e,
            self.h,
            self.l,
            self.ie as u8
        )
    }

    fn marshal(&self, state: &mut DeviceState) {
        state.put("A", self.a);
        state.put("F", self.f);
        state.put("B", self.b);
        state.put("C", self.c);
        state.put("D", self.d);
        state.put("E", self.e);
        state.put("H", self.h);
        state.put("L", self.l);
        state.put("PC", self.pc);
        state.put("SP", self.sp);
        state.put("IE", self.ie);
        state.put("TID", self.ei_delay);
        state.put("HALTED", self.halted);
        self.core.marshal(state);
    }

    fn unmarshal(&mut self, state: &DeviceState) -> Result<(), SnapshotError> {
        self.a = state.read("A")?;
        self.f = (state.read::<u8>("F")? & FLAG_MASK) | ONE;
        self.b = state.read("B")?;
        self.c = state.read("C")?;
        self.d = state.read("D")?;
        self.e = state.read("E")?;
        self.h = state.read("H")?;
        self.l = state.read("L")?;
        self.pc = state.read("PC")?;
        self.sp = state.read("SP")?;
        self.ie = state.read("IE")?;
        self.ei_delay = state.read("TID")?;
        self.halted = state.read("HALTED")?;
        self.core.unmarshal(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::cpu::StopReason;
    use crate::components::memory::SimpleMemory;
    use std::collections::HashSet;

    fn machine(program: &[u8]) -> (Intel8080, Bus) {
        let mut bus = Bus::new();
        let mut memory = SimpleMemory::ram("MEMORY");
        memory.load(0, program);
        let id = bus.add_device(Box::new(memory));
        bus.attach_memory(id);
        (Intel8080::new("CPU"), bus)
    }

    #[test]
    fn test_opcode_table() {
        let cpu = Intel8080::new("CPU");
        let mvi = cpu.opcode(0x3e);
        assert_eq!(mvi.mnemonic, "MVI");
        assert_eq!(mvi.parameters, "A,n");
        assert_eq!(mvi.length, 2);
        assert_eq!(cpu.opcode(0xcd).kind, K::CALL | K::MEMORY_WRITE);
        assert_eq!(cpu.opcode(0xc3).length, 3);
        assert_eq!(cpu.opcode(0x76).kind, K::HALT);
        assert!(cpu.opcode(0xdd).kind.contains(K::UNDOCUMENTED));
        assert!(cpu.opcode(0xd9).kind.contains(K::RETURN));
        assert_eq!(cpu.opcode(0xf5).parameters, "PSW");
        assert_eq!(cpu.opcode(0xff).parameters, "7");
    }

    #[test]
    fn test_disassembly() {
        let (cpu, bus) = machine(&[0x3e, 0x05, 0xc3, 0x34, 0x12, 0x70]);
        let memory = bus.memory().unwrap();
        assert_eq!(cpu.disassemble(memory, 0).simplified(), "MVI A,05");
        let jump = cpu.disassemble(memory, 2);
        assert_eq!(jump.simplified(), "JMP 1234");
        assert_eq!(jump.bytes, vec![0xc3, 0x34, 0x12]);
        assert_eq!(cpu.disassemble(memory, 5).simplified(), "MOV M,B");
    }

    #[test]
    fn test_arithmetic_flags() {
        // MVI A,0x3a; ADI 0xc6; DAA
        let (mut cpu, mut bus) = machine(&[0x3e, 0x3a, 0xc6, 0xc6, 0x27]);
        cpu.step(&mut bus);
        cpu.step(&mut bus);
        assert_eq!(cpu.a, 0x00);
        assert!(cpu.flag(ZF));
        assert!(cpu.flag(CF));
        assert!(cpu.flag(AF));
        assert!(cpu.flag(PF));
        assert_eq!(cpu.system_clock(), 14);
    }

    #[test]
    fn test_subtract_and_compare() {
        // MVI A,5; SUI 7; CPI 0xfe
        let (mut cpu, mut bus) = machine(&[0x3e, 0x05, 0xd6, 0x07, 0xfe, 0xfe]);
        cpu.run(&mut bus, 14);
        assert_eq!(cpu.a, 0xfe);
        assert!(cpu.flag(CF));
        assert!(cpu.flag(SF));
        cpu.step(&mut bus);
        assert!(cpu.flag(ZF));
        assert!(!cpu.flag(CF));
    }

    #[test]
    fn test_daa_bcd_addition() {
        // MVI A,0x19; ADI 0x28; DAA -> 0x47
        let (mut cpu, mut bus) = machine(&[0x3e, 0x19, 0xc6, 0x28, 0x27]);
        for _ in 0..3 {
            cpu.step(&mut bus);
        }
        assert_eq!(cpu.a, 0x47);
        assert!(!cpu.flag(CF));
    }

    #[test]
    fn test_call_and_return() {
        // LXI SP,0x2000; CALL 0x0010; HLT ... 0x0010: MVI B,0x42; RET
        let mut program = vec![0x31, 0x00, 0x20, 0xcd, 0x10, 0x00, 0x76];
        program.resize(0x10, 0);
        program.extend([0x06, 0x42, 0xc9]);
        let (mut cpu, mut bus) = machine(&program);
        cpu.run(&mut bus, 100);
        assert_eq!(cpu.b, 0x42);
        assert!(cpu.is_halted());
        assert_eq!(cpu.pc, 0x0006);
        assert_eq!(cpu.sp, 0x2000);
        assert_eq!(bus.peek(0x1ffe), 0x06);
    }

    #[test]
    fn test_push_pop_psw() {
        // LXI SP,0x100; MVI A,0x80; ORA A; PUSH PSW; POP B
        let (mut cpu, mut bus) = machine(&[0x31, 0x00, 0x01, 0x3e, 0x80, 0xb7, 0xf5, 0xc1]);
        for _ in 0..5 {
            cpu.step(&mut bus);
        }
        assert_eq!(cpu.b, 0x80);
        assert_eq!(cpu.c, SF | ONE);
    }

    #[test]
    fn test_interrupt_wakes_halt() {
        // EI; HLT
        let (mut cpu, mut bus) = machine(&[0xfb, 0x76]);
        cpu.sp = 0x1000;
        cpu.run(&mut bus, 50);
        assert!(cpu.is_halted());
        assert_eq!(cpu.pc, 0x0001);

        cpu.request_interrupt(3);
        cpu.step(&mut bus);
        assert!(!cpu.is_halted());
        assert!(!cpu.ie);
        assert_eq!(cpu.pc, 0x0018);
        // return address is past the HLT
        assert_eq!(bus.peek(0x0ffe), 0x02);
    }

    #[test]
    fn test_ei_delays_acceptance_by_one_instruction() {
        // EI; MVI A,1; MVI A,2
        let (mut cpu, mut bus) = machine(&[0xfb, 0x3e, 0x01, 0x3e, 0x02]);
        cpu.sp = 0x1000;
        cpu.step(&mut bus);
        cpu.request_interrupt(1);
        cpu.step(&mut bus);
        assert_eq!(cpu.a, 1);
        cpu.step(&mut bus);
        assert_eq!(cpu.pc, 0x0008);
    }

    #[test]
    fn test_interrupts_wait_while_disabled() {
        let (mut cpu, mut bus) = machine(&[0x00, 0x00, 0xfb, 0x00, 0x00]);
        cpu.sp = 0x1000;
        cpu.request_interrupt(7);
        cpu.request_interrupt(2);
        cpu.run(&mut bus, 8);
        assert_eq!(cpu.pc, 2);
        // EI, then one more instruction before acceptance
        cpu.run(&mut bus, 12);
        assert_eq!(cpu.pc, 0x0010);
        assert_eq!(cpu.core.interrupts.pending_mask(), 0x80);
    }

    #[test]
    fn test_nmi_is_ignored() {
        let (mut cpu, mut bus) = machine(&[0x00]);
        cpu.request_nmi();
        cpu.step(&mut bus);
        assert_eq!(cpu.pc, 1);
    }

    #[test]
    fn test_breakpoint_on_loop_head() {
        // MVI A,1; loop: INR B; JMP loop
        let (mut cpu, mut bus) = machine(&[0x3e, 0x01, 0x04, 0xc3, 0x02, 0x00]);
        let breakpoints: HashSet<u16> = [0x0002].into_iter().collect();
        let reason = cpu.exec(&mut bus, 10_000, K::NONE, &breakpoints);
        assert_eq!(reason, StopReason::Breakpoint);
        assert_eq!(cpu.pc, 0x0002);
        assert_eq!(cpu.a, 1);
        assert_eq!(cpu.b, 0);

        cpu.exec(&mut bus, 10_000, K::NONE, &breakpoints);
        assert_eq!(cpu.pc, 0x0002);
        assert_eq!(cpu.b, 1);
    }

    #[test]
    fn test_stop_mask_halts_before_call() {
        // NOP; CALL 0x0100
        let (mut cpu, mut bus) = machine(&[0x00, 0xcd, 0x00, 0x01]);
        let reason = cpu.exec(&mut bus, 1000, K::CALL, &HashSet::new());
        assert_eq!(reason, StopReason::Masked);
        assert_eq!(cpu.pc, 1);
    }

    #[test]
    fn test_reset_request() {
        let (mut cpu, mut bus) = machine(&[0xfb, 0x00, 0x00]);
        cpu.step(&mut bus);
        assert!(cpu.ie);
        let clock = cpu.system_clock();
        cpu.request_reset();
        cpu.step(&mut bus);
        assert_eq!(cpu.pc, 0);
        assert!(!cpu.ie);
        assert_eq!(cpu.system_clock(), clock);
    }

    #[test]
    fn test_snapshot_round_trip() {
        let (mut cpu, _bus) = machine(&[]);
        cpu.a = 0x12;
        cpu.set_hl(0xbeef);
        cpu.sp = 0x4000;
        cpu.ie = true;
        cpu.request_interrupt(4);
        let mut state = DeviceState::new("CPU");
        cpu.marshal(&mut state);

        let mut restored = Intel8080::new("CPU");
        restored.unmarshal(&state).unwrap();
        assert_eq!(restored.state_string(), cpu.state_string());
        assert_eq!(restored.core.interrupts.pending_mask(), 0x10);
    }
}
