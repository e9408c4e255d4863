//! Zilog Z80.
//!
//! Documented instruction set plus the common undocumented behaviour:
//! index register halves, SLL, the DDCB register copy, ED no-ops and the
//! Y/X flag bits. Interrupt modes 0, 1 and 2 and NMI are supported; in
//! mode 0 the device is assumed to place `RST level` on the bus.

use super::processor::{fill_template, peek_bytes, Disassembly, Opcode, Processor, ProcessorCore};
use super::z80_alu::{self as alu, CF, HF, NF, PF, SF, XF, YF, ZF};
use super::z80_decode::{decode, tables, INTERRUPT_MODES};
use crate::bus::Bus;
use crate::component::Memory;
use crate::snapshot::{DeviceState, SnapshotError};
use crate::types::InstructionKind;
use log::trace;

pub const NMI_VECTOR: u16 = 0x0066;
pub const IM1_VECTOR: u16 = 0x0038;

/// Which register an `HL` operand names under the current prefix
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Index {
    Hl,
    Ix,
    Iy,
}

pub struct ZilogZ80 {
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
    pub af_alt: u16,
    pub bc_alt: u16,
    pub de_alt: u16,
    pub hl_alt: u16,
    pub ix: u16,
    pub iy: u16,
    pub sp: u16,
    pub pc: u16,
    pub i: u8,
    pub r: u8,
    pub iff1: bool,
    pub iff2: bool,
    pub im: u8,
    pub halted: bool,
    ei_delay: bool,
}

impl ZilogZ80 {
    pub fn new(name: &str) -> Self {
        let mut cpu = ZilogZ80 {
            name: name.to_string(),
            core: ProcessorCore::new(),
            a: 0,
            f: 0,
            b: 0,
            c: 0,
            d: 0,
            e: 0,
            h: 0,
            l: 0,
            af_alt: 0,
            bc_alt: 0,
            de_alt: 0,
            hl_alt: 0,
            ix: 0,
            iy: 0,
            sp: 0,
            pc: 0,
            i: 0,
            r: 0,
            iff1: false,
            iff2: false,
            im: 0,
            halted: false,
            ei_delay: false,
        };
        cpu.reset();
        cpu
    }

    pub fn af(&self) -> u16 {
        u16::from_be_bytes([self.a, self.f])
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

    pub fn set_af(&mut self, value: u16) {
        [self.a, self.f] = value.to_be_bytes();
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

    pub fn flag(&self, flag: u8) -> bool {
        self.f & flag != 0
    }

    fn increment_r(&mut self) {
        self.r = (self.r & 0x80) | (self.r.wrapping_add(1) & 0x7f);
    }

    fn decrement_r(&mut self) {
        self.r = (self.r & 0x80) | (self.r.wrapping_sub(1) & 0x7f);
    }

    fn fetch(&mut self, bus: &mut Bus) -> u8 {
        let value = bus.read_byte(self.pc);
        self.pc = self.pc.wrapping_add(1);
        value
    }

    /// M1 cycle: also refreshes R
    fn fetch_opcode(&mut self, bus: &mut Bus) -> u8 {
        self.increment_r();
        self.fetch(bus)
    }

    fn fetch_word(&mut self, bus: &mut Bus) -> u16 {
        let low = self.fetch(bus);
        let high = self.fetch(bus);
        u16::from_le_bytes([low, high])
    }

    fn relative_jump(&mut self, offset: u8) {
        self.pc = self.pc.wrapping_add(offset as i8 as u16);
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

    fn index_register(&self, index: Index) -> u16 {
        match index {
            Index::Hl => self.hl(),
            Index::Ix => self.ix,
            Index::Iy => self.iy,
        }
    }

    fn set_index_register(&mut self, index: Index, value: u16) {
        match index {
            Index::Hl => self.set_hl(value),
            Index::Ix => self.ix = value,
            Index::Iy => self.iy = value,
        }
    }

    /// Register `r` other than `(HL)`; H and L follow the index prefix
    fn get_reg(&self, r: usize, index: Index) -> u8 {
        match r {
            0 => self.b,
            1 => self.c,
            2 => self.d,
            3 => self.e,
            4 => self.index_register(index).to_be_bytes()[0],
            5 => self.index_register(index).to_be_bytes()[1],
            7 => self.a,
            _ => unreachable!("memory operand read as a register"),
        }
    }

    fn set_reg(&mut self, r: usize, index: Index, value: u8) {
        match r {
            0 => self.b = value,
            1 => self.c = value,
            2 => self.d = value,
            3 => self.e = value,
            4 | 5 => {
                let mut bytes = self.index_register(index).to_be_bytes();
                bytes[r - 4] = value;
                self.set_index_register(index, u16::from_be_bytes(bytes));
            }
            7 => self.a = value,
            _ => unreachable!("memory operand written as a register"),
        }
    }

    fn get_rp(&self, p: usize, index: Index) -> u16 {
        match p {
            0 => self.bc(),
            1 => self.de(),
            2 => self.index_register(index),
            _ => self.sp,
        }
    }

    fn set_rp(&mut self, p: usize, index: Index, value: u16) {
        match p {
            0 => self.set_bc(value),
            1 => self.set_de(value),
            2 => self.set_index_register(index, value),
            _ => self.sp = value,
        }
    }

    /// Address of a `(HL)` operand and the extra cycles an index costs
    fn memory_operand(&mut self, bus: &mut Bus, index: Index) -> (u16, u64) {
        match index {
            Index::Hl => (self.hl(), 0),
            _ => {
                let offset = self.fetch(bus);
                let base = self.index_register(index);
                (base.wrapping_add(offset as i8 as u16), 8)
            }
        }
    }

    fn alu(&mut self, operation: usize, value: u8) {
        let carry = self.flag(CF);
        let result = match operation {
            0 => alu::add8(self.a, value, false),
            1 => alu::add8(self.a, value, carry),
            2 => alu::sub8(self.a, value, false),
            3 => alu::sub8(self.a, value, carry),
            4 => alu::and8(self.a, value),
            5 => alu::xor8(self.a, value),
            6 => alu::or8(self.a, value),
            _ => alu::cp8(self.a, value),
        };
        self.a = result.value;
        self.f = result.flags;
    }

    fn accumulator_op(&mut self, operation: usize) {
        let kept = self.f & (SF | ZF | PF);
        let carry = self.flag(CF) as u8;
        match operation {
            0 => {
                self.a = self.a.rotate_left(1);
                self.f = kept | (self.a & (YF | XF)) | (self.a & 1);
            }
            1 => {
                let out = self.a & 1;
                self.a = self.a.rotate_right(1);
                self.f = kept | (self.a & (YF | XF)) | out;
            }
            2 => {
                let out = self.a >> 7;
                self.a = self.a << 1 | carry;
                self.f = kept | (self.a & (YF | XF)) | out;
            }
            3 => {
                let out = self.a & 1;
                self.a = self.a >> 1 | carry << 7;
                self.f = kept | (self.a & (YF | XF)) | out;
            }
            4 => {
                let result = alu::daa(self.a, self.f);
                self.a = result.value;
                self.f = result.flags;
            }
            5 => {
                self.a = !self.a;
                self.f = (self.f & (SF | ZF | PF | CF)) | HF | NF | (self.a & (YF | XF));
            }
            6 => self.f = kept | (self.a & (YF | XF)) | CF,
            _ => {
                let half = if carry != 0 { HF } else { CF };
                self.f = kept | (self.a & (YF | XF)) | half;
            }
        }
    }

    fn execute_main(&mut self, bus: &mut Bus, op: u8, index: Index) -> u64 {
        let y = ((op >> 3) & 7) as usize;
        let z = (op & 7) as usize;
        let p = y >> 1;
        let q = y & 1;

        match op >> 6 {
            0 => match z {
                0 => match y {
                    0 => 4,
                    1 => {
                        let af = self.af();
                        self.set_af(self.af_alt);
                        self.af_alt = af;
                        4
                    }
                    2 => {
                        let offset = self.fetch(bus);
                        self.b = self.b.wrapping_sub(1);
                        if self.b != 0 {
                            self.relative_jump(offset);
                            13
                        } else {
                            8
                        }
                    }
                    3 => {
                        let offset = self.fetch(bus);
                        self.relative_jump(offset);
                        12
                    }
                    _ => {
                        let offset = self.fetch(bus);
                        if self.condition(y - 4) {
                            self.relative_jump(offset);
                            12
                        } else {
                            7
                        }
                    }
                },
                1 if q == 0 => {
                    let value = self.fetch_word(bus);
                    self.set_rp(p, index, value);
                    10
                }
                1 => {
                    let (sum, flags) = alu::add16(self.get_rp(2, index), self.get_rp(p, index));
                    self.f = (self.f & (SF | ZF | PF)) | flags;
                    self.set_rp(2, index, sum);
                    11
                }
                2 => match y {
                    0 | 2 => {
                        bus.write_byte(self.get_rp(p, index), self.a);
                        7
                    }
                    1 | 3 => {
                        self.a = bus.read_byte(self.get_rp(p, index));
                        7
                    }
                    4 => {
                        let address = self.fetch_word(bus);
                        Self::write_word(bus, address, self.index_register(index));
                        16
                    }
                    5 => {
                        let address = self.fetch_word(bus);
                        let value = Self::read_word(bus, address);
                        self.set_index_register(index, value);
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
                    let value = self.get_rp(p, index);
                    let value = if q == 0 {
                        value.wrapping_add(1)
                    } else {
                        value.wrapping_sub(1)
                    };
                    self.set_rp(p, index, value);
                    6
                }
                4 | 5 => {
                    let step = |value| if z == 4 { alu::inc8(value) } else { alu::dec8(value) };
                    if y == 6 {
                        let (address, extra) = self.memory_operand(bus, index);
                        let result = step(bus.read_byte(address));
                        bus.write_byte(address, result.value);
                        self.f = (self.f & CF) | result.flags;
                        11 + extra
                    } else {
                        let result = step(self.get_reg(y, index));
                        self.set_reg(y, index, result.value);
                        self.f = (self.f & CF) | result.flags;
                        4
                    }
                }
                6 => {
                    if y == 6 {
                        let (address, extra) = self.memory_operand(bus, index);
                        let value = self.fetch(bus);
                        bus.write_byte(address, value);
                        // the displacement overlaps the operand fetch
                        if extra > 0 {
                            15
                        } else {
                            10
                        }
                    } else {
                        let value = self.fetch(bus);
                        self.set_reg(y, index, value);
                        7
                    }
                }
                _ => {
                    self.accumulator_op(y);
                    4
                }
            },
            1 if op == 0x76 => {
                self.halted = true;
                self.pc = self.pc.wrapping_sub(1);
                4
            }
            1 => {
                if z == 6 {
                    let (address, extra) = self.memory_operand(bus, index);
                    let value = bus.read_byte(address);
                    self.set_reg(y, Index::Hl, value);
                    7 + extra
                } else if y == 6 {
                    let (address, extra) = self.memory_operand(bus, index);
                    bus.write_byte(address, self.get_reg(z, Index::Hl));
                    7 + extra
                } else {
                    let value = self.get_reg(z, index);
                    self.set_reg(y, index, value);
                    4
                }
            }
            2 => {
                if z == 6 {
                    let (address, extra) = self.memory_operand(bus, index);
                    let value = bus.read_byte(address);
                    self.alu(y, value);
                    7 + extra
                } else {
                    self.alu(y, self.get_reg(z, index));
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
                        self.set_af(value);
                    } else {
                        self.set_rp(p, index, value);
                    }
                    10
                }
                1 => match p {
                    0 => {
                        self.pc = self.pop(bus);
                        10
                    }
                    1 => {
                        let (bc, de, hl) = (self.bc(), self.de(), self.hl());
                        self.set_bc(self.bc_alt);
                        self.set_de(self.de_alt);
                        self.set_hl(self.hl_alt);
                        self.bc_alt = bc;
                        self.de_alt = de;
                        self.hl_alt = hl;
                        4
                    }
                    2 => {
                        self.pc = self.index_register(index);
                        4
                    }
                    _ => {
                        self.sp = self.index_register(index);
                        6
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
                    0 => {
                        self.pc = self.fetch_word(bus);
                        10
                    }
                    1 => self.execute_cb(bus),
                    2 => {
                        let port = self.fetch(bus);
                        bus.port_output(&self.core.ports, port, self.a);
                        11
                    }
                    3 => {
                        let port = self.fetch(bus);
                        self.a = bus.port_input(&self.core.ports, port);
                        11
                    }
                    4 => {
                        let value = Self::read_word(bus, self.sp);
                        Self::write_word(bus, self.sp, self.index_register(index));
                        self.set_index_register(index, value);
                        19
                    }
                    5 => {
                        let de = self.de();
                        self.set_de(self.hl());
                        self.set_hl(de);
                        4
                    }
                    6 => {
                        self.iff1 = false;
                        self.iff2 = false;
                        4
                    }
                    _ => {
                        self.iff1 = true;
                        self.iff2 = true;
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
                        10
                    }
                }
                5 if q == 0 => {
                    let value = if p == 3 { self.af() } else { self.get_rp(p, index) };
                    self.push(bus, value);
                    11
                }
                5 => match p {
                    0 => {
                        let address = self.fetch_word(bus);
                        self.push(bus, self.pc);
                        self.pc = address;
                        17
                    }
                    1 => self.execute_indexed(bus, Index::Ix),
                    2 => self.execute_ed(bus),
                    _ => self.execute_indexed(bus, Index::Iy),
                },
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

    fn execute_indexed(&mut self, bus: &mut Bus, index: Index) -> u64 {
        let op = self.fetch_opcode(bus);
        match op {
            0xdd | 0xed | 0xfd => {
                // lone prefix: the next byte starts a new instruction
                self.pc = self.pc.wrapping_sub(1);
                self.decrement_r();
                4
            }
            0xcb => self.execute_indexed_cb(bus, index),
            _ => 4 + self.execute_main(bus, op, index),
        }
    }

    fn bit(&mut self, bit: usize, value: u8) {
        let tested = value & (1 << bit);
        let mut flags = (self.f & CF) | HF | (value & (YF | XF));
        if tested == 0 {
            flags |= ZF | PF;
        }
        if bit == 7 && tested != 0 {
            flags |= SF;
        }
        self.f = flags;
    }

    /// Shift, RES or SET for CB group `x`
    fn transform(&mut self, x: u8, y: usize, value: u8) -> u8 {
        match x {
            0 => {
                let result = alu::shift(y, value, self.flag(CF));
                self.f = result.flags;
                result.value
            }
            2 => value & !(1 << y),
            _ => value | (1 << y),
        }
    }

    fn execute_cb(&mut self, bus: &mut Bus) -> u64 {
        let op = self.fetch_opcode(bus);
        let x = op >> 6;
        let y = ((op >> 3) & 7) as usize;
        let z = (op & 7) as usize;
        if z == 6 {
            let address = self.hl();
            let value = bus.read_byte(address);
            if x == 1 {
                self.bit(y, value);
                return 12;
            }
            let result = self.transform(x, y, value);
            bus.write_byte(address, result);
            15
        } else {
            let value = self.get_reg(z, Index::Hl);
            if x == 1 {
                self.bit(y, value);
            } else {
                let result = self.transform(x, y, value);
                self.set_reg(z, Index::Hl, result);
            }
            8
        }
    }

    fn execute_indexed_cb(&mut self, bus: &mut Bus, index: Index) -> u64 {
        let offset = self.fetch(bus);
        let op = self.fetch(bus);
        let address = self.index_register(index).wrapping_add(offset as i8 as u16);
        let x = op >> 6;
        let y = ((op >> 3) & 7) as usize;
        let z = (op & 7) as usize;
        let value = bus.read_byte(address);
        if x == 1 {
            self.bit(y, value);
            return 20;
        }
        let result = self.transform(x, y, value);
        bus.write_byte(address, result);
        if z != 6 {
            self.set_reg(z, Index::Hl, result);
        }
        23
    }

    fn execute_ed(&mut self, bus: &mut Bus) -> u64 {
        let op = self.fetch_opcode(bus);
        let y = ((op >> 3) & 7) as usize;
        let z = (op & 7) as usize;
        let p = y >> 1;
        let q = y & 1;

        match op >> 6 {
            1 => match z {
                0 => {
                    let value = bus.port_input(&self.core.ports, self.c);
                    self.f = (self.f & CF) | alu::sz53p(value);
                    if y != 6 {
                        self.set_reg(y, Index::Hl, value);
                    }
                    12
                }
                1 => {
                    let value = if y == 6 { 0 } else { self.get_reg(y, Index::Hl) };
                    bus.port_output(&self.core.ports, self.c, value);
                    12
                }
                2 => {
                    let carry = self.flag(CF);
                    let (value, flags) = if q == 0 {
                        alu::sbc16(self.hl(), self.get_rp(p, Index::Hl), carry)
                    } else {
                        alu::adc16(self.hl(), self.get_rp(p, Index::Hl), carry)
                    };
                    self.set_hl(value);
                    self.f = flags;
                    15
                }
                3 => {
                    let address = self.fetch_word(bus);
                    if q == 0 {
                        Self::write_word(bus, address, self.get_rp(p, Index::Hl));
                    } else {
                        let value = Self::read_word(bus, address);
                        self.set_rp(p, Index::Hl, value);
                    }
                    20
                }
                4 => {
                    let result = alu::sub8(0, self.a, false);
                    self.a = result.value;
                    self.f = result.flags;
                    8
                }
                5 => {
                    self.pc = self.pop(bus);
                    self.iff1 = self.iff2;
                    14
                }
                6 => {
                    self.im = INTERRUPT_MODES[y];
                    8
                }
                _ => match y {
                    0 => {
                        self.i = self.a;
                        9
                    }
                    1 => {
                        self.r = self.a;
                        9
                    }
                    2 | 3 => {
                        self.a = if y == 2 { self.i } else { self.r };
                        let parity = if self.iff2 { PF } else { 0 };
                        self.f = (self.f & CF) | alu::sz53(self.a) | parity;
                        9
                    }
                    4 | 5 => {
                        let address = self.hl();
                        let value = bus.read_byte(address);
                        let (memory, a) = if y == 4 {
                            (self.a << 4 | value >> 4, (self.a & 0xf0) | (value & 0x0f))
                        } else {
                            (value << 4 | (self.a & 0x0f), (self.a & 0xf0) | (value >> 4))
                        };
                        bus.write_byte(address, memory);
                        self.a = a;
                        self.f = (self.f & CF) | alu::sz53p(a);
                        18
                    }
                    _ => 8,
                },
            },
            2 if z <= 3 && y >= 4 => self.block(bus, y, z),
            _ => 8,
        }
    }

    /// LDI/CPI/INI/OUTI and their decrementing and repeating forms
    fn block(&mut self, bus: &mut Bus, y: usize, z: usize) -> u64 {
        let step: u16 = if y & 1 == 0 { 1 } else { 0xffff };
        let repeat = y >= 6;
        let hl = self.hl();
        let again = match z {
            0 => {
                let value = bus.read_byte(hl);
                bus.write_byte(self.de(), value);
                self.set_hl(hl.wrapping_add(step));
                self.set_de(self.de().wrapping_add(step));
                let count = self.bc().wrapping_sub(1);
                self.set_bc(count);
                let n = value.wrapping_add(self.a);
                let mut flags = (self.f & (SF | ZF | CF)) | (n & XF) | ((n << 4) & YF);
                if count != 0 {
                    flags |= PF;
                }
                self.f = flags;
                count != 0
            }
            1 => {
                let value = bus.read_byte(hl);
                let result = alu::sub8(self.a, value, false);
                self.set_hl(hl.wrapping_add(step));
                let count = self.bc().wrapping_sub(1);
                self.set_bc(count);
                let n = result.value.wrapping_sub((result.flags & HF != 0) as u8);
                let mut flags = (self.f & CF)
                    | NF
                    | (result.flags & (SF | ZF | HF))
                    | (n & XF)
                    | ((n << 4) & YF);
                if count != 0 {
                    flags |= PF;
                }
                self.f = flags;
                count != 0 && result.value != 0
            }
            2 => {
                let value = bus.port_input(&self.core.ports, self.c);
                bus.write_byte(hl, value);
                self.set_hl(hl.wrapping_add(step));
                self.b = self.b.wrapping_sub(1);
                self.f = (self.f & CF) | NF | alu::sz53(self.b);
                self.b != 0
            }
            _ => {
                let value = bus.read_byte(hl);
                self.b = self.b.wrapping_sub(1);
                bus.port_output(&self.core.ports, self.c, value);
                self.set_hl(hl.wrapping_add(step));
                self.f = (self.f & CF) | NF | alu::sz53(self.b);
                self.b != 0
            }
        };
        if repeat && again {
            self.pc = self.pc.wrapping_sub(2);
            21
        } else {
            16
        }
    }

    fn leave_halt(&mut self) {
        if self.halted {
            self.halted = false;
            self.pc = self.pc.wrapping_add(1);
        }
    }
}

impl Processor for ZilogZ80 {
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
        self.iff1 = false;
        self.iff2 = false;
        self.im = 0;
        self.i = 0;
        self.r = 0;
        self.set_af(0xffff);
        self.set_bc(0xffff);
        self.set_de(0xffff);
        self.set_hl(0xffff);
        self.af_alt = 0xffff;
        self.bc_alt = 0xffff;
        self.de_alt = 0xffff;
        self.hl_alt = 0xffff;
        self.sp = 0xffff;
        self.ix = 0xffff;
        self.iy = 0xffff;
        self.halted = false;
        self.ei_delay = false;
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

    fn service_interrupt(&mut self, bus: &mut Bus) -> Option<u64> {
        if self.core.interrupts.take_nmi() {
            trace!("{}: NMI accepted", self.name);
            self.leave_halt();
            self.increment_r();
            self.iff2 = self.iff1;
            self.iff1 = false;
            self.push(bus, self.pc);
            self.pc = NMI_VECTOR;
            return Some(11);
        }
        if !self.iff1 || self.ei_delay {
            return None;
        }
        let level = self.core.interrupts.highest()?;
        self.core.interrupts.acknowledge(level);
        trace!("{}: interrupt {} accepted in IM{}", self.name, level, self.im);
        self.leave_halt();
        self.increment_r();
        self.iff1 = false;
        self.iff2 = false;
        self.push(bus, self.pc);
        match self.im {
            0 => {
                self.pc = level as u16 * 8;
                Some(13)
            }
            1 => {
                self.pc = IM1_VECTOR;
                Some(13)
            }
            _ => {
                let vector = u16::from_be_bytes([self.i, level * 2]);
                self.pc = Self::read_word(bus, vector);
                Some(19)
            }
        }
    }

    fn execute(&mut self, bus: &mut Bus) -> u64 {
        self.ei_delay = false;
        let op = self.fetch_opcode(bus);
        self.execute_main(bus, op, Index::Hl)
    }

    fn kind_at(&self, bus: &Bus) -> InstructionKind {
        decode(|address| bus.peek(address), self.pc).opcode.kind
    }

    fn opcode(&self, byte: u8) -> &'static Opcode {
        &tables().base[byte as usize]
    }

    fn disassemble(&self, memory: &dyn Memory, address: u16) -> Disassembly {
        let decoded = decode(|at| memory.peek(at), address);
        let bytes = peek_bytes(memory, address, decoded.length());
        let operands = if decoded.displacement_first {
            &bytes[2..3]
        } else {
            &bytes[decoded.prefix_length + 1..]
        };
        let next = address.wrapping_add(bytes.len() as u16);
        Disassembly {
            address,
            parameters: fill_template(&decoded.opcode.parameters, operands, next),
            mnemonic: decoded.opcode.mnemonic.to_string(),
            prefix_length: decoded.prefix_length,
            kind: decoded.opcode.kind,
            bytes,
        }
    }

    fn state_string(&self) -> String {
        format!(
            "PC:{:04x} SP:{:04x} AF:{:04x} BC:{:04x} DE:{:04x} HL:{:04x} IX:{:04x} IY:{:04x} I:{:02x} R:{:02x} IM:{} IFF:{}",
            self.pc,
            self.sp,
            self.af(),
            self.bc(),
            self.de(),
            self.hl(),
            self.ix,
            self.iy,
            self.i,
            self.r,
            self.im,
            self.iff1 as u8
        )
    }

    fn marshal(&self, state: &mut DeviceState) {
        state.put("AF", self.af());
        state.put("BC", self.bc());
        state.put("DE", self.de());
        state.put("HL", self.hl());
        state.put("AF'", self.af_alt);
        state.put("BC'", self.bc_alt);
        state.put("DE'", self.de_alt);
        state.put("HL'", self.hl_alt);
        state.put("IX", self.ix);
        state.put("IY", self.iy);
        state.put("SP", self.sp);
        state.put("PC", self.pc);
        state.put("I", self.i);
        state.put("R", self.r);
        state.put("IFF1", self.iff1);
        state.put("IFF2", self.iff2);
        state.put("IM", self.im);
        state.put("TID", self.ei_delay);
        state.put("HALTED", self.halted);
        self.core.marshal(state);
    }

    fn unmarshal(&mut self, state: &DeviceState) -> Result<(), SnapshotError> {
        self.set_af(state.read("AF")?);
        self.set_bc(state.read("BC")?);
        self.set_de(state.read("DE")?);
        self.set_hl(state.read("HL")?);
        self.af_alt = state.read("AF'")?;
        self.bc_alt = state.read("BC'")?;
        self.de_alt = state.read("DE'")?;
        self.hl_alt = state.read("HL'")?;
        self.ix = state.read("IX")?;
        self.iy = state.read("IY")?;
        self.sp = state.read("SP")?;
        self.pc = state.read("PC")?;
        self.i = state.read("I")?;
        self.r = state.read("R")?;
        self.iff1 = state.read("IFF1")?;
        self.iff2 = state.read("IFF2")?;
        let im: u8 = state.read("IM")?;
        if im > 2 {
            return Err(SnapshotError::BadRegister {
                register: "IM".to_string(),
                value: im.to_string(),
            });
        }
        self.im = im;
        self.ei_delay = state.read("TID")?;
        self.halted = state.read("HALTED")?;
        self.core.unmarshal(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::io::OutputLatch;
    use crate::components::memory::SimpleMemory;
    use crate::types::InstructionKind as K;

    fn machine(program: &[u8]) -> (ZilogZ80, Bus) {
        let mut bus = Bus::new();
        let mut memory = SimpleMemory::ram("MEMORY");
        memory.load(0, program);
        let id = bus.add_device(Box::new(memory));
        bus.attach_memory(id);
        let mut cpu = ZilogZ80::new("CPU");
        cpu.sp = 0x8000;
        (cpu, bus)
    }

    fn steps(cpu: &mut ZilogZ80, bus: &mut Bus, count: usize) {
        for _ in 0..count {
            cpu.step(bus);
        }
    }

    #[test]
    fn test_reset_state() {
        let cpu = ZilogZ80::new("CPU");
        assert_eq!(cpu.pc, 0);
        assert_eq!(cpu.af(), 0xffff);
        assert_eq!(cpu.hl_alt, 0xffff);
        assert_eq!(cpu.ix, 0xffff);
        assert_eq!(cpu.sp, 0xffff);
        assert_eq!(cpu.im, 0);
        assert!(!cpu.iff1);
    }

    #[test]
    fn test_load_and_add() {
        // LD A,0x7F; LD B,1; ADD A,B
        let (mut cpu, mut bus) = machine(&[0x3e, 0x7f, 0x06, 0x01, 0x80]);
        steps(&mut cpu, &mut bus, 3);
        assert_eq!(cpu.a, 0x80);
        assert!(cpu.flag(SF));
        assert!(cpu.flag(PF));
        assert!(cpu.flag(HF));
        assert!(!cpu.flag(CF));
        assert_eq!(cpu.system_clock(), 7 + 7 + 4);
    }

    #[test]
    fn test_djnz_loop_timing() {
        // LD B,3; loop: DJNZ loop
        let (mut cpu, mut bus) = machine(&[0x06, 0x03, 0x10, 0xfe]);
        steps(&mut cpu, &mut bus, 4);
        assert_eq!(cpu.b, 0);
        assert_eq!(cpu.pc, 4);
        assert_eq!(cpu.system_clock(), 7 + 13 + 13 + 8);
    }

    #[test]
    fn test_call_return_and_stack() {
        // CALL 0x0010; HALT ... 0x10: LD A,0x55; RET
        let mut program = vec![0xcd, 0x10, 0x00, 0x76];
        program.resize(0x10, 0);
        program.extend([0x3e, 0x55, 0xc9]);
        let (mut cpu, mut bus) = machine(&program);
        cpu.run(&mut bus, 200);
        assert_eq!(cpu.a, 0x55);
        assert!(cpu.is_halted());
        assert_eq!(cpu.pc, 3);
        assert_eq!(cpu.sp, 0x8000);
    }

    #[test]
    fn test_indexed_access() {
        // LD IX,0x2000; LD (IX+5),0x42; LD A,(IX+5); LD (IX-1),A
        let (mut cpu, mut bus) = machine(&[
            0xdd, 0x21, 0x00, 0x20, 0xdd, 0x36, 0x05, 0x42, 0xdd, 0x7e, 0x05, 0xdd, 0x77, 0xff,
        ]);
        steps(&mut cpu, &mut bus, 4);
        assert_eq!(cpu.ix, 0x2000);
        assert_eq!(bus.peek(0x2005), 0x42);
        assert_eq!(cpu.a, 0x42);
        assert_eq!(bus.peek(0x1fff), 0x42);
        assert_eq!(cpu.system_clock(), 14 + 19 + 19 + 19);
    }

    #[test]
    fn test_index_halves() {
        // LD IY,0x1234; LD A,IYH (FD 7C); LD IYL,A (FD 6F)
        let (mut cpu, mut bus) = machine(&[0xfd, 0x21, 0x34, 0x12, 0xfd, 0x7c, 0xfd, 0x6f]);
        steps(&mut cpu, &mut bus, 3);
        assert_eq!(cpu.a, 0x12);
        assert_eq!(cpu.iy, 0x1212);
        assert_eq!(cpu.hl(), 0xffff);
    }

    #[test]
    fn test_bit_set_res() {
        // LD HL,0x3000; SET 3,(HL); BIT 3,(HL); RES 3,(HL); BIT 3,(HL)
        let (mut cpu, mut bus) = machine(&[
            0x21, 0x00, 0x30, 0xcb, 0xde, 0xcb, 0x5e, 0xcb, 0x9e, 0xcb, 0x5e,
        ]);
        steps(&mut cpu, &mut bus, 3);
        assert_eq!(bus.peek(0x3000), 0x08);
        assert!(!cpu.flag(ZF));
        steps(&mut cpu, &mut bus, 2);
        assert_eq!(bus.peek(0x3000), 0x00);
        assert!(cpu.flag(ZF));
        assert_eq!(cpu.system_clock(), 10 + 15 + 12 + 15 + 12);
    }

    #[test]
    fn test_indexed_cb_copies_to_register() {
        // LD IX,0x3000; SET 0,(IX+2),B (DD CB 02 C0)
        let (mut cpu, mut bus) = machine(&[0xdd, 0x21, 0x00, 0x30, 0xdd, 0xcb, 0x02, 0xc0]);
        steps(&mut cpu, &mut bus, 2);
        assert_eq!(bus.peek(0x3002), 0x01);
        assert_eq!(cpu.b, 0x01);
        assert_eq!(cpu.system_clock(), 14 + 23);
    }

    #[test]
    fn test_ldir_block_copy() {
        // LD HL,0x0100; LD DE,0x0200; LD BC,3; LDIR
        let mut program = vec![0x21, 0x00, 0x01, 0x11, 0x00, 0x02, 0x01, 0x03, 0x00, 0xed, 0xb0];
        program.resize(0x100, 0);
        program.extend([0xaa, 0xbb, 0xcc]);
        let (mut cpu, mut bus) = machine(&program);
        steps(&mut cpu, &mut bus, 6);
        assert_eq!(bus.peek(0x0200), 0xaa);
        assert_eq!(bus.peek(0x0202), 0xcc);
        assert_eq!(cpu.bc(), 0);
        assert_eq!(cpu.pc, 11);
        assert!(!cpu.flag(PF));
        assert_eq!(cpu.system_clock(), 30 + 21 + 21 + 16);
    }

    #[test]
    fn test_sbc_and_adc_hl() {
        // LD HL,0x1000; LD DE,0x0001; OR A; SBC HL,DE; ADC HL,DE
        let (mut cpu, mut bus) = machine(&[
            0x21, 0x00, 0x10, 0x11, 0x01, 0x00, 0xb7, 0xed, 0x52, 0xed, 0x5a,
        ]);
        steps(&mut cpu, &mut bus, 4);
        assert_eq!(cpu.hl(), 0x0fff);
        assert!(cpu.flag(HF));
        assert!(cpu.flag(NF));
        cpu.step(&mut bus);
        assert_eq!(cpu.hl(), 0x1000);
        assert!(!cpu.flag(NF));
    }

    #[test]
    fn test_exchange_instructions() {
        // LD BC,0x1111; EXX; LD BC,0x2222; EXX; EX AF,AF'
        let (mut cpu, mut bus) = machine(&[0x01, 0x11, 0x11, 0xd9, 0x01, 0x22, 0x22, 0xd9, 0x08]);
        steps(&mut cpu, &mut bus, 5);
        assert_eq!(cpu.bc(), 0x1111);
        assert_eq!(cpu.bc_alt, 0x2222);
        assert_eq!(cpu.af(), 0xffff);
    }

    #[test]
    fn test_im1_interrupt() {
        // IM 1; EI; NOP; NOP
        let (mut cpu, mut bus) = machine(&[0xed, 0x56, 0xfb, 0x00, 0x00]);
        steps(&mut cpu, &mut bus, 2);
        cpu.request_interrupt(5);
        cpu.step(&mut bus);
        assert_eq!(cpu.pc, 4, "EI holds off acceptance for one instruction");
        cpu.step(&mut bus);
        assert_eq!(cpu.pc, IM1_VECTOR);
        assert!(!cpu.iff1);
        assert_eq!(bus.peek(0x7ffe), 0x04);
    }

    #[test]
    fn test_im2_vector_table() {
        // LD A,0x20; LD I,A; IM 2; EI; HALT
        let mut program = vec![0x3e, 0x20, 0xed, 0x47, 0xed, 0x5e, 0xfb, 0x76];
        program.resize(0x2006, 0);
        program.extend([0x34, 0x12]);
        let (mut cpu, mut bus) = machine(&program);
        cpu.run(&mut bus, 100);
        assert!(cpu.is_halted());
        cpu.request_interrupt(3);
        let before = cpu.system_clock();
        cpu.step(&mut bus);
        assert_eq!(cpu.pc, 0x1234);
        assert_eq!(cpu.system_clock() - before, 19);
        // returns past the HALT
        assert_eq!(bus.peek(0x7ffe), 0x08);
    }

    #[test]
    fn test_nmi_and_retn() {
        let mut program = vec![0xfb, 0x00, 0x00];
        program.resize(0x66, 0);
        program.extend([0xed, 0x45]);
        let (mut cpu, mut bus) = machine(&program);
        steps(&mut cpu, &mut bus, 2);
        cpu.request_nmi();
        cpu.step(&mut bus);
        assert_eq!(cpu.pc, NMI_VECTOR);
        assert!(!cpu.iff1);
        assert!(cpu.iff2);
        cpu.step(&mut bus);
        assert_eq!(cpu.pc, 2);
        assert!(cpu.iff1);
    }

    #[test]
    fn test_refresh_register_counts_fetches() {
        // NOP; LD IX,0; BIT 0,B
        let (mut cpu, mut bus) = machine(&[0x00, 0xdd, 0x21, 0x00, 0x00, 0xcb, 0x40]);
        steps(&mut cpu, &mut bus, 3);
        assert_eq!(cpu.r, 5);
    }

    #[test]
    fn test_stray_prefix_is_a_nop() {
        // DD FD 21 34 12: the DD is dropped, LD IY,0x1234 runs
        let (mut cpu, mut bus) = machine(&[0xdd, 0xfd, 0x21, 0x34, 0x12]);
        cpu.step(&mut bus);
        assert_eq!(cpu.pc, 1);
        assert_eq!(cpu.system_clock(), 4);
        cpu.step(&mut bus);
        assert_eq!(cpu.iy, 0x1234);
    }

    #[test]
    fn test_port_io() {
        // LD A,0x5A; OUT (0x10),A; IN A,(0x11)
        let (mut cpu, mut bus) = machine(&[0x3e, 0x5a, 0xd3, 0x10, 0xdb, 0x11]);
        let latch = bus.add_device(Box::new(OutputLatch::new("LATCH")));
        cpu.add_io_output(0x10, latch);
        steps(&mut cpu, &mut bus, 3);
        let mut state = DeviceState::new("LATCH");
        bus.device(latch).marshal(&mut state, 0);
        assert_eq!(state.get("REGISTER"), Some("90"));
        assert_eq!(cpu.a, 0xff);
    }

    #[test]
    fn test_disassembly() {
        let (cpu, bus) = machine(&[
            0xdd, 0x36, 0xfe, 0x42, // LD (IX-02),42
            0xfd, 0xcb, 0x03, 0x7e, // BIT 7,(IY+03)
            0x18, 0xfe, // JR 0008
            0xed, 0xb0, // LDIR
            0xcb, 0x11, // RL C
        ]);
        let memory = bus.memory().unwrap();
        let first = cpu.disassemble(memory, 0);
        assert_eq!(first.simplified(), "LD (IX-02),42");
        assert_eq!(first.prefix_length, 1);
        assert_eq!(cpu.disassemble(memory, 4).simplified(), "BIT 7,(IY+03)");
        assert_eq!(cpu.disassemble(memory, 8).simplified(), "JR 0008");
        assert_eq!(cpu.disassemble(memory, 10).simplified(), "LDIR");
        assert_eq!(cpu.disassemble(memory, 12).simplified(), "RL C");
    }

    #[test]
    fn test_kind_sees_through_prefixes() {
        let (mut cpu, bus) = machine(&[0xed, 0xb0, 0xdd, 0xe9, 0xcd, 0x00, 0x00]);
        assert!(cpu.kind_at(&bus).contains(K::MEMORY_WRITE));
        cpu.pc = 2;
        assert!(cpu.kind_at(&bus).contains(K::JUMP));
        cpu.pc = 4;
        assert!(cpu.kind_at(&bus).contains(K::CALL));
    }

    #[test]
    fn test_snapshot_round_trip() {
        let (mut cpu, _bus) = machine(&[]);
        cpu.set_bc(0x1234);
        cpu.ix = 0x4000;
        cpu.im = 2;
        cpu.iff1 = true;
        cpu.request_nmi();
        let mut state = DeviceState::new("CPU");
        cpu.marshal(&mut state);

        let mut restored = ZilogZ80::new("CPU");
        restored.unmarshal(&state).unwrap();
        assert_eq!(restored.state_string(), cpu.state_string());
        assert!(restored.core.interrupts.is_nmi_pending());

        state.put("IM", 3);
        assert!(restored.unmarshal(&state).is_err());
    }
}
