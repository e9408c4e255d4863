//! Z80 decode tables for disassembly and instruction classification.
//!
//! Tables are generated once from the x/y/z fields of each opcode. The
//! IX and IY tables are derived from the unprefixed one by rewriting HL
//! operands, so their templates always agree with the executed semantics.

use super::processor::Opcode;
use crate::types::InstructionKind as K;
use std::sync::OnceLock;

const REGISTERS: [&str; 8] = ["B", "C", "D", "E", "H", "L", "(HL)", "A"];
const PAIRS: [&str; 4] = ["BC", "DE", "HL", "SP"];
const PAIRS_AF: [&str; 4] = ["BC", "DE", "HL", "AF"];
const CONDITIONS: [&str; 8] = ["NZ", "Z", "NC", "C", "PO", "PE", "P", "M"];
const ALU: [&str; 8] = ["ADD", "ADC", "SUB", "SBC", "AND", "XOR", "OR", "CP"];
const ACCUMULATOR: [&str; 8] = ["RLCA", "RRCA", "RLA", "RRA", "DAA", "CPL", "SCF", "CCF"];
const SHIFTS: [&str; 8] = ["RLC", "RRC", "RL", "RR", "SLA", "SRA", "SLL", "SRL"];
const BLOCK: [[&str; 4]; 4] = [
    ["LDI", "CPI", "INI", "OUTI"],
    ["LDD", "CPD", "IND", "OUTD"],
    ["LDIR", "CPIR", "INIR", "OTIR"],
    ["LDDR", "CPDR", "INDR", "OTDR"],
];
pub const INTERRUPT_MODES: [u8; 8] = [0, 0, 1, 2, 0, 0, 1, 2];

fn fields(op: u8) -> (usize, usize, usize, usize) {
    let y = ((op >> 3) & 7) as usize;
    (y, (op & 7) as usize, y >> 1, y & 1)
}

/// `A,` prefix for the arithmetic group, as in `ADD A,B` but `SUB B`
fn alu_parameters(operation: usize, operand: &str) -> String {
    match operation {
        0 | 1 | 3 => format!("A,{}", operand),
        _ => operand.to_string(),
    }
}

fn memory_kind(r: usize, kind: K) -> K {
    if r == 6 {
        kind
    } else {
        K::NONE
    }
}

fn decode_base(op: u8) -> Opcode {
    let (y, z, p, q) = fields(op);
    let (mnemonic, parameters, kind): (&'static str, String, K) = match op >> 6 {
        0 => match z {
            0 => match y {
                0 => ("NOP", String::new(), K::NONE),
                1 => ("EX", "AF,AF'".to_string(), K::NONE),
                2 => ("DJNZ", "e".to_string(), K::JUMP),
                3 => ("JR", "e".to_string(), K::JUMP),
                _ => ("JR", format!("{},e", CONDITIONS[y - 4]), K::JUMP),
            },
            1 if q == 0 => ("LD", format!("{},nn", PAIRS[p]), K::NONE),
            1 => ("ADD", format!("HL,{}", PAIRS[p]), K::NONE),
            2 => match y {
                0 => ("LD", "(BC),A".to_string(), K::MEMORY_WRITE),
                1 => ("LD", "A,(BC)".to_string(), K::MEMORY_READ),
                2 => ("LD", "(DE),A".to_string(), K::MEMORY_WRITE),
                3 => ("LD", "A,(DE)".to_string(), K::MEMORY_READ),
                4 => ("LD", "(nn),HL".to_string(), K::MEMORY_WRITE),
                5 => ("LD", "HL,(nn)".to_string(), K::MEMORY_READ),
                6 => ("LD", "(nn),A".to_string(), K::MEMORY_WRITE),
                _ => ("LD", "A,(nn)".to_string(), K::MEMORY_READ),
            },
            3 if q == 0 => ("INC", PAIRS[p].to_string(), K::NONE),
            3 => ("DEC", PAIRS[p].to_string(), K::NONE),
            4 | 5 => (
                if z == 4 { "INC" } else { "DEC" },
                REGISTERS[y].to_string(),
                memory_kind(y, K::MEMORY_READ | K::MEMORY_WRITE),
            ),
            6 => (
                "LD",
                format!("{},n", REGISTERS[y]),
                memory_kind(y, K::MEMORY_WRITE),
            ),
            _ => (ACCUMULATOR[y], String::new(), K::NONE),
        },
        1 if op == 0x76 => ("HALT", String::new(), K::HALT),
        1 => (
            "LD",
            format!("{},{}", REGISTERS[y], REGISTERS[z]),
            memory_kind(y, K::MEMORY_WRITE) | memory_kind(z, K::MEMORY_READ),
        ),
        2 => (
            ALU[y],
            alu_parameters(y, REGISTERS[z]),
            memory_kind(z, K::MEMORY_READ),
        ),
        _ => match z {
            0 => ("RET", CONDITIONS[y].to_string(), K::RETURN | K::MEMORY_READ),
            1 if q == 0 => ("POP", PAIRS_AF[p].to_string(), K::MEMORY_READ),
            1 => match p {
                0 => ("RET", String::new(), K::RETURN | K::MEMORY_READ),
                1 => ("EXX", String::new(), K::NONE),
                2 => ("JP", "(HL)".to_string(), K::JUMP),
                _ => ("LD", "SP,HL".to_string(), K::NONE),
            },
            2 => ("JP", format!("{},nn", CONDITIONS[y]), K::JUMP),
            3 => match y {
                0 => ("JP", "nn".to_string(), K::JUMP),
                1 => ("PREFIX", "CB".to_string(), K::NONE),
                2 => ("OUT", "(n),A".to_string(), K::IO),
                3 => ("IN", "A,(n)".to_string(), K::IO),
                4 => ("EX", "(SP),HL".to_string(), K::MEMORY_READ | K::MEMORY_WRITE),
                5 => ("EX", "DE,HL".to_string(), K::NONE),
                6 => ("DI", String::new(), K::NONE),
                _ => ("EI", String::new(), K::NONE),
            },
            4 => (
                "CALL",
                format!("{},nn", CONDITIONS[y]),
                K::CALL | K::MEMORY_WRITE,
            ),
            5 if q == 0 => ("PUSH", PAIRS_AF[p].to_string(), K::MEMORY_WRITE),
            5 => match p {
                0 => ("CALL", "nn".to_string(), K::CALL | K::MEMORY_WRITE),
                1 => ("PREFIX", "DD".to_string(), K::NONE),
                2 => ("PREFIX", "ED".to_string(), K::NONE),
                _ => ("PREFIX", "FD".to_string(), K::NONE),
            },
            6 => (ALU[y], alu_parameters(y, "n"), K::NONE),
            _ => ("RST", format!("{:02X}H", y * 8), K::CALL | K::MEMORY_WRITE),
        },
    };
    Opcode::new(mnemonic, parameters, kind)
}

fn decode_cb(op: u8) -> Opcode {
    let (y, z, _, _) = fields(op);
    let access = memory_kind(z, K::MEMORY_READ | K::MEMORY_WRITE);
    match op >> 6 {
        0 => {
            let kind = if y == 6 { access | K::UNDOCUMENTED } else { access };
            Opcode::new(SHIFTS[y], REGISTERS[z].to_string(), kind)
        }
        1 => Opcode::new(
            "BIT",
            format!("{},{}", y, REGISTERS[z]),
            memory_kind(z, K::MEMORY_READ),
        ),
        2 => Opcode::new("RES", format!("{},{}", y, REGISTERS[z]), access),
        _ => Opcode::new("SET", format!("{},{}", y, REGISTERS[z]), access),
    }
}

fn decode_ed(op: u8) -> Opcode {
    let (y, z, p, q) = fields(op);
    let undocumented_nop = || Opcode::new("NOP", String::new(), K::UNDOCUMENTED);
    match op >> 6 {
        1 => match z {
            0 if y == 6 => Opcode::new("IN", "(C)".to_string(), K::IO | K::UNDOCUMENTED),
            0 => Opcode::new("IN", format!("{},(C)", REGISTERS[y]), K::IO),
            1 if y == 6 => Opcode::new("OUT", "(C),0".to_string(), K::IO | K::UNDOCUMENTED),
            1 => Opcode::new("OUT", format!("(C),{}", REGISTERS[y]), K::IO),
            2 if q == 0 => Opcode::new("SBC", format!("HL,{}", PAIRS[p]), K::NONE),
            2 => Opcode::new("ADC", format!("HL,{}", PAIRS[p]), K::NONE),
            3 if q == 0 => Opcode::new("LD", format!("(nn),{}", PAIRS[p]), K::MEMORY_WRITE),
            3 => Opcode::new("LD", format!("{},(nn)", PAIRS[p]), K::MEMORY_READ),
            4 if y == 0 => Opcode::new("NEG", String::new(), K::NONE),
            4 => Opcode::new("NEG", String::new(), K::UNDOCUMENTED),
            5 => {
                let mnemonic = if y == 1 { "RETI" } else { "RETN" };
                let mut kind = K::RETURN | K::MEMORY_READ;
                if y > 1 {
                    kind |= K::UNDOCUMENTED;
                }
                Opcode::new(mnemonic, String::new(), kind)
            }
            6 => {
                let kind = if matches!(y, 0 | 2 | 3) {
                    K::NONE
                } else {
                    K::UNDOCUMENTED
                };
                Opcode::new("IM", INTERRUPT_MODES[y].to_string(), kind)
            }
            _ => match y {
                0 => Opcode::new("LD", "I,A".to_string(), K::NONE),
                1 => Opcode::new("LD", "R,A".to_string(), K::NONE),
                2 => Opcode::new("LD", "A,I".to_string(), K::NONE),
                3 => Opcode::new("LD", "A,R".to_string(), K::NONE),
                4 => Opcode::new("RRD", String::new(), K::MEMORY_READ | K::MEMORY_WRITE),
                5 => Opcode::new("RLD", String::new(), K::MEMORY_READ | K::MEMORY_WRITE),
                _ => undocumented_nop(),
            },
        },
        2 if z <= 3 && y >= 4 => {
            let kind = match z {
                0 => K::MEMORY_READ | K::MEMORY_WRITE,
                1 => K::MEMORY_READ,
                2 => K::IO | K::MEMORY_WRITE,
                _ => K::IO | K::MEMORY_READ,
            };
            Opcode::new(BLOCK[y - 4][z], String::new(), kind)
        }
        _ => undocumented_nop(),
    }
}

/// Rewrite an unprefixed entry for IX or IY.
///
/// `(HL)` becomes `(IX+d)` and `HL` becomes `IX`; in instructions without
/// either, `H` and `L` name the undocumented index halves. An instruction
/// the prefix does not touch still decodes but is flagged undocumented.
fn decode_indexed(op: u8, register: &'static str) -> Opcode {
    let base = decode_base(op);
    let mut kind = base.kind;
    let parameters = if op == 0xe9 {
        format!("({})", register)
    } else if op == 0xeb {
        kind |= K::UNDOCUMENTED;
        base.parameters.clone()
    } else if base.parameters.contains("(HL)") {
        base.parameters.replace("(HL)", &format!("({}+d)", register))
    } else if base.parameters.contains("HL") {
        base.parameters.replace("HL", register)
    } else {
        let rewritten: Vec<String> = base
            .parameters
            .split(',')
            .map(|operand| match operand {
                "H" => format!("{}H", register),
                "L" => format!("{}L", register),
                other => other.to_string(),
            })
            .collect();
        // the prefix changed nothing or selected a half register
        kind |= K::UNDOCUMENTED;
        rewritten.join(",")
    };
    Opcode::new(base.mnemonic, parameters, kind)
}

/// `DD CB d op`: the displacement precedes the final opcode byte
fn decode_indexed_cb(op: u8, register: &'static str) -> Opcode {
    let (y, z, _, _) = fields(op);
    let operand = format!("({}+d)", register);
    let access = K::MEMORY_READ | K::MEMORY_WRITE;
    let copy = z != 6;
    let mut kind = if op >> 6 == 1 { K::MEMORY_READ } else { access };
    if copy || (op >> 6 == 0 && y == 6) {
        kind |= K::UNDOCUMENTED;
    }
    let parameters = match op >> 6 {
        0 if copy => format!("{},{}", operand, REGISTERS[z]),
        0 => operand,
        1 => format!("{},{}", y, operand),
        _ if copy => format!("{},{},{}", y, operand, REGISTERS[z]),
        _ => format!("{},{}", y, operand),
    };
    let mnemonic = match op >> 6 {
        0 => SHIFTS[y],
        1 => "BIT",
        2 => "RES",
        _ => "SET",
    };
    Opcode::new(mnemonic, parameters, kind)
}

pub struct Tables {
    pub base: Vec<Opcode>,
    pub cb: Vec<Opcode>,
    pub ed: Vec<Opcode>,
    pub ix: Vec<Opcode>,
    pub iy: Vec<Opcode>,
    pub ix_cb: Vec<Opcode>,
    pub iy_cb: Vec<Opcode>,
    pub stray_prefix: Opcode,
}

pub fn tables() -> &'static Tables {
    static TABLES: OnceLock<Tables> = OnceLock::new();
    TABLES.get_or_init(|| {
        let build = |f: &dyn Fn(u8) -> Opcode| (0..=255u8).map(f).collect::<Vec<_>>();
        Tables {
            base: build(&decode_base),
            cb: build(&decode_cb),
            ed: build(&decode_ed),
            ix: build(&|op| decode_indexed(op, "IX")),
            iy: build(&|op| decode_indexed(op, "IY")),
            ix_cb: build(&|op| decode_indexed_cb(op, "IX")),
            iy_cb: build(&|op| decode_indexed_cb(op, "IY")),
            stray_prefix: Opcode::new("NOP", String::new(), K::UNDOCUMENTED),
        }
    })
}

/// Table entry for the instruction at some address
#[derive(Debug, Clone, Copy)]
pub struct Decoded {
    pub prefix_length: usize,
    pub opcode: &'static Opcode,
    /// `DD CB d op` layout: the operand byte sits before the opcode
    pub displacement_first: bool,
}

impl Decoded {
    pub fn length(&self) -> usize {
        self.prefix_length + self.opcode.length as usize
    }
}

/// Decode the instruction at `address`, reading memory through `peek`
pub fn decode<F: Fn(u16) -> u8>(peek: F, address: u16) -> Decoded {
    let at = |offset: u16| peek(address.wrapping_add(offset)) as usize;
    let tables = tables();
    let plain = |prefix_length, opcode| Decoded {
        prefix_length,
        opcode,
        displacement_first: false,
    };
    match at(0) {
        0xcb => plain(1, &tables.cb[at(1)]),
        0xed => plain(1, &tables.ed[at(1)]),
        prefix @ (0xdd | 0xfd) => {
            let (table, cb_table) = if prefix == 0xdd {
                (&tables.ix, &tables.ix_cb)
            } else {
                (&tables.iy, &tables.iy_cb)
            };
            match at(1) {
                0xcb => Decoded {
                    prefix_length: 2,
                    opcode: &cb_table[at(3)],
                    displacement_first: true,
                },
                0xdd | 0xed | 0xfd => plain(0, &tables.stray_prefix),
                next => plain(1, &table[next]),
            }
        }
        op => plain(0, &tables.base[op]),
    }
}
