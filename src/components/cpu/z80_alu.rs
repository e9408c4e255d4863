//! Z80 flag bits and the arithmetic-logic unit.
//!
//! Every operation is a pure function of its inputs; the caller decides
//! which flags of the old F register survive.

pub const SF: u8 = 0x80;
pub const ZF: u8 = 0x40;
pub const YF: u8 = 0x20; // Undocumented copy of result bit 5
pub const HF: u8 = 0x10;
pub const XF: u8 = 0x08; // Undocumented copy of result bit 3
pub const PF: u8 = 0x04; // Parity or overflow
pub const NF: u8 = 0x02;
pub const CF: u8 = 0x01;

/// Sign, zero and the two undocumented bits of `value`
pub fn sz53(value: u8) -> u8 {
    let mut flags = value & (SF | YF | XF);
    if value == 0 {
        flags |= ZF;
    }
    flags
}

/// [`sz53`] plus even parity
pub fn sz53p(value: u8) -> u8 {
    if value.count_ones() % 2 == 0 {
        sz53(value) | PF
    } else {
        sz53(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AluResult {
    pub value: u8,
    pub flags: u8,
}

pub fn add8(a: u8, b: u8, carry: bool) -> AluResult {
    let c = carry as u8;
    let wide = a as u16 + b as u16 + c as u16;
    let value = wide as u8;
    let mut flags = sz53(value);
    if (a & 0x0f) + (b & 0x0f) + c > 0x0f {
        flags |= HF;
    }
    if (a ^ b) & 0x80 == 0 && (a ^ value) & 0x80 != 0 {
        flags |= PF;
    }
    if wide > 0xff {
        flags |= CF;
    }
    AluResult { value, flags }
}

pub fn sub8(a: u8, b: u8, carry: bool) -> AluResult {
    let c = carry as u8;
    let value = a.wrapping_sub(b).wrapping_sub(c);
    let mut flags = sz53(value) | NF;
    if (a & 0x0f) < (b & 0x0f) + c {
        flags |= HF;
    }
    if (a ^ b) & 0x80 != 0 && (a ^ value) & 0x80 != 0 {
        flags |= PF;
    }
    if (a as u16) < b as u16 + c as u16 {
        flags |= CF;
    }
    AluResult { value, flags }
}

pub fn and8(a: u8, b: u8) -> AluResult {
    let value = a & b;
    AluResult {
        value,
        flags: sz53p(value) | HF,
    }
}

pub fn or8(a: u8, b: u8) -> AluResult {
    let value = a | b;
    AluResult {
        value,
        flags: sz53p(value),
    }
}

pub fn xor8(a: u8, b: u8) -> AluResult {
    let value = a ^ b;
    AluResult {
        value,
        flags: sz53p(value),
    }
}

/// Compare; the undocumented bits come from the operand
pub fn cp8(a: u8, b: u8) -> AluResult {
    let result = sub8(a, b, false);
    AluResult {
        value: a,
        flags: (result.flags & !(YF | XF)) | (b & (YF | XF)),
    }
}

/// Increment; carry is left to the caller
pub fn inc8(a: u8) -> AluResult {
    let value = a.wrapping_add(1);
    let mut flags = sz53(value);
    if a & 0x0f == 0x0f {
        flags |= HF;
    }
    if a == 0x7f {
        flags |= PF;
    }
    AluResult { value, flags }
}

/// Decrement; carry is left to the caller
pub fn dec8(a: u8) -> AluResult {
    let value = a.wrapping_sub(1);
    let mut flags = sz53(value) | NF;
    if a & 0x0f == 0 {
        flags |= HF;
    }
    if a == 0x80 {
        flags |= PF;
    }
    AluResult { value, flags }
}

/// CB-prefixed shifts and rotates, indexed RLC RRC RL RR SLA SRA SLL SRL
pub fn shift(operation: usize, value: u8, carry: bool) -> AluResult {
    let c = carry as u8;
    let (value, out) = match operation {
        0 => (value.rotate_left(1), value >> 7),
        1 => (value.rotate_right(1), value & 1),
        2 => (value << 1 | c, value >> 7),
        3 => (value >> 1 | c << 7, value & 1),
        4 => (value << 1, value >> 7),
        5 => (value >> 1 | value & 0x80, value & 1),
        6 => (value << 1 | 1, value >> 7),
        _ => (value >> 1, value & 1),
    };
    AluResult {
        value,
        flags: sz53p(value) | out,
    }
}

pub fn daa(a: u8, flags: u8) -> AluResult {
    let subtract = flags & NF != 0;
    let mut correction = 0;
    let mut carry = flags & CF != 0;
    if flags & HF != 0 || a & 0x0f > 9 {
        correction |= 0x06;
    }
    if carry || a > 0x99 {
        correction |= 0x60;
        carry = true;
    }
    let (value, half) = if subtract {
        (a.wrapping_sub(correction), flags & HF != 0 && a & 0x0f < 6)
    } else {
        (a.wrapping_add(correction), a & 0x0f > 9)
    };
    let mut result = sz53p(value) | (flags & NF);
    if half {
        result |= HF;
    }
    if carry {
        result |= CF;
    }
    AluResult {
        value,
        flags: result,
    }
}

/// `ADD HL,rp`: returns the sum and the H, C and undocumented bits;
/// S, Z and P/V are left to the caller
pub fn add16(a: u16, b: u16) -> (u16, u8) {
    let wide = a as u32 + b as u32;
    let value = wide as u16;
    let mut flags = (value >> 8) as u8 & (YF | XF);
    if (a & 0x0fff) + (b & 0x0fff) > 0x0fff {
        flags |= HF;
    }
    if wide > 0xffff {
        flags |= CF;
    }
    (value, flags)
}

fn flags16(value: u16) -> u8 {
    let high = (value >> 8) as u8;
    let mut flags = high & (SF | YF | XF);
    if value == 0 {
        flags |= ZF;
    }
    flags
}

pub fn adc16(a: u16, b: u16, carry: bool) -> (u16, u8) {
    let c = carry as u32;
    let wide = a as u32 + b as u32 + c;
    let value = wide as u16;
    let mut flags = flags16(value);
    if (a as u32 & 0x0fff) + (b as u32 & 0x0fff) + c > 0x0fff {
        flags |= HF;
    }
    if (a ^ b) & 0x8000 == 0 && (a ^ value) & 0x8000 != 0 {
        flags |= PF;
    }
    if wide > 0xffff {
        flags |= CF;
    }
    (value, flags)
}

pub fn sbc16(a: u16, b: u16, carry: bool) -> (u16, u8) {
    let c = carry as u32;
    let value = a.wrapping_sub(b).wrapping_sub(c as u16);
    let mut flags = flags16(value) | NF;
    if (a as u32 & 0x0fff) < (b as u32 & 0x0fff) + c {
        flags |= HF;
    }
    if (a ^ b) & 0x8000 != 0 && (a ^ value) & 0x8000 != 0 {
        flags |= PF;
    }
    if (a as u32) < b as u32 + c {
        flags |= CF;
    }
    (value, flags)
}
