use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};

/// Index of a device in the bus arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceId(pub usize);

impl DeviceId {
    pub fn index(&self) -> usize {
        self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Index of a node (electrical net) in the net table
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub usize);

impl NodeId {
    pub fn index(&self) -> usize {
        self.0
    }
}

/// Instruction class flags carried by decode-table entries.
/// Also used as the stop mask of `Processor::exec`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct InstructionKind(u8);

impl InstructionKind {
    pub const NONE: InstructionKind = InstructionKind(0);
    pub const HALT: InstructionKind = InstructionKind(1);
    pub const JUMP: InstructionKind = InstructionKind(2);
    pub const CALL: InstructionKind = InstructionKind(4);
    pub const RETURN: InstructionKind = InstructionKind(8);
    pub const IO: InstructionKind = InstructionKind(16);
    pub const MEMORY_READ: InstructionKind = InstructionKind(32);
    pub const MEMORY_WRITE: InstructionKind = InstructionKind(64);
    pub const UNDOCUMENTED: InstructionKind = InstructionKind(128);

    pub const fn bits(&self) -> u8 {
        self.0
    }

    pub const fn from_bits(bits: u8) -> Self {
        InstructionKind(bits)
    }

    pub const fn union(self, other: InstructionKind) -> Self {
        InstructionKind(self.0 | other.0)
    }

    pub const fn contains(&self, other: InstructionKind) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn intersects(&self, other: InstructionKind) -> bool {
        self.0 & other.0 != 0
    }

    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

impl BitOr for InstructionKind {
    type Output = InstructionKind;

    fn bitor(self, rhs: Self) -> Self::Output {
        self.union(rhs)
    }
}

impl BitOrAssign for InstructionKind {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for InstructionKind {
    type Output = InstructionKind;

    fn bitand(self, rhs: Self) -> Self::Output {
        InstructionKind(self.0 & rhs.0)
    }
}

impl fmt::Display for InstructionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [&str; 8] = ["HLT", "JMP", "CALL", "RET", "IO", "MR", "MW", "UND"];
        if self.is_empty() {
            return write!(f, "-");
        }
        let mut first = true;
        for (bit, name) in NAMES.iter().enumerate() {
            if self.0 & (1 << bit) != 0 {
                if !first {
                    write!(f, "|")?;
                }
                write!(f, "{}", name)?;
                first = false;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instruction_kind_flags() {
        let kind = InstructionKind::CALL | InstructionKind::MEMORY_WRITE;
        assert!(kind.contains(InstructionKind::CALL));
        assert!(kind.intersects(InstructionKind::MEMORY_WRITE | InstructionKind::IO));
        assert!(!kind.intersects(InstructionKind::RETURN));
        assert_eq!(kind.bits(), 68);
        assert_eq!(kind.to_string(), "CALL|MW");
        assert_eq!(InstructionKind::NONE.to_string(), "-");
    }
}
