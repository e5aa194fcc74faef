use bitfield::BitRange;

use crate::consts::opcode::{CACHE_GROUP, OP8_CACHE_IOCSR_IDLE, OP8_CSR};

/// `op rd, rj`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Reg2 {
    pub rd: usize,
    pub rj: usize,
    pub opcode: u32,
}

/// `csrrd/csrwr/csrxchg rd, rj, csr`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Reg2Csr {
    pub rd: usize,
    pub rj: usize,
    pub csr: u16,
    pub opcode: u32,
}

/// `op rd, rj, rk`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Reg3 {
    pub rd: usize,
    pub rj: usize,
    pub rk: usize,
    pub opcode: u32,
}

/// `op rd, rj, si14`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Reg2I14 {
    pub rd: usize,
    pub rj: usize,
    pub imm: u32,
    pub opcode: u32,
}

/// `op rd, rj, si12`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Reg2I12 {
    pub rd: usize,
    pub rj: usize,
    pub imm: u32,
    pub opcode: u32,
}

/// The field layout an instruction word is interpreted with, chosen by its top byte.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InsnFormat {
    Reg2(Reg2),
    Reg2Csr(Reg2Csr),
    Reg3(Reg3),
    Reg2I14(Reg2I14),
    Reg2I12(Reg2I12),
}

/// A raw 32-bit LoongArch instruction word.
///
/// Every accessor is a pure bit-field view; none of them validates the encoding. Callers match
/// on the opcode of the view they asked for and reject what they do not know.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct LaInst(pub u32);

impl LaInst {
    /// Bits `lsb..=msb` of the word.
    pub fn field(&self, msb: usize, lsb: usize) -> u32 {
        self.0.bit_range(msb, lsb)
    }

    /// Bits 24..=31, the primary selector.
    pub fn op8(&self) -> u32 {
        self.field(31, 24)
    }

    fn rd(&self) -> usize {
        let rd: u32 = self.0.bit_range(4, 0);
        rd as usize
    }

    fn rj(&self) -> usize {
        let rj: u32 = self.0.bit_range(9, 5);
        rj as usize
    }

    pub fn reg2(&self) -> Reg2 {
        Reg2 {
            rd: self.rd(),
            rj: self.rj(),
            opcode: self.0.bit_range(31, 10),
        }
    }

    pub fn reg2csr(&self) -> Reg2Csr {
        let csr: u32 = self.0.bit_range(23, 10);
        Reg2Csr {
            rd: self.rd(),
            rj: self.rj(),
            csr: csr as u16,
            opcode: self.op8(),
        }
    }

    pub fn reg3(&self) -> Reg3 {
        let rk: u32 = self.0.bit_range(14, 10);
        Reg3 {
            rd: self.rd(),
            rj: self.rj(),
            rk: rk as usize,
            opcode: self.0.bit_range(31, 15),
        }
    }

    pub fn reg2i14(&self) -> Reg2I14 {
        Reg2I14 {
            rd: self.rd(),
            rj: self.rj(),
            imm: self.0.bit_range(23, 10),
            opcode: self.op8(),
        }
    }

    pub fn reg2i12(&self) -> Reg2I12 {
        Reg2I12 {
            rd: self.rd(),
            rj: self.rj(),
            imm: self.0.bit_range(21, 10),
            opcode: self.0.bit_range(31, 22),
        }
    }

    /// Picks the field view the top byte implies.
    ///
    /// Words whose top byte belongs to none of the emulated classes fall back to [`Reg2`], which
    /// keeps all 22 opcode bits for the caller to reject.
    pub fn format(&self) -> InsnFormat {
        match self.op8() {
            OP8_CSR => InsnFormat::Reg2Csr(self.reg2csr()),
            0x24..=0x27 => InsnFormat::Reg2I14(self.reg2i14()),
            0x28..=0x2e => InsnFormat::Reg2I12(self.reg2i12()),
            0x38 => InsnFormat::Reg3(self.reg3()),
            // cacop is the only reg2i12 encoding in the 0x06 group.
            OP8_CACHE_IOCSR_IDLE if self.field(31, 22) == CACHE_GROUP => {
                InsnFormat::Reg2I12(self.reg2i12())
            }
            _ => InsnFormat::Reg2(self.reg2()),
        }
    }
}

impl core::fmt::Debug for LaInst {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "LaInst({:#010x})", self.0)
    }
}

impl From<u32> for LaInst {
    fn from(word: u32) -> Self {
        Self(word)
    }
}
