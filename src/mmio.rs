//! Decoding of trapping loads, stores and IOCSR accesses into host transactions, and their
//! completion once the host has answered.

use crate::consts::opcode::*;
use crate::exit::AccessWidth;
use crate::insn::{InsnFormat, LaInst};

/// The address space of a pending transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IoSpace {
    /// Guest physical memory not backed by RAM.
    Mmio,
    /// The IOCSR space, reached with `iocsrrd`/`iocsrwr`.
    Iocsr,
}

/// How a loaded value is widened to 64 bits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Extension {
    Signed,
    Unsigned,
}

/// An MMIO or IOCSR access awaiting the host. A vCPU holds at most one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PendingIo {
    pub space: IoSpace,
    pub addr: u64,
    pub width: AccessWidth,
    pub is_write: bool,
    /// Widening of a load result; `None` for stores.
    pub ext: Option<Extension>,
    /// Destination register of a load, source register of a store.
    pub reg: usize,
    /// Little-endian store data, or the buffer the host fills for a load.
    pub data: [u8; 8],
}

impl PendingIo {
    fn load(space: IoSpace, addr: u64, width: AccessWidth, ext: Extension, reg: usize) -> Self {
        Self {
            space,
            addr,
            width,
            is_write: false,
            ext: Some(ext),
            reg,
            data: [0; 8],
        }
    }

    fn store(space: IoSpace, addr: u64, width: AccessWidth, reg: usize, val: u64) -> Self {
        let mut data = [0; 8];
        data[..width.size()].copy_from_slice(&val.to_le_bytes()[..width.size()]);
        Self {
            space,
            addr,
            width,
            is_write: true,
            ext: None,
            reg,
            data,
        }
    }

    /// The value a completed load writes to its destination register.
    ///
    /// Returns `None` for stores, which have nothing to complete.
    pub fn read_result(&self) -> Option<u64> {
        let ext = self.ext?;
        extend(self.width.size(), &self.data, ext)
    }
}

/// Widens the first `len` little-endian bytes of `data` to 64 bits.
///
/// Returns `None` if `len` is not 1, 2, 4 or 8.
pub fn extend(len: usize, data: &[u8; 8], ext: Extension) -> Option<u64> {
    let val = match (len, ext) {
        (1, Extension::Signed) => data[0] as i8 as i64 as u64,
        (1, Extension::Unsigned) => data[0] as u64,
        (2, Extension::Signed) => i16::from_le_bytes([data[0], data[1]]) as i64 as u64,
        (2, Extension::Unsigned) => u16::from_le_bytes([data[0], data[1]]) as u64,
        (4, Extension::Signed) => {
            i32::from_le_bytes([data[0], data[1], data[2], data[3]]) as i64 as u64
        }
        (4, Extension::Unsigned) => {
            u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as u64
        }
        (8, _) => u64::from_le_bytes(*data),
        _ => return None,
    };
    Some(val)
}

/// Decodes a store that faulted on unbacked memory at `addr`.
///
/// Only the data buffer is filled; guest memory is never touched. Returns `None` for anything
/// that is not `st.{b,h,w,d}`, `stx.{b,h,w,d}` or `stptr.{w,d}`.
pub(crate) fn decode_mmio_store(inst: LaInst, addr: u64, gprs: &[u64; 32]) -> Option<PendingIo> {
    let (width, rd) = match inst.format() {
        InsnFormat::Reg2I14(f) => match f.opcode {
            STPTR_W => (AccessWidth::Dword, f.rd),
            STPTR_D => (AccessWidth::Qword, f.rd),
            _ => return None,
        },
        InsnFormat::Reg2I12(f) => match f.opcode {
            ST_B => (AccessWidth::Byte, f.rd),
            ST_H => (AccessWidth::Word, f.rd),
            ST_W => (AccessWidth::Dword, f.rd),
            ST_D => (AccessWidth::Qword, f.rd),
            _ => return None,
        },
        InsnFormat::Reg3(f) => match f.opcode {
            STX_B => (AccessWidth::Byte, f.rd),
            STX_H => (AccessWidth::Word, f.rd),
            STX_W => (AccessWidth::Dword, f.rd),
            STX_D => (AccessWidth::Qword, f.rd),
            _ => return None,
        },
        _ => return None,
    };
    Some(PendingIo::store(IoSpace::Mmio, addr, width, rd, gprs[rd]))
}

/// Decodes a load that faulted on unbacked memory at `addr`.
///
/// The destination register is left alone until the host answers. Returns `None` for anything
/// that is not a plain, indexed or pointer-offset load.
pub(crate) fn decode_mmio_load(inst: LaInst, addr: u64) -> Option<PendingIo> {
    use AccessWidth::*;
    use Extension::*;

    let (width, ext, rd) = match inst.format() {
        InsnFormat::Reg2I14(f) => match f.opcode {
            LDPTR_W => (Dword, Signed, f.rd),
            LDPTR_D => (Qword, Signed, f.rd),
            _ => return None,
        },
        InsnFormat::Reg2I12(f) => match f.opcode {
            LD_B => (Byte, Signed, f.rd),
            LD_BU => (Byte, Unsigned, f.rd),
            LD_H => (Word, Signed, f.rd),
            LD_HU => (Word, Unsigned, f.rd),
            LD_W => (Dword, Signed, f.rd),
            LD_WU => (Dword, Unsigned, f.rd),
            LD_D => (Qword, Signed, f.rd),
            _ => return None,
        },
        InsnFormat::Reg3(f) => match f.opcode {
            LDX_B => (Byte, Signed, f.rd),
            LDX_BU => (Byte, Unsigned, f.rd),
            LDX_H => (Word, Signed, f.rd),
            LDX_HU => (Word, Unsigned, f.rd),
            LDX_W => (Dword, Signed, f.rd),
            LDX_WU => (Dword, Unsigned, f.rd),
            LDX_D => (Qword, Signed, f.rd),
            _ => return None,
        },
        _ => return None,
    };
    Some(PendingIo::load(IoSpace::Mmio, addr, width, ext, rd))
}

/// Decodes `iocsrrd.{b,h,w,d}` / `iocsrwr.{b,h,w,d}`. The address comes from `rj`.
///
/// IOCSR reads are always sign-extended.
pub(crate) fn decode_iocsr(inst: LaInst, gprs: &[u64; 32]) -> Option<PendingIo> {
    let f = inst.reg2();
    // The IOCSR space is 32 bits wide.
    let addr = gprs[f.rj] & 0xffff_ffff;
    let (width, is_write) = match f.opcode {
        IOCSRRD_B => (AccessWidth::Byte, false),
        IOCSRRD_H => (AccessWidth::Word, false),
        IOCSRRD_W => (AccessWidth::Dword, false),
        IOCSRRD_D => (AccessWidth::Qword, false),
        IOCSRWR_B => (AccessWidth::Byte, true),
        IOCSRWR_H => (AccessWidth::Word, true),
        IOCSRWR_W => (AccessWidth::Dword, true),
        IOCSRWR_D => (AccessWidth::Qword, true),
        _ => return None,
    };
    Some(if is_write {
        PendingIo::store(IoSpace::Iocsr, addr, width, f.rd, gprs[f.rd])
    } else {
        PendingIo::load(IoSpace::Iocsr, addr, width, Extension::Signed, f.rd)
    })
}
