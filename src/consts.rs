//! Architectural constants of the LoongArch virtualization extension.

/// Exception codes found in `ESTAT.Ecode` after a guest exit.
pub mod exccode {
    /// Interrupt only, no exception.
    pub const INT: u32 = 0;
    /// Page invalid on load.
    pub const PIL: u32 = 1;
    /// Page invalid on store.
    pub const PIS: u32 = 2;
    /// Page invalid on instruction fetch.
    pub const PIF: u32 = 3;
    /// Page modification (store to clean page).
    pub const PME: u32 = 4;
    /// Page not readable.
    pub const PNR: u32 = 5;
    /// Page not executable.
    pub const PNX: u32 = 6;
    /// Floating-point unit disabled.
    pub const FPD: u32 = 15;
    /// Guest sensitive privileged resource, the general software trap.
    pub const GSPR: u32 = 22;
}

/// `ESTAT` layout.
pub mod estat {
    /// Interrupt status bits, NMI excluded.
    pub const IS_MASK: u64 = 0x1fff;
    pub const ECODE_SHIFT: u32 = 16;
    pub const ECODE_MASK: u64 = 0x3f << ECODE_SHIFT;
    /// Bits 2..=9 of the visible ESTAT value are backed by GINTC.
    pub const GINTC_SHIFT: u32 = 2;
    pub const GINTC_MASK: u64 = 0xff << GINTC_SHIFT;
}

/// Guest CSR ids.
pub mod csr {
    pub const CRMD: u16 = 0x0;
    pub const PRMD: u16 = 0x1;
    pub const EUEN: u16 = 0x2;
    pub const MISC: u16 = 0x3;
    pub const ECFG: u16 = 0x4;
    pub const ESTAT: u16 = 0x5;
    pub const ERA: u16 = 0x6;
    pub const BADV: u16 = 0x7;
    pub const BADI: u16 = 0x8;
    pub const EENTRY: u16 = 0xc;
    pub const TLBIDX: u16 = 0x10;
    pub const TLBEHI: u16 = 0x11;
    pub const TLBELO0: u16 = 0x12;
    pub const TLBELO1: u16 = 0x13;
    pub const ASID: u16 = 0x18;
    pub const PGDL: u16 = 0x19;
    pub const PGDH: u16 = 0x1a;
    pub const PGD: u16 = 0x1b;
    pub const PWCTL0: u16 = 0x1c;
    pub const PWCTL1: u16 = 0x1d;
    pub const STLBPGSIZE: u16 = 0x1e;
    pub const RVACFG: u16 = 0x1f;
    pub const CPUID: u16 = 0x20;
    pub const PRCFG1: u16 = 0x21;
    pub const PRCFG2: u16 = 0x22;
    pub const PRCFG3: u16 = 0x23;
    pub const KS0: u16 = 0x30;
    pub const KS8: u16 = 0x38;
    pub const TMID: u16 = 0x40;
    pub const TCFG: u16 = 0x41;
    pub const TVAL: u16 = 0x42;
    pub const CNTC: u16 = 0x43;
    pub const TINTCLR: u16 = 0x44;
    pub const LLBCTL: u16 = 0x60;
    pub const IMPCTL1: u16 = 0x80;
    pub const IMPCTL2: u16 = 0x81;
    pub const TLBRENTRY: u16 = 0x88;
    pub const TLBRBADV: u16 = 0x89;
    pub const TLBRERA: u16 = 0x8a;
    pub const TLBRSAVE: u16 = 0x8b;
    pub const TLBRELO0: u16 = 0x8c;
    pub const TLBRELO1: u16 = 0x8d;
    pub const TLBREHI: u16 = 0x8e;
    pub const TLBRPRMD: u16 = 0x8f;
    pub const MERRCTL: u16 = 0x90;
    pub const MERRSAVE: u16 = 0x95;
    pub const CTAG: u16 = 0x98;
    pub const DMWIN0: u16 = 0x180;
    pub const DMWIN3: u16 = 0x183;
    pub const PERFCTRL0: u16 = 0x200;
    pub const PERFCNTR3: u16 = 0x207;
    pub const MWPC: u16 = 0x300;
    pub const MWPS: u16 = 0x301;
    /// First memory watchpoint register (`DB0ADDR`).
    pub const DB0ADDR: u16 = 0x310;
    /// Last memory watchpoint register (`DB7ASID`).
    pub const DB7ASID: u16 = 0x37b;
    pub const FWPC: u16 = 0x380;
    pub const FWPS: u16 = 0x381;
    /// First fetch watchpoint register (`IB0ADDR`).
    pub const IB0ADDR: u16 = 0x390;
    /// Last fetch watchpoint register (`IB7ASID`).
    pub const IB7ASID: u16 = 0x3fb;
    pub const DEBUG: u16 = 0x500;
    pub const DERA: u16 = 0x501;
    pub const DESAVE: u16 = 0x502;

    /// Size of the guest CSR id space.
    pub const MAX_NUMS: usize = 0x800;

    /// `CRMD.DA`, direct address translation mode.
    pub const CRMD_DA: u64 = 1 << 3;
}

/// Interrupt numbers, also the bit index in the pending/clear bitsets.
pub mod irq {
    pub const SWI0: usize = 0;
    pub const SWI1: usize = 1;
    pub const HWI0: usize = 2;
    pub const HWI7: usize = 9;
    pub const PCOV: usize = 10;
    pub const TI: usize = 11;
    pub const IPI: usize = 12;
    pub const NMI: usize = 13;
    /// Number of architectural interrupt sources.
    pub const NR_IRQS: usize = 14;
}

/// `cpucfg` words and the feature bits withheld from guests.
pub mod cpucfg {
    /// Number of cpucfg words a guest may read; higher indexes read as zero.
    pub const MAX_REGS: usize = 21;

    /// Word 2: virtualization extension present.
    pub const CFG2_LVZP: u32 = 1 << 10;
    /// Word 2: virtualization extension version.
    pub const CFG2_LVZVER: u32 = 0x7 << 11;
    /// Word 2: FPU present.
    pub const CFG2_FP: u32 = 1 << 0;

    /// Word 6: performance counters present.
    pub const CFG6_PMP: u32 = 1 << 0;
    pub const CFG6_PMVER: u32 = 0x7 << 1;
    pub const CFG6_PMNUM: u32 = 0xf << 4;
    pub const CFG6_PMBITS: u32 = 0x3f << 8;
    pub const CFG6_UPM: u32 = 1 << 14;
}

/// Instruction opcodes used by the emulator, per field view.
pub mod opcode {
    /// Top-byte classes of the general software trap.
    pub const OP8_CPUCFG: u32 = 0x00;
    pub const OP8_CSR: u32 = 0x04;
    pub const OP8_CACHE_IOCSR_IDLE: u32 = 0x06;

    /// `cpucfg rd, rj`, reg2 view.
    pub const CPUCFG: u32 = 0x1b;

    /// Selector values of bits 22..=31 under op8 `0x06`.
    pub const CACHE_GROUP: u32 = 0x18;
    pub const IOCSR_IDLE_GROUP: u32 = 0x19;
    /// Selector values of bits 15..=31 under the IOCSR/idle group.
    pub const IOCSR: u32 = 0xc90;
    pub const IDLE: u32 = 0xc91;

    /// IOCSR accesses, reg2 view.
    pub const IOCSRRD_B: u32 = 0x19200;
    pub const IOCSRRD_H: u32 = 0x19201;
    pub const IOCSRRD_W: u32 = 0x19202;
    pub const IOCSRRD_D: u32 = 0x19203;
    pub const IOCSRWR_B: u32 = 0x19204;
    pub const IOCSRWR_H: u32 = 0x19205;
    pub const IOCSRWR_W: u32 = 0x19206;
    pub const IOCSRWR_D: u32 = 0x19207;

    /// Pointer-offset loads and stores, reg2i14 view.
    pub const LDPTR_W: u32 = 0x24;
    pub const STPTR_W: u32 = 0x25;
    pub const LDPTR_D: u32 = 0x26;
    pub const STPTR_D: u32 = 0x27;

    /// Immediate-offset loads and stores, reg2i12 view.
    pub const LD_B: u32 = 0xa0;
    pub const LD_H: u32 = 0xa1;
    pub const LD_W: u32 = 0xa2;
    pub const LD_D: u32 = 0xa3;
    pub const ST_B: u32 = 0xa4;
    pub const ST_H: u32 = 0xa5;
    pub const ST_W: u32 = 0xa6;
    pub const ST_D: u32 = 0xa7;
    pub const LD_BU: u32 = 0xa8;
    pub const LD_HU: u32 = 0xa9;
    pub const LD_WU: u32 = 0xaa;

    /// Indexed loads and stores, reg3 view.
    pub const LDX_B: u32 = 0x7000;
    pub const LDX_H: u32 = 0x7008;
    pub const LDX_W: u32 = 0x7010;
    pub const LDX_D: u32 = 0x7018;
    pub const STX_B: u32 = 0x7020;
    pub const STX_H: u32 = 0x7028;
    pub const STX_W: u32 = 0x7030;
    pub const STX_D: u32 = 0x7038;
    pub const LDX_BU: u32 = 0x7040;
    pub const LDX_HU: u32 = 0x7048;
    pub const LDX_WU: u32 = 0x7050;
}
