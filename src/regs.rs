use axerrno::{ax_err, AxResult};

/// The general-purpose register file and PC, for bulk transfer.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LaRegs {
    /// `$r0`..`$r31`. `$r0` reads as zero and ignores writes.
    pub gpr: [u64; 32],
    pub pc: u64,
}

/// Guest floating-point state.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FpuContext {
    /// `$f0`..`$f31`.
    pub fpr: [u64; 32],
    /// The eight condition flags `$fcc0`..`$fcc7`, one per byte.
    pub fcc: u64,
    /// `$fcsr0`.
    pub fcsr: u32,
}

const REG_ARCH_MASK: u64 = 0xff00_0000_0000_0000;
const REG_ARCH_LOONGARCH: u64 = 0x9000_0000_0000_0000;
const REG_SIZE_MASK: u64 = 0x00f0_0000_0000_0000;
const REG_SIZE_U64: u64 = 0x0030_0000_0000_0000;
const REG_TYPE_MASK: u64 = 0x7_0000;
const REG_TYPE_CSR: u64 = 0x1_0000;
const REG_TYPE_KVM: u64 = 0x2_0000;
const REG_IDX_MASK: u64 = 0x7fff;
const REG_IDX_SHIFT: u32 = 3;

const KVM_REG_COUNTER: u64 = 1;
const KVM_REG_VCPU_RESET: u64 = 2;

/// A register reachable through the get/set-one-register boundary.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OneRegId {
    /// A guest CSR, by CSR id.
    Csr(u16),
    /// The guest stable counter: the host counter plus the VM's time offset.
    Counter,
    /// Writing any value resets the vCPU's interrupt state and timer.
    VCpuReset,
}

impl OneRegId {
    /// Parses the 64-bit register id used by the host boundary.
    pub fn from_raw(id: u64) -> AxResult<Self> {
        if id & REG_ARCH_MASK != REG_ARCH_LOONGARCH || id & REG_SIZE_MASK != REG_SIZE_U64 {
            return ax_err!(InvalidInput, format!("bad register id {:#x}", id));
        }
        let idx = (id & REG_IDX_MASK) >> REG_IDX_SHIFT;
        match (id & REG_TYPE_MASK, idx) {
            (REG_TYPE_CSR, idx) => Ok(OneRegId::Csr(idx as u16)),
            (REG_TYPE_KVM, KVM_REG_COUNTER) => Ok(OneRegId::Counter),
            (REG_TYPE_KVM, KVM_REG_VCPU_RESET) => Ok(OneRegId::VCpuReset),
            _ => ax_err!(InvalidInput, format!("unsupported register id {:#x}", id)),
        }
    }

    /// Encodes the id for the host boundary.
    pub fn to_raw(self) -> u64 {
        let (ty, idx) = match self {
            OneRegId::Csr(csr) => (REG_TYPE_CSR, csr as u64),
            OneRegId::Counter => (REG_TYPE_KVM, KVM_REG_COUNTER),
            OneRegId::VCpuReset => (REG_TYPE_KVM, KVM_REG_VCPU_RESET),
        };
        REG_ARCH_LOONGARCH | REG_SIZE_U64 | ty | (idx << REG_IDX_SHIFT)
    }
}
