use crate::mmio::{IoSpace, PendingIo};

/// The width of an MMIO or IOCSR access.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessWidth {
    /// 8-bit access.
    Byte,
    /// 16-bit access.
    Word,
    /// 32-bit access.
    Dword,
    /// 64-bit access.
    Qword,
}

impl AccessWidth {
    /// The access size in bytes.
    pub const fn size(self) -> usize {
        match self {
            AccessWidth::Byte => 1,
            AccessWidth::Word => 2,
            AccessWidth::Dword => 4,
            AccessWidth::Qword => 8,
        }
    }
}

/// An MMIO or IOCSR access the host must carry out against its device model.
///
/// For writes `data` already holds the little-endian bytes to store. For reads the host fills
/// the first `width` bytes of `data` (through [`LaVCpu::io_data_mut`](crate::LaVCpu::io_data_mut))
/// before calling `run` again.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IoRequest {
    /// Guest physical address for MMIO, IOCSR address for IOCSR.
    pub addr: u64,
    /// The width of the access.
    pub width: AccessWidth,
    /// `true` for stores, `false` for loads.
    pub is_write: bool,
    /// The data buffer.
    pub data: [u8; 8],
}

impl IoRequest {
    /// The meaningful part of the data buffer.
    pub fn data(&self) -> &[u8] {
        &self.data[..self.width.size()]
    }

    /// The buffer interpreted as a little-endian value, zero-extended.
    pub fn value(&self) -> u64 {
        u64::from_le_bytes(self.data)
    }
}

impl From<&PendingIo> for IoRequest {
    fn from(pending: &PendingIo) -> Self {
        Self {
            addr: pending.addr,
            width: pending.width,
            is_write: pending.is_write,
            data: pending.data,
        }
    }
}

/// Why an internal error exit was taken.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InternalErrorKind {
    /// A general software trap whose instruction is not emulated.
    UnsupportedInstruction,
    /// A load or store that faulted on unbacked memory but is not a known MMIO instruction.
    UnsupportedMmioInstruction,
    /// An instruction fetch hit memory that is not backed by RAM.
    InstructionFetchFault,
    /// The guest raised FPU-disabled although it already owns the FPU.
    FpuAlreadyOwned,
    /// A pending read completed with a length the decoder never produces.
    BadCompletionLength,
}

/// The result of [`LaVCpu::run`](crate::LaVCpu::run).
///
/// Modeled on the exit reasons of [kvm-ioctls](https://github.com/rust-vmm/kvm-ioctls/blob/main/src/ioctls/vcpu.rs).
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaVCpuExitReason {
    /// The guest accessed memory that is not backed by RAM.
    ///
    /// Exactly one follow-up `run` completes the access; for reads the host must fill the data
    /// buffer first.
    Mmio(IoRequest),
    /// The guest executed an `iocsrrd`/`iocsrwr` instruction.
    ///
    /// Completed like [`LaVCpuExitReason::Mmio`].
    Iocsr(IoRequest),
    /// Emulation cannot continue; the guest did not make progress past the faulting instruction.
    ///
    /// The registers have been dumped to the log. Running again re-executes the instruction.
    InternalError {
        /// What went wrong.
        kind: InternalErrorKind,
        /// The guest PC of the faulting instruction.
        pc: u64,
        /// The instruction word reported by hardware, if any.
        inst: u32,
    },
    /// The guest exited with an exception code the dispatcher does not handle.
    Unknown {
        /// The exception code from `ESTAT`.
        exccode: u32,
        /// The full `ESTAT` value of the exit.
        estat: u64,
    },
    /// The host has pending work (a signal, an immediate-exit request); the guest is intact.
    Interrupted,
}

impl LaVCpuExitReason {
    pub(crate) fn from_pending(pending: &PendingIo) -> Self {
        match pending.space {
            IoSpace::Mmio => LaVCpuExitReason::Mmio(pending.into()),
            IoSpace::Iocsr => LaVCpuExitReason::Iocsr(pending.into()),
        }
    }
}
