//! Guest exit dispatch and emulation of the trapping instruction classes.

use crate::addr::GuestPhysAddr;
use crate::consts::{estat, exccode, opcode::*};
use crate::csr::CsrFile;
use crate::exit::{InternalErrorKind, LaVCpuExitReason};
use crate::hal::LaVCpuHal;
use crate::insn::LaInst;
use crate::mmio::{self, PendingIo};
use crate::vcpu::LaVCpu;

/// The outcome of emulating one trapping instruction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EmulateResult {
    /// Emulated entirely inside the core.
    Done,
    /// The access must be carried out by the host's MMIO device model.
    DoMmio(PendingIo),
    /// The access must be carried out by the host's IOCSR device model.
    DoIocsr(PendingIo),
    /// Emulation is impossible; the guest must not make progress.
    Fail(InternalErrorKind),
}

/// What the run loop does after an exit has been dispatched.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExitDecision {
    /// Re-enter the guest.
    ResumeGuest,
    /// Return to the host with a structured reason.
    ResumeHost(LaVCpuExitReason),
    /// Stop guest progress; the run loop reports an internal error with a register dump.
    Error(InternalErrorKind),
}

/// Instruction fetches never become MMIO.
fn is_ifetch_fault(ecode: u32, badv: u64, pc: u64) -> bool {
    ecode == exccode::PIF || ecode == exccode::PNX || badv == pc
}

impl<H: LaVCpuHal> LaVCpu<H> {
    /// Classifies the exit recorded in `self.exit` and handles it.
    pub(crate) fn handle_exit(&mut self) -> ExitDecision {
        let exit = self.exit;
        let ecode = ((exit.estat & estat::ECODE_MASK) >> estat::ECODE_SHIFT) as u32;
        trace!(
            "vCPU {} exit: ecode {:#x} estat {:#x} pc {:#x}",
            self.id(),
            ecode,
            exit.estat,
            self.pc
        );

        match ecode {
            exccode::INT => {
                if exit.estat & estat::IS_MASK == 0 {
                    warn!("vCPU {} exited with no pending interrupt", self.id());
                }
                self.stats.int_exits += 1;
                ExitDecision::ResumeGuest
            }
            exccode::GSPR => self.handle_gspr(),
            exccode::PIL | exccode::PIF | exccode::PNR | exccode::PNX => {
                self.handle_rdwr_fault(ecode, false)
            }
            exccode::PIS | exccode::PME => self.handle_rdwr_fault(ecode, true),
            exccode::FPD => self.handle_fpu_disabled(),
            _ => {
                error!(
                    "vCPU {} unhandled exit code {:#x}, estat {:#x}",
                    self.id(),
                    ecode,
                    exit.estat
                );
                self.dump_regs();
                ExitDecision::ResumeHost(LaVCpuExitReason::Unknown {
                    exccode: ecode,
                    estat: exit.estat,
                })
            }
        }
    }

    fn decide(&mut self, result: EmulateResult) -> ExitDecision {
        match result {
            EmulateResult::Done => ExitDecision::ResumeGuest,
            EmulateResult::DoMmio(pending) | EmulateResult::DoIocsr(pending) => {
                let reason = LaVCpuExitReason::from_pending(&pending);
                self.pending = Some(pending);
                ExitDecision::ResumeHost(reason)
            }
            EmulateResult::Fail(kind) => ExitDecision::Error(kind),
        }
    }

    /// The general software trap. PC moves past the instruction first and moves back if it
    /// cannot be emulated.
    fn handle_gspr(&mut self) -> ExitDecision {
        let inst = LaInst(self.exit.badi);
        let curr_pc = self.pc;
        self.pc = curr_pc.wrapping_add(4);

        let result = match inst.op8() {
            OP8_CPUCFG => self.emulate_cpucfg(inst),
            OP8_CSR => self.emulate_csr(inst, curr_pc),
            OP8_CACHE_IOCSR_IDLE => match inst.field(31, 22) {
                // Guest cache maintenance needs nothing from the host.
                CACHE_GROUP => EmulateResult::Done,
                IOCSR_IDLE_GROUP => match inst.field(31, 15) {
                    IOCSR => self.emulate_iocsr(inst),
                    IDLE => self.emulate_idle(),
                    _ => EmulateResult::Fail(InternalErrorKind::UnsupportedInstruction),
                },
                _ => EmulateResult::Fail(InternalErrorKind::UnsupportedInstruction),
            },
            _ => EmulateResult::Fail(InternalErrorKind::UnsupportedInstruction),
        };

        if let EmulateResult::Fail(_) = result {
            warn!(
                "vCPU {} cannot emulate {:?} at pc {:#x}",
                self.id(),
                inst,
                curr_pc
            );
            self.pc = curr_pc;
        }
        self.decide(result)
    }

    fn emulate_cpucfg(&mut self, inst: LaInst) -> EmulateResult {
        let f = inst.reg2();
        if f.opcode != CPUCFG {
            return EmulateResult::Fail(InternalErrorKind::UnsupportedInstruction);
        }
        let index = usize::try_from(self.gprs[f.rj]).unwrap_or(usize::MAX);
        let val = self.vm().cpucfg().read(index);
        self.set_gpr(f.rd, val as u64);
        self.stats.cpucfg_exits += 1;
        EmulateResult::Done
    }

    /// `csrrd` when `rj` is 0, `csrwr` when it is 1, `csrxchg` with the mask in `rj` otherwise.
    fn emulate_csr(&mut self, inst: LaInst, pc: u64) -> EmulateResult {
        let f = inst.reg2csr();
        if !CsrFile::is_valid(f.csr) && self.csr.note_unsupported(f.csr) {
            warn!(
                "vCPU {} accessed unsupported CSR {:#x} at pc {:#x}",
                self.id(),
                f.csr,
                pc
            );
        }

        let old = self.csr.read(f.csr);
        let val = match f.rj {
            0 => old,
            1 => {
                self.csr.write(f.csr, self.gprs[f.rd]);
                old
            }
            rj => {
                let mask = self.gprs[rj];
                self.csr.exchange(f.csr, mask, self.gprs[f.rd]);
                old & mask
            }
        };
        self.set_gpr(f.rd, val);
        self.stats.csr_exits += 1;
        EmulateResult::Done
    }

    fn emulate_iocsr(&mut self, inst: LaInst) -> EmulateResult {
        match mmio::decode_iocsr(inst, &self.gprs) {
            Some(pending) => {
                self.stats.iocsr_exits += 1;
                EmulateResult::DoIocsr(pending)
            }
            None => EmulateResult::Fail(InternalErrorKind::UnsupportedInstruction),
        }
    }

    /// `idle`: blocks until the vCPU is runnable. The guest timer moves into the host software
    /// timer before blocking so that its expiry can wake the vCPU.
    fn emulate_idle(&mut self) -> EmulateResult {
        self.stats.idle_exits += 1;
        if !self.is_runnable() {
            let id = self.id();
            self.timer.save::<H>(id, &self.csr, &self.signals);
            // The thread may wake up on another CPU.
            self.lose_fpu();
            self.block();
        }
        EmulateResult::Done
    }

    fn handle_rdwr_fault(&mut self, ecode: u32, is_write: bool) -> ExitDecision {
        let badv = self.exit.badv;
        let gpa = GuestPhysAddr::from(badv as usize);
        if H::resolve_guest_page_fault(self.vm().id(), self.id(), gpa, is_write).is_ok() {
            return ExitDecision::ResumeGuest;
        }

        let inst = LaInst(self.exit.badi);
        let result = if is_write {
            self.emulate_mmio_write(inst, badv)
        } else if is_ifetch_fault(ecode, badv, self.pc) {
            error!(
                "vCPU {} fetched from unbacked address {:#x}",
                self.id(),
                badv
            );
            EmulateResult::Fail(InternalErrorKind::InstructionFetchFault)
        } else {
            self.emulate_mmio_read(inst, badv)
        };
        self.decide(result)
    }

    /// The destination register is written and PC advanced when the host completes the read.
    fn emulate_mmio_read(&mut self, inst: LaInst, addr: u64) -> EmulateResult {
        match mmio::decode_mmio_load(inst, addr) {
            Some(pending) => {
                self.stats.mmio_exits += 1;
                EmulateResult::DoMmio(pending)
            }
            None => {
                warn!(
                    "vCPU {} unsupported MMIO read {:?} at pc {:#x}",
                    self.id(),
                    inst,
                    self.pc
                );
                EmulateResult::Fail(InternalErrorKind::UnsupportedMmioInstruction)
            }
        }
    }

    /// A store is complete once decoded, so PC moves past it here.
    fn emulate_mmio_write(&mut self, inst: LaInst, addr: u64) -> EmulateResult {
        let curr_pc = self.pc;
        self.pc = curr_pc.wrapping_add(4);
        match mmio::decode_mmio_store(inst, addr, &self.gprs) {
            Some(pending) => {
                self.stats.mmio_exits += 1;
                EmulateResult::DoMmio(pending)
            }
            None => {
                self.pc = curr_pc;
                warn!(
                    "vCPU {} unsupported MMIO write {:?} at pc {:#x}",
                    self.id(),
                    inst,
                    curr_pc
                );
                EmulateResult::Fail(InternalErrorKind::UnsupportedMmioInstruction)
            }
        }
    }

    fn handle_fpu_disabled(&mut self) -> ExitDecision {
        if self.fpu_owned {
            error!("vCPU {} raised FPU-disabled while owning the FPU", self.id());
            return ExitDecision::Error(InternalErrorKind::FpuAlreadyOwned);
        }
        H::restore_fpu(&self.fpu);
        self.fpu_owned = true;
        ExitDecision::ResumeGuest
    }
}
