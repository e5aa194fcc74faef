use alloc::boxed::Box;
use alloc::sync::Arc;

use axerrno::{ax_err, AxResult};

use crate::addr::GuestPhysAddr;
use crate::consts::csr;
use crate::csr::CsrFile;
use crate::exit::{InternalErrorKind, LaVCpuExitReason};
use crate::hal::{GuestContext, GuestExit, LaVCpuHal};
use crate::irq::{request, VCpuSignals};
use crate::mmio::{IoSpace, PendingIo};
use crate::regs::{FpuContext, LaRegs, OneRegId};
use crate::timer::{GuestTimer, TimerMode};
use crate::trap::ExitDecision;
use crate::vm::LaVm;

/// The state of a virtual CPU.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VCpuState {
    /// An invalid state.
    Invalid = 0,
    /// The vcpu is created but not initialized yet.
    Created = 1,
    /// The vcpu is already initialized and can be bound to a physical CPU.
    Free = 2,
    /// The vcpu is bound to a physical CPU and ready to run.
    Ready = 3,
    /// The vcpu is bound to a physical CPU and running.
    Running = 4,
    /// The vcpu is blocked.
    Blocked = 5,
}

/// Whether a vCPU may run at all.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MpState {
    Runnable,
    /// Never runnable; `idle` keeps blocking until the host makes the vCPU runnable again.
    Stopped,
}

/// Configuration for creating a [`LaVCpu`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LaVCpuCreateConfig {
    /// Frequency of the guest constant timer.
    pub timer_hz: u64,
}

impl Default for LaVCpuCreateConfig {
    fn default() -> Self {
        Self {
            timer_hz: 100_000_000,
        }
    }
}

/// Exit counters by class.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LaVCpuStats {
    pub int_exits: u64,
    pub idle_exits: u64,
    pub cpucfg_exits: u64,
    pub csr_exits: u64,
    pub iocsr_exits: u64,
    pub mmio_exits: u64,
    /// Returns to the host for a signal or an immediate-exit request.
    pub signal_exits: u64,
}

/// A LoongArch virtual CPU.
///
/// Owned by the thread that runs it: every method that touches guest state takes `&mut self`.
/// Other threads reach the vCPU only through its [`VCpuSignals`], e.g. with
/// [`LaVm::inject_interrupt`].
///
/// Dropping the vCPU removes it from its VM and clears every per-CPU reference to it.
pub struct LaVCpu<H: LaVCpuHal> {
    vm: Arc<LaVm<H>>,
    id: usize,
    state: VCpuState,

    pub(crate) gprs: [u64; 32],
    pub(crate) pc: u64,
    pub(crate) csr: Box<CsrFile>,
    pub(crate) signals: Arc<VCpuSignals>,

    pub(crate) fpu: FpuContext,
    pub(crate) fpu_owned: bool,

    /// The full VPID value, generation bits included. 0 forces a fresh one.
    vpid: u64,
    /// The physical CPU `vpid` was allocated on.
    vpid_cpu: Option<usize>,
    /// The physical CPU the vCPU is loaded on.
    loaded_cpu: Option<usize>,
    /// The physical CPU the vCPU was last put from.
    last_sched_cpu: Option<usize>,

    /// The most recent guest exit.
    pub(crate) exit: GuestExit,
    pub(crate) pending: Option<PendingIo>,
    pub(crate) timer: GuestTimer,
    mp_state: MpState,
    immediate_exit: bool,
    pub(crate) stats: LaVCpuStats,
}

impl<H: LaVCpuHal> LaVCpu<H> {
    pub(crate) fn new(vm: Arc<LaVm<H>>, id: usize, config: LaVCpuCreateConfig) -> Self {
        let mut csr = Box::new(CsrFile::new());
        csr.write(csr::CRMD, csr::CRMD_DA);
        csr.write(csr::TMID, id as u64);

        let signals = Arc::new(VCpuSignals::with_kick(vm.id(), id, H::kick_vcpu));

        debug!("VM[{}] vCPU {} created", vm.id(), id);
        Self {
            vm,
            id,
            state: VCpuState::Created,
            gprs: [0; 32],
            pc: 0,
            csr,
            signals,
            fpu: FpuContext::default(),
            fpu_owned: false,
            vpid: 0,
            vpid_cpu: None,
            loaded_cpu: None,
            last_sched_cpu: None,
            exit: GuestExit::default(),
            pending: None,
            timer: GuestTimer::new(config.timer_hz),
            mp_state: MpState::Runnable,
            immediate_exit: false,
            stats: LaVCpuStats::default(),
        }
    }

    /// Sets the guest entry point.
    pub fn setup(&mut self, entry: GuestPhysAddr) -> AxResult {
        self.with_state_transition(VCpuState::Created, VCpuState::Free, |vcpu| {
            vcpu.pc = entry.as_usize() as u64;
            Ok(())
        })
    }

    /// Get the id of the vcpu.
    pub const fn id(&self) -> usize {
        self.id
    }

    /// Get whether the vcpu is the BSP. We always assume the first vcpu (vcpu with id #0) is the BSP.
    pub const fn is_bsp(&self) -> bool {
        self.id == 0
    }

    /// The VM this vCPU belongs to.
    pub fn vm(&self) -> &Arc<LaVm<H>> {
        &self.vm
    }

    /// Get the state of the vcpu.
    pub fn state(&self) -> VCpuState {
        self.state
    }

    /// Execute a block with the state of the vcpu transitioned from `from` to `to`. If the current state is not `from`, return an error.
    ///
    /// The state will be set to [`VCpuState::Invalid`] if an error occurs (including the case that the current state is not `from`).
    ///
    /// The state will be set to `to` if the block is executed successfully.
    pub fn with_state_transition<F, T>(
        &mut self,
        from: VCpuState,
        to: VCpuState,
        f: F,
    ) -> AxResult<T>
    where
        F: FnOnce(&mut Self) -> AxResult<T>,
    {
        if self.state != from {
            let current = self.state;
            self.state = VCpuState::Invalid;
            ax_err!(
                BadState,
                format!("VCpu state is not {:?}, but {:?}", from, current)
            )
        } else {
            let result = f(self);
            self.state = if result.is_err() {
                VCpuState::Invalid
            } else {
                to
            };
            result
        }
    }

    /// Transition the state of the vcpu. If the current state is not `from`, return an error.
    pub fn transition_state(&mut self, from: VCpuState, to: VCpuState) -> AxResult {
        self.with_state_transition(from, to, |_| Ok(()))
    }

    /// Bind the vcpu to the current physical CPU.
    pub fn bind(&mut self) -> AxResult {
        self.with_state_transition(VCpuState::Free, VCpuState::Ready, |vcpu| {
            vcpu.load(H::current_cpu())
        })
    }

    /// Unbind the vcpu from the current physical CPU.
    pub fn unbind(&mut self) -> AxResult {
        self.with_state_transition(VCpuState::Ready, VCpuState::Free, |vcpu| {
            vcpu.put();
            Ok(())
        })
    }

    /// Run the vcpu until the host has to act.
    ///
    /// A pending MMIO or IOCSR read is completed first from the data the host left in
    /// [`LaVCpu::io_data_mut`]. The guest never owns the FPU once this returns.
    pub fn run(&mut self) -> AxResult<LaVCpuExitReason> {
        self.transition_state(VCpuState::Ready, VCpuState::Running)?;
        self.with_state_transition(VCpuState::Running, VCpuState::Ready, |vcpu| {
            let exit = vcpu.run_loop();
            // The host may move this thread to another CPU before the next run.
            vcpu.lose_fpu();
            exit
        })
    }

    fn run_loop(&mut self) -> AxResult<LaVCpuExitReason> {
        if let Err(kind) = self.complete_pending_io() {
            return Ok(self.internal_error(kind));
        }
        if self.immediate_exit {
            self.stats.signal_exits += 1;
            return Ok(LaVCpuExitReason::Interrupted);
        }

        loop {
            if !self.pre_enter()? {
                self.stats.signal_exits += 1;
                return Ok(LaVCpuExitReason::Interrupted);
            }

            trace!("vCPU {} enter at pc {:#x}", self.id, self.pc);
            let vpid = self.vpid & self.vm.contexts().vpid_mask();
            self.exit = H::enter_guest(GuestContext {
                gprs: &mut self.gprs,
                pc: &mut self.pc,
                csr: &mut *self.csr,
                vpid,
            });
            H::local_irq_enable();

            match self.handle_exit() {
                ExitDecision::ResumeGuest => trace!("vCPU {} re-enter", self.id),
                ExitDecision::ResumeHost(reason) => return Ok(reason),
                ExitDecision::Error(kind) => return Ok(self.internal_error(kind)),
            }
        }
    }

    /// Applies a read the host has answered. Stores are already complete.
    fn complete_pending_io(&mut self) -> Result<(), InternalErrorKind> {
        let Some(pending) = self.pending.take() else {
            return Ok(());
        };
        if pending.is_write {
            return Ok(());
        }
        let val = pending
            .read_result()
            .ok_or(InternalErrorKind::BadCompletionLength)?;
        self.set_gpr(pending.reg, val);
        // IOCSR reads moved PC at the trap.
        if pending.space == IoSpace::Mmio {
            self.pc = self.pc.wrapping_add(4);
        }
        Ok(())
    }

    /// Prepares a guest entry. Returns `Ok(true)` with interrupts disabled when the guest may be
    /// entered, `Ok(false)` with interrupts enabled when a signal needs the host.
    fn pre_enter(&mut self) -> AxResult<bool> {
        loop {
            if H::signal_pending() {
                return Ok(false);
            }
            if H::host_work_pending() {
                self.lose_fpu();
                H::handle_host_work();
            }
            if self.signals.check_request(request::TLB_FLUSH) {
                self.vpid = 0;
            }

            H::local_irq_disable();
            if let Err(err) = self.prepare_entry() {
                H::local_irq_enable();
                return Err(err);
            }
            if H::signal_pending() || H::host_work_pending() || self.signals.has_request() {
                H::local_irq_enable();
                continue;
            }
            return Ok(true);
        }
    }

    /// Runs with interrupts disabled, right before the switch into guest mode.
    fn prepare_entry(&mut self) -> AxResult {
        let cpu = H::current_cpu();
        if self.loaded_cpu != Some(cpu) {
            self.put();
            self.load(cpu)?;
        }
        self.timer.acquire::<H>(self.id, &mut self.csr);
        self.check_vpid(cpu)?;
        self.signals.deliver(&mut self.csr);
        Ok(())
    }

    /// Allocates a fresh VPID if ours belongs to an older generation of `cpu`, or was
    /// allocated on another CPU.
    fn check_vpid(&mut self, cpu: usize) -> AxResult {
        let contexts = self.vm.contexts();
        let mask = contexts.vpid_mask();
        let mut ctx = contexts.get(cpu)?;
        let migrated = self.vpid_cpu != Some(cpu);
        if migrated || (self.vpid & !mask) != (ctx.vpid_cache() & !mask) {
            self.vpid = ctx.next_vpid(mask, H::flush_guest_tlb_all);
            self.vpid_cpu = Some(cpu);
            trace!("vCPU {} VPID {:#x} on CPU {}", self.id, self.vpid, cpu);
        }
        Ok(())
    }

    fn load(&mut self, cpu: usize) -> AxResult {
        let mut ctx = self.vm.contexts().get(cpu)?;
        if ctx.last_vcpu() != Some(self.id) || self.last_sched_cpu != Some(cpu) {
            self.csr.mark_all_hw_dirty();
        }
        ctx.set_last_vcpu(self.id);
        self.loaded_cpu = Some(cpu);
        Ok(())
    }

    /// Must run on the CPU the guest FPU state is live on.
    pub(crate) fn lose_fpu(&mut self) {
        if self.fpu_owned {
            H::save_fpu(&mut self.fpu);
            self.fpu_owned = false;
        }
    }

    fn put(&mut self) {
        self.lose_fpu();
        if let Some(cpu) = self.loaded_cpu.take() {
            self.last_sched_cpu = Some(cpu);
        }
    }

    pub(crate) fn is_runnable(&self) -> bool {
        self.mp_state == MpState::Runnable
            && (self.signals.has_deliverable() || self.signals.has_pending_timer(&self.csr))
    }

    /// Waits until the vCPU is runnable or the host has a signal for this thread.
    pub(crate) fn block(&mut self) {
        self.state = VCpuState::Blocked;
        while !self.is_runnable() && !H::signal_pending() {
            H::wait_for_wakeup(self.vm.id(), self.id, &self.signals);
            self.signals.take_kick();
        }
        self.state = VCpuState::Running;
    }

    fn internal_error(&self, kind: InternalErrorKind) -> LaVCpuExitReason {
        error!(
            "vCPU {} internal error {:?} at pc {:#x}, inst {:#010x}",
            self.id, kind, self.pc, self.exit.badi
        );
        self.dump_regs();
        LaVCpuExitReason::InternalError {
            kind,
            pc: self.pc,
            inst: self.exit.badi,
        }
    }

    pub(crate) fn dump_regs(&self) {
        error!("vCPU {} pc: {:#018x}", self.id, self.pc);
        for (i, regs) in self.gprs.chunks(4).enumerate() {
            error!(
                "$r{:<2}: {:016x} {:016x} {:016x} {:016x}",
                i * 4,
                regs[0],
                regs[1],
                regs[2],
                regs[3]
            );
        }
        error!(
            "CRMD: {:#x} PRMD: {:#x} ECFG: {:#x} ESTAT: {:#x} ERA: {:#x} BADV: {:#x}",
            self.csr.read(csr::CRMD),
            self.csr.read(csr::PRMD),
            self.csr.read(csr::ECFG),
            self.csr.read(csr::ESTAT),
            self.csr.read(csr::ERA),
            self.csr.read(csr::BADV),
        );
    }

    /// The data buffer of a pending read, for the host to fill before the next [`LaVCpu::run`].
    pub fn io_data_mut(&mut self) -> Option<&mut [u8]> {
        match &mut self.pending {
            Some(pending) if !pending.is_write => {
                let len = pending.width.size();
                Some(&mut pending.data[..len])
            }
            _ => None,
        }
    }

    /// The MMIO or IOCSR access awaiting the host, if any.
    pub fn pending_io(&self) -> Option<&PendingIo> {
        self.pending.as_ref()
    }

    /// Gets the value of general-purpose register `reg`. Out-of-range indexes read as zero.
    pub fn gpr(&self, reg: usize) -> u64 {
        self.gprs.get(reg).copied().unwrap_or(0)
    }

    /// Sets the value of general-purpose register `reg`. Writes to `$r0` are ignored.
    pub fn set_gpr(&mut self, reg: usize, val: u64) {
        if reg == 0 {
            return;
        }
        if reg < self.gprs.len() {
            self.gprs[reg] = val;
        } else {
            warn!("vCPU {} set_gpr: register index {} out of range", self.id, reg);
        }
    }

    /// The guest program counter.
    pub fn pc(&self) -> u64 {
        self.pc
    }

    pub fn get_regs(&self) -> LaRegs {
        LaRegs {
            gpr: self.gprs,
            pc: self.pc,
        }
    }

    /// Loads the register file. `$r0` stays zero.
    pub fn set_regs(&mut self, regs: &LaRegs) {
        self.gprs[1..].copy_from_slice(&regs.gpr[1..]);
        self.pc = regs.pc;
    }

    /// Reads one register through the host boundary.
    pub fn get_one_reg(&self, id: OneRegId) -> AxResult<u64> {
        match id {
            OneRegId::Csr(csr) if CsrFile::is_valid(csr) => Ok(self.csr.read(csr)),
            OneRegId::Csr(csr) => ax_err!(InvalidInput, format!("invalid CSR {:#x}", csr)),
            OneRegId::Counter => Ok(self.vm.guest_counter()),
            OneRegId::VCpuReset => ax_err!(InvalidInput, "the reset register is write-only"),
        }
    }

    /// Writes one register through the host boundary.
    pub fn set_one_reg(&mut self, id: OneRegId, val: u64) -> AxResult {
        match id {
            OneRegId::Csr(csr) if CsrFile::is_valid(csr) => self.csr.write(csr, val),
            OneRegId::Csr(csr) => {
                return ax_err!(InvalidInput, format!("invalid CSR {:#x}", csr));
            }
            OneRegId::Counter => self.vm.set_guest_counter(self.id, val),
            OneRegId::VCpuReset => {
                self.timer.reset::<H>(self.id, &mut self.csr);
                self.signals.reset();
                debug!("vCPU {} reset", self.id);
            }
        }
        Ok(())
    }

    /// The guest FPU state. Between runs it is always the saved copy.
    pub fn get_fpu(&self) -> FpuContext {
        self.fpu.clone()
    }

    /// Replaces the guest FPU state, loaded at the guest's next FPU use.
    pub fn set_fpu(&mut self, fpu: &FpuContext) {
        self.fpu = fpu.clone();
    }

    pub fn mp_state(&self) -> MpState {
        self.mp_state
    }

    pub fn set_mp_state(&mut self, state: MpState) {
        self.mp_state = state;
        if state == MpState::Runnable {
            self.signals.wake();
        }
    }

    /// When set, [`LaVCpu::run`] completes a pending access and returns without entering the
    /// guest.
    pub fn set_immediate_exit(&mut self, immediate_exit: bool) {
        self.immediate_exit = immediate_exit;
    }

    pub fn stats(&self) -> LaVCpuStats {
        self.stats
    }

    /// The signal block other threads use to interrupt this vCPU.
    pub fn signals(&self) -> &Arc<VCpuSignals> {
        &self.signals
    }

    /// The guest CSR mirror.
    pub fn csr(&self) -> &CsrFile {
        &self.csr
    }

    pub fn timer_mode(&self) -> TimerMode {
        self.timer.mode()
    }

    /// The guest timer frequency.
    pub fn timer_hz(&self) -> u64 {
        self.timer.hz()
    }

    /// The current VPID, generation bits included.
    pub fn vpid(&self) -> u64 {
        self.vpid
    }

    /// Whether the guest currently owns the FPU.
    pub fn fpu_owned(&self) -> bool {
        self.fpu_owned
    }
}

impl<H: LaVCpuHal> Drop for LaVCpu<H> {
    fn drop(&mut self) {
        self.vm.remove_vcpu(self.id);
    }
}
