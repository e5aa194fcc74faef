use alloc::sync::Arc;

use crate::addr::GuestPhysAddr;
use crate::csr::CsrFile;
use crate::irq::VCpuSignals;
use crate::regs::FpuContext;

/// Returned by [`LaVCpuHal::resolve_guest_page_fault`] when the faulting address is not
/// backed by guest RAM and must be handled as MMIO.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NeedsMmio;

/// The guest state handed to the hardware layer for one guest entry.
///
/// Before switching to guest mode the implementation loads every id yielded by
/// [`CsrFile::take_dirty`] into the guest CSRs, `csr.gintc()` into the root `GINTC` register
/// and `vpid` into `GSTAT.GID`. After the exit it stores the general-purpose registers and PC
/// back here and refreshes the hardware-shadowed CSRs with [`CsrFile::sync_from_hw`].
pub struct GuestContext<'a> {
    /// General-purpose registers; `gprs[0]` is always zero.
    pub gprs: &'a mut [u64; 32],
    /// The guest program counter.
    pub pc: &'a mut u64,
    /// The guest CSR mirror.
    pub csr: &'a mut CsrFile,
    /// The hardware VPID tag for this entry.
    pub vpid: u64,
}

/// The raw state hardware reports on a guest exit.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GuestExit {
    /// The host `ESTAT` at exit: exception code and interrupt status.
    pub estat: u64,
    /// The faulting virtual address (`BADV`).
    pub badv: u64,
    /// The faulting instruction word (`BADI`).
    pub badi: u32,
}

/// The interfaces which the underlying software (kernel or hypervisor) must implement.
///
/// Functions documented as running with interrupts disabled are only called between
/// [`LaVCpuHal::local_irq_disable`] and [`LaVCpuHal::local_irq_enable`].
pub trait LaVCpuHal {
    /// Returns the id of the physical CPU the caller runs on.
    fn current_cpu() -> usize;

    /// Reads word `index` of the host `cpucfg` space.
    fn read_host_cpucfg(index: usize) -> u32;

    /// Reads the stable counter (`rdtime`).
    fn read_counter() -> u64;

    /// Disables interrupts on the current physical CPU.
    fn local_irq_disable();

    /// Enables interrupts on the current physical CPU.
    fn local_irq_enable();

    /// Switches into guest mode and runs until the next exit.
    ///
    /// Called, and returns, with interrupts disabled.
    fn enter_guest(ctx: GuestContext<'_>) -> GuestExit;

    /// Drops every guest TLB entry of the current physical CPU. Runs with interrupts disabled.
    fn flush_guest_tlb_all();

    /// Tries to map `gpa` for the faulting access.
    ///
    /// Returns `Ok` when the fault was resolved and the guest can retry the access, or
    /// [`NeedsMmio`] when `gpa` is not backed by guest RAM.
    fn resolve_guest_page_fault(
        vm_id: usize,
        vcpu_id: usize,
        gpa: GuestPhysAddr,
        is_write: bool,
    ) -> Result<(), NeedsMmio>;

    /// Saves the live FPU registers into `fpu`.
    fn save_fpu(fpu: &mut FpuContext);

    /// Loads `fpu` into the FPU registers and enables the FPU for the guest.
    fn restore_fpu(fpu: &FpuContext);

    /// Moves the guest timer from hardware into a host software timer.
    ///
    /// The host must queue [`irq::TI`](crate::irq_num::TI) on `signals` when the software timer
    /// expires. Queuing kicks the vCPU through [`LaVCpuHal::kick_vcpu`].
    fn timer_to_software(vcpu_id: usize, csr: &CsrFile, signals: &Arc<VCpuSignals>);

    /// Cancels the software timer and moves the guest timer back into hardware.
    fn timer_to_hardware(vcpu_id: usize, csr: &mut CsrFile);

    /// Whether the current thread has a signal pending that must be handled in the host.
    fn signal_pending() -> bool {
        false
    }

    /// Whether the host wants the CPU back (rescheduling, deferred work).
    fn host_work_pending() -> bool {
        false
    }

    /// Lets the host perform its pending work, e.g. reschedule. Runs with interrupts enabled.
    fn handle_host_work() {}

    /// Parks the current thread until [`LaVCpuHal::kick_vcpu`] is called for the same vCPU or a
    /// host signal arrives. Spurious returns are allowed.
    ///
    /// A kick that happens between the caller's runnable check and the park must not be lost.
    fn wait_for_wakeup(vm_id: usize, vcpu_id: usize, signals: &VCpuSignals) {
        let _ = (vm_id, vcpu_id, signals);
        core::hint::spin_loop();
    }

    /// Forces the vCPU out of guest mode or out of its idle wait.
    ///
    /// Called from any thread whenever the vCPU's [`VCpuSignals`] wake it, software timer expiry
    /// included.
    fn kick_vcpu(vm_id: usize, vcpu_id: usize) {
        let _ = (vm_id, vcpu_id);
    }
}
