use alloc::sync::Arc;

use crate::consts::csr::TCFG;
use crate::csr::CsrFile;
use crate::hal::LaVCpuHal;
use crate::irq::VCpuSignals;

/// Where the guest timer currently runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimerMode {
    /// The guest timer CSRs count in hardware; only possible while the vCPU is in guest mode.
    Hardware,
    /// A host software timer stands in, so an expiry can wake a blocked vCPU.
    Software,
}

/// Guest timer hand-off between hardware and the host software timer.
#[derive(Debug)]
pub(crate) struct GuestTimer {
    mode: TimerMode,
    hz: u64,
}

impl GuestTimer {
    pub fn new(hz: u64) -> Self {
        Self {
            mode: TimerMode::Hardware,
            hz,
        }
    }

    pub fn mode(&self) -> TimerMode {
        self.mode
    }

    pub fn hz(&self) -> u64 {
        self.hz
    }

    /// Brings the timer back into hardware before a guest entry.
    pub fn acquire<H: LaVCpuHal>(&mut self, vcpu_id: usize, csr: &mut CsrFile) {
        if self.mode == TimerMode::Software {
            H::timer_to_hardware(vcpu_id, csr);
            self.mode = TimerMode::Hardware;
        }
    }

    /// Hands the timer to the host before the vCPU blocks.
    pub fn save<H: LaVCpuHal>(
        &mut self,
        vcpu_id: usize,
        csr: &CsrFile,
        signals: &Arc<VCpuSignals>,
    ) {
        if self.mode == TimerMode::Hardware {
            H::timer_to_software(vcpu_id, csr, signals);
            self.mode = TimerMode::Software;
        }
    }

    /// Stops the guest timer.
    pub fn reset<H: LaVCpuHal>(&mut self, vcpu_id: usize, csr: &mut CsrFile) {
        csr.write(TCFG, 0);
        self.acquire::<H>(vcpu_id, csr);
    }
}
