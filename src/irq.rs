use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use axerrno::{ax_err, AxResult};

use crate::consts::irq::*;
use crate::csr::CsrFile;

/// Where an interrupt source is asserted in guest state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum IrqSignal {
    /// A dedicated bit of the guest `ESTAT`.
    Estat(u64),
    /// A `VIP` bit of the shared guest interrupt controller.
    Gintc(u64),
}

/// Signal of every interrupt number. `PCOV` and `NMI` have no virtual signal.
static IRQ_SIGNALS: [Option<IrqSignal>; NR_IRQS] = [
    Some(IrqSignal::Estat(1 << 0)),  // SWI0
    Some(IrqSignal::Estat(1 << 1)),  // SWI1
    Some(IrqSignal::Gintc(1 << 0)),  // HWI0
    Some(IrqSignal::Gintc(1 << 1)),  // HWI1
    Some(IrqSignal::Gintc(1 << 2)),  // HWI2
    Some(IrqSignal::Gintc(1 << 3)),  // HWI3
    Some(IrqSignal::Gintc(1 << 4)),  // HWI4
    Some(IrqSignal::Gintc(1 << 5)),  // HWI5
    Some(IrqSignal::Gintc(1 << 6)),  // HWI6
    Some(IrqSignal::Gintc(1 << 7)),  // HWI7
    None,                            // PCOV
    Some(IrqSignal::Estat(1 << 11)), // TI
    Some(IrqSignal::Estat(1 << 12)), // IPI
    None,                            // NMI
];

/// Sources above `IPI` are never scanned by delivery.
const DELIVERY_MASK: u64 = (1 << (IPI + 1)) - 1;

/// `ESTAT` bit reflecting a live guest timer interrupt.
const ESTAT_TIMER: u64 = 1 << 11;

/// Request bits checked before every entry.
pub(crate) mod request {
    /// Drop the vCPU's VPID so the next entry allocates a fresh one.
    pub const TLB_FLUSH: u32 = 1 << 0;
}

/// The part of a vCPU other threads may touch: interrupt bitsets, requests and the wake flag.
///
/// Shared through an `Arc` between the thread running the vCPU and every thread that injects
/// interrupts into it. All mutation is atomic; the owning thread consumes the bitsets in
/// [`VCpuSignals::deliver`] right before each guest entry.
///
/// Every wake also calls the kick function the block was created with, so a vCPU parked in
/// [`LaVCpuHal::wait_for_wakeup`](crate::LaVCpuHal::wait_for_wakeup) is released no matter
/// which thread raised the signal.
#[derive(Debug)]
pub struct VCpuSignals {
    pending: AtomicU64,
    clear: AtomicU64,
    requests: AtomicU32,
    kicked: AtomicBool,
    vm_id: usize,
    vcpu_id: usize,
    kick: fn(usize, usize),
}

fn no_kick(_vm_id: usize, _vcpu_id: usize) {}

impl VCpuSignals {
    /// Creates an empty signal block with no kick target.
    pub const fn new() -> Self {
        Self::with_kick(0, 0, no_kick)
    }

    /// Creates an empty signal block whose wakes call `kick(vm_id, vcpu_id)`.
    pub const fn with_kick(vm_id: usize, vcpu_id: usize, kick: fn(usize, usize)) -> Self {
        Self {
            pending: AtomicU64::new(0),
            clear: AtomicU64::new(0),
            requests: AtomicU32::new(0),
            kicked: AtomicBool::new(false),
            vm_id,
            vcpu_id,
            kick,
        }
    }

    /// Requests `irq` be raised at the next entry, and wakes the vCPU.
    pub fn queue(&self, irq: usize) -> AxResult {
        if irq >= NR_IRQS {
            return ax_err!(InvalidInput, format!("irq {} out of range", irq));
        }
        self.pending.fetch_or(1 << irq, Ordering::AcqRel);
        self.clear.fetch_and(!(1 << irq), Ordering::AcqRel);
        self.wake();
        Ok(())
    }

    /// Requests `irq` be lowered at the next entry, and wakes the vCPU.
    pub fn dequeue(&self, irq: usize) -> AxResult {
        if irq >= NR_IRQS {
            return ax_err!(InvalidInput, format!("irq {} out of range", irq));
        }
        self.pending.fetch_and(!(1 << irq), Ordering::AcqRel);
        self.clear.fetch_or(1 << irq, Ordering::AcqRel);
        self.wake();
        Ok(())
    }

    /// Whether any interrupt is waiting to be raised.
    pub fn has_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire) != 0
    }

    /// Whether a queued interrupt will be asserted by the next [`VCpuSignals::deliver`].
    pub fn has_deliverable(&self) -> bool {
        self.pending.load(Ordering::Acquire) & DELIVERY_MASK != 0
    }

    /// Whether a timer interrupt is queued or already live in the guest `ESTAT`.
    pub fn has_pending_timer(&self, csr: &CsrFile) -> bool {
        self.pending.load(Ordering::Acquire) & (1 << TI) != 0 || csr.raw_estat() & ESTAT_TIMER != 0
    }

    /// Drops all queued raise and lower requests.
    pub fn reset(&self) {
        self.pending.store(0, Ordering::Release);
        self.clear.store(0, Ordering::Release);
    }

    /// Applies queued lower requests, then queued raise requests, to the guest state in `csr`.
    ///
    /// Both scans run from the lowest interrupt number up to and including `IPI`. Raises are
    /// applied last, so a source with both bits set ends up asserted.
    pub fn deliver(&self, csr: &mut CsrFile) {
        let to_clear = self.clear.load(Ordering::Acquire) & DELIVERY_MASK;
        for irq in set_bits(to_clear) {
            self.clear.fetch_and(!(1 << irq), Ordering::AcqRel);
            match IRQ_SIGNALS[irq] {
                Some(IrqSignal::Estat(bit)) => csr.clear_estat_bits(bit),
                Some(IrqSignal::Gintc(bit)) => csr.clear_gintc_bits(bit),
                None => {}
            }
        }

        let to_raise = self.pending.load(Ordering::Acquire) & DELIVERY_MASK;
        for irq in set_bits(to_raise) {
            self.pending.fetch_and(!(1 << irq), Ordering::AcqRel);
            match IRQ_SIGNALS[irq] {
                Some(IrqSignal::Estat(bit)) => csr.set_estat_bits(bit),
                Some(IrqSignal::Gintc(bit)) => csr.set_gintc_bits(bit),
                None => {}
            }
        }
    }

    pub(crate) fn make_request(&self, req: u32) {
        self.requests.fetch_or(req, Ordering::AcqRel);
        self.wake();
    }

    /// Takes and clears `req`, returning whether it was set.
    pub(crate) fn check_request(&self, req: u32) -> bool {
        self.requests.fetch_and(!req, Ordering::AcqRel) & req != 0
    }

    /// Whether any request is outstanding.
    pub(crate) fn has_request(&self) -> bool {
        self.requests.load(Ordering::Acquire) != 0
    }

    /// Marks the vCPU as kicked and kicks it, so a blocked owner re-evaluates whether it can run.
    pub fn wake(&self) {
        self.kicked.store(true, Ordering::Release);
        (self.kick)(self.vm_id, self.vcpu_id);
    }

    /// Consumes a pending kick.
    pub fn take_kick(&self) -> bool {
        self.kicked.swap(false, Ordering::AcqRel)
    }
}

impl Default for VCpuSignals {
    fn default() -> Self {
        Self::new()
    }
}

/// Indexes of set bits, lowest first.
fn set_bits(mut bits: u64) -> impl Iterator<Item = usize> {
    core::iter::from_fn(move || {
        if bits == 0 {
            return None;
        }
        let idx = bits.trailing_zeros() as usize;
        bits &= bits - 1;
        Some(idx)
    })
}
