use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use core::marker::PhantomData;
use core::sync::atomic::{AtomicU64, Ordering};

use axerrno::{ax_err, AxResult};
use spin::Mutex;

use crate::consts::cpucfg::*;
use crate::hal::LaVCpuHal;
use crate::irq::{request, VCpuSignals};
use crate::percpu::VpidContexts;
use crate::vcpu::{LaVCpu, LaVCpuCreateConfig};

/// Feature bits withheld from the guest, per cpucfg word.
static CPUCFG_HIDDEN: [(usize, u32); 2] = [
    // No nested virtualization.
    (2, CFG2_LVZP | CFG2_LVZVER),
    // No performance monitor.
    (6, CFG6_PMP | CFG6_PMVER | CFG6_PMNUM | CFG6_PMBITS | CFG6_UPM),
];

/// The cpucfg words presented to the guest.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CpucfgTable {
    words: [u32; MAX_REGS],
}

impl CpucfgTable {
    /// Builds the guest view of the host words `words`, hiding the features guests never see.
    pub fn new(mut words: [u32; MAX_REGS]) -> Self {
        for &(index, hidden) in CPUCFG_HIDDEN.iter() {
            words[index] &= !hidden;
        }
        Self { words }
    }

    /// Reads the host words through the hardware layer.
    pub fn from_host<H: LaVCpuHal>() -> Self {
        let mut words = [0; MAX_REGS];
        for (index, word) in words.iter_mut().enumerate() {
            *word = H::read_host_cpucfg(index);
        }
        Self::new(words)
    }

    /// Word `index`; indexes past the table read as zero.
    pub fn read(&self, index: usize) -> u32 {
        self.words.get(index).copied().unwrap_or(0)
    }
}

/// Configuration for creating a [`LaVm`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LaVmConfig {
    /// Number of physical CPUs vCPUs of this VM may run on.
    pub nr_cpus: usize,
    /// Width of the hardware VPID tag (`GSTAT.GIDBIT`).
    pub gid_bits: u32,
}

impl Default for LaVmConfig {
    fn default() -> Self {
        Self {
            nr_cpus: 1,
            gid_bits: 8,
        }
    }
}

/// The VM-wide state shared by all vCPUs of one guest.
///
/// Other vCPU threads reach a vCPU only through the registry of [`VCpuSignals`] kept here.
pub struct LaVm<H: LaVCpuHal> {
    id: usize,
    cpucfg: CpucfgTable,
    contexts: VpidContexts,
    /// Guest counter minus host counter, as a wrapping difference.
    time_offset: AtomicU64,
    vcpus: Mutex<BTreeMap<usize, Arc<VCpuSignals>>>,
    _hal: PhantomData<fn() -> H>,
}

impl<H: LaVCpuHal> LaVm<H> {
    /// Creates a VM. The guest cpucfg table is read from the host once, here.
    pub fn new(id: usize, config: LaVmConfig) -> AxResult<Arc<Self>> {
        let contexts = VpidContexts::new(config.nr_cpus, config.gid_bits)?;
        debug!(
            "VM[{}] created: {} physical CPUs, {}-bit VPID",
            id, config.nr_cpus, config.gid_bits
        );
        Ok(Arc::new(Self {
            id,
            cpucfg: CpucfgTable::from_host::<H>(),
            contexts,
            time_offset: AtomicU64::new(0),
            vcpus: Mutex::new(BTreeMap::new()),
            _hal: PhantomData,
        }))
    }

    /// The VM id.
    pub fn id(&self) -> usize {
        self.id
    }

    /// The guest cpucfg table.
    pub fn cpucfg(&self) -> &CpucfgTable {
        &self.cpucfg
    }

    /// The per-physical-CPU VPID contexts.
    pub fn contexts(&self) -> &VpidContexts {
        &self.contexts
    }

    /// Creates vCPU `id`. Ids are unique within a VM.
    ///
    /// Dropping the returned vCPU unregisters it and clears every per-CPU reference to it.
    pub fn create_vcpu(
        self: &Arc<Self>,
        id: usize,
        config: LaVCpuCreateConfig,
    ) -> AxResult<LaVCpu<H>> {
        let mut vcpus = self.vcpus.lock();
        if vcpus.contains_key(&id) {
            return ax_err!(
                AlreadyExists,
                format!("VM[{}] vCPU {} already exists", self.id, id)
            );
        }
        let vcpu = LaVCpu::new(self.clone(), id, config);
        vcpus.insert(id, vcpu.signals().clone());
        Ok(vcpu)
    }

    pub(crate) fn remove_vcpu(&self, id: usize) {
        self.vcpus.lock().remove(&id);
        self.contexts.forget_vcpu(id);
        debug!("VM[{}] vCPU {} destroyed", self.id, id);
    }

    /// The signal block of vCPU `id`.
    pub fn vcpu_signals(&self, id: usize) -> AxResult<Arc<VCpuSignals>> {
        match self.vcpus.lock().get(&id) {
            Some(signals) => Ok(signals.clone()),
            None => ax_err!(NotFound, format!("VM[{}] has no vCPU {}", self.id, id)),
        }
    }

    /// Raises (`irq > 0`) or lowers (`irq < 0`, source `-irq`) an interrupt of vCPU `vcpu_id`.
    ///
    /// The vCPU is kicked either way, through [`LaVCpuHal::kick_vcpu`]. Zero is not an interrupt
    /// source.
    pub fn inject_interrupt(&self, vcpu_id: usize, irq: i32) -> AxResult {
        if irq == 0 {
            return ax_err!(InvalidInput, "irq 0 is neither a raise nor a lower request");
        }
        let signals = self.vcpu_signals(vcpu_id)?;
        let source = irq.unsigned_abs() as usize;
        if irq > 0 {
            signals.queue(source)?;
        } else {
            signals.dequeue(source)?;
        }
        trace!("VM[{}] vCPU {} irq {}", self.id, vcpu_id, irq);
        Ok(())
    }

    /// Makes vCPU `vcpu_id` pick a fresh VPID before its next entry.
    pub fn request_tlb_flush(&self, vcpu_id: usize) -> AxResult {
        self.vcpu_signals(vcpu_id)?.make_request(request::TLB_FLUSH);
        Ok(())
    }

    /// The guest stable counter.
    pub fn guest_counter(&self) -> u64 {
        H::read_counter().wrapping_add(self.time_offset.load(Ordering::Acquire))
    }

    /// Sets the guest stable counter on behalf of vCPU `vcpu_id`.
    ///
    /// The offset is VM-wide and only vCPU 0 establishes it; writes from other vCPUs are ignored.
    pub(crate) fn set_guest_counter(&self, vcpu_id: usize, val: u64) {
        if vcpu_id == 0 {
            let offset = val.wrapping_sub(H::read_counter());
            self.time_offset.store(offset, Ordering::Release);
        }
    }
}
