use alloc::vec::Vec;

use axerrno::{ax_err, AxResult};
use spin::{Mutex, MutexGuard};

/// The VPID state of one physical CPU for one VM.
///
/// `vpid_cache` is a monotonic counter: its low `gid_bits` bits are the hardware tag most
/// recently handed out on this CPU, the high bits are the tag generation.
#[derive(Debug)]
pub struct VpidContext {
    vpid_cache: u64,
    /// The vCPU that was last loaded on this CPU. Bookkeeping only, never dereferenced.
    last_vcpu: Option<usize>,
}

impl VpidContext {
    fn new(vpid_mask: u64) -> Self {
        Self {
            vpid_cache: vpid_mask + 1,
            last_vcpu: None,
        }
    }

    /// The last VPID value handed out on this CPU.
    pub fn vpid_cache(&self) -> u64 {
        self.vpid_cache
    }

    /// The id of the vCPU last loaded on this CPU.
    pub fn last_vcpu(&self) -> Option<usize> {
        self.last_vcpu
    }

    pub(crate) fn set_last_vcpu(&mut self, vcpu_id: usize) {
        self.last_vcpu = Some(vcpu_id);
    }

    /// Hands out the next VPID on this CPU.
    ///
    /// Tag 0 is reserved for the host. When the tag bits wrap, a new generation starts: the
    /// caller-provided `flush` drops every guest TLB entry of this CPU. If the whole 64-bit
    /// counter wraps, counting restarts at the first generation rather than at zero.
    pub(crate) fn next_vpid(&mut self, vpid_mask: u64, flush: impl FnOnce()) -> u64 {
        let mut vpid = self.vpid_cache.wrapping_add(1);
        if vpid & vpid_mask == 0 {
            if vpid == 0 {
                vpid = vpid_mask + 1;
            }
            vpid += 1;
            flush();
        }
        self.vpid_cache = vpid;
        vpid
    }

    #[cfg(test)]
    pub(crate) fn set_vpid_cache(&mut self, vpid: u64) {
        self.vpid_cache = vpid;
    }
}

/// Per-physical-CPU VPID contexts of a VM.
///
/// A context is only ever modified by the thread loading a vCPU onto that physical CPU with
/// local interrupts disabled, so its lock is uncontended; it exists to make the table `Sync`.
pub struct VpidContexts {
    vpid_mask: u64,
    contexts: Vec<Mutex<VpidContext>>,
}

impl VpidContexts {
    /// Creates contexts for `nr_cpus` physical CPUs with a `gid_bits`-wide hardware tag.
    pub fn new(nr_cpus: usize, gid_bits: u32) -> AxResult<Self> {
        if nr_cpus == 0 {
            return ax_err!(InvalidInput, "a VM needs at least one physical CPU");
        }
        if gid_bits == 0 || gid_bits >= 32 {
            return ax_err!(InvalidInput, format!("unsupported VPID width {}", gid_bits));
        }
        let vpid_mask = (1u64 << gid_bits) - 1;
        Ok(Self {
            vpid_mask,
            contexts: (0..nr_cpus)
                .map(|_| Mutex::new(VpidContext::new(vpid_mask)))
                .collect(),
        })
    }

    /// The mask of the hardware tag bits.
    pub fn vpid_mask(&self) -> u64 {
        self.vpid_mask
    }

    /// The number of physical CPUs covered.
    pub fn nr_cpus(&self) -> usize {
        self.contexts.len()
    }

    /// Locks the context of physical CPU `cpu`.
    pub fn get(&self, cpu: usize) -> AxResult<MutexGuard<'_, VpidContext>> {
        match self.contexts.get(cpu) {
            Some(ctx) => Ok(ctx.lock()),
            None => ax_err!(InvalidInput, format!("physical CPU {} out of range", cpu)),
        }
    }

    /// Forgets `vcpu_id` on every physical CPU that still names it as the last loaded vCPU.
    pub fn forget_vcpu(&self, vcpu_id: usize) {
        for ctx in &self.contexts {
            let mut ctx = ctx.lock();
            if ctx.last_vcpu == Some(vcpu_id) {
                ctx.last_vcpu = None;
            }
        }
    }
}
