use bitflags::bitflags;

use crate::consts::{csr, estat};

bitflags! {
    /// How a guest CSR id is backed.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct CsrCapability: u8 {
        /// Kept only in the software mirror.
        const SOFTWARE = 1 << 0;
        /// Has guest hardware state that is loaded on entry and saved on exit.
        const HARDWARE = 1 << 1;
    }
}

const CSR_WORDS: usize = csr::MAX_NUMS / 64;
/// The csr field of `csrrd/csrwr/csrxchg` is 14 bits wide.
const ENCODABLE_WORDS: usize = (1 << 14) / 64;

/// Capability of every CSR id, computed at compile time. An empty set marks an invalid id.
static CAPABILITIES: [CsrCapability; csr::MAX_NUMS] = build_capabilities();

const fn build_capabilities() -> [CsrCapability; csr::MAX_NUMS] {
    let mut caps = [CsrCapability::empty(); csr::MAX_NUMS];

    const HW_IDS: [u16; 38] = [
        csr::CRMD,
        csr::PRMD,
        csr::EUEN,
        csr::MISC,
        csr::ECFG,
        csr::ESTAT,
        csr::ERA,
        csr::BADV,
        csr::BADI,
        csr::EENTRY,
        csr::TLBIDX,
        csr::TLBEHI,
        csr::TLBELO0,
        csr::TLBELO1,
        csr::ASID,
        csr::PGDL,
        csr::PGDH,
        csr::PGD,
        csr::PWCTL0,
        csr::PWCTL1,
        csr::STLBPGSIZE,
        csr::RVACFG,
        csr::CPUID,
        csr::PRCFG1,
        csr::PRCFG2,
        csr::PRCFG3,
        csr::TMID,
        csr::TCFG,
        csr::TVAL,
        csr::CNTC,
        csr::TINTCLR,
        csr::LLBCTL,
        csr::TLBRENTRY,
        csr::TLBRBADV,
        csr::TLBRERA,
        csr::TLBRSAVE,
        csr::TLBRELO0,
        csr::TLBRELO1,
    ];
    let mut i = 0;
    while i < HW_IDS.len() {
        caps[HW_IDS[i] as usize] = CsrCapability::HARDWARE;
        i += 1;
    }
    let hw_ranges: [(u16, u16); 3] = [
        (csr::KS0, csr::KS8),
        (csr::TLBREHI, csr::TLBRPRMD),
        (csr::DMWIN0, csr::DMWIN3),
    ];
    let mut r = 0;
    while r < hw_ranges.len() {
        let mut id = hw_ranges[r].0;
        while id <= hw_ranges[r].1 {
            caps[id as usize] = CsrCapability::HARDWARE;
            id += 1;
        }
        r += 1;
    }

    let sw_ranges: [(u16, u16); 9] = [
        (csr::IMPCTL1, csr::IMPCTL2),
        (csr::MERRCTL, csr::MERRSAVE),
        (csr::CTAG, csr::CTAG),
        (csr::PERFCTRL0, csr::PERFCNTR3),
        (csr::MWPC, csr::MWPS),
        (csr::DB0ADDR, csr::DB7ASID),
        (csr::FWPC, csr::FWPS),
        (csr::IB0ADDR, csr::IB7ASID),
        (csr::DEBUG, csr::DESAVE),
    ];
    let mut r = 0;
    while r < sw_ranges.len() {
        let mut id = sw_ranges[r].0;
        while id <= sw_ranges[r].1 {
            caps[id as usize] = CsrCapability::SOFTWARE;
            id += 1;
        }
        r += 1;
    }
    caps
}

/// A fixed-size bitmap over CSR ids.
#[derive(Clone)]
struct CsrBitmap<const W: usize>([u64; W]);

impl<const W: usize> CsrBitmap<W> {
    const fn new() -> Self {
        Self([0; W])
    }

    fn set(&mut self, id: usize) {
        self.0[id / 64] |= 1 << (id % 64);
    }

    /// Sets the bit and returns whether it was clear before.
    fn test_and_set(&mut self, id: usize) -> bool {
        let was_clear = !self.get(id);
        self.set(id);
        was_clear
    }

    fn get(&self, id: usize) -> bool {
        self.0[id / 64] & (1 << (id % 64)) != 0
    }

    fn take(&mut self) -> Self {
        core::mem::replace(self, Self::new())
    }

    #[cfg(test)]
    fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        (0..W * 64).filter(move |&id| self.get(id))
    }
}

/// Software mirror of a vCPU's guest CSRs.
///
/// The mirror is authoritative between exits: the hardware layer loads the hardware-shadowed
/// ids it reports as dirty before entering the guest and stores all of them back after the
/// exit, so every read here observes the latest write without a guest round trip.
///
/// `ESTAT` is split: bits 2..=9 live in the virtual interrupt controller field (`GINTC`)
/// rather than in the ESTAT slot.
#[derive(Clone)]
pub struct CsrFile {
    regs: [u64; csr::MAX_NUMS],
    /// The root-level guest interrupt controller, `GINTC.VIP` in bits 0..=7.
    gintc: u64,
    /// Hardware-shadowed ids written since the last load into hardware.
    dirty: CsrBitmap<CSR_WORDS>,
    /// Invalid ids that have already been reported.
    reported: CsrBitmap<ENCODABLE_WORDS>,
}

impl CsrFile {
    /// Creates a mirror with every register zeroed.
    pub fn new() -> Self {
        Self {
            regs: [0; csr::MAX_NUMS],
            gintc: 0,
            dirty: CsrBitmap::new(),
            reported: CsrBitmap::new(),
        }
    }

    /// The capability of `id`, empty for invalid or out-of-range ids.
    pub fn capability(id: u16) -> CsrCapability {
        CAPABILITIES
            .get(id as usize)
            .copied()
            .unwrap_or(CsrCapability::empty())
    }

    /// Whether `id` names a guest CSR at all.
    pub fn is_valid(id: u16) -> bool {
        !Self::capability(id).is_empty()
    }

    /// Reads the guest-visible value of `id`. Invalid ids read as zero.
    pub fn read(&self, id: u16) -> u64 {
        if !Self::is_valid(id) {
            return 0;
        }
        if id == csr::ESTAT {
            let vip = self.gintc & 0xff;
            return self.regs[id as usize] | (vip << estat::GINTC_SHIFT);
        }
        self.regs[id as usize]
    }

    /// Writes the guest-visible value of `id`. Writes to invalid ids are dropped.
    pub fn write(&mut self, id: u16, val: u64) {
        if !Self::is_valid(id) {
            return;
        }
        if id == csr::ESTAT {
            self.gintc = (val & estat::GINTC_MASK) >> estat::GINTC_SHIFT;
            self.store(id, val & !estat::GINTC_MASK);
            return;
        }
        self.store(id, val);
    }

    /// Replaces only the bits of `id` selected by `mask`.
    pub fn exchange(&mut self, id: u16, mask: u64, val: u64) {
        let old = self.read(id);
        self.write(id, (old & !mask) | (val & mask));
    }

    fn store(&mut self, id: u16, val: u64) {
        self.regs[id as usize] = val;
        if Self::capability(id).contains(CsrCapability::HARDWARE) {
            self.dirty.set(id as usize);
        }
    }

    /// Sets bits in the raw ESTAT slot, bypassing the split view.
    pub(crate) fn set_estat_bits(&mut self, bits: u64) {
        let val = self.regs[csr::ESTAT as usize] | bits;
        self.store(csr::ESTAT, val);
    }

    /// Clears bits in the raw ESTAT slot, bypassing the split view.
    pub(crate) fn clear_estat_bits(&mut self, bits: u64) {
        let val = self.regs[csr::ESTAT as usize] & !bits;
        self.store(csr::ESTAT, val);
    }

    /// The raw ESTAT slot without the GINTC-backed bits.
    pub fn raw_estat(&self) -> u64 {
        self.regs[csr::ESTAT as usize]
    }

    /// The guest interrupt controller value loaded into the root `GINTC` register on entry.
    pub fn gintc(&self) -> u64 {
        self.gintc
    }

    pub(crate) fn set_gintc_bits(&mut self, bits: u64) {
        self.gintc |= bits;
    }

    pub(crate) fn clear_gintc_bits(&mut self, bits: u64) {
        self.gintc &= !bits;
    }

    /// Drains the set of hardware-shadowed ids written since the previous call.
    pub fn take_dirty(&mut self) -> impl Iterator<Item = u16> {
        let dirty = self.dirty.take();
        (0..csr::MAX_NUMS)
            .filter(move |&id| dirty.get(id))
            .map(|id| id as u16)
    }

    /// Marks every hardware-shadowed id dirty, forcing a full reload on the next entry.
    pub fn mark_all_hw_dirty(&mut self) {
        for id in 0..csr::MAX_NUMS {
            if CAPABILITIES[id].contains(CsrCapability::HARDWARE) {
                self.dirty.set(id);
            }
        }
    }

    /// Stores a value read back from guest hardware after an exit; does not mark it dirty.
    pub fn sync_from_hw(&mut self, id: u16, val: u64) {
        if Self::capability(id).contains(CsrCapability::HARDWARE) {
            self.regs[id as usize] = val;
        }
    }

    /// Records that the guest touched the invalid `id`. Returns `true` only the first time.
    pub(crate) fn note_unsupported(&mut self, id: u16) -> bool {
        let id = id as usize & ((ENCODABLE_WORDS * 64) - 1);
        self.reported.test_and_set(id)
    }

    #[cfg(test)]
    pub(crate) fn reported_ids(&self) -> alloc::vec::Vec<usize> {
        self.reported.iter().collect()
    }
}

impl Default for CsrFile {
    fn default() -> Self {
        Self::new()
    }
}
