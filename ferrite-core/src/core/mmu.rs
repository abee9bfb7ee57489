//! Sv32 virtual memory: the two-level page-table walk and the translation caches.

use std::collections::HashMap;

use bitvec::{order::Lsb0, view::BitView};
use log::{debug, trace};
use std::fmt;
use thiserror::Error;

use super::status::Status;
use super::trap::Trap;
use crate::address_space::{AddressSpace, InvalidAddress};
use crate::PrivilegeLevel;

// log2(size of a single page in bytes)
const PAGE_SIZE_SHF: u32 = 12;
const PAGE_SIZE_MSK: u32 = (1 << PAGE_SIZE_SHF) - 1;
// log2(size of a single PTE in bytes)
const PTE_SIZE_SHF: u32 = 2;
// log2(number of PTEs that fit in one page)
const PTE_COUNT_SHF: u32 = PAGE_SIZE_SHF - PTE_SIZE_SHF;
const PTE_COUNT_MSK: u32 = (1 << PTE_COUNT_SHF) - 1;

/// Entries kept in the physical-address composition cache before it is flushed wholesale.
const PA_CACHE_LIMIT: usize = 524_288;

/// The three kinds of memory access the MMU distinguishes.
///
/// Each kind has its own slot in the translation accelerator, and each maps page faults to its
/// own exception cause.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum AccessType {
    /// Regular loads.
    Read,
    /// Regular stores and AMOs.
    Write,
    /// Instruction fetches.
    Execute,
}

impl AccessType {
    fn accel_slot(self) -> usize {
        match self {
            Self::Read => 0,
            Self::Write => 1,
            Self::Execute => 2,
        }
    }
}

impl fmt::Display for AccessType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match *self {
            Self::Read => "R",
            Self::Write => "W",
            Self::Execute => "X",
        })
    }
}

#[derive(Error, Debug, Clone, Copy, Eq, PartialEq)]
pub enum MemoryError {
    /// The access reached an unmapped physical address. Fatal; never turned into a trap.
    #[error(transparent)]
    Bus(#[from] InvalidAddress),
    /// Sv32 translation failed; the inner value is the faulting virtual address. The access kind
    /// determines the trap cause.
    #[error("page fault at virtual address {0:#010x}")]
    PageFault(u32),
}

/// A cached leaf PTE: the entry's bits, the physical address it was loaded from (for A/D
/// write-back), and whether it is a first-level superpage leaf.
type PteCacheEntry = (u32, u32, bool);

/// The Sv32 translation state: page-table walk plus three cache tiers.
///
/// - `pte_cache` memoizes successful walks per (ASID, virtual page). Invalidated by SFENCE.VMA
///   and refreshed on A/D write-back.
/// - `pa_cache` memoizes the physical-address composition per (masked PTE bits, superpage,
///   vaddr). Bounded; flushed wholesale when it grows past [`PA_CACHE_LIMIT`]. Entries are pure
///   functions of their key, so staleness is harmless.
/// - `accel` holds the last `(vaddr, paddr)` pair per access kind and short-circuits
///   translations that stay within the same 4 KiB page. It is the only tier that must be flushed
///   eagerly when `satp` is written or the privilege mode changes.
#[derive(Debug)]
pub struct Mmu {
    pte_cache: HashMap<u32, HashMap<u32, PteCacheEntry>>,
    pa_cache: HashMap<(u32, bool, u32), u32>,
    accel: [Option<(u32, u32)>; 3],
    satp_dirty: bool,
}

impl Default for Mmu {
    fn default() -> Self {
        Self::new()
    }
}

impl Mmu {
    pub fn new() -> Self {
        Self {
            pte_cache: HashMap::new(),
            pa_cache: HashMap::new(),
            accel: [None; 3],
            satp_dirty: true,
        }
    }

    /// Record that satp was written. The accelerator is flushed lazily, at the top of the next
    /// fetch iteration.
    pub fn note_satp_write(&mut self) {
        self.satp_dirty = true;
    }

    /// Returns whether satp was written since the last call, clearing the flag.
    pub fn take_satp_dirty(&mut self) -> bool {
        std::mem::take(&mut self.satp_dirty)
    }

    /// Drop the per-access-kind accelerator entries.
    pub fn flush_accelerator(&mut self) {
        self.accel = [None; 3];
    }

    /// SFENCE.VMA: drop cached walks for `asid`, or for every ASID when `None`.
    pub fn flush_pte_cache(&mut self, asid: Option<u32>) {
        match asid {
            Some(asid) => {
                self.pte_cache.remove(&asid);
            }
            None => self.pte_cache.clear(),
        }
    }

    /// Map a virtual byte address to the corresponding physical byte address.
    ///
    /// Consults the accelerator first: if `vaddr` falls in the same page as the previous
    /// translation of the same kind, the cached result is reused with the offset adjusted.
    pub fn translate(
        &mut self,
        bus: &mut AddressSpace,
        trap: &Trap,
        status: &Status,
        mode: PrivilegeLevel,
        vaddr: u32,
        access_type: AccessType,
    ) -> Result<u32, MemoryError> {
        let slot = access_type.accel_slot();
        if let Some((prev_vaddr, prev_paddr)) = self.accel[slot] {
            if (vaddr ^ prev_vaddr) < (1 << PAGE_SIZE_SHF) {
                return Ok(prev_paddr.wrapping_add(vaddr.wrapping_sub(prev_vaddr)));
            }
        }
        let paddr = self.translate_uncached(bus, trap, status, mode, vaddr, access_type)?;
        self.accel[slot] = Some((vaddr, paddr));
        Ok(paddr)
    }

    fn translate_uncached(
        &mut self,
        bus: &mut AddressSpace,
        trap: &Trap,
        status: &Status,
        mode: PrivilegeLevel,
        vaddr: u32,
        access_type: AccessType,
    ) -> Result<u32, MemoryError> {
        // Translation is active below M-mode with satp.MODE = Sv32; otherwise physical addresses
        // are used as-is.
        if mode == PrivilegeLevel::Machine || !trap.satp_mode() {
            return Ok(vaddr);
        }

        let (mut pte, pte_addr, superpage) = self
            .find_pte(bus, trap, vaddr)?
            .ok_or(MemoryError::PageFault(vaddr))?;

        self.check_permissions(pte, superpage, status, mode, access_type)
            .map_err(|()| {
                debug!(
                    vaddr, pte, access_type:%;
                    "Sv32 permission check failed"
                );
                MemoryError::PageFault(vaddr)
            })?;

        // A/D update: set A on any access and D on stores, writing the PTE back and refreshing
        // the cached walk.
        let pte_bits = pte.view_bits_mut::<Lsb0>();
        if !pte_bits[pte::A] || (access_type == AccessType::Write && !pte_bits[pte::D]) {
            pte_bits.set(pte::A, true);
            if access_type == AccessType::Write {
                pte_bits.set(pte::D, true);
            }
            bus.write_u32(pte_addr, pte)?;
            self.pte_cache
                .entry(trap.satp_asid())
                .or_default()
                .insert(vaddr & !PAGE_SIZE_MSK, (pte, pte_addr, superpage));
        }

        // Compose the physical address. The key only involves the PTE bits that feed the
        // composition, so a cached value is always a correct function of its key.
        let pa_key = (pte & 0xFFFF_FC00, superpage, vaddr);
        if let Some(&paddr) = self.pa_cache.get(&pa_key) {
            return Ok(paddr);
        }
        let vpn0 = (vaddr >> PAGE_SIZE_SHF) & 0x3FF;
        let ppn0 = match superpage {
            true => vpn0,
            false => (pte >> 10) & 0x3FF,
        };
        let ppn1 = pte >> 20;
        // An Sv32 physical address is 34 bits; the upper two bits fall off the 32-bit fabric.
        let paddr = (ppn1 << 22) | (ppn0 << PAGE_SIZE_SHF) | (vaddr & PAGE_SIZE_MSK);
        if self.pa_cache.len() > PA_CACHE_LIMIT {
            self.pa_cache.clear();
        }
        self.pa_cache.insert(pa_key, paddr);
        Ok(paddr)
    }

    /// Walk the page table for `vaddr`, or return the memoized walk for its page.
    ///
    /// Returns `Ok(None)` when the walk ends in an invalid or malformed entry (a page fault for
    /// every access kind). Walk loads are physical, so an unmapped page-table address is a bus
    /// error, not a fault.
    fn find_pte(
        &mut self,
        bus: &mut AddressSpace,
        trap: &Trap,
        vaddr: u32,
    ) -> Result<Option<PteCacheEntry>, InvalidAddress> {
        let asid = trap.satp_asid();
        let vpage = vaddr & !PAGE_SIZE_MSK;
        if let Some(entry) = self.pte_cache.get(&asid).and_then(|walks| walks.get(&vpage)) {
            return Ok(Some(*entry));
        }

        let vpn1 = vaddr >> (PAGE_SIZE_SHF + PTE_COUNT_SHF);
        let vpn0 = (vaddr >> PAGE_SIZE_SHF) & PTE_COUNT_MSK;

        trace!("Walking page table for vaddr {vaddr:#010x} (asid {asid})");
        let mut pte_addr = (trap.satp_ppn() << PAGE_SIZE_SHF).wrapping_add(vpn1 << PTE_SIZE_SHF);
        let mut pte = bus.read_u32(pte_addr)?;
        let bits = pte.view_bits::<Lsb0>();
        if !bits[pte::V] || (bits[pte::W] && !bits[pte::R]) {
            return Ok(None);
        }

        let superpage = if !bits[pte::R] && !bits[pte::X] {
            // Pointer to the second-level table.
            pte_addr = ((pte >> 10) << PAGE_SIZE_SHF).wrapping_add(vpn0 << PTE_SIZE_SHF);
            pte = bus.read_u32(pte_addr)?;
            let bits = pte.view_bits::<Lsb0>();
            // A second-level entry must be a leaf.
            if !bits[pte::V]
                || (bits[pte::W] && !bits[pte::R])
                || (!bits[pte::R] && !bits[pte::X])
            {
                return Ok(None);
            }
            false
        } else {
            true
        };

        let entry = (pte, pte_addr, superpage);
        self.pte_cache.entry(asid).or_default().insert(vpage, entry);
        Ok(Some(entry))
    }

    /// The Sv32 permission checks for a leaf `pte`, staged by access kind and privilege.
    fn check_permissions(
        &self,
        pte: u32,
        superpage: bool,
        status: &Status,
        mode: PrivilegeLevel,
        access_type: AccessType,
    ) -> Result<(), ()> {
        let bits = pte.view_bits::<Lsb0>();
        let allowed = match access_type {
            AccessType::Read => bits[pte::R] || (bits[pte::X] && status.mxr()),
            AccessType::Write => bits[pte::W],
            AccessType::Execute => bits[pte::X],
        };
        if !allowed {
            return Err(());
        }
        match mode {
            PrivilegeLevel::User if !bits[pte::U] => return Err(()),
            PrivilegeLevel::Supervisor if bits[pte::U] && !status.sum() => return Err(()),
            _ => {}
        }
        // A superpage leaf must have PPN0 == 0, otherwise it is misaligned.
        if superpage && (pte >> 10) & PTE_COUNT_MSK != 0 {
            return Err(());
        }
        Ok(())
    }
}

/// Bit indices into a page-table entry.
mod pte {
    pub const V: usize = 0;
    pub const R: usize = 1;
    pub const W: usize = 2;
    pub const X: usize = 3;
    pub const U: usize = 4;
    pub const A: usize = 6;
    pub const D: usize = 7;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address_range;
    use crate::address_space::Region;

    const RAM_BASE: u32 = 0x8000_0000;
    const ROOT_TABLE: u32 = 0x8010_0000;

    fn ram() -> AddressSpace {
        AddressSpace::new(vec![(
            address_range![RAM_BASE, RAM_BASE + 0x3F_FFFF],
            Region::Buffer(vec![0; 0x40_0000]),
        )])
        .unwrap()
    }

    fn sv32_trap() -> Trap {
        let mut trap = Trap::new();
        // MODE = Sv32, ASID = 0, root table at ROOT_TABLE.
        trap.write_satp((1 << 31) | (ROOT_TABLE >> 12), 0xFFFF_FFFF);
        trap
    }

    /// Install a second-level mapping of `vaddr`'s page to `paddr`'s frame with `flags`.
    fn map_page(bus: &mut AddressSpace, vaddr: u32, paddr: u32, flags: u32) {
        let second_level = ROOT_TABLE + 0x1000;
        let vpn1 = vaddr >> 22;
        let vpn0 = (vaddr >> 12) & 0x3FF;
        // Non-leaf first-level entry pointing at the second-level table.
        bus.write_u32(ROOT_TABLE + vpn1 * 4, (second_level >> 12) << 10 | 1)
            .unwrap();
        bus.write_u32(second_level + vpn0 * 4, (paddr >> 12) << 10 | flags)
            .unwrap();
    }

    #[test]
    fn test_machine_mode_is_identity() {
        let mut bus = ram();
        let mut mmu = Mmu::new();
        let trap = sv32_trap();
        let status = Status::new();
        let paddr = mmu
            .translate(
                &mut bus,
                &trap,
                &status,
                PrivilegeLevel::Machine,
                0x1234_5678,
                AccessType::Read,
            )
            .unwrap();
        assert_eq!(paddr, 0x1234_5678);
    }

    #[test]
    fn test_bare_mode_is_identity() {
        let mut bus = ram();
        let mut mmu = Mmu::new();
        let trap = Trap::new();
        let status = Status::new();
        let paddr = mmu
            .translate(
                &mut bus,
                &trap,
                &status,
                PrivilegeLevel::Supervisor,
                RAM_BASE + 4,
                AccessType::Write,
            )
            .unwrap();
        assert_eq!(paddr, RAM_BASE + 4);
    }

    #[test]
    fn test_two_level_translation() {
        let mut bus = ram();
        let mut mmu = Mmu::new();
        let trap = sv32_trap();
        let status = Status::new();
        // V|R|W|X, A/D clear.
        map_page(&mut bus, 0x1000, 0x8020_0000, 0b1111);

        let paddr = mmu
            .translate(
                &mut bus,
                &trap,
                &status,
                PrivilegeLevel::Supervisor,
                0x1ABC,
                AccessType::Read,
            )
            .unwrap();
        assert_eq!(paddr, 0x8020_0ABC);
        // Page offset is preserved by construction.
        assert_eq!(paddr & 0xFFF, 0x1ABC & 0xFFF);

        // The A bit was set and written back.
        let second_level = ROOT_TABLE + 0x1000;
        let pte = bus.read_u32(second_level + 1 * 4).unwrap();
        assert_ne!(pte & (1 << 6), 0, "A bit set");
        assert_eq!(pte & (1 << 7), 0, "D bit still clear");

        // A store also sets D.
        mmu.translate(
            &mut bus,
            &trap,
            &status,
            PrivilegeLevel::Supervisor,
            0x1000,
            AccessType::Write,
        )
        .unwrap();
        let pte = bus.read_u32(second_level + 1 * 4).unwrap();
        assert_ne!(pte & (1 << 7), 0, "D bit set");
    }

    #[test]
    fn test_unmapped_page_faults() {
        let mut bus = ram();
        let mut mmu = Mmu::new();
        let trap = sv32_trap();
        let status = Status::new();
        map_page(&mut bus, 0x1000, 0x8020_0000, 0b1111);
        assert_eq!(
            mmu.translate(
                &mut bus,
                &trap,
                &status,
                PrivilegeLevel::Supervisor,
                0x2000,
                AccessType::Read,
            ),
            Err(MemoryError::PageFault(0x2000))
        );
    }

    #[test]
    fn test_write_without_w_faults() {
        let mut bus = ram();
        let mut mmu = Mmu::new();
        let trap = sv32_trap();
        let status = Status::new();
        // V|R|X only.
        map_page(&mut bus, 0x1000, 0x8020_0000, 0b1011);
        assert!(mmu
            .translate(
                &mut bus,
                &trap,
                &status,
                PrivilegeLevel::Supervisor,
                0x1000,
                AccessType::Read,
            )
            .is_ok());
        assert_eq!(
            mmu.translate(
                &mut bus,
                &trap,
                &status,
                PrivilegeLevel::Supervisor,
                0x1000,
                AccessType::Write,
            ),
            Err(MemoryError::PageFault(0x1000))
        );
    }

    #[test]
    fn test_user_page_protection() {
        let mut bus = ram();
        let mut mmu = Mmu::new();
        let trap = sv32_trap();
        let mut status = Status::new();
        // User page: V|R|W|U.
        map_page(&mut bus, 0x1000, 0x8020_0000, 0b1_0111);

        // S-mode access to a U page requires SUM.
        assert_eq!(
            mmu.translate(
                &mut bus,
                &trap,
                &status,
                PrivilegeLevel::Supervisor,
                0x1000,
                AccessType::Read,
            ),
            Err(MemoryError::PageFault(0x1000))
        );
        status.set_sum(true);
        assert!(mmu
            .translate(
                &mut bus,
                &trap,
                &status,
                PrivilegeLevel::Supervisor,
                0x1000,
                AccessType::Read,
            )
            .is_ok());

        // U-mode access to a non-U page faults.
        let mut mmu = Mmu::new();
        map_page(&mut bus, 0x5000, 0x8020_1000, 0b0111);
        assert_eq!(
            mmu.translate(
                &mut bus,
                &trap,
                &status,
                PrivilegeLevel::User,
                0x5000,
                AccessType::Read,
            ),
            Err(MemoryError::PageFault(0x5000))
        );
    }

    #[test]
    fn test_mxr_substitutes_execute_for_read() {
        let mut bus = ram();
        let mut mmu = Mmu::new();
        let trap = sv32_trap();
        let mut status = Status::new();
        // Execute-only page.
        map_page(&mut bus, 0x1000, 0x8020_0000, 0b1001);
        assert_eq!(
            mmu.translate(
                &mut bus,
                &trap,
                &status,
                PrivilegeLevel::Supervisor,
                0x1000,
                AccessType::Read,
            ),
            Err(MemoryError::PageFault(0x1000))
        );
        status.set_mxr(true);
        assert!(mmu
            .translate(
                &mut bus,
                &trap,
                &status,
                PrivilegeLevel::Supervisor,
                0x1000,
                AccessType::Read,
            )
            .is_ok());
    }

    #[test]
    fn test_superpage() {
        let mut bus = ram();
        let mut mmu = Mmu::new();
        let trap = sv32_trap();
        let status = Status::new();
        // First-level leaf mapping the 4 MiB region at VPN1=2 to PPN1=0x200 (0x8000_0000).
        bus.write_u32(ROOT_TABLE + 2 * 4, 0x200 << 20 | 0b100_1111)
            .unwrap();
        let vaddr = (2 << 22) | 0x12_3456;
        let paddr = mmu
            .translate(
                &mut bus,
                &trap,
                &status,
                PrivilegeLevel::Supervisor,
                vaddr,
                AccessType::Read,
            )
            .unwrap();
        // VPN0 passes through on a superpage.
        assert_eq!(paddr, 0x8012_3456);
    }

    #[test]
    fn test_misaligned_superpage_faults() {
        let mut bus = ram();
        let mut mmu = Mmu::new();
        let trap = sv32_trap();
        let status = Status::new();
        // First-level leaf with PPN0 != 0.
        bus.write_u32(ROOT_TABLE + 2 * 4, (0x200 << 20) | (1 << 10) | 0b100_1111)
            .unwrap();
        assert_eq!(
            mmu.translate(
                &mut bus,
                &trap,
                &status,
                PrivilegeLevel::Supervisor,
                2 << 22,
                AccessType::Read,
            ),
            Err(MemoryError::PageFault(2 << 22))
        );
    }

    #[test]
    fn test_accelerator_same_page() {
        let mut bus = ram();
        let mut mmu = Mmu::new();
        let trap = sv32_trap();
        let status = Status::new();
        map_page(&mut bus, 0x1000, 0x8020_0000, 0b1111);
        let first = mmu
            .translate(
                &mut bus,
                &trap,
                &status,
                PrivilegeLevel::Supervisor,
                0x1000,
                AccessType::Read,
            )
            .unwrap();
        // Clear the walk caches: a same-page hit must not need them.
        mmu.flush_pte_cache(None);
        let second = mmu
            .translate(
                &mut bus,
                &trap,
                &status,
                PrivilegeLevel::Supervisor,
                0x1FFC,
                AccessType::Read,
            )
            .unwrap();
        assert_eq!(second, first + 0xFFC);
    }
}
