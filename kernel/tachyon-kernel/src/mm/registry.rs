//! Virtual↔physical address-mapping registry.
//!
//! The registry is the kernel's single source of truth for address
//! translation: page-table code, DMA setup and drivers all go through
//! [`MappingRegistry::virt_to_phys`] / [`phys_to_virt`] instead of casting
//! pointers. A physical range has at most one *canonical* mapping (the
//! window the kernel itself uses) plus any number of *alias* mappings
//! (device-owned windows, e.g. MMIO).
//!
//! [`phys_to_virt`]: MappingRegistry::phys_to_virt

use planck_noalloc::vec::ArrayVec;

use tachyon_core::addr::{PhysAddr, VirtAddr};
use tachyon_core::error::{Errno, KResult};

use super::paging::PteFlags;

/// Maximum number of registered mappings.
pub const MAX_ADDR_MAPPINGS: usize = 32;

/// Whether a mapping is the kernel's own window or a device alias.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingKind {
    /// The unique window the kernel uses to address the physical range.
    Canonical,
    /// An additional, device-owned window.
    Alias,
}

/// Cacheability of a mapping, translated into PWT/PCD bits by the paging
/// code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryType {
    /// Normal write-back cacheable memory (the default).
    WriteBack,
    /// Write-through caching.
    WriteThrough,
    /// Uncacheable.
    Uncacheable,
    /// Strong uncacheable; required for MMIO registers.
    StrongUncacheable,
}

/// One registered virtual↔physical mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddrMapping {
    /// First virtual address of the range.
    pub vbase: VirtAddr,
    /// First physical address of the range.
    pub pbase: PhysAddr,
    /// Length in bytes.
    pub len: u64,
    /// Canonical window or alias.
    pub kind: MappingKind,
    /// Cacheability applied to the leaf PTEs.
    pub mem_type: MemoryType,
    /// Permission bits applied when the range is mapped.
    pub perms: PteFlags,
}

impl AddrMapping {
    /// A canonical, write-back, writable mapping — the common case for
    /// kernel memory.
    pub fn kernel(vbase: VirtAddr, pbase: PhysAddr, len: u64) -> Self {
        Self {
            vbase,
            pbase,
            len,
            kind: MappingKind::Canonical,
            mem_type: MemoryType::WriteBack,
            perms: PteFlags::WRITABLE,
        }
    }
}

#[inline]
fn ranges_overlap(a1: u64, b1: u64, a2: u64, b2: u64) -> bool {
    a1 < b2 && a2 < b1
}

/// Table of registered mappings.
pub struct MappingRegistry {
    entries: ArrayVec<AddrMapping, MAX_ADDR_MAPPINGS>,
}

impl MappingRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            entries: ArrayVec::new(),
        }
    }

    /// Registers a mapping.
    ///
    /// Fails with `EINVAL` if the virtual range overlaps any existing
    /// entry, or if the physical range would end up with more than one
    /// canonical mapping, or with a canonical-less set of several aliases
    /// (which would make `phys_to_virt` ambiguous). Fails with `ENOMEM`
    /// when the table is full.
    pub fn add(&mut self, new: AddrMapping) -> KResult<()> {
        let mut n_canonical = 0;
        let mut n_alias = 0;

        for m in self.entries.iter() {
            if ranges_overlap(
                new.vbase.as_u64(),
                new.vbase.as_u64() + new.len,
                m.vbase.as_u64(),
                m.vbase.as_u64() + m.len,
            ) {
                return Err(Errno::Einval);
            }
            if ranges_overlap(
                new.pbase.as_u64(),
                new.pbase.as_u64() + new.len,
                m.pbase.as_u64(),
                m.pbase.as_u64() + m.len,
            ) {
                match m.kind {
                    MappingKind::Canonical => n_canonical += 1,
                    MappingKind::Alias => n_alias += 1,
                }
            }
        }

        // Count the new entry itself, then check the translation invariant:
        // one canonical with any number of aliases, or a single alias.
        match new.kind {
            MappingKind::Canonical => n_canonical += 1,
            MappingKind::Alias => n_alias += 1,
        }
        let ok = n_canonical == 1 || (n_canonical == 0 && n_alias <= 1);
        if !ok {
            return Err(Errno::Einval);
        }

        if self.entries.is_full() {
            return Err(Errno::Enomem);
        }
        self.entries.insert(self.entries.len(), new);
        Ok(())
    }

    /// Removes a mapping previously registered with [`add`](Self::add).
    /// The triple `(vbase, pbase, len)` identifies the entry.
    pub fn remove(&mut self, mapping: AddrMapping) -> KResult<()> {
        for i in 0..self.entries.len() {
            let m = self.entries[i];
            if m.vbase == mapping.vbase && m.pbase == mapping.pbase && m.len == mapping.len {
                self.entries.remove(i);
                return Ok(());
            }
        }
        Err(Errno::Einval)
    }

    /// Translates a physical address to the virtual address the kernel uses
    /// for it: the canonical window if one exists, else the unique alias.
    ///
    /// The null address translates to the null address so callers need not
    /// special-case it.
    pub fn phys_to_virt(&self, paddr: PhysAddr) -> KResult<VirtAddr> {
        if paddr.is_zero() {
            return Ok(VirtAddr::zero());
        }

        let mut canonical: Option<&AddrMapping> = None;
        let mut alias: Option<&AddrMapping> = None;
        let mut n_alias = 0;

        for m in self.entries.iter() {
            let p = paddr.as_u64();
            if p >= m.pbase.as_u64() && p < m.pbase.as_u64() + m.len {
                match m.kind {
                    MappingKind::Canonical => {
                        assert!(canonical.is_none(), "two canonical mappings for {paddr}");
                        canonical = Some(m);
                    }
                    MappingKind::Alias => {
                        alias = Some(m);
                        n_alias += 1;
                    }
                }
            }
        }

        if let Some(m) = canonical {
            return Ok(m.vbase + (paddr - m.pbase));
        }
        if let Some(m) = alias {
            assert!(n_alias == 1, "ambiguous alias mappings for {paddr}");
            return Ok(m.vbase + (paddr - m.pbase));
        }
        Err(Errno::Einval)
    }

    /// Translates a virtual address to its physical address. Virtual ranges
    /// never overlap, so the match is unique. Null maps to null.
    pub fn virt_to_phys(&self, vaddr: VirtAddr) -> KResult<PhysAddr> {
        if vaddr.is_zero() {
            return Ok(PhysAddr::zero());
        }

        for m in self.entries.iter() {
            let v = vaddr.as_u64();
            if v >= m.vbase.as_u64() && v < m.vbase.as_u64() + m.len {
                return Ok(m.pbase + (vaddr - m.vbase));
            }
        }
        Err(Errno::Einval)
    }
}

impl Default for MappingRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapping(v: u64, p: u64, len: u64, kind: MappingKind) -> AddrMapping {
        AddrMapping {
            vbase: VirtAddr::new(v),
            pbase: PhysAddr::new(p),
            len,
            kind,
            mem_type: MemoryType::WriteBack,
            perms: PteFlags::WRITABLE,
        }
    }

    #[test]
    fn translate_round_trip() {
        let mut reg = MappingRegistry::new();
        reg.add(mapping(0x10_0000, 0x40_0000, 0x1000, MappingKind::Canonical))
            .unwrap();

        let p = PhysAddr::new(0x40_0123);
        let v = reg.phys_to_virt(p).unwrap();
        assert_eq!(v.as_u64(), 0x10_0123);
        assert_eq!(reg.virt_to_phys(v).unwrap(), p);
    }

    #[test]
    fn null_translates_to_null() {
        let reg = MappingRegistry::new();
        assert_eq!(reg.phys_to_virt(PhysAddr::zero()).unwrap(), VirtAddr::zero());
        assert_eq!(reg.virt_to_phys(VirtAddr::zero()).unwrap(), PhysAddr::zero());
    }

    #[test]
    fn unmapped_address_is_einval() {
        let reg = MappingRegistry::new();
        assert_eq!(reg.phys_to_virt(PhysAddr::new(0x1000)), Err(Errno::Einval));
        assert_eq!(reg.virt_to_phys(VirtAddr::new(0x1000)), Err(Errno::Einval));
    }

    #[test]
    fn overlapping_virtual_ranges_rejected() {
        let mut reg = MappingRegistry::new();
        reg.add(mapping(0x1000, 0x10_0000, 0x2000, MappingKind::Canonical))
            .unwrap();
        assert_eq!(
            reg.add(mapping(0x2000, 0x20_0000, 0x1000, MappingKind::Canonical)),
            Err(Errno::Einval)
        );
    }

    #[test]
    fn second_canonical_for_same_phys_rejected() {
        let mut reg = MappingRegistry::new();
        reg.add(mapping(0x1000, 0x10_0000, 0x1000, MappingKind::Canonical))
            .unwrap();
        assert_eq!(
            reg.add(mapping(0x9000, 0x10_0000, 0x1000, MappingKind::Canonical)),
            Err(Errno::Einval)
        );
    }

    #[test]
    fn canonical_preferred_over_alias() {
        let mut reg = MappingRegistry::new();
        reg.add(mapping(0x1000, 0x10_0000, 0x1000, MappingKind::Canonical))
            .unwrap();
        reg.add(mapping(0x8000, 0x10_0000, 0x1000, MappingKind::Alias))
            .unwrap();

        let v = reg.phys_to_virt(PhysAddr::new(0x10_0080)).unwrap();
        assert_eq!(v.as_u64(), 0x1080);
    }

    #[test]
    fn lone_alias_translates() {
        let mut reg = MappingRegistry::new();
        reg.add(mapping(0x8000, 0xFEB8_0000, 0x1000, MappingKind::Alias))
            .unwrap();
        let v = reg.phys_to_virt(PhysAddr::new(0xFEB8_0010)).unwrap();
        assert_eq!(v.as_u64(), 0x8010);
    }

    #[test]
    fn two_canonical_less_aliases_rejected() {
        let mut reg = MappingRegistry::new();
        reg.add(mapping(0x8000, 0xFEB8_0000, 0x1000, MappingKind::Alias))
            .unwrap();
        assert_eq!(
            reg.add(mapping(0x9000, 0xFEB8_0000, 0x1000, MappingKind::Alias)),
            Err(Errno::Einval)
        );
    }

    #[test]
    fn remove_then_translate_fails() {
        let mut reg = MappingRegistry::new();
        let m = mapping(0x1000, 0x10_0000, 0x1000, MappingKind::Canonical);
        reg.add(m).unwrap();
        reg.remove(m).unwrap();
        assert!(reg.phys_to_virt(PhysAddr::new(0x10_0000)).is_err());
        assert_eq!(reg.remove(m), Err(Errno::Einval));
    }

    #[test]
    fn alias_after_canonical_round_trips_on_virt() {
        let mut reg = MappingRegistry::new();
        reg.add(mapping(0x1000, 0x10_0000, 0x1000, MappingKind::Canonical))
            .unwrap();
        reg.add(mapping(0x8000, 0x10_0000, 0x1000, MappingKind::Alias))
            .unwrap();
        // virt_to_phys works for both windows.
        assert_eq!(
            reg.virt_to_phys(VirtAddr::new(0x8004)).unwrap().as_u64(),
            0x10_0004
        );
        assert_eq!(
            reg.virt_to_phys(VirtAddr::new(0x1004)).unwrap().as_u64(),
            0x10_0004
        );
    }
}
