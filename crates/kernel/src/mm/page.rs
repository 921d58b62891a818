/// Physical page bookkeeping.
///
/// Tracks metadata for each physical page frame including reference
/// counts, buddy order, and flags, plus the zone classification and the
/// direct-map window used to reach frame contents from kernel code.
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Physical address type
pub type PhysAddr = u64;
/// Virtual address type
pub type VirtAddr = u64;
/// Page frame number
pub type Pfn = usize;

/// Page size (4 KiB)
pub const PAGE_SIZE: usize = 4096;
pub const PAGE_SHIFT: usize = 12;

#[inline]
pub const fn pa_to_pfn(pa: PhysAddr) -> Pfn {
    (pa as usize) >> PAGE_SHIFT
}

#[inline]
pub const fn pfn_to_pa(pfn: Pfn) -> PhysAddr {
    (pfn << PAGE_SHIFT) as PhysAddr
}

#[inline]
pub const fn page_align_down(addr: u64) -> u64 {
    addr & !(PAGE_SIZE as u64 - 1)
}

#[inline]
pub const fn page_align_up(addr: u64) -> u64 {
    (addr + PAGE_SIZE as u64 - 1) & !(PAGE_SIZE as u64 - 1)
}

/// Offset of the kernel's linear view of physical memory. Zero while the
/// boot identity map is live; set from the bootloader's HHDM offset on
/// x86_64.
static DIRECT_MAP_OFFSET: AtomicU64 = AtomicU64::new(0);

pub fn set_direct_map_offset(offset: u64) {
    DIRECT_MAP_OFFSET.store(offset, Ordering::Release);
}

/// Kernel-visible pointer to a physical address.
#[inline]
pub fn phys_to_ptr(pa: PhysAddr) -> *mut u8 {
    (pa + DIRECT_MAP_OFFSET.load(Ordering::Acquire)) as *mut u8
}

/// Memory zones, lowest first. Fallback on exhaustion walks downward:
/// High -> Normal -> Dma.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(usize)]
pub enum Zone {
    /// Legacy DMA window below 16 MiB
    Dma = 0,
    Normal = 1,
    /// Above 4 GiB
    High = 2,
}

pub const ZONE_COUNT: usize = 3;
const DMA_LIMIT: PhysAddr = 16 * 1024 * 1024;
const HIGH_BASE: PhysAddr = 4 * 1024 * 1024 * 1024;

impl Zone {
    pub const fn of(pa: PhysAddr) -> Zone {
        if pa < DMA_LIMIT {
            Zone::Dma
        } else if pa < HIGH_BASE {
            Zone::Normal
        } else {
            Zone::High
        }
    }

    pub const fn from_index(idx: usize) -> Zone {
        match idx {
            0 => Zone::Dma,
            1 => Zone::Normal,
            _ => Zone::High,
        }
    }
}

bitflags::bitflags! {
    /// Per-frame state flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u32 {
        /// Frame sits on a buddy free list
        const BUDDY = 1 << 0;
        /// Not available for allocation (holes, firmware regions)
        const RESERVED = 1 << 1;
        /// Owned by the kernel image or a kernel stack
        const KERNEL = 1 << 2;
        /// Pinned; must not be handed out even when refcount drops
        const LOCKED = 1 << 3;
        /// Backs a slab cache
        const SLAB = 1 << 4;
    }
}

/// Frame metadata, one per physical page, indexed by PFN.
#[repr(C)]
pub struct Page {
    /// Reference count (0 = free)
    refcount: AtomicU32,
    pub order: u8,
    pub flags: PageFlags,
}

impl Page {
    pub const fn new() -> Self {
        Self {
            refcount: AtomicU32::new(0),
            order: 0,
            flags: PageFlags::empty(),
        }
    }

    pub fn is_free(&self) -> bool {
        self.refcount.load(Ordering::Acquire) == 0
    }

    /// Increment the reference count.
    pub fn get(&self) {
        self.refcount.fetch_add(1, Ordering::AcqRel);
    }

    /// Decrement the reference count and return the new value.
    pub fn put(&self) -> u32 {
        self.refcount.fetch_sub(1, Ordering::AcqRel) - 1
    }

    pub fn set_refcount(&self, count: u32) {
        self.refcount.store(count, Ordering::Release);
    }

    pub fn refcount(&self) -> u32 {
        self.refcount.load(Ordering::Acquire)
    }
}

impl core::fmt::Debug for Page {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Page")
            .field("refcount", &self.refcount())
            .field("order", &self.order)
            .field("flags", &self.flags)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment_helpers() {
        assert_eq!(page_align_down(0x1fff), 0x1000);
        assert_eq!(page_align_up(0x1001), 0x2000);
        assert_eq!(page_align_up(0x1000), 0x1000);
        assert_eq!(pa_to_pfn(0x3000), 3);
        assert_eq!(pfn_to_pa(3), 0x3000);
    }

    #[test]
    fn zone_classification() {
        assert_eq!(Zone::of(0x10_0000), Zone::Dma);
        assert_eq!(Zone::of(0x4000_0000), Zone::Normal);
        assert_eq!(Zone::of(0x2_0000_0000), Zone::High);
    }
}
