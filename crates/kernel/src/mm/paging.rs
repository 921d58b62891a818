/// Page-table management.
///
/// Four-level tables with 512 eight-byte descriptors per node. The walker
/// is portable; the descriptor bit layout is selected per architecture
/// (AArch64 stage-1 format, x86_64 long-mode format). Block descriptors
/// at L1 (1 GiB) and L2 (2 MiB) serve the boot identity map and
/// short-circuit translation.
use super::bootmem;
use super::buddy;
use super::page::{phys_to_ptr, PhysAddr, VirtAddr, PAGE_SIZE};
use crate::error::KernelError;
use core::sync::atomic::{AtomicU64, Ordering};

pub const ENTRIES: usize = 512;
pub const LEVELS: usize = 4;

/// Span of one entry at each level
pub const L1_BLOCK_SIZE: u64 = 1 << 30;
pub const L2_BLOCK_SIZE: u64 = 1 << 21;

bitflags::bitflags! {
    /// Portable mapping permissions, translated to architecture bits at
    /// the leaf.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MapFlags: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
        const USER = 1 << 3;
        const SHARED = 1 << 4;
        /// Non-cacheable device-ordered memory; implies no-execute at
        /// both privilege levels
        const DEVICE = 1 << 5;
    }
}

/// Raw descriptor.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Pte(pub u64);

impl Pte {
    pub const fn invalid() -> Self {
        Self(0)
    }

    pub fn is_valid(&self) -> bool {
        pte_bits::is_valid(self.0)
    }

    pub fn phys_addr(&self) -> PhysAddr {
        pte_bits::addr(self.0)
    }
}

impl core::fmt::Debug for Pte {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Pte")
            .field("raw", &format_args!("{:#x}", self.0))
            .field("phys", &format_args!("{:#x}", self.phys_addr()))
            .finish()
    }
}

/// One 512-entry table node.
#[repr(C, align(4096))]
pub struct PageTable {
    pub entries: [Pte; ENTRIES],
}

impl PageTable {
    pub const fn new() -> Self {
        Self {
            entries: [Pte::invalid(); ENTRIES],
        }
    }

    /// Index of `vaddr` at `level` (0 = root): 9 bits starting at
    /// 39/30/21/12.
    #[inline]
    pub fn index(vaddr: VirtAddr, level: usize) -> usize {
        ((vaddr >> (39 - 9 * level)) & 0x1FF) as usize
    }
}

// AArch64 stage-1 descriptor format (4 KiB granule).
#[cfg(target_arch = "aarch64")]
mod pte_bits {
    use super::{MapFlags, PhysAddr};

    const VALID: u64 = 1 << 0;
    /// Table at L0-L2; page at L3
    const TYPE_BIT: u64 = 1 << 1;
    const ATTR_DEVICE: u64 = 1 << 2; // MAIR index 1
    const AP_EL0: u64 = 1 << 6;
    const AP_RO: u64 = 1 << 7;
    const SH_INNER: u64 = 0b11 << 8;
    const AF: u64 = 1 << 10;
    const NOT_GLOBAL: u64 = 1 << 11;
    const PXN: u64 = 1 << 53;
    const UXN: u64 = 1 << 54;
    /// Software bit recording a shared mapping
    const SW_SHARED: u64 = 1 << 55;

    const ADDR_MASK: u64 = 0x0000_FFFF_FFFF_F000;

    pub fn encode_leaf(pa: PhysAddr, flags: MapFlags, level: usize) -> u64 {
        let mut raw = (pa & ADDR_MASK) | VALID | AF;
        if level == 3 {
            raw |= TYPE_BIT;
        }
        if flags.contains(MapFlags::DEVICE) {
            // Device-nGnRE, never executable at either level
            raw |= ATTR_DEVICE | UXN | PXN;
        } else {
            raw |= SH_INNER;
            if flags.contains(MapFlags::EXEC) {
                // Executable for exactly one privilege level
                raw |= if flags.contains(MapFlags::USER) { PXN } else { UXN };
            } else {
                raw |= UXN | PXN;
            }
        }
        if !flags.contains(MapFlags::WRITE) {
            raw |= AP_RO;
        }
        if flags.contains(MapFlags::USER) {
            raw |= AP_EL0 | NOT_GLOBAL;
        }
        if flags.contains(MapFlags::SHARED) {
            raw |= SW_SHARED;
        }
        raw
    }

    pub fn encode_table(pa: PhysAddr) -> u64 {
        (pa & ADDR_MASK) | VALID | TYPE_BIT
    }

    pub fn is_valid(raw: u64) -> bool {
        raw & VALID != 0
    }

    pub fn is_table(raw: u64, level: usize) -> bool {
        level < 3 && is_valid(raw) && raw & TYPE_BIT != 0
    }

    pub fn addr(raw: u64) -> PhysAddr {
        raw & ADDR_MASK
    }

    pub fn decode_flags(raw: u64) -> MapFlags {
        let mut flags = MapFlags::READ;
        if raw & AP_RO == 0 {
            flags |= MapFlags::WRITE;
        }
        if raw & AP_EL0 != 0 {
            flags |= MapFlags::USER;
            if raw & UXN == 0 {
                flags |= MapFlags::EXEC;
            }
        } else if raw & PXN == 0 {
            flags |= MapFlags::EXEC;
        }
        if raw & ATTR_DEVICE != 0 {
            flags |= MapFlags::DEVICE;
        }
        if raw & SW_SHARED != 0 {
            flags |= MapFlags::SHARED;
        }
        flags
    }
}

// x86_64 long-mode descriptor format.
#[cfg(target_arch = "x86_64")]
mod pte_bits {
    use super::{MapFlags, PhysAddr};

    const PRESENT: u64 = 1 << 0;
    const WRITABLE: u64 = 1 << 1;
    const USER: u64 = 1 << 2;
    const WRITE_THROUGH: u64 = 1 << 3;
    const NO_CACHE: u64 = 1 << 4;
    /// PS bit: terminates the walk at L1/L2
    const HUGE: u64 = 1 << 7;
    /// Software bit recording a shared mapping
    const SW_SHARED: u64 = 1 << 9;
    const NX: u64 = 1 << 63;

    const ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

    pub fn encode_leaf(pa: PhysAddr, flags: MapFlags, level: usize) -> u64 {
        let mut raw = (pa & ADDR_MASK) | PRESENT;
        if level < 3 {
            raw |= HUGE;
        }
        if flags.contains(MapFlags::WRITE) {
            raw |= WRITABLE;
        }
        if flags.contains(MapFlags::USER) {
            raw |= USER;
        }
        if flags.contains(MapFlags::DEVICE) {
            // Uncached device ordering via PAT, never executable
            raw |= NO_CACHE | WRITE_THROUGH | NX;
        } else if !flags.contains(MapFlags::EXEC) {
            raw |= NX;
        }
        if flags.contains(MapFlags::SHARED) {
            raw |= SW_SHARED;
        }
        raw
    }

    pub fn encode_table(pa: PhysAddr) -> u64 {
        // Intermediate entries stay permissive; the leaf governs access
        (pa & ADDR_MASK) | PRESENT | WRITABLE | USER
    }

    pub fn is_valid(raw: u64) -> bool {
        raw & PRESENT != 0
    }

    pub fn is_table(raw: u64, level: usize) -> bool {
        level < 3 && is_valid(raw) && raw & HUGE == 0
    }

    pub fn addr(raw: u64) -> PhysAddr {
        raw & ADDR_MASK
    }

    pub fn decode_flags(raw: u64) -> MapFlags {
        let mut flags = MapFlags::READ;
        if raw & WRITABLE != 0 {
            flags |= MapFlags::WRITE;
        }
        if raw & USER != 0 {
            flags |= MapFlags::USER;
        }
        if raw & NX == 0 {
            flags |= MapFlags::EXEC;
        }
        if raw & NO_CACHE != 0 {
            flags |= MapFlags::DEVICE;
        }
        if raw & SW_SHARED != 0 {
            flags |= MapFlags::SHARED;
        }
        flags
    }
}

/// Kernel root table, installed at init and copied (upper half) into every
/// new address space.
static KERNEL_ROOT: AtomicU64 = AtomicU64::new(0);

pub fn kernel_root() -> PhysAddr {
    KERNEL_ROOT.load(Ordering::Acquire)
}

#[inline]
fn table_mut(pa: PhysAddr) -> *mut PageTable {
    phys_to_ptr(pa) as *mut PageTable
}

/// Allocate a zeroed table node: buddy-backed once the frame allocator is
/// up, boot pool before that.
fn alloc_table_frame() -> Result<PhysAddr, KernelError> {
    match buddy::alloc_frame() {
        Ok(pa) => Ok(pa),
        Err(KernelError::OutOfMemory) => {
            bootmem::alloc_table_frame().ok_or(KernelError::OutOfMemory)
        }
        Err(e) => Err(e),
    }
}

/// Map one 4 KiB page. Fails with `AlreadyMapped` if the leaf slot (or a
/// covering block) is already valid. The TLB entry is flushed before
/// return.
pub fn map(root: PhysAddr, vaddr: VirtAddr, paddr: PhysAddr, flags: MapFlags) -> Result<(), KernelError> {
    if vaddr % PAGE_SIZE as u64 != 0 || paddr % PAGE_SIZE as u64 != 0 {
        return Err(KernelError::InvalidAddress);
    }

    let mut table = root;
    for level in 0..3 {
        let idx = PageTable::index(vaddr, level);
        let entry = unsafe { &mut (*table_mut(table)).entries[idx] };
        if !entry.is_valid() {
            let frame = alloc_table_frame()?;
            entry.0 = pte_bits::encode_table(frame);
        } else if !pte_bits::is_table(entry.0, level) {
            // A block already terminates this walk
            return Err(KernelError::AlreadyMapped);
        }
        table = entry.phys_addr();
    }

    let idx = PageTable::index(vaddr, 3);
    let entry = unsafe { &mut (*table_mut(table)).entries[idx] };
    if entry.is_valid() {
        return Err(KernelError::AlreadyMapped);
    }
    entry.0 = pte_bits::encode_leaf(paddr, flags, 3);

    crate::arch::flush_tlb_page(vaddr);
    Ok(())
}

/// Map a block descriptor terminating at L1 (1 GiB) or L2 (2 MiB); used
/// for the boot identity map.
pub fn map_block(
    root: PhysAddr,
    vaddr: VirtAddr,
    paddr: PhysAddr,
    level: usize,
    flags: MapFlags,
) -> Result<(), KernelError> {
    let block_size = match level {
        1 => L1_BLOCK_SIZE,
        2 => L2_BLOCK_SIZE,
        _ => return Err(KernelError::InvalidArgument),
    };
    if vaddr % block_size != 0 || paddr % block_size != 0 {
        return Err(KernelError::InvalidAddress);
    }

    let mut table = root;
    for walk_level in 0..level {
        let idx = PageTable::index(vaddr, walk_level);
        let entry = unsafe { &mut (*table_mut(table)).entries[idx] };
        if !entry.is_valid() {
            let frame = alloc_table_frame()?;
            entry.0 = pte_bits::encode_table(frame);
        } else if !pte_bits::is_table(entry.0, walk_level) {
            return Err(KernelError::AlreadyMapped);
        }
        table = entry.phys_addr();
    }

    let idx = PageTable::index(vaddr, level);
    let entry = unsafe { &mut (*table_mut(table)).entries[idx] };
    if entry.is_valid() {
        return Err(KernelError::AlreadyMapped);
    }
    entry.0 = pte_bits::encode_leaf(paddr, flags, level);

    crate::arch::flush_tlb_page(vaddr);
    Ok(())
}

/// Map `len` bytes page by page.
pub fn map_range(
    root: PhysAddr,
    vaddr: VirtAddr,
    paddr: PhysAddr,
    len: usize,
    flags: MapFlags,
) -> Result<(), KernelError> {
    let len = super::page::page_align_up(len as u64);
    let mut offset = 0;
    while offset < len {
        map(root, vaddr + offset, paddr + offset, flags)?;
        offset += PAGE_SIZE as u64;
    }
    Ok(())
}

/// Unmap one page, returning the physical frame it mapped. `NotMapped` if
/// there is no valid leaf. The TLB entry is flushed before return.
pub fn unmap(root: PhysAddr, vaddr: VirtAddr) -> Result<PhysAddr, KernelError> {
    let mut table = root;
    for level in 0..3 {
        let idx = PageTable::index(vaddr, level);
        let entry = unsafe { &(*table_mut(table)).entries[idx] };
        if !entry.is_valid() {
            return Err(KernelError::NotMapped);
        }
        if !pte_bits::is_table(entry.0, level) {
            // Blocks are not demoted piecemeal
            return Err(KernelError::Unsupported);
        }
        table = entry.phys_addr();
    }

    let idx = PageTable::index(vaddr, 3);
    let entry = unsafe { &mut (*table_mut(table)).entries[idx] };
    if !entry.is_valid() {
        return Err(KernelError::NotMapped);
    }
    let pa = entry.phys_addr();
    *entry = Pte::invalid();

    crate::arch::flush_tlb_page(vaddr);
    Ok(pa)
}

/// Unmap a range; pages that are already unmapped are skipped.
pub fn unmap_range(root: PhysAddr, vaddr: VirtAddr, len: usize) -> Result<(), KernelError> {
    let len = super::page::page_align_up(len as u64);
    let mut offset = 0;
    while offset < len {
        match unmap(root, vaddr + offset) {
            Ok(_) | Err(KernelError::NotMapped) => {}
            Err(e) => return Err(e),
        }
        offset += PAGE_SIZE as u64;
    }
    Ok(())
}

/// Walk to the physical address backing `vaddr`, honoring block
/// descriptors.
pub fn translate(root: PhysAddr, vaddr: VirtAddr) -> Option<PhysAddr> {
    let mut table = root;
    for level in 0..4 {
        let idx = PageTable::index(vaddr, level);
        let entry = unsafe { &(*table_mut(table)).entries[idx] };
        if !entry.is_valid() {
            return None;
        }
        if level == 3 {
            return Some(entry.phys_addr() + (vaddr & (PAGE_SIZE as u64 - 1)));
        }
        if !pte_bits::is_table(entry.0, level) {
            let block_size = if level == 1 { L1_BLOCK_SIZE } else { L2_BLOCK_SIZE };
            return Some(entry.phys_addr() + (vaddr & (block_size - 1)));
        }
        table = entry.phys_addr();
    }
    None
}

/// Leaf permissions for `vaddr`, if mapped.
pub fn leaf_flags(root: PhysAddr, vaddr: VirtAddr) -> Option<MapFlags> {
    let mut table = root;
    for level in 0..4 {
        let idx = PageTable::index(vaddr, level);
        let entry = unsafe { &(*table_mut(table)).entries[idx] };
        if !entry.is_valid() {
            return None;
        }
        if level == 3 || !pte_bits::is_table(entry.0, level) {
            return Some(pte_bits::decode_flags(entry.0));
        }
        table = entry.phys_addr();
    }
    None
}

/// Free every table node reachable from the user (lower) half of `root`,
/// bottom-up, and finally the root itself. Leaf frames are the caller's
/// responsibility; they are owned by the regions that mapped them.
pub fn free_user_tables(root: PhysAddr) {
    fn free_level(table: PhysAddr, level: usize, first: usize, last: usize) {
        for idx in first..last {
            let entry = unsafe { (*table_mut(table)).entries[idx] };
            if pte_bits::is_table(entry.0, level) {
                free_level(entry.phys_addr(), level + 1, 0, ENTRIES);
                buddy::free_frame(entry.phys_addr());
            }
        }
    }
    // Lower half only: the kernel half is shared with every space
    free_level(root, 0, 0, ENTRIES / 2);
    buddy::free_frame(root);
}

/// Build the kernel root: identity block maps for low RAM (normal memory)
/// and the device-MMIO windows (device memory). Returns the root for
/// `arch::mmu` to install.
pub fn init_kernel_space(
    ram_bytes: u64,
    mmio_windows: &[(PhysAddr, u64)],
) -> Result<PhysAddr, KernelError> {
    let root = alloc_table_frame()?;

    // Low RAM window: 1 GiB blocks up to 2 GiB
    let ram_top = ram_bytes.min(2 * L1_BLOCK_SIZE);
    let mut addr = 0u64;
    while addr < ram_top {
        map_block(
            root,
            addr,
            addr,
            1,
            MapFlags::READ | MapFlags::WRITE | MapFlags::EXEC,
        )?;
        addr += L1_BLOCK_SIZE;
    }

    // Device windows: 2 MiB device blocks
    for &(base, len) in mmio_windows {
        let start = base & !(L2_BLOCK_SIZE - 1);
        let end = (base + len + L2_BLOCK_SIZE - 1) & !(L2_BLOCK_SIZE - 1);
        let mut addr = start;
        while addr < end {
            match map_block(
                root,
                addr,
                addr,
                2,
                MapFlags::READ | MapFlags::WRITE | MapFlags::DEVICE,
            ) {
                Ok(()) | Err(KernelError::AlreadyMapped) => {}
                Err(e) => return Err(e),
            }
            addr += L2_BLOCK_SIZE;
        }
    }

    KERNEL_ROOT.store(root, Ordering::Release);
    crate::info!(
        "paging: kernel root {:#x}, {} MiB identity, {} device windows",
        root,
        ram_top / (1024 * 1024),
        mmio_windows.len()
    );
    Ok(root)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::buddy::tests::init_global_test_arena;

    fn fresh_root() -> PhysAddr {
        init_global_test_arena();
        buddy::alloc_frame().unwrap()
    }

    #[test]
    fn map_translate_unmap_roundtrip() {
        let root = fresh_root();
        let frame = buddy::alloc_frame().unwrap();
        let va = 0x4000_0000u64;

        map(root, va, frame, MapFlags::READ | MapFlags::WRITE).unwrap();
        assert_eq!(translate(root, va), Some(frame));
        assert_eq!(translate(root, va + 0x123), Some(frame + 0x123));

        let flags = leaf_flags(root, va).unwrap();
        assert!(flags.contains(MapFlags::READ | MapFlags::WRITE));
        assert!(!flags.contains(MapFlags::EXEC));

        assert_eq!(unmap(root, va), Ok(frame));
        assert_eq!(translate(root, va), None);
        buddy::free_frame(frame);
    }

    #[test]
    fn double_map_is_rejected() {
        let root = fresh_root();
        let frame = buddy::alloc_frame().unwrap();
        let va = 0x5000_0000u64;
        map(root, va, frame, MapFlags::READ).unwrap();
        assert_eq!(
            map(root, va, frame, MapFlags::READ),
            Err(KernelError::AlreadyMapped)
        );
        unmap(root, va).unwrap();
        buddy::free_frame(frame);
    }

    #[test]
    fn unmap_range_is_idempotent() {
        let root = fresh_root();
        let frame = buddy::alloc_frame().unwrap();
        let va = 0x6000_0000u64;
        map(root, va, frame, MapFlags::READ).unwrap();
        // Covers two pages, only one of which is mapped
        unmap_range(root, va, 2 * PAGE_SIZE).unwrap();
        // And again, with nothing mapped at all
        unmap_range(root, va, 2 * PAGE_SIZE).unwrap();
        assert_eq!(translate(root, va), None);
        buddy::free_frame(frame);
    }

    #[test]
    fn device_region_map_unmap() {
        // Identity-map a device window, translate, then tear it down
        let root = fresh_root();
        let base = 0x0900_0000u64;
        let flags = MapFlags::DEVICE | MapFlags::READ | MapFlags::WRITE;
        map_range(root, base, base, 0x1000, flags).unwrap();
        assert_eq!(translate(root, base), Some(base));
        let leaf = leaf_flags(root, base).unwrap();
        assert!(leaf.contains(MapFlags::DEVICE));
        assert!(!leaf.contains(MapFlags::EXEC), "device memory is never executable");
        unmap_range(root, base, 0x1000).unwrap();
        assert_eq!(translate(root, base), None);
    }

    #[test]
    fn tlb_flushed_on_map_and_unmap() {
        use core::sync::atomic::Ordering;
        let root = fresh_root();
        let frame = buddy::alloc_frame().unwrap();
        let va = 0x7000_0000u64;

        let before = crate::arch::TLB_PAGE_FLUSHES.load(Ordering::Relaxed);
        map(root, va, frame, MapFlags::READ).unwrap();
        unmap(root, va).unwrap();
        let after = crate::arch::TLB_PAGE_FLUSHES.load(Ordering::Relaxed);
        assert!(after >= before + 2, "map and unmap each flush the entry");
        buddy::free_frame(frame);
    }

    #[test]
    fn block_descriptor_short_circuits() {
        let root = fresh_root();
        let pa = 0x8000_0000u64;
        let va = 0x1_0000_0000u64;
        map_block(root, va, pa, 2, MapFlags::READ | MapFlags::WRITE).unwrap();
        assert_eq!(translate(root, va + 0x12345), Some(pa + 0x12345));
        // A page map underneath the block is refused
        let frame = buddy::alloc_frame().unwrap();
        assert_eq!(
            map(root, va, frame, MapFlags::READ),
            Err(KernelError::AlreadyMapped)
        );
        buddy::free_frame(frame);
    }

    #[test]
    fn permissions_decode_consistently() {
        let root = fresh_root();
        let frame = buddy::alloc_frame().unwrap();
        let va = 0x9000_0000u64;
        map(
            root,
            va,
            frame,
            MapFlags::READ | MapFlags::EXEC | MapFlags::USER,
        )
        .unwrap();
        let flags = leaf_flags(root, va).unwrap();
        assert!(flags.contains(MapFlags::EXEC));
        assert!(flags.contains(MapFlags::USER));
        assert!(!flags.contains(MapFlags::WRITE));
        unmap(root, va).unwrap();
        buddy::free_frame(frame);
    }
}
