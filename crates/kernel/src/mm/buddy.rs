/// Buddy allocator for physical page management.
///
/// Free lists per order within each zone (DMA / Normal / High); allocation
/// splits higher-order blocks on demand, free coalesces with the XOR
/// buddy. Frame metadata is a dense array indexed by PFN. Allocation
/// never blocks and zeroes frames before handing them out.
use super::page::{
    pa_to_pfn, page_align_down, page_align_up, pfn_to_pa, phys_to_ptr, Page, PageFlags, Pfn,
    PhysAddr, Zone, PAGE_SIZE, ZONE_COUNT,
};
use crate::error::KernelError;
use crate::sync::SpinLock;
use alloc::vec::Vec;

/// Maximum order (2^10 frames = 4 MiB max contiguous run)
pub const MAX_ORDER: u8 = 10;

const ORDERS: usize = MAX_ORDER as usize + 1;

struct ZoneArea {
    free_lists: [Vec<Pfn>; ORDERS],
    free_frames: usize,
}

impl ZoneArea {
    fn new() -> Self {
        Self {
            free_lists: Default::default(),
            free_frames: 0,
        }
    }
}

/// Buddy allocator state
pub struct FrameAllocator {
    zones: [ZoneArea; ZONE_COUNT],
    /// Frame metadata array (indexed by PFN - base_pfn)
    pages: Vec<Page>,
    base_pfn: Pfn,
    num_pages: usize,
    total_frames: usize,
}

impl FrameAllocator {
    /// Standalone instance for hosted tests; kernel code goes through
    /// the module-level functions and the global instance.
    #[cfg(test)]
    pub fn new_for_tests() -> Self {
        Self::new()
    }

    fn new() -> Self {
        Self {
            zones: [ZoneArea::new(), ZoneArea::new(), ZoneArea::new()],
            pages: Vec::new(),
            base_pfn: 0,
            num_pages: 0,
            total_frames: 0,
        }
    }

    /// Initialize from RAM ranges reported by the boot memory map.
    pub fn init(&mut self, ram_ranges: &[(PhysAddr, usize)]) -> Result<(), KernelError> {
        if ram_ranges.is_empty() {
            return Err(KernelError::InvalidArgument);
        }

        let mut min_addr = u64::MAX;
        let mut max_addr = 0u64;
        for &(addr, size) in ram_ranges {
            min_addr = min_addr.min(page_align_down(addr));
            max_addr = max_addr.max(page_align_down(addr + size as u64));
        }

        self.base_pfn = pa_to_pfn(min_addr);
        self.num_pages = pa_to_pfn(max_addr) - self.base_pfn;

        self.pages = Vec::with_capacity(self.num_pages);
        for _ in 0..self.num_pages {
            let mut page = Page::new();
            // Holes between ranges stay reserved until proven otherwise
            page.flags = PageFlags::RESERVED;
            self.pages.push(page);
        }

        for &(addr, size) in ram_ranges {
            let start_pfn = pa_to_pfn(page_align_up(addr));
            let end_pfn = pa_to_pfn(page_align_down(addr + size as u64));
            for pfn in start_pfn..end_pfn {
                if let Some(page) = self.page_mut(pfn) {
                    page.flags = PageFlags::empty();
                }
            }
            let count = end_pfn.saturating_sub(start_pfn);
            self.total_frames += count;
            self.add_free_range(start_pfn, count);
        }

        // Settle the per-zone accounting from the carved lists
        for zone in self.zones.iter_mut() {
            zone.free_frames = zone
                .free_lists
                .iter()
                .enumerate()
                .map(|(order, list)| list.len() << order)
                .sum();
        }

        crate::info!(
            "buddy: {} frames ({} MiB) in {} ranges, base pfn {}",
            self.total_frames,
            self.total_frames * PAGE_SIZE / (1024 * 1024),
            ram_ranges.len(),
            self.base_pfn
        );
        Ok(())
    }

    /// Carve a PFN range into maximal naturally-aligned blocks.
    fn add_free_range(&mut self, start_pfn: Pfn, num_pages: usize) {
        let mut pfn = start_pfn;
        let mut remaining = num_pages;
        while remaining > 0 {
            let mut order = 0u8;
            while order < MAX_ORDER {
                let next = 1usize << (order + 1);
                if next > remaining || pfn & (next - 1) != 0 {
                    break;
                }
                // A block must not straddle a zone boundary
                if Zone::of(pfn_to_pa(pfn)) != Zone::of(pfn_to_pa(pfn + next - 1)) {
                    break;
                }
                order += 1;
            }
            self.put_free_block(pfn, order);
            pfn += 1 << order;
            remaining -= 1 << order;
        }
    }

    /// Allocate 2^order frames from `zone` or any lower zone.
    pub fn alloc_frames(&mut self, order: u8, zone: Zone) -> Result<PhysAddr, KernelError> {
        if order > MAX_ORDER {
            return Err(KernelError::InvalidArgument);
        }

        for zone_idx in (0..=zone as usize).rev() {
            if let Some(pa) = self.alloc_from_zone(order, zone_idx) {
                // Zero the frames before ownership transfers to the caller
                unsafe {
                    core::ptr::write_bytes(phys_to_ptr(pa), 0, PAGE_SIZE << order);
                }
                return Ok(pa);
            }
        }

        crate::warn!("buddy: out of memory (order {}, zone {:?})", order, zone);
        Err(KernelError::OutOfMemory)
    }

    fn alloc_from_zone(&mut self, order: u8, zone_idx: usize) -> Option<PhysAddr> {
        let mut current = order;
        let pfn = loop {
            if current > MAX_ORDER {
                return None;
            }
            if let Some(pfn) = self.zones[zone_idx].free_lists[current as usize].pop() {
                break pfn;
            }
            current += 1;
        };

        // Split down, returning the upper buddies to their lists
        while current > order {
            current -= 1;
            self.put_free_block(pfn + (1 << current), current);
        }

        self.zones[zone_idx].free_frames -= 1 << order;
        if let Some(page) = self.page_mut(pfn) {
            page.set_refcount(1);
            page.order = order;
            page.flags.remove(PageFlags::BUDDY);
        }
        Some(pfn_to_pa(pfn))
    }

    /// Free 2^order frames. A frame still referenced elsewhere stays
    /// allocated until the last `put`.
    pub fn free_frames(&mut self, pa: PhysAddr, order: u8) {
        let pfn = pa_to_pfn(pa);
        if let Some(page) = self.page(pfn) {
            if page.flags.contains(PageFlags::BUDDY) || page.is_free() {
                crate::error!("buddy: double free of pfn {}", pfn);
                return;
            }
            if page.put() > 0 {
                return;
            }
        } else {
            crate::error!("buddy: free of unmanaged pa {:#x}", pa);
            return;
        }

        let zone_idx = Zone::of(pa) as usize;
        self.zones[zone_idx].free_frames += 1 << order;
        self.coalesce_and_insert(pfn, order);
    }

    fn coalesce_and_insert(&mut self, mut pfn: Pfn, mut order: u8) {
        while order < MAX_ORDER {
            let buddy_pfn = pfn ^ (1usize << order);
            let buddy_free = match self.page(buddy_pfn) {
                Some(buddy) => {
                    buddy.flags.contains(PageFlags::BUDDY)
                        && buddy.order == order
                        && Zone::of(pfn_to_pa(buddy_pfn)) == Zone::of(pfn_to_pa(pfn))
                }
                None => false,
            };
            if !buddy_free {
                break;
            }

            let zone_idx = Zone::of(pfn_to_pa(buddy_pfn)) as usize;
            let list = &mut self.zones[zone_idx].free_lists[order as usize];
            if let Some(pos) = list.iter().position(|&p| p == buddy_pfn) {
                list.swap_remove(pos);
            }
            if let Some(buddy) = self.page_mut(buddy_pfn) {
                buddy.flags.remove(PageFlags::BUDDY);
            }

            pfn = pfn.min(buddy_pfn);
            order += 1;
        }
        self.put_free_block(pfn, order);
    }

    fn put_free_block(&mut self, pfn: Pfn, order: u8) {
        if let Some(page) = self.page_mut(pfn) {
            page.set_refcount(0);
            page.order = order;
            page.flags.insert(PageFlags::BUDDY);
        }
        let zone_idx = Zone::of(pfn_to_pa(pfn)) as usize;
        self.zones[zone_idx].free_lists[order as usize].push(pfn);
    }

    fn page(&self, pfn: Pfn) -> Option<&Page> {
        pfn.checked_sub(self.base_pfn)
            .and_then(|idx| self.pages.get(idx))
    }

    fn page_mut(&mut self, pfn: Pfn) -> Option<&mut Page> {
        let base = self.base_pfn;
        pfn.checked_sub(base).and_then(|idx| self.pages.get_mut(idx))
    }

    pub fn free_bytes(&self) -> usize {
        self.zones.iter().map(|z| z.free_frames).sum::<usize>() * PAGE_SIZE
    }

    pub fn total_bytes(&self) -> usize {
        self.total_frames * PAGE_SIZE
    }

    /// Mark a frame pinned (kernel image, DMA rings that must never move).
    pub fn lock_frame(&mut self, pa: PhysAddr) {
        if let Some(page) = self.page_mut(pa_to_pfn(pa)) {
            page.flags.insert(PageFlags::LOCKED | PageFlags::KERNEL);
        }
    }
}

/// Global frame allocator. Single lock around free-list mutation; never
/// held across suspension.
static FRAMES: SpinLock<Option<FrameAllocator>> = SpinLock::new(None);

pub fn init_frame_allocator(ram_ranges: &[(PhysAddr, usize)]) -> Result<(), KernelError> {
    let mut allocator = FrameAllocator::new();
    allocator.init(ram_ranges)?;
    *FRAMES.lock() = Some(allocator);
    Ok(())
}

/// Allocate one zeroed 4 KiB frame.
pub fn alloc_frame() -> Result<PhysAddr, KernelError> {
    alloc_frames_in(0, Zone::High)
}

/// Allocate 2^order naturally-aligned zeroed frames.
pub fn alloc_frames(order: u8) -> Result<PhysAddr, KernelError> {
    alloc_frames_in(order, Zone::High)
}

/// Allocate with a zone preference; exhaustion falls back to lower zones.
pub fn alloc_frames_in(order: u8, zone: Zone) -> Result<PhysAddr, KernelError> {
    FRAMES
        .lock()
        .as_mut()
        .ok_or(KernelError::OutOfMemory)?
        .alloc_frames(order, zone)
}

pub fn free_frame(pa: PhysAddr) {
    free_frames(pa, 0)
}

pub fn free_frames(pa: PhysAddr, order: u8) {
    if let Some(alloc) = FRAMES.lock().as_mut() {
        alloc.free_frames(pa, order);
    }
}

pub fn free_bytes() -> usize {
    FRAMES.lock().as_ref().map_or(0, |a| a.free_bytes())
}

pub fn total_bytes() -> usize {
    FRAMES.lock().as_ref().map_or(0, |a| a.total_bytes())
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use crate::mm::page::pa_to_pfn;

    /// Page-aligned RAM arena handed to a private allocator instance so
    /// frame contents are real, writable host memory.
    pub struct TestArena {
        backing: Vec<u8>,
        pub base: PhysAddr,
        pub size: usize,
    }

    impl TestArena {
        pub fn new(frames: usize) -> Self {
            let size = frames * PAGE_SIZE;
            let backing = alloc::vec![0u8; size + PAGE_SIZE];
            let base = page_align_up(backing.as_ptr() as u64);
            Self {
                backing,
                base,
                size,
            }
        }

        pub fn ranges(&self) -> [(PhysAddr, usize); 1] {
            let _ = &self.backing;
            [(self.base, self.size)]
        }
    }

    pub fn arena_allocator(frames: usize) -> (TestArena, FrameAllocator) {
        let arena = TestArena::new(frames);
        let mut alloc = FrameAllocator::new();
        alloc.init(&arena.ranges()).unwrap();
        (arena, alloc)
    }

    /// Point the global allocator at a leaked arena so subsystems that
    /// call `alloc_frame()` internally (page tables, exec, DMA rings) run
    /// against real memory. Shared by every test in the process.
    pub fn init_global_test_arena() {
        static ONCE: std::sync::Once = std::sync::Once::new();
        ONCE.call_once(|| {
            let arena = alloc::boxed::Box::leak(alloc::boxed::Box::new(TestArena::new(16384)));
            init_frame_allocator(&arena.ranges()).unwrap();
        });
    }

    #[test]
    fn alloc_free_preserves_free_bytes() {
        let (_arena, mut alloc) = arena_allocator(64);
        let initial = alloc.free_bytes();

        let a = alloc.alloc_frames(0, Zone::High).unwrap();
        let b = alloc.alloc_frames(2, Zone::High).unwrap();
        let c = alloc.alloc_frames(0, Zone::High).unwrap();
        assert_eq!(alloc.free_bytes(), initial - 6 * PAGE_SIZE);

        alloc.free_frames(b, 2);
        alloc.free_frames(a, 0);
        alloc.free_frames(c, 0);
        assert_eq!(alloc.free_bytes(), initial);
    }

    #[test]
    fn allocations_are_aligned_and_zeroed() {
        let (_arena, mut alloc) = arena_allocator(64);
        let pa = alloc.alloc_frames(3, Zone::High).unwrap();
        assert_eq!(pa_to_pfn(pa) & 0x7, 0, "order-3 block naturally aligned");
        let bytes = unsafe { core::slice::from_raw_parts(phys_to_ptr(pa), PAGE_SIZE << 3) };
        assert!(bytes.iter().all(|&b| b == 0));
        alloc.free_frames(pa, 3);
    }

    #[test]
    fn split_blocks_coalesce_back() {
        let (_arena, mut alloc) = arena_allocator(32);
        let initial = alloc.free_bytes();

        // Exhaust with single frames, then free all; coalescing must
        // restore a block large enough for a high order
        let mut held = Vec::new();
        while let Ok(pa) = alloc.alloc_frames(0, Zone::High) {
            held.push(pa);
        }
        assert_eq!(alloc.free_bytes(), 0);
        for pa in held {
            alloc.free_frames(pa, 0);
        }
        assert_eq!(alloc.free_bytes(), initial);
        let big = alloc.alloc_frames(4, Zone::High);
        assert!(big.is_ok(), "coalescing restored an order-4 block");
    }

    #[test]
    fn refcounted_frame_survives_first_put() {
        let (_arena, mut alloc) = arena_allocator(16);
        let pa = alloc.alloc_frames(0, Zone::High).unwrap();
        let before = alloc.free_bytes();

        if let Some(page) = alloc.page(pa_to_pfn(pa)) {
            page.get();
        }
        alloc.free_frames(pa, 0);
        assert_eq!(alloc.free_bytes(), before, "still referenced");
        alloc.free_frames(pa, 0);
        assert_eq!(alloc.free_bytes(), before + PAGE_SIZE);
    }

    #[test]
    fn exhaustion_reports_out_of_memory() {
        let (_arena, mut alloc) = arena_allocator(8);
        assert_eq!(
            alloc.alloc_frames(MAX_ORDER, Zone::High),
            Err(KernelError::OutOfMemory)
        );
        assert!(alloc.alloc_frames(MAX_ORDER + 1, Zone::High).is_err());
    }

    #[test]
    fn double_free_is_rejected() {
        let (_arena, mut alloc) = arena_allocator(16);
        let initial = alloc.free_bytes();
        let pa = alloc.alloc_frames(0, Zone::High).unwrap();
        alloc.free_frames(pa, 0);
        alloc.free_frames(pa, 0);
        assert_eq!(alloc.free_bytes(), initial);
    }
}
