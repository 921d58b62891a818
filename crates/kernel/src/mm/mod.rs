/// Memory management subsystem:
/// - buddy frame allocator with DMA/Normal/High zones
/// - 4-level page tables with block descriptors and device attributes
/// - per-process address spaces with owned regions
/// - bounded boot pool for pre-allocator page-table frames
pub mod address_space;
pub mod bootmem;
pub mod buddy;
pub mod page;
pub mod paging;

pub use page::{
    pa_to_pfn, page_align_down, page_align_up, pfn_to_pa, phys_to_ptr, set_direct_map_offset,
    Page, PageFlags, Pfn, PhysAddr, VirtAddr, Zone, PAGE_SHIFT, PAGE_SIZE,
};

pub use buddy::{
    alloc_frame, alloc_frames, alloc_frames_in, free_bytes, free_frame, free_frames,
    init_frame_allocator, total_bytes, MAX_ORDER,
};

pub use paging::{
    init_kernel_space, kernel_root, map, map_block, map_range, translate, unmap, unmap_range,
    MapFlags, PageTable, Pte,
};

pub use address_space::{
    switch_to, AddressSpace, Segments, SharedAddressSpace, Vma, USER_HEAP_START, USER_STACK_SIZE,
    USER_STACK_TOP,
};
