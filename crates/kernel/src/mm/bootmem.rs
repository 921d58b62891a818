//! Early page-table frames.
//!
//! The page-table manager needs a handful of zeroed frames before the
//! frame allocator exists (the frame allocator's own metadata wants a
//! mapped heap, which wants page tables). This pool is exactly four
//! frames, statically allocated and never returned; paging bootstrap
//! switches to the buddy allocator the moment it is initialized.

use super::page::{PhysAddr, PAGE_SIZE};
use core::sync::atomic::{AtomicUsize, Ordering};

const BOOT_FRAMES: usize = 4;

#[repr(C, align(4096))]
struct BootFrame([u8; PAGE_SIZE]);

static mut POOL: [BootFrame; BOOT_FRAMES] = [
    BootFrame([0; PAGE_SIZE]),
    BootFrame([0; PAGE_SIZE]),
    BootFrame([0; PAGE_SIZE]),
    BootFrame([0; PAGE_SIZE]),
];

static NEXT: AtomicUsize = AtomicUsize::new(0);

/// Hand out the next boot frame, identity-addressed. `None` once the pool
/// is spent; callers must have switched to the frame allocator by then.
pub fn alloc_table_frame() -> Option<PhysAddr> {
    let idx = NEXT.fetch_add(1, Ordering::Relaxed);
    if idx >= BOOT_FRAMES {
        return None;
    }
    let pa = unsafe { core::ptr::addr_of!(POOL[idx]) as PhysAddr };
    Some(pa)
}

/// Frames handed out so far.
pub fn used() -> usize {
    NEXT.load(Ordering::Relaxed).min(BOOT_FRAMES)
}
