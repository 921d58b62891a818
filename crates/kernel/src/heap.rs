//! Kernel heap.
//!
//! A general-purpose linked-list allocator: `dealloc` genuinely reclaims,
//! so subsystems may allocate and free freely. The heap region is a boot
//! carve-out handed over before the frame allocator exists; the frame
//! allocator's metadata itself lives here.

#[cfg(not(test))]
use linked_list_allocator::LockedHeap;

#[cfg(not(test))]
#[global_allocator]
static KERNEL_HEAP: LockedHeap = LockedHeap::empty();

/// Initialize the kernel heap over `[start, start + size)`.
///
/// # Safety
/// The region must be mapped, writable, unused by anything else, and this
/// must be called exactly once before the first allocation.
#[cfg(not(test))]
pub unsafe fn init(start: usize, size: usize) {
    KERNEL_HEAP.lock().init(start as *mut u8, size);
    crate::info!("heap: {} KiB at {:#x}", size / 1024, start);
}

/// Hosted test builds use the process allocator; heap init is a no-op.
#[cfg(test)]
pub unsafe fn init(_start: usize, _size: usize) {}
