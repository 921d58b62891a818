/// Split virtqueues.
///
/// Descriptor table, available ring and used ring live in one
/// page-aligned DMA block. Publication follows the virtio ordering
/// rules: every descriptor in a chain is fully initialized before the
/// new available index is store-released, and the used index is
/// load-acquired before any completion is read. The driver is the only
/// producer on the available ring; the device is the only producer on
/// the used ring; no lock is needed between them.
use crate::drivers::{DriverError, DriverResult};
use crate::mm::{self, PhysAddr, PAGE_SIZE};
use alloc::vec::Vec;
use core::sync::atomic::{fence, Ordering};

pub const VIRTQ_DESC_F_NEXT: u16 = 1;
pub const VIRTQ_DESC_F_WRITE: u16 = 2;

/// Descriptor-table entry.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct VirtqDesc {
    pub addr: u64,
    pub len: u32,
    pub flags: u16,
    pub next: u16,
}

/// One buffer in a posted chain.
#[derive(Debug, Clone, Copy)]
pub struct Buffer {
    pub addr: PhysAddr,
    pub len: u32,
    /// Device writes into this buffer (responses) rather than reading it
    pub device_writes: bool,
}

/// Token identifying a posted chain; returned again on completion.
pub type Token = u16;

pub struct VirtQueue {
    pub index: u16,
    pub size: u16,
    block: PhysAddr,
    block_order: u8,
    avail_offset: usize,
    used_offset: usize,
    free_descs: Vec<u16>,
    avail_idx_shadow: u16,
    last_used_idx: u16,
}

impl VirtQueue {
    /// Allocate and lay out a queue of `size` entries (power of two).
    pub fn new(index: u16, size: u16) -> DriverResult<Self> {
        if !size.is_power_of_two() || size == 0 || size > 32768 {
            return Err(DriverError::InvalidParameter);
        }

        let desc_bytes = size as usize * core::mem::size_of::<VirtqDesc>();
        // flags + idx + ring + used_event
        let avail_bytes = 6 + 2 * size as usize;
        // flags + idx + elems + avail_event, 4-byte aligned
        let avail_offset = desc_bytes;
        let used_offset = (avail_offset + avail_bytes + 3) & !3;
        let used_bytes = 6 + 8 * size as usize;

        let total = used_offset + used_bytes;
        let order = total
            .div_ceil(PAGE_SIZE)
            .next_power_of_two()
            .trailing_zeros() as u8;
        let block = mm::alloc_frames_in(order, mm::Zone::Normal).map_err(DriverError::from)?;

        Ok(Self {
            index,
            size,
            block,
            block_order: order,
            avail_offset,
            used_offset,
            free_descs: (0..size).collect(),
            avail_idx_shadow: 0,
            last_used_idx: 0,
        })
    }

    /// Ring addresses to program into the transport.
    pub fn addresses(&self) -> (PhysAddr, PhysAddr, PhysAddr) {
        (
            self.block,
            self.block + self.avail_offset as u64,
            self.block + self.used_offset as u64,
        )
    }

    #[inline]
    fn desc_ptr(&self, idx: u16) -> *mut VirtqDesc {
        unsafe {
            (mm::phys_to_ptr(self.block) as *mut VirtqDesc).add(idx as usize)
        }
    }

    #[inline]
    fn avail_ptr(&self, byte_off: usize) -> *mut u16 {
        unsafe { mm::phys_to_ptr(self.block).add(self.avail_offset + byte_off) as *mut u16 }
    }

    #[inline]
    fn used_ptr(&self, byte_off: usize) -> *mut u32 {
        unsafe { mm::phys_to_ptr(self.block).add(self.used_offset + byte_off) as *mut u32 }
    }

    /// Post a chain of buffers. The head descriptor index is the token;
    /// the device hands it back on completion.
    pub fn post(&mut self, chain: &[Buffer]) -> DriverResult<Token> {
        if chain.is_empty() {
            return Err(DriverError::InvalidParameter);
        }
        if chain.len() > self.free_descs.len() {
            return Err(DriverError::Busy);
        }

        let mut indices = Vec::with_capacity(chain.len());
        for _ in 0..chain.len() {
            indices.push(self.free_descs.pop().unwrap());
        }

        // Fill every descriptor before publication
        for (i, buffer) in chain.iter().enumerate() {
            let mut flags = if buffer.device_writes {
                VIRTQ_DESC_F_WRITE
            } else {
                0
            };
            let next = if i + 1 < indices.len() {
                flags |= VIRTQ_DESC_F_NEXT;
                indices[i + 1]
            } else {
                0
            };
            unsafe {
                core::ptr::write_volatile(
                    self.desc_ptr(indices[i]),
                    VirtqDesc {
                        addr: buffer.addr,
                        len: buffer.len,
                        flags,
                        next,
                    },
                );
            }
        }

        let head = indices[0];
        let slot = (self.avail_idx_shadow % self.size) as usize;
        unsafe {
            // ring[slot] = head
            core::ptr::write_volatile(self.avail_ptr(4 + 2 * slot), head);
        }

        // Publication barrier: descriptors and the ring slot are visible
        // before the index moves
        fence(Ordering::Release);
        self.avail_idx_shadow = self.avail_idx_shadow.wrapping_add(1);
        unsafe {
            core::ptr::write_volatile(self.avail_ptr(2), self.avail_idx_shadow);
        }

        Ok(head)
    }

    /// Next completion in device order, if any: `(token, written_len)`.
    pub fn next_completion(&mut self) -> Option<(Token, u32)> {
        let used_idx = unsafe { core::ptr::read_volatile(self.used_ptr(2) as *const u16) };
        if used_idx == self.last_used_idx {
            return None;
        }
        // Pair with the device's release of used.idx
        fence(Ordering::Acquire);

        let slot = (self.last_used_idx % self.size) as usize;
        let (id, len) = unsafe {
            let elem = self.used_ptr(4 + 8 * slot);
            (
                core::ptr::read_volatile(elem) as u16,
                core::ptr::read_volatile(elem.add(1)),
            )
        };
        self.last_used_idx = self.last_used_idx.wrapping_add(1);

        // Return the chain to the free list
        let mut desc_idx = id;
        loop {
            let desc = unsafe { core::ptr::read_volatile(self.desc_ptr(desc_idx)) };
            self.free_descs.push(desc_idx);
            if desc.flags & VIRTQ_DESC_F_NEXT == 0 {
                break;
            }
            desc_idx = desc.next;
        }

        Some((id, len))
    }

    /// Drain completions strictly in order.
    pub fn poll_completions(&mut self) -> impl Iterator<Item = (Token, u32)> + '_ {
        core::iter::from_fn(move || self.next_completion())
    }

    pub fn free_desc_count(&self) -> usize {
        self.free_descs.len()
    }
}

impl Drop for VirtQueue {
    fn drop(&mut self) {
        mm::free_frames(self.block, self.block_order);
    }
}

unsafe impl Send for VirtQueue {}
