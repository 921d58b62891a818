//! Device contexts and the DCBAA.
//!
//! The controller reads device state through the Device Context Base
//! Address Array: slot 0 points at the scratchpad array when the
//! controller asks for scratch memory, slots 1..=max hold per-device
//! output contexts. Input contexts carry the add/drop flags the
//! Address Device / Configure Endpoint / Evaluate Context commands
//! consume.
use crate::drivers::{DriverError, DriverResult};
use crate::mm::{self, PhysAddr, PAGE_SIZE};

/// 32-byte context entries (CSZ = 0).
pub const CONTEXT_BYTES: usize = 32;

/// Slot context field encoding (first context entry).
#[derive(Debug, Clone, Copy, Default)]
pub struct SlotContextFields {
    pub route_string: u32,
    pub speed: u8,
    pub context_entries: u8,
    pub root_hub_port: u8,
}

impl SlotContextFields {
    fn dword0(&self) -> u32 {
        (self.route_string & 0xF_FFFF)
            | ((self.speed as u32 & 0xF) << 20)
            | ((self.context_entries as u32 & 0x1F) << 27)
    }

    fn dword1(&self) -> u32 {
        (self.root_hub_port as u32) << 16
    }
}

/// Endpoint context field encoding.
#[derive(Debug, Clone, Copy, Default)]
pub struct EndpointContextFields {
    /// 1 = ISO out .. 7 = control; 3 = interrupt IN is what the keyboard
    /// path uses
    pub endpoint_type: u8,
    pub max_packet_size: u16,
    pub interval: u8,
    pub ring_base: u64,
    pub dequeue_cycle: bool,
    pub error_count: u8,
}

pub const EP_TYPE_CONTROL: u8 = 4;
pub const EP_TYPE_INTERRUPT_IN: u8 = 7;

impl EndpointContextFields {
    fn dword0(&self) -> u32 {
        (self.interval as u32) << 16
    }

    fn dword1(&self) -> u32 {
        ((self.error_count as u32 & 0x3) << 1)
            | ((self.endpoint_type as u32 & 0x7) << 3)
            | ((self.max_packet_size as u32) << 16)
    }

    fn tr_dequeue(&self) -> u64 {
        self.ring_base | self.dequeue_cycle as u64
    }
}

/// One DMA block holding a device's output context.
pub struct DeviceContext {
    base: PhysAddr,
}

impl DeviceContext {
    pub fn new() -> DriverResult<Self> {
        let base = mm::alloc_frame().map_err(DriverError::from)?;
        Ok(Self { base })
    }

    pub fn base(&self) -> PhysAddr {
        self.base
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        mm::free_frame(self.base);
    }
}

/// Input context: control context (add/drop flags) followed by slot and
/// endpoint contexts.
pub struct InputContext {
    base: PhysAddr,
}

impl InputContext {
    pub fn new() -> DriverResult<Self> {
        let base = mm::alloc_frame().map_err(DriverError::from)?;
        Ok(Self { base })
    }

    pub fn base(&self) -> PhysAddr {
        self.base
    }

    fn dword_ptr(&self, byte_off: usize) -> *mut u32 {
        unsafe { mm::phys_to_ptr(self.base).add(byte_off) as *mut u32 }
    }

    pub fn clear(&mut self) {
        unsafe { core::ptr::write_bytes(mm::phys_to_ptr(self.base), 0, PAGE_SIZE) };
    }

    /// A1..A31/D1..D31 add/drop flags in the input control context.
    pub fn set_add_flags(&mut self, flags: u32) {
        unsafe { core::ptr::write_volatile(self.dword_ptr(4), flags) };
    }

    pub fn set_drop_flags(&mut self, flags: u32) {
        unsafe { core::ptr::write_volatile(self.dword_ptr(0), flags) };
    }

    /// Slot context sits after the input control context.
    pub fn write_slot(&mut self, fields: &SlotContextFields) {
        let off = CONTEXT_BYTES;
        unsafe {
            core::ptr::write_volatile(self.dword_ptr(off), fields.dword0());
            core::ptr::write_volatile(self.dword_ptr(off + 4), fields.dword1());
        }
    }

    /// Endpoint context for device context index `dci` (1 = EP0).
    pub fn write_endpoint(&mut self, dci: u8, fields: &EndpointContextFields) {
        let off = CONTEXT_BYTES * (1 + dci as usize);
        unsafe {
            core::ptr::write_volatile(self.dword_ptr(off), fields.dword0());
            core::ptr::write_volatile(self.dword_ptr(off + 4), fields.dword1());
            core::ptr::write_volatile(
                self.dword_ptr(off + 8) as *mut u64,
                fields.tr_dequeue(),
            );
            // Average TRB length
            core::ptr::write_volatile(self.dword_ptr(off + 16), 8);
        }
    }
}

impl Drop for InputContext {
    fn drop(&mut self) {
        mm::free_frame(self.base);
    }
}

/// The DCBAA plus the scratchpad buffers the controller asked for.
pub struct DeviceContextArray {
    base: PhysAddr,
    scratchpad_array: Option<PhysAddr>,
    scratchpad_pages: alloc::vec::Vec<PhysAddr>,
    max_slots: usize,
}

impl DeviceContextArray {
    /// Allocate the array and `scratchpads` scratch pages (HCSPARAMS2).
    pub fn new(max_slots: usize, scratchpads: usize) -> DriverResult<Self> {
        let base = mm::alloc_frame().map_err(DriverError::from)?;

        let mut scratchpad_pages = alloc::vec::Vec::new();
        let scratchpad_array = if scratchpads > 0 {
            let array = mm::alloc_frame().map_err(DriverError::from)?;
            for i in 0..scratchpads.min(PAGE_SIZE / 8) {
                let page = mm::alloc_frame().map_err(DriverError::from)?;
                unsafe {
                    core::ptr::write_volatile(
                        (mm::phys_to_ptr(array) as *mut u64).add(i),
                        page,
                    );
                }
                scratchpad_pages.push(page);
            }
            unsafe {
                // Slot 0 of the DCBAA carries the scratchpad array
                core::ptr::write_volatile(mm::phys_to_ptr(base) as *mut u64, array);
            }
            Some(array)
        } else {
            None
        };

        Ok(Self {
            base,
            scratchpad_array,
            scratchpad_pages,
            max_slots,
        })
    }

    pub fn base(&self) -> PhysAddr {
        self.base
    }

    /// Point a slot entry at a device's output context.
    pub fn set_slot(&mut self, slot_id: u8, context: &DeviceContext) -> DriverResult<()> {
        if slot_id == 0 || slot_id as usize > self.max_slots {
            return Err(DriverError::InvalidParameter);
        }
        unsafe {
            core::ptr::write_volatile(
                (mm::phys_to_ptr(self.base) as *mut u64).add(slot_id as usize),
                context.base(),
            );
        }
        Ok(())
    }

    pub fn clear_slot(&mut self, slot_id: u8) {
        if slot_id == 0 || slot_id as usize > self.max_slots {
            return;
        }
        unsafe {
            core::ptr::write_volatile(
                (mm::phys_to_ptr(self.base) as *mut u64).add(slot_id as usize),
                0,
            );
        }
    }
}

impl Drop for DeviceContextArray {
    fn drop(&mut self) {
        for page in &self.scratchpad_pages {
            mm::free_frame(*page);
        }
        if let Some(array) = self.scratchpad_array {
            mm::free_frame(array);
        }
        mm::free_frame(self.base);
    }
}
