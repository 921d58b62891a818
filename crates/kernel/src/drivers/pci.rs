//! PCI configuration-space access.
//!
//! Two access mechanisms behind one trait: ECAM memory-mapped config
//! space (ARM64 virt, modern PCIe) and the legacy 0xCF8/0xCFC port pair
//! (x86_64). On top of that: device scan, vendor-capability walk, and
//! BAR sizing/assignment from a reserved high MMIO window for BARs the
//! firmware left unprogrammed.
//!
//! Capability-walk hardening: the walk stops on a zero link, masks link
//! pointers to 4-byte alignment, and gives up after 48 links.

use super::{DriverError, DriverResult};
use crate::sync::SpinLock;

/// Bus/device/function address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bdf {
    pub bus: u8,
    pub device: u8,
    pub function: u8,
}

impl Bdf {
    pub const fn new(bus: u8, device: u8, function: u8) -> Self {
        Self {
            bus,
            device,
            function,
        }
    }
}

/// Config-space registers this module touches.
pub mod config {
    pub const VENDOR_ID: u16 = 0x00;
    pub const COMMAND: u16 = 0x04;
    pub const CLASS_REV: u16 = 0x08;
    pub const HEADER_TYPE: u16 = 0x0C;
    pub const BAR0: u16 = 0x10;
    pub const CAP_PTR: u16 = 0x34;

    pub const COMMAND_MEMORY: u16 = 1 << 1;
    pub const COMMAND_BUS_MASTER: u16 = 1 << 2;
}

/// Raw dword access to one function's 256-byte config space.
pub trait ConfigSpace: Send + Sync {
    fn read32(&self, bdf: Bdf, offset: u16) -> u32;
    fn write32(&self, bdf: Bdf, offset: u16, value: u32);

    fn read16(&self, bdf: Bdf, offset: u16) -> u16 {
        let dword = self.read32(bdf, offset & !0x3);
        (dword >> ((offset & 0x2) * 8)) as u16
    }

    fn read8(&self, bdf: Bdf, offset: u16) -> u8 {
        let dword = self.read32(bdf, offset & !0x3);
        (dword >> ((offset & 0x3) * 8)) as u8
    }

    fn write16(&self, bdf: Bdf, offset: u16, value: u16) {
        let aligned = offset & !0x3;
        let shift = (offset & 0x2) * 8;
        let dword = self.read32(bdf, aligned);
        let dword = (dword & !(0xFFFF << shift)) | ((value as u32) << shift);
        self.write32(bdf, aligned, dword);
    }
}

/// ECAM: `base + (bus << 20) + (dev << 15) + (func << 12) + offset`.
pub struct Ecam {
    base: u64,
}

impl Ecam {
    /// # Safety
    /// `base` must be the device-mapped ECAM window for this segment.
    pub const unsafe fn new(base: u64) -> Self {
        Self { base }
    }

    fn addr(&self, bdf: Bdf, offset: u16) -> *mut u32 {
        (self.base
            + ((bdf.bus as u64) << 20)
            + ((bdf.device as u64) << 15)
            + ((bdf.function as u64) << 12)
            + (offset & !0x3) as u64) as *mut u32
    }
}

impl ConfigSpace for Ecam {
    fn read32(&self, bdf: Bdf, offset: u16) -> u32 {
        unsafe { core::ptr::read_volatile(self.addr(bdf, offset)) }
    }

    fn write32(&self, bdf: Bdf, offset: u16, value: u32) {
        unsafe { core::ptr::write_volatile(self.addr(bdf, offset), value) }
    }
}

/// Legacy port-pair access (CONFIG_ADDRESS 0xCF8 / CONFIG_DATA 0xCFC).
#[cfg(target_arch = "x86_64")]
pub struct PortCam {
    ports: SpinLock<()>,
}

#[cfg(target_arch = "x86_64")]
impl PortCam {
    pub const fn new() -> Self {
        Self {
            ports: SpinLock::new(()),
        }
    }

    fn select(bdf: Bdf, offset: u16) -> u32 {
        (1 << 31)
            | ((bdf.bus as u32) << 16)
            | ((bdf.device as u32) << 11)
            | ((bdf.function as u32) << 8)
            | (offset as u32 & 0xFC)
    }
}

#[cfg(target_arch = "x86_64")]
impl ConfigSpace for PortCam {
    fn read32(&self, bdf: Bdf, offset: u16) -> u32 {
        use x86_64::instructions::port::Port;
        let _guard = self.ports.lock();
        unsafe {
            let mut addr: Port<u32> = Port::new(0xCF8);
            let mut data: Port<u32> = Port::new(0xCFC);
            addr.write(Self::select(bdf, offset));
            data.read()
        }
    }

    fn write32(&self, bdf: Bdf, offset: u16, value: u32) {
        use x86_64::instructions::port::Port;
        let _guard = self.ports.lock();
        unsafe {
            let mut addr: Port<u32> = Port::new(0xCF8);
            let mut data: Port<u32> = Port::new(0xCFC);
            addr.write(Self::select(bdf, offset));
            data.write(value);
        }
    }
}

/// A discovered function.
#[derive(Debug, Clone, Copy)]
pub struct PciDevice {
    pub bdf: Bdf,
    pub vendor_id: u16,
    pub device_id: u16,
    pub class: u8,
    pub subclass: u8,
    pub prog_if: u8,
}

/// Scan bus 0 (single-segment virt machines put everything there).
pub fn scan(cfg: &dyn ConfigSpace) -> heapless::Vec<PciDevice, 32> {
    let mut devices = heapless::Vec::new();
    for device in 0..32u8 {
        for function in 0..8u8 {
            let bdf = Bdf::new(0, device, function);
            let id = cfg.read32(bdf, config::VENDOR_ID);
            let vendor_id = id as u16;
            if vendor_id == 0xFFFF || vendor_id == 0 {
                if function == 0 {
                    break;
                }
                continue;
            }
            let class_rev = cfg.read32(bdf, config::CLASS_REV);
            let found = PciDevice {
                bdf,
                vendor_id,
                device_id: (id >> 16) as u16,
                class: (class_rev >> 24) as u8,
                subclass: (class_rev >> 16) as u8,
                prog_if: (class_rev >> 8) as u8,
            };
            crate::debug!(
                "pci: {:02x}:{:02x}.{} {:04x}:{:04x} class {:02x}.{:02x}",
                bdf.bus,
                bdf.device,
                bdf.function,
                found.vendor_id,
                found.device_id,
                found.class,
                found.subclass
            );
            if devices.push(found).is_err() {
                return devices;
            }
            // Single-function devices only answer on function 0
            if function == 0 && cfg.read8(bdf, (config::HEADER_TYPE + 2) as u16) & 0x80 == 0 {
                break;
            }
        }
    }
    devices
}

/// One capability in the linked list.
#[derive(Debug, Clone, Copy)]
pub struct Capability {
    pub id: u8,
    pub offset: u16,
}

const CAP_WALK_TTL: usize = 48;

/// Walk the capability list. Stops on a zero link, masks pointers to
/// 4-byte alignment, and bounds the walk at 48 entries.
pub fn capabilities(cfg: &dyn ConfigSpace, bdf: Bdf) -> heapless::Vec<Capability, 48> {
    let mut caps = heapless::Vec::new();
    let mut ptr = cfg.read8(bdf, config::CAP_PTR) & 0xFC;
    let mut ttl = CAP_WALK_TTL;

    while ptr != 0 && ttl > 0 {
        let id = cfg.read8(bdf, ptr as u16);
        if caps
            .push(Capability {
                id,
                offset: ptr as u16,
            })
            .is_err()
        {
            break;
        }
        ptr = cfg.read8(bdf, ptr as u16 + 1) & 0xFC;
        ttl -= 1;
    }
    caps
}

/// Decoded base address register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bar {
    Unused,
    Io {
        port: u32,
    },
    Mem32 {
        addr: u32,
        size: u32,
        prefetchable: bool,
    },
    Mem64 {
        addr: u64,
        size: u64,
        prefetchable: bool,
    },
}

const BAR_IO: u32 = 1 << 0;
const BAR_TYPE_64: u32 = 0b10 << 1;
const BAR_PREFETCH: u32 = 1 << 3;

/// Read and size a BAR (all-ones probe, then restore).
pub fn read_bar(cfg: &dyn ConfigSpace, bdf: Bdf, index: u8) -> Bar {
    let offset = config::BAR0 + index as u16 * 4;
    let original = cfg.read32(bdf, offset);

    if original & BAR_IO != 0 {
        return Bar::Io {
            port: original & !0x3,
        };
    }

    cfg.write32(bdf, offset, !0);
    let mask = cfg.read32(bdf, offset);
    cfg.write32(bdf, offset, original);

    if mask == 0 {
        return Bar::Unused;
    }

    let prefetchable = original & BAR_PREFETCH != 0;
    if original & BAR_TYPE_64 == BAR_TYPE_64 {
        let offset_hi = offset + 4;
        let original_hi = cfg.read32(bdf, offset_hi);
        cfg.write32(bdf, offset_hi, !0);
        let mask_hi = cfg.read32(bdf, offset_hi);
        cfg.write32(bdf, offset_hi, original_hi);

        let full_mask = ((mask_hi as u64) << 32) | (mask & !0xF) as u64;
        let size = (!full_mask).wrapping_add(1);
        Bar::Mem64 {
            addr: ((original_hi as u64) << 32) | (original & !0xF) as u64,
            size,
            prefetchable,
        }
    } else {
        let size = (!(mask & !0xF)).wrapping_add(1);
        Bar::Mem32 {
            addr: original & !0xF,
            size,
            prefetchable,
        }
    }
}

/// Bump allocator over the reserved high MMIO window used for BARs the
/// firmware never programmed.
pub struct MmioWindow {
    next: u64,
    end: u64,
}

impl MmioWindow {
    pub const fn new(base: u64, size: u64) -> Self {
        Self {
            next: base,
            end: base + size,
        }
    }

    /// Naturally aligned allocation (BAR decode requires it).
    pub fn alloc(&mut self, size: u64) -> DriverResult<u64> {
        let size = size.max(0x1000).next_power_of_two();
        let addr = (self.next + size - 1) & !(size - 1);
        if addr + size > self.end {
            return Err(DriverError::OutOfMemory);
        }
        self.next = addr + size;
        Ok(addr)
    }
}

/// Default assignment window: the 2 GiB..3 GiB PCI hole, clear of RAM on
/// both targets and reachable by 32-bit BARs.
pub static MMIO_WINDOW: SpinLock<MmioWindow> =
    SpinLock::new(MmioWindow::new(0x8000_0000, 0x4000_0000));

/// Ensure a BAR decodes somewhere: keep the firmware assignment when
/// present, otherwise size it and assign from the reserved window.
pub fn assign_bar(cfg: &dyn ConfigSpace, bdf: Bdf, index: u8) -> DriverResult<u64> {
    let offset = config::BAR0 + index as u16 * 4;
    match read_bar(cfg, bdf, index) {
        Bar::Unused => Err(DriverError::DeviceNotFound),
        Bar::Io { .. } => Err(DriverError::NotSupported),
        Bar::Mem32 { addr, size, .. } => {
            if addr != 0 {
                return Ok(addr as u64);
            }
            let assigned = MMIO_WINDOW.lock().alloc(size as u64)?;
            if assigned > u32::MAX as u64 {
                return Err(DriverError::OutOfMemory);
            }
            cfg.write32(bdf, offset, assigned as u32);
            crate::info!("pci: assigned bar{} of {:?} at {:#x}", index, bdf, assigned);
            Ok(assigned)
        }
        Bar::Mem64 { addr, size, .. } => {
            if addr != 0 {
                return Ok(addr);
            }
            let assigned = MMIO_WINDOW.lock().alloc(size)?;
            cfg.write32(bdf, offset, assigned as u32);
            cfg.write32(bdf, offset + 4, (assigned >> 32) as u32);
            crate::info!("pci: assigned bar{} of {:?} at {:#x}", index, bdf, assigned);
            Ok(assigned)
        }
    }
}

/// Enable memory decode and DMA for a function.
pub fn enable_bus_mastering(cfg: &dyn ConfigSpace, bdf: Bdf) {
    let command = cfg.read16(bdf, config::COMMAND);
    cfg.write16(
        bdf,
        config::COMMAND,
        command | config::COMMAND_MEMORY | config::COMMAND_BUS_MASTER,
    );
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Scripted single-device config space: 64 dwords plus BAR size
    /// masks that emulate hardware address-bit masking.
    pub struct MockCfg {
        regs: Mutex<[u32; 64]>,
        bar_sizes: [u64; 6],
        bar_64bit: [bool; 6],
    }

    impl MockCfg {
        pub fn new() -> Self {
            let mut regs = [0u32; 64];
            regs[0] = 0x1050_1AF4; // virtio vendor/device
            regs[2] = 0x0300_0000; // display class
            Self {
                regs: Mutex::new(regs),
                bar_sizes: [0; 6],
                bar_64bit: [false; 6],
            }
        }

        pub fn with_bar(mut self, index: usize, size: u64, is_64: bool) -> Self {
            self.bar_sizes[index] = size;
            self.bar_64bit[index] = is_64;
            {
                let mut regs = self.regs.lock().unwrap();
                regs[4 + index] = if is_64 { 0b100 } else { 0 };
            }
            self
        }

        pub fn set_cap_chain(&self, entries: &[(u8, u8, u8)]) {
            // entries: (offset, cap id, next)
            let mut regs = self.regs.lock().unwrap();
            regs[config::CAP_PTR as usize / 4] = entries.first().map_or(0, |e| e.0 as u32);
            for &(offset, id, next) in entries {
                regs[offset as usize / 4] = (id as u32) | ((next as u32) << 8);
            }
        }

        fn bar_index(offset: u16) -> Option<usize> {
            if (config::BAR0..config::BAR0 + 24).contains(&offset) {
                Some(((offset - config::BAR0) / 4) as usize)
            } else {
                None
            }
        }
    }

    impl ConfigSpace for MockCfg {
        fn read32(&self, _bdf: Bdf, offset: u16) -> u32 {
            self.regs.lock().unwrap()[(offset / 4) as usize]
        }

        fn write32(&self, _bdf: Bdf, offset: u16, value: u32) {
            let mut regs = self.regs.lock().unwrap();
            if let Some(bar) = Self::bar_index(offset) {
                // Model hardware masking of address bits below the size
                if self.bar_sizes[bar] > 0 {
                    let mask_low = !(self.bar_sizes[bar] - 1) as u32;
                    let type_bits = regs[4 + bar] & 0xF;
                    regs[(offset / 4) as usize] = (value & mask_low & !0xF) | type_bits;
                    return;
                }
                if bar > 0 && self.bar_64bit[bar - 1] && self.bar_sizes[bar - 1] > 0 {
                    let mask_high = (!(self.bar_sizes[bar - 1] - 1) >> 32) as u32;
                    regs[(offset / 4) as usize] = value & mask_high;
                    return;
                }
                // Unimplemented BAR: reads as zero no matter what
                regs[(offset / 4) as usize] = 0;
                return;
            }
            regs[(offset / 4) as usize] = value;
        }
    }

    #[test]
    fn capability_walk_is_bounded_and_aligned() {
        let cfg = MockCfg::new();
        // Self-loop: 0x40 -> 0x41 (masked to 0x40) would spin forever
        // without the TTL
        cfg.set_cap_chain(&[(0x40, 0x09, 0x41)]);
        let caps = capabilities(&cfg, Bdf::new(0, 0, 0));
        assert!(caps.len() <= 48, "TTL bounds the walk");
        assert!(caps.iter().all(|c| c.offset % 4 == 0));
    }

    #[test]
    fn capability_walk_stops_on_zero() {
        let cfg = MockCfg::new();
        cfg.set_cap_chain(&[(0x40, 0x09, 0x50), (0x50, 0x11, 0x00)]);
        let caps = capabilities(&cfg, Bdf::new(0, 0, 0));
        assert_eq!(caps.len(), 2);
        assert_eq!(caps[0].id, 0x09);
        assert_eq!(caps[1].id, 0x11);
    }

    #[test]
    fn unprogrammed_bar_is_sized_and_assigned() {
        let cfg = MockCfg::new().with_bar(0, 0x4000, false);
        let bdf = Bdf::new(0, 0, 0);

        match read_bar(&cfg, bdf, 0) {
            Bar::Mem32 { addr, size, .. } => {
                assert_eq!(addr, 0);
                assert_eq!(size, 0x4000);
            }
            other => panic!("expected Mem32, got {:?}", other),
        }

        let assigned = assign_bar(&cfg, bdf, 0).unwrap();
        assert_ne!(assigned, 0);
        assert_eq!(assigned % 0x4000, 0, "naturally aligned");
        // The device now decodes at the assigned address
        match read_bar(&cfg, bdf, 0) {
            Bar::Mem32 { addr, .. } => assert_eq!(addr as u64, assigned),
            other => panic!("expected Mem32, got {:?}", other),
        }
    }

    #[test]
    fn mmio_window_allocates_aligned_and_bounded() {
        let mut window = MmioWindow::new(0x1000_0000, 0x10_0000);
        let a = window.alloc(0x3000).unwrap();
        assert_eq!(a % 0x4000, 0, "rounded to a power of two and aligned");
        let b = window.alloc(0x1000).unwrap();
        assert_ne!(a, b);
        assert!(window.alloc(0x100_0000).is_err(), "window exhausted");
    }
}
