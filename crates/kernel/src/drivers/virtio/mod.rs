//! VirtIO transport layer.
//!
//! Implements the VirtIO 1.0+ PCI transport: vendor-capability walk to
//! locate the four config regions (common, notify, interrupt status,
//! device specific), BAR mapping, and the status handshake. Device
//! drivers talk to a transport trait so the same driver runs over any
//! transport.

pub mod gpu;
pub mod queue;

use super::pci::{self, Bdf, ConfigSpace};
use super::{poll_until, DriverError, DriverResult};
use crate::mm::{phys_to_ptr, PhysAddr};
use core::ptr::{read_volatile, write_volatile};

/// Device status bits, written in handshake order.
pub mod status {
    pub const ACKNOWLEDGE: u8 = 1;
    pub const DRIVER: u8 = 2;
    pub const DRIVER_OK: u8 = 4;
    pub const FEATURES_OK: u8 = 8;
    pub const DEVICE_NEEDS_RESET: u8 = 64;
    pub const FAILED: u8 = 128;
}

/// Virtio-over-PCI vendor capability config types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CapCfgType {
    Common = 1,
    Notify = 2,
    Isr = 3,
    Device = 4,
    Pci = 5,
}

const PCI_CAP_ID_VENDOR: u8 = 0x09;

/// Transport operations every virtio driver needs.
pub trait VirtioTransport: Send {
    fn read_status(&self) -> u8;
    fn write_status(&self, status: u8);
    fn read_device_features(&self) -> u64;
    fn write_driver_features(&self, features: u64);
    fn max_queue_size(&self, queue: u16) -> u16;
    /// Program ring addresses and size for `queue`.
    fn setup_queue(&self, queue: u16, size: u16, desc: PhysAddr, avail: PhysAddr, used: PhysAddr);
    fn enable_queue(&self, queue: u16);
    fn queue_enabled(&self, queue: u16) -> bool;
    /// Ring the notification doorbell for `queue`.
    fn notify(&self, queue: u16);
    fn read_device_config_u32(&self, offset: usize) -> u32;
    fn write_device_config_u32(&self, offset: usize, value: u32);
}

/// Run the initialization handshake through FEATURES_OK:
/// RESET -> ACKNOWLEDGE -> DRIVER -> feature negotiation -> FEATURES_OK
/// (re-read to confirm). DRIVER_OK is the driver's to set after queue
/// setup. Failure to confirm FEATURES_OK is terminal for the device.
pub fn negotiate(transport: &dyn VirtioTransport, wanted: u64) -> DriverResult<u64> {
    transport.write_status(0);
    poll_until(1000, || transport.read_status() == 0)?;

    transport.write_status(status::ACKNOWLEDGE);
    transport.write_status(status::ACKNOWLEDGE | status::DRIVER);

    let offered = transport.read_device_features();
    let accepted = offered & wanted;
    transport.write_driver_features(accepted);

    transport.write_status(status::ACKNOWLEDGE | status::DRIVER | status::FEATURES_OK);
    if transport.read_status() & status::FEATURES_OK == 0 {
        transport.write_status(status::FAILED);
        return Err(DriverError::Protocol);
    }

    Ok(accepted)
}

/// Common configuration layout inside the Common capability region.
#[repr(C)]
pub struct CommonCfg {
    pub device_feature_select: u32,
    pub device_feature: u32,
    pub driver_feature_select: u32,
    pub driver_feature: u32,
    pub msix_config: u16,
    pub num_queues: u16,
    pub device_status: u8,
    pub config_generation: u8,
    pub queue_select: u16,
    pub queue_size: u16,
    pub queue_msix_vector: u16,
    pub queue_enable: u16,
    pub queue_notify_off: u16,
    pub queue_desc: u64,
    pub queue_avail: u64,
    pub queue_used: u64,
}

/// PCI transport state: pointers into the mapped BAR regions.
pub struct VirtioPciTransport {
    common: *mut CommonCfg,
    notify_base: *mut u8,
    notify_off_multiplier: u32,
    #[allow(dead_code)]
    isr: *const u8,
    device_cfg: *mut u8,
    device_cfg_len: usize,
}

unsafe impl Send for VirtioPciTransport {}

impl VirtioPciTransport {
    /// Locate the virtio config regions through the capability chain and
    /// resolve them to kernel pointers. BARs left unprogrammed by
    /// firmware are assigned from the reserved window first.
    pub fn new(cfg: &dyn ConfigSpace, bdf: Bdf) -> DriverResult<Self> {
        let mut common = None;
        let mut notify = None;
        let mut notify_mult = 0u32;
        let mut isr = None;
        let mut device = None;
        let mut device_len = 0usize;

        for cap in pci::capabilities(cfg, bdf).iter() {
            if cap.id != PCI_CAP_ID_VENDOR {
                continue;
            }
            let cfg_type = cfg.read8(bdf, cap.offset + 3);
            let bar = cfg.read8(bdf, cap.offset + 4);
            let offset = cfg.read32(bdf, cap.offset + 8) as u64;
            let length = cfg.read32(bdf, cap.offset + 12) as usize;
            if bar >= 6 {
                continue;
            }

            let bar_base = pci::assign_bar(cfg, bdf, bar)?;
            let region = bar_base + offset;

            match cfg_type {
                t if t == CapCfgType::Common as u8 => common = Some(region),
                t if t == CapCfgType::Notify as u8 => {
                    notify = Some(region);
                    notify_mult = cfg.read32(bdf, cap.offset + 16);
                }
                t if t == CapCfgType::Isr as u8 => isr = Some(region),
                t if t == CapCfgType::Device as u8 => {
                    device = Some(region);
                    device_len = length;
                }
                _ => {}
            }
        }

        let common = common.ok_or(DriverError::Protocol)?;
        pci::enable_bus_mastering(cfg, bdf);

        Ok(Self {
            common: phys_to_ptr(common) as *mut CommonCfg,
            notify_base: notify.map(|pa| phys_to_ptr(pa)).unwrap_or(core::ptr::null_mut()),
            notify_off_multiplier: notify_mult,
            isr: isr.map(|pa| phys_to_ptr(pa) as *const u8).unwrap_or(core::ptr::null()),
            device_cfg: device.map(|pa| phys_to_ptr(pa)).unwrap_or(core::ptr::null_mut()),
            device_cfg_len: device_len,
        })
    }

    fn select_queue(&self, queue: u16) {
        unsafe { write_volatile(&mut (*self.common).queue_select, queue) }
    }
}

impl VirtioTransport for VirtioPciTransport {
    fn read_status(&self) -> u8 {
        unsafe { read_volatile(&(*self.common).device_status) }
    }

    fn write_status(&self, status: u8) {
        unsafe { write_volatile(&mut (*self.common).device_status, status) }
    }

    fn read_device_features(&self) -> u64 {
        unsafe {
            write_volatile(&mut (*self.common).device_feature_select, 0);
            let low = read_volatile(&(*self.common).device_feature) as u64;
            write_volatile(&mut (*self.common).device_feature_select, 1);
            let high = read_volatile(&(*self.common).device_feature) as u64;
            (high << 32) | low
        }
    }

    fn write_driver_features(&self, features: u64) {
        unsafe {
            write_volatile(&mut (*self.common).driver_feature_select, 0);
            write_volatile(&mut (*self.common).driver_feature, features as u32);
            write_volatile(&mut (*self.common).driver_feature_select, 1);
            write_volatile(&mut (*self.common).driver_feature, (features >> 32) as u32);
        }
    }

    fn max_queue_size(&self, queue: u16) -> u16 {
        self.select_queue(queue);
        unsafe { read_volatile(&(*self.common).queue_size) }
    }

    fn setup_queue(&self, queue: u16, size: u16, desc: PhysAddr, avail: PhysAddr, used: PhysAddr) {
        self.select_queue(queue);
        unsafe {
            write_volatile(&mut (*self.common).queue_size, size);
            write_volatile(&mut (*self.common).queue_desc, desc);
            write_volatile(&mut (*self.common).queue_avail, avail);
            write_volatile(&mut (*self.common).queue_used, used);
        }
    }

    fn enable_queue(&self, queue: u16) {
        self.select_queue(queue);
        unsafe { write_volatile(&mut (*self.common).queue_enable, 1) }
    }

    fn queue_enabled(&self, queue: u16) -> bool {
        self.select_queue(queue);
        unsafe { read_volatile(&(*self.common).queue_enable) != 0 }
    }

    fn notify(&self, queue: u16) {
        if self.notify_base.is_null() {
            return;
        }
        self.select_queue(queue);
        unsafe {
            let notify_off = read_volatile(&(*self.common).queue_notify_off) as u64;
            let doorbell = self
                .notify_base
                .add((notify_off * self.notify_off_multiplier as u64) as usize)
                as *mut u16;
            write_volatile(doorbell, queue);
        }
    }

    fn read_device_config_u32(&self, offset: usize) -> u32 {
        if self.device_cfg.is_null() || offset + 4 > self.device_cfg_len {
            return 0;
        }
        unsafe { read_volatile(self.device_cfg.add(offset) as *const u32) }
    }

    fn write_device_config_u32(&self, offset: usize, value: u32) {
        if self.device_cfg.is_null() || offset + 4 > self.device_cfg_len {
            return;
        }
        unsafe { write_volatile(self.device_cfg.add(offset) as *mut u32, value) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    /// Minimal transport model driven purely by the handshake tests.
    struct ModelTransport {
        status: Cell<u8>,
        features: u64,
        driver_features: Cell<u64>,
        /// Device rejects the negotiated feature set
        reject_features: bool,
    }

    unsafe impl Send for ModelTransport {}

    impl ModelTransport {
        fn new(features: u64, reject: bool) -> Self {
            Self {
                status: Cell::new(0),
                features,
                driver_features: Cell::new(0),
                reject_features: reject,
            }
        }
    }

    impl VirtioTransport for ModelTransport {
        fn read_status(&self) -> u8 {
            let s = self.status.get();
            if self.reject_features {
                s & !status::FEATURES_OK
            } else {
                s
            }
        }
        fn write_status(&self, s: u8) {
            self.status.set(s);
        }
        fn read_device_features(&self) -> u64 {
            self.features
        }
        fn write_driver_features(&self, f: u64) {
            self.driver_features.set(f);
        }
        fn max_queue_size(&self, _q: u16) -> u16 {
            64
        }
        fn setup_queue(&self, _q: u16, _s: u16, _d: u64, _a: u64, _u: u64) {}
        fn enable_queue(&self, _q: u16) {}
        fn queue_enabled(&self, _q: u16) -> bool {
            false
        }
        fn notify(&self, _q: u16) {}
        fn read_device_config_u32(&self, _o: usize) -> u32 {
            0
        }
        fn write_device_config_u32(&self, _o: usize, _v: u32) {}
    }

    #[test]
    fn handshake_masks_features_and_confirms() {
        let device = ModelTransport::new(0b1011, false);
        let accepted = negotiate(&device, 0b0011).unwrap();
        assert_eq!(accepted, 0b0011, "only wanted features survive");
        assert_eq!(device.driver_features.get(), 0b0011);
        assert_eq!(
            device.status.get(),
            status::ACKNOWLEDGE | status::DRIVER | status::FEATURES_OK
        );
    }

    #[test]
    fn unconfirmed_features_ok_is_terminal() {
        let device = ModelTransport::new(0b1, true);
        assert_eq!(negotiate(&device, 0b1), Err(DriverError::Protocol));
        assert!(device.status.get() & status::FAILED != 0, "device marked failed");
    }
}
