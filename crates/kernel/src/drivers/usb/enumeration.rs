//! USB device enumeration: standard requests and descriptor parsing.
//!
//! The controller side (slot allocation, address assignment, endpoint
//! configuration) lives in `xhci`; this module knows the wire formats —
//! setup packets, device/configuration descriptors — and how to find
//! the interrupt-IN endpoint of a boot-protocol keyboard.

use crate::drivers::{DriverError, DriverResult};

// Standard request codes
pub const REQ_GET_DESCRIPTOR: u8 = 6;
pub const REQ_SET_CONFIGURATION: u8 = 9;

// Descriptor types
pub const DESC_DEVICE: u8 = 1;
pub const DESC_CONFIGURATION: u8 = 2;
pub const DESC_INTERFACE: u8 = 4;
pub const DESC_ENDPOINT: u8 = 5;

// Class codes
pub const CLASS_HID: u8 = 3;
pub const SUBCLASS_BOOT: u8 = 1;
pub const PROTOCOL_KEYBOARD: u8 = 1;

/// 8-byte SETUP packet.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
pub struct SetupPacket {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl SetupPacket {
    pub fn get_descriptor(desc_type: u8, desc_index: u8, length: u16) -> Self {
        Self {
            request_type: 0x80, // device-to-host, standard, device
            request: REQ_GET_DESCRIPTOR,
            value: ((desc_type as u16) << 8) | desc_index as u16,
            index: 0,
            length,
        }
    }

    pub fn set_configuration(config: u8) -> Self {
        Self {
            request_type: 0x00,
            request: REQ_SET_CONFIGURATION,
            value: config as u16,
            index: 0,
            length: 0,
        }
    }

    /// The packet as immediate data for a Setup Stage TRB.
    pub fn as_u64(&self) -> u64 {
        u64::from_le_bytes(unsafe { core::mem::transmute::<SetupPacket, [u8; 8]>(*self) })
    }

    pub fn has_data_stage(&self) -> bool {
        self.length > 0
    }

    pub fn device_to_host(&self) -> bool {
        self.request_type & 0x80 != 0
    }
}

/// Fields of the 18-byte device descriptor the driver consumes.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeviceDescriptor {
    pub usb_release: u16,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    pub max_packet_size0: u16,
    pub vendor_id: u16,
    pub product_id: u16,
    pub num_configurations: u8,
}

impl DeviceDescriptor {
    pub fn parse(data: &[u8]) -> DriverResult<Self> {
        if data.len() < 18 || data[1] != DESC_DEVICE {
            return Err(DriverError::Protocol);
        }
        let bcd_usb = u16::from_le_bytes([data[2], data[3]]);
        // USB3 encodes bMaxPacketSize0 as a power of two
        let mps = if bcd_usb >= 0x0300 {
            1u16 << data[7].min(15)
        } else {
            data[7] as u16
        };
        Ok(Self {
            usb_release: bcd_usb,
            class: data[4],
            subclass: data[5],
            protocol: data[6],
            max_packet_size0: mps,
            vendor_id: u16::from_le_bytes([data[8], data[9]]),
            product_id: u16::from_le_bytes([data[10], data[11]]),
            num_configurations: data[17],
        })
    }
}

/// An endpoint pulled out of a configuration descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointInfo {
    pub address: u8,
    pub attributes: u8,
    pub max_packet_size: u16,
    pub interval: u8,
}

impl EndpointInfo {
    pub fn is_in(&self) -> bool {
        self.address & 0x80 != 0
    }

    pub fn is_interrupt(&self) -> bool {
        self.attributes & 0x3 == 0x3
    }

    pub fn number(&self) -> u8 {
        self.address & 0xF
    }

    /// Device context index: endpoints interleave OUT/IN above the
    /// control endpoint at DCI 1.
    pub fn dci(&self) -> u8 {
        self.number() * 2 + self.is_in() as u8
    }
}

#[derive(Debug, Clone, Copy)]
pub struct InterfaceInfo {
    pub number: u8,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
}

/// Parsed configuration: its value plus the keyboard endpoint, if one
/// exists.
#[derive(Debug, Clone)]
pub struct ConfigurationInfo {
    pub value: u8,
    pub interfaces: alloc::vec::Vec<InterfaceInfo>,
    pub keyboard_endpoint: Option<EndpointInfo>,
}

/// Walk a full configuration descriptor (header plus interface/endpoint
/// descriptors) and locate the first interrupt-IN endpoint belonging to
/// a boot-protocol HID keyboard interface.
pub fn parse_configuration(data: &[u8]) -> DriverResult<ConfigurationInfo> {
    if data.len() < 9 || data[1] != DESC_CONFIGURATION {
        return Err(DriverError::Protocol);
    }
    let total_len = u16::from_le_bytes([data[2], data[3]]) as usize;
    let data = &data[..total_len.min(data.len())];

    let mut info = ConfigurationInfo {
        value: data[5],
        interfaces: alloc::vec::Vec::new(),
        keyboard_endpoint: None,
    };

    let mut in_keyboard_interface = false;
    let mut offset = data[0] as usize;
    while offset + 2 <= data.len() {
        let len = data[offset] as usize;
        if len < 2 || offset + len > data.len() {
            break;
        }
        let desc_type = data[offset + 1];
        match desc_type {
            DESC_INTERFACE if len >= 9 => {
                let iface = InterfaceInfo {
                    number: data[offset + 2],
                    class: data[offset + 5],
                    subclass: data[offset + 6],
                    protocol: data[offset + 7],
                };
                in_keyboard_interface = iface.class == CLASS_HID
                    && iface.subclass == SUBCLASS_BOOT
                    && iface.protocol == PROTOCOL_KEYBOARD;
                info.interfaces.push(iface);
            }
            DESC_ENDPOINT if len >= 7 => {
                let endpoint = EndpointInfo {
                    address: data[offset + 2],
                    attributes: data[offset + 3],
                    max_packet_size: u16::from_le_bytes([data[offset + 4], data[offset + 5]]),
                    interval: data[offset + 6],
                };
                if in_keyboard_interface
                    && info.keyboard_endpoint.is_none()
                    && endpoint.is_in()
                    && endpoint.is_interrupt()
                {
                    info.keyboard_endpoint = Some(endpoint);
                }
            }
            _ => {}
        }
        offset += len;
    }

    Ok(info)
}
