//! USB host support: the xHCI controller and device enumeration.

pub mod enumeration;
pub mod xhci;

/// Port/device speed as reported in PORTSC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceSpeed {
    Low,
    Full,
    High,
    Super,
    SuperPlus,
}

impl DeviceSpeed {
    pub fn from_portsc(speed_id: u8) -> Self {
        match speed_id {
            2 => DeviceSpeed::Low,
            3 => DeviceSpeed::High,
            4 => DeviceSpeed::Super,
            5 => DeviceSpeed::SuperPlus,
            _ => DeviceSpeed::Full,
        }
    }

    /// Default control-endpoint max packet size before the device
    /// descriptor is read.
    pub fn default_max_packet(&self) -> u16 {
        match self {
            DeviceSpeed::Low => 8,
            DeviceSpeed::Full | DeviceSpeed::High => 64,
            DeviceSpeed::Super | DeviceSpeed::SuperPlus => 512,
        }
    }
}

/// An enumerated USB device.
#[derive(Debug, Clone)]
pub struct UsbDevice {
    pub slot_id: u8,
    pub port: u8,
    pub speed: DeviceSpeed,
    pub vendor_id: u16,
    pub product_id: u16,
    pub class: u8,
    /// Interrupt-IN endpoint of the first HID keyboard interface, if any
    pub keyboard_endpoint: Option<enumeration::EndpointInfo>,
}
