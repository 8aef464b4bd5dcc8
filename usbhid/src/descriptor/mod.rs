//! Describes the descriptor tree of a USB device, as reported by a backend,
//! and the HID class descriptors retrieved from an attached interface.
//!
//! The tree is `device → configurations → interfaces → alternate settings →
//! endpoints`. Every level is identified by the number it carries on the
//! wire, which is not necessarily its position in the enclosing list.

use std::{collections::HashMap, fmt, time::Duration};

use num_enum::{IntoPrimitive, TryFromPrimitive};

mod hid;
mod report;

pub use hid::*;
pub use report::*;

/// The USB class code of HID interfaces.
pub const HID_CLASS: u8 = 0x03;

/// The negotiated bus speed of a device.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
pub enum Speed {
    #[default]
    Unknown,
    Low,
    Full,
    High,
    Super,
    SuperPlus,
}

impl fmt::Display for Speed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Speed::Unknown => "unknown",
            Speed::Low => "low",
            Speed::Full => "full",
            Speed::High => "high",
            Speed::Super => "super",
            Speed::SuperPlus => "super+",
        })
    }
}

/// The direction of an endpoint, seen from the host.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Direction {
    In,
    Out,
}

impl Direction {
    /// Extracts the direction from bit 7 of an endpoint address.
    pub fn from_address(address: u8) -> Self {
        if address & 0x80 != 0 {
            Direction::In
        } else {
            Direction::Out
        }
    }
}

/// The transfer type of an endpoint. HID interfaces only use control and
/// interrupt endpoints.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum TransferType {
    Control = 0,
    Isochronous = 1,
    Bulk = 2,
    Interrupt = 3,
}

/// The subclass of a HID interface.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum HidSubclass {
    None = 0,

    /// The interface supports the boot protocol.
    BootInterface = 1,
}

/// The boot protocol of a HID interface.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum HidProtocol {
    None = 0,
    Keyboard = 1,
    Mouse = 2,
}

/// Describes a single endpoint of an alternate setting.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct EndpointDescriptor {
    /// The endpoint address.
    ///
    /// Bits 0..3 carry the endpoint number, bit 7 the direction (set for IN).
    pub address: u8,

    /// The endpoint number, i.e. the address without its direction bit.
    pub number: u8,

    /// The direction derived from the address.
    pub direction: Direction,

    /// The largest packet this endpoint sends or receives.
    pub max_packet_size: u16,

    /// The transfer type.
    pub transfer_type: TransferType,

    /// The polling interval for interrupt endpoints.
    pub poll_interval: Duration,
}

impl EndpointDescriptor {
    /// Creates the descriptor of an interrupt endpoint from its address.
    pub fn interrupt(address: u8, max_packet_size: u16, poll_interval: Duration) -> Self {
        Self {
            address,
            number: address & 0x0f,
            direction: Direction::from_address(address),
            max_packet_size,
            transfer_type: TransferType::Interrupt,
            poll_interval,
        }
    }
}

/// Describes one alternate setting of an interface.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct AltSetting {
    /// The number of the interface this setting belongs to.
    pub number: u8,

    /// The alternate setting number.
    pub alternate: u8,

    pub class: u8,
    pub sub_class: u8,
    pub protocol: u8,

    /// The endpoints of this setting, keyed by endpoint address.
    ///
    /// The iteration order of this map is unspecified.
    pub endpoints: HashMap<u8, EndpointDescriptor>,
}

impl AltSetting {
    /// Whether this setting belongs to the HID class.
    pub fn is_hid(&self) -> bool {
        self.class == HID_CLASS
    }

    /// Looks up an endpoint by its number and direction.
    pub fn endpoint(&self, number: u8, direction: Direction) -> Option<&EndpointDescriptor> {
        self.endpoints
            .values()
            .find(|ep| ep.number == number && ep.direction == direction)
    }
}

/// Describes an interface and all of its alternate settings.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct InterfaceDescriptor {
    pub number: u8,
    pub alt_settings: Vec<AltSetting>,
}

/// Describes a configuration.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct ConfigDescriptor {
    /// The value passed to `SET_CONFIGURATION` to select this configuration.
    pub number: u8,

    pub self_powered: bool,
    pub remote_wakeup: bool,

    /// The maximum power consumption in milliamperes.
    pub max_power: u16,

    pub interfaces: Vec<InterfaceDescriptor>,
}

/// Describes a connected device and its complete descriptor tree.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct DeviceDescriptor {
    pub bus: u8,
    pub address: u8,
    pub speed: Speed,

    /// The USB specification release in BCD (e.g. `0x0200`).
    pub usb_version: u16,

    /// The device release in BCD.
    pub device_version: u16,

    pub vendor_id: u16,
    pub product_id: u16,

    pub class: u8,
    pub sub_class: u8,
    pub protocol: u8,

    /// The max packet size of the default control endpoint.
    pub max_control_packet_size: u8,

    pub configs: Vec<ConfigDescriptor>,
}

impl DeviceDescriptor {
    /// Iterates over every HID alternate setting of the device, together with
    /// the numbers of the configuration and interface it belongs to.
    pub fn hid_settings(&self) -> impl Iterator<Item = (u8, u8, &AltSetting)> {
        self.configs.iter().flat_map(|config| {
            config.interfaces.iter().flat_map(move |intf| {
                intf.alt_settings
                    .iter()
                    .filter(|setting| setting.is_hid())
                    .map(move |setting| (config.number, intf.number, setting))
            })
        })
    }
}
