//! Encodes the USB setup packets used to talk to HID interfaces over the
//! default control endpoint.
//!
//! Every request in this module is addressed to an interface. The USB-IF HID
//! class specification defines six class requests (`GET_REPORT`,
//! `SET_REPORT`, `GET_IDLE`, `SET_IDLE`, `GET_PROTOCOL` and `SET_PROTOCOL`);
//! HID class descriptors are fetched using the standard `GET_DESCRIPTOR`
//! request with an interface recipient.

use num_enum::{IntoPrimitive, TryFromPrimitive};

/// The standard `GET_DESCRIPTOR` request code.
pub const GET_DESCRIPTOR: u8 = 0x06;

/// Bit fields of the `bmRequestType` byte.
pub mod request_type {
    pub const DIR_OUT: u8 = 0 << 7;
    pub const DIR_IN: u8 = 1 << 7;

    pub const TYPE_STANDARD: u8 = 0 << 5;
    pub const TYPE_CLASS: u8 = 1 << 5;
    pub const TYPE_VENDOR: u8 = 2 << 5;

    pub const RECIPIENT_DEVICE: u8 = 0;
    pub const RECIPIENT_INTERFACE: u8 = 1;
    pub const RECIPIENT_ENDPOINT: u8 = 2;
    pub const RECIPIENT_OTHER: u8 = 3;
}

/// The class-specific requests defined for HID interfaces.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum HidRequest {
    GetReport = 0x01,
    GetIdle = 0x02,
    GetProtocol = 0x03,
    SetReport = 0x09,
    SetIdle = 0x0a,
    SetProtocol = 0x0b,
}

/// The type of a report, as encoded in the high byte of `wValue` for
/// `GET_REPORT` and `SET_REPORT`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum ReportType {
    /// Reports sent from the device to the host.
    Input = 0x01,

    /// Reports sent from the host to the device.
    Output = 0x02,

    /// Bidirectional configuration reports.
    Feature = 0x03,
}

/// The HID class descriptor types.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum DescriptorType {
    Hid = 0x21,
    Report = 0x22,
    Physical = 0x23,
}

/// The protocol a boot-capable interface is operating in.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Protocol {
    Boot = 0x00,
    Report = 0x01,
}

/// The four setup fields of a control transfer. The `wLength` field is
/// implied by the length of the buffer handed to the backend.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ControlSetup {
    /// `bmRequestType`: direction, type and recipient.
    pub request_type: u8,

    /// `bRequest`.
    pub request: u8,

    /// `wValue`.
    pub value: u16,

    /// `wIndex`.
    pub index: u16,
}

fn w_value(hi: u8, lo: u8) -> u16 {
    (u16::from(hi) << 8) | u16::from(lo)
}

impl ControlSetup {
    /// Builds a `SET_REPORT` request for the given report.
    pub fn set_report(report_type: ReportType, report_id: u8, interface: u8) -> Self {
        use request_type::*;

        Self {
            request_type: DIR_OUT | TYPE_CLASS | RECIPIENT_INTERFACE,
            request: HidRequest::SetReport.into(),
            value: w_value(report_type.into(), report_id),
            index: interface.into(),
        }
    }

    /// Builds a `GET_REPORT` request for the given report.
    pub fn get_report(report_type: ReportType, report_id: u8, interface: u8) -> Self {
        use request_type::*;

        Self {
            request_type: DIR_IN | TYPE_CLASS | RECIPIENT_INTERFACE,
            request: HidRequest::GetReport.into(),
            value: w_value(report_type.into(), report_id),
            index: interface.into(),
        }
    }

    /// Builds a standard `GET_DESCRIPTOR` request for a HID class
    /// descriptor.
    ///
    /// The descriptor index is zero for everything but physical
    /// descriptors.
    pub fn get_descriptor(descriptor_type: DescriptorType, index: u8, interface: u8) -> Self {
        use request_type::*;

        Self {
            request_type: DIR_IN | TYPE_STANDARD | RECIPIENT_INTERFACE,
            request: GET_DESCRIPTOR,
            value: w_value(descriptor_type.into(), index),
            index: interface.into(),
        }
    }

    /// Builds a `GET_IDLE` request. The device answers with a single byte.
    pub fn get_idle(report_id: u8, interface: u8) -> Self {
        use request_type::*;

        Self {
            request_type: DIR_IN | TYPE_CLASS | RECIPIENT_INTERFACE,
            request: HidRequest::GetIdle.into(),
            value: w_value(0, report_id),
            index: interface.into(),
        }
    }

    /// Builds a `SET_IDLE` request.
    ///
    /// `duration` is expressed in units of 4 ms, `0` meaning the device only
    /// reports on change.
    pub fn set_idle(duration: u8, report_id: u8, interface: u8) -> Self {
        use request_type::*;

        Self {
            request_type: DIR_OUT | TYPE_CLASS | RECIPIENT_INTERFACE,
            request: HidRequest::SetIdle.into(),
            value: w_value(duration, report_id),
            index: interface.into(),
        }
    }

    /// Builds a `GET_PROTOCOL` request. The device answers with a single
    /// byte.
    pub fn get_protocol(interface: u8) -> Self {
        use request_type::*;

        Self {
            request_type: DIR_IN | TYPE_CLASS | RECIPIENT_INTERFACE,
            request: HidRequest::GetProtocol.into(),
            value: 0,
            index: interface.into(),
        }
    }

    /// Builds a `SET_PROTOCOL` request.
    pub fn set_protocol(protocol: Protocol, interface: u8) -> Self {
        use request_type::*;

        Self {
            request_type: DIR_OUT | TYPE_CLASS | RECIPIENT_INTERFACE,
            request: HidRequest::SetProtocol.into(),
            value: u8::from(protocol).into(),
            index: interface.into(),
        }
    }

    /// Whether data flows from the device to the host.
    pub fn is_in(&self) -> bool {
        self.request_type & request_type::DIR_IN != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_requests() {
        let setup = ControlSetup::set_report(ReportType::Feature, 0x05, 3);
        assert_eq!(setup.request_type, 0x21);
        assert_eq!(setup.request, 0x09);
        assert_eq!(setup.value, 0x0305);
        assert_eq!(setup.index, 3);
        assert!(!setup.is_in());

        let setup = ControlSetup::get_report(ReportType::Feature, 0x01, 1);
        assert_eq!(setup.request_type, 0xa1);
        assert_eq!(setup.request, 0x01);
        assert_eq!(setup.value, 0x0301);
        assert!(setup.is_in());

        let setup = ControlSetup::set_report(ReportType::Output, 0x00, 3);
        assert_eq!(setup.value, 0x0200);

        let setup = ControlSetup::get_report(ReportType::Input, 0x02, 0);
        assert_eq!(setup.value, 0x0102);
        assert_eq!(setup.index, 0);
    }

    #[test]
    fn descriptor_requests() {
        let setup = ControlSetup::get_descriptor(DescriptorType::Report, 0, 2);
        assert_eq!(setup.request_type, 0x81);
        assert_eq!(setup.request, GET_DESCRIPTOR);
        assert_eq!(setup.value, 0x2200);
        assert_eq!(setup.index, 2);

        let setup = ControlSetup::get_descriptor(DescriptorType::Hid, 0, 1);
        assert_eq!(setup.value, 0x2100);
    }

    #[test]
    fn idle_and_protocol_requests() {
        let setup = ControlSetup::set_idle(0x7d, 0, 1);
        assert_eq!(setup.request_type, 0x21);
        assert_eq!(setup.request, 0x0a);
        assert_eq!(setup.value, 0x7d00);

        let setup = ControlSetup::get_idle(4, 1);
        assert_eq!(setup.request_type, 0xa1);
        assert_eq!(setup.request, 0x02);
        assert_eq!(setup.value, 0x0004);

        let setup = ControlSetup::set_protocol(Protocol::Boot, 0);
        assert_eq!(setup.request, 0x0b);
        assert_eq!(setup.value, 0);

        let setup = ControlSetup::get_protocol(2);
        assert_eq!(setup.request, 0x03);
        assert_eq!(setup.index, 2);
    }

    #[test]
    fn report_type_round_trips_through_primitive() {
        assert_eq!(ReportType::try_from(0x02).ok(), Some(ReportType::Output));
        assert!(ReportType::try_from(0x04).is_err());
        assert_eq!(u8::from(DescriptorType::Physical), 0x23);
    }
}
