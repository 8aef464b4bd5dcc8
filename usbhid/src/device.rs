//! Implements HID devices on top of an opened [`UsbDevice`].
//!
//! A [`HidDevice`] starts out unattached. [`HidDevice::set_target`] claims a
//! configuration, one of its interfaces and the interrupt endpoints of the
//! chosen alternate setting, and opens transfer streams on them. Calling it
//! again switches to another interface, releasing everything claimed before.
//! [`HidDevice::close`] releases the attachment and closes the device.

use std::{fmt, time::Duration};

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::{
    backend::{
        BackendError,
        InEndpoint,
        OutEndpoint,
        StreamError,
        StreamReader,
        StreamWriter,
        UsbConfig,
        UsbDevice,
        UsbInterface,
    },
    descriptor::{
        Direction,
        HID_DESCRIPTOR_LENGTH,
        HidDescriptor,
        HidDescriptorError,
        MAX_REPORT_DESCRIPTOR_LENGTH,
        ReportDescriptor,
    },
    profile::{DeviceInfo, ProfileError},
    request::{ControlSetup, DescriptorType, Protocol, ReportType},
};

/// The default number of concurrent transfers of every interrupt stream.
pub const DEFAULT_STREAM_LANE_COUNT: usize = 16;

/// Configures how a [`HidDevice`] drives its endpoints.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct DeviceConfig {
    /// The number of concurrent transfer lanes inside each interrupt-endpoint
    /// stream.
    pub stream_lane_count: usize,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            stream_lane_count: DEFAULT_STREAM_LANE_COUNT,
        }
    }
}

impl DeviceConfig {
    pub fn with_stream_lane_count(mut self, stream_lane_count: usize) -> Self {
        self.stream_lane_count = stream_lane_count;
        self
    }
}

/// Names the backend operation an error originates from.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Operation {
    SetAutoDetach,
    ClaimConfig(u8),
    ClaimInterface { number: u8, alt: u8 },
    OpenInEndpoint(u8),
    OpenOutEndpoint(u8),
    OpenReader(u8),
    OpenWriter(u8),
    WriteOutput,
    ReadInput,
    SendFeatureReport,
    GetFeatureReport,
    SendOutputReport,
    GetInputReport,
    GetReportDescriptor,
    GetHidDescriptor,
    GetIdle,
    SetIdle,
    GetProtocol,
    SetProtocol,
    GetStringDescriptor(u8),
    GetManufacturer,
    GetProduct,
    GetSerialNumber,
    CloseReader(u8),
    CloseWriter(u8),
    ReleaseInterface(u8),
    ReleaseConfig(u8),
    CloseDevice,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SetAutoDetach => write!(f, "set auto detach"),
            Self::ClaimConfig(n) => write!(f, "claim config #{}", n),
            Self::ClaimInterface { number, alt } => {
                write!(f, "claim interface #{}:{}", number, alt)
            },
            Self::OpenInEndpoint(n) => write!(f, "open IN endpoint #{}", n),
            Self::OpenOutEndpoint(n) => write!(f, "open OUT endpoint #{}", n),
            Self::OpenReader(n) => write!(f, "create stream reader for endpoint #{}", n),
            Self::OpenWriter(n) => write!(f, "create stream writer for endpoint #{}", n),
            Self::WriteOutput => write!(f, "write output report to interrupt OUT endpoint"),
            Self::ReadInput => write!(f, "read input report from interrupt IN endpoint"),
            Self::SendFeatureReport => write!(f, "send feature report via control endpoint"),
            Self::GetFeatureReport => write!(f, "get feature report via control endpoint"),
            Self::SendOutputReport => write!(f, "send output report via control endpoint"),
            Self::GetInputReport => write!(f, "get input report via control endpoint"),
            Self::GetReportDescriptor => write!(f, "get report descriptor"),
            Self::GetHidDescriptor => write!(f, "get HID descriptor"),
            Self::GetIdle => write!(f, "get idle rate"),
            Self::SetIdle => write!(f, "set idle rate"),
            Self::GetProtocol => write!(f, "get protocol"),
            Self::SetProtocol => write!(f, "set protocol"),
            Self::GetStringDescriptor(n) => write!(f, "get string descriptor #{}", n),
            Self::GetManufacturer => write!(f, "get manufacturer"),
            Self::GetProduct => write!(f, "get product"),
            Self::GetSerialNumber => write!(f, "get serial number"),
            Self::CloseReader(n) => write!(f, "close stream reader for endpoint #{}", n),
            Self::CloseWriter(n) => write!(f, "close stream writer for endpoint #{}", n),
            Self::ReleaseInterface(n) => write!(f, "release interface #{}", n),
            Self::ReleaseConfig(n) => write!(f, "release config #{}", n),
            Self::CloseDevice => write!(f, "close device"),
        }
    }
}

/// The resources claimed for one profile.
struct Attachment {
    config: Box<dyn UsbConfig>,
    interface: Box<dyn UsbInterface>,
    in_endpoint: Box<dyn InEndpoint>,
    reader: Box<dyn StreamReader>,
    out_endpoint: Option<Box<dyn OutEndpoint>>,
    writer: Option<Box<dyn StreamWriter>>,
}

/// The endpoints and streams opened on a claimed interface.
struct Streams {
    in_endpoint: Box<dyn InEndpoint>,
    reader: Box<dyn StreamReader>,
    out_endpoint: Option<Box<dyn OutEndpoint>>,
    writer: Option<Box<dyn StreamWriter>>,
}

/// A HID device reached by claiming its USB interfaces directly.
///
/// The device owns the opened [`UsbDevice`] and everything claimed on it.
/// Dropping it without calling [`Self::close`] releases all resources and
/// logs failures.
pub struct HidDevice {
    device: Option<Box<dyn UsbDevice>>,
    vendor_id: u16,
    product_id: u16,
    config: DeviceConfig,
    attachment: Option<Attachment>,
    info: DeviceInfo,
}

impl HidDevice {
    /// Wraps an opened device. No interface is claimed yet.
    pub fn new(device: Box<dyn UsbDevice>, config: DeviceConfig) -> Self {
        let desc = device.descriptor();

        Self {
            vendor_id: desc.vendor_id,
            product_id: desc.product_id,
            device: Some(device),
            config,
            attachment: None,
            info: DeviceInfo::default(),
        }
    }

    pub fn vendor_id(&self) -> u16 {
        self.vendor_id
    }

    pub fn product_id(&self) -> u16 {
        self.product_id
    }

    /// Whether an interface is currently attached.
    pub fn is_attached(&self) -> bool {
        self.attachment.is_some()
    }

    /// The profile of the attached interface.
    ///
    /// This is an empty profile while no interface is attached.
    pub fn device_info(&self) -> &DeviceInfo {
        &self.info
    }

    fn device(&self) -> Result<&dyn UsbDevice, DeviceError> {
        self.device
            .as_deref()
            .ok_or(DeviceError::UninitializedDevice)
    }

    fn backend_error(&self, operation: Operation, source: BackendError) -> DeviceError {
        DeviceError::Backend {
            vendor_id: self.vendor_id,
            product_id: self.product_id,
            operation,
            source,
        }
    }

    fn backend(&self, operation: Operation) -> impl FnOnce(BackendError) -> DeviceError + use<> {
        let (vendor_id, product_id) = (self.vendor_id, self.product_id);
        move |source| DeviceError::Backend {
            vendor_id,
            product_id,
            operation,
            source,
        }
    }

    /// Sets whether kernel drivers bound to an interface are detached
    /// automatically when it is claimed.
    ///
    /// Without this, kernels that bind a default HID driver require the
    /// driver to be detached manually before [`Self::set_target`] succeeds.
    pub fn set_auto_detach(&self, auto_detach: bool) -> Result<(), DeviceError> {
        self.device()?
            .set_auto_detach(auto_detach)
            .map_err(self.backend(Operation::SetAutoDetach))
    }

    /// Attaches the alternate setting `alt` of interface `interface` in
    /// configuration `config`, all given by their descriptor numbers.
    ///
    /// Any previous attachment is released first, even if the new one fails.
    /// Errors releasing it are logged, not returned.
    ///
    /// If the coordinate does not name a HID alternate setting,
    /// [`ProfileError::ProfileNotFound`] is returned before anything is
    /// released. This is the one failure that does not leave the device
    /// unattached: the previous attachment, if any, stays in place and
    /// [`Self::is_attached`] keeps reporting it.
    ///
    /// On any other failure, everything claimed during the attempt is
    /// released again and the device is left unattached.
    pub fn set_target(&mut self, config: u8, interface: u8, alt: u8) -> Result<(), DeviceError> {
        let desc = self.device()?.descriptor();
        let info = DeviceInfo::from_device_descriptor(desc, config, interface, alt)?;

        if let Some(previous) = self.attachment.take() {
            self.discard(previous);
        }
        self.info = DeviceInfo::default();

        let attachment = self.attach(&info, config, interface, alt)?;
        self.attachment = Some(attachment);
        self.info = info;

        Ok(())
    }

    /// Releases an attachment that is being replaced, logging failures.
    fn discard(&self, attachment: Attachment) {
        let Attachment {
            config,
            interface,
            in_endpoint,
            reader,
            out_endpoint,
            writer,
        } = attachment;
        let (vendor_id, product_id) = (self.vendor_id, self.product_id);

        if let (Some(out), Some(writer)) = (out_endpoint, writer) {
            if let Err(err) = writer.close() {
                let endpoint = out.descriptor().number;
                error!(vendor_id, product_id, endpoint, %err, "unable to close existing stream writer");
            }
        }
        if let Err(err) = reader.close() {
            let endpoint = in_endpoint.descriptor().number;
            error!(vendor_id, product_id, endpoint, %err, "unable to close existing stream reader");
        }
        if let Err(err) = interface.close() {
            error!(vendor_id, product_id, %err, "unable to close existing interface");
        }
        if let Err(err) = config.close() {
            error!(vendor_id, product_id, %err, "unable to close existing config");
        }
    }

    fn attach(
        &self,
        info: &DeviceInfo,
        config: u8,
        interface: u8,
        alt: u8,
    ) -> Result<Attachment, DeviceError> {
        let device = self.device()?;

        let cfg = device
            .config(config)
            .map_err(self.backend(Operation::ClaimConfig(config)))?;
        debug!(config, "claimed config");

        let intf = match cfg.interface(interface, alt) {
            Ok(intf) => intf,
            Err(source) => {
                self.rollback(None, cfg);
                return Err(
                    self.backend_error(Operation::ClaimInterface { number: interface, alt }, source)
                );
            },
        };
        debug!(config, interface, alt, "claimed interface");

        match self.open_streams(info, intf.as_ref(), config, interface, alt) {
            Ok(streams) => Ok(Attachment {
                config: cfg,
                interface: intf,
                in_endpoint: streams.in_endpoint,
                reader: streams.reader,
                out_endpoint: streams.out_endpoint,
                writer: streams.writer,
            }),
            Err(err) => {
                self.rollback(Some(intf), cfg);
                Err(err)
            },
        }
    }

    /// Releases what a failed attachment attempt claimed, logging failures.
    fn rollback(&self, interface: Option<Box<dyn UsbInterface>>, config: Box<dyn UsbConfig>) {
        if let Some(interface) = interface {
            if let Err(err) = interface.close() {
                error!(
                    vendor_id = self.vendor_id,
                    product_id = self.product_id,
                    %err,
                    "unable to release interface after failed attachment"
                );
            }
        }
        if let Err(err) = config.close() {
            error!(
                vendor_id = self.vendor_id,
                product_id = self.product_id,
                %err,
                "unable to release config after failed attachment"
            );
        }
    }

    fn open_streams(
        &self,
        info: &DeviceInfo,
        intf: &dyn UsbInterface,
        config: u8,
        interface: u8,
        alt: u8,
    ) -> Result<Streams, DeviceError> {
        let mut in_endpoint = None;
        let mut out_endpoint = None;

        // Any IN and any OUT endpoint will do, the map has no defined order.
        for endpoint in info.endpoints()?.values() {
            match endpoint.direction {
                Direction::In if in_endpoint.is_none() => {
                    info!(config, interface, alt, number = endpoint.number, "use endpoint IN");
                    in_endpoint = Some(
                        intf.in_endpoint(endpoint.number)
                            .map_err(self.backend(Operation::OpenInEndpoint(endpoint.number)))?,
                    );
                },
                Direction::Out if out_endpoint.is_none() => {
                    info!(config, interface, alt, number = endpoint.number, "use endpoint OUT");
                    out_endpoint = Some(
                        intf.out_endpoint(endpoint.number)
                            .map_err(self.backend(Operation::OpenOutEndpoint(endpoint.number)))?,
                    );
                },
                _ => {},
            }
        }

        let Some(in_endpoint) = in_endpoint else {
            return Err(DeviceError::EndpointInNotFound {
                vendor_id: self.vendor_id,
                product_id: self.product_id,
                config,
                interface,
                alt,
            });
        };

        let lanes = self.config.stream_lane_count;
        let in_number = in_endpoint.descriptor().number;
        let reader = in_endpoint
            .new_stream(lanes)
            .map_err(self.backend(Operation::OpenReader(in_number)))?;

        let writer = match &out_endpoint {
            Some(out) => match out.new_stream(lanes) {
                Ok(writer) => Some(writer),
                Err(source) => {
                    if let Err(err) = reader.close() {
                        error!(
                            vendor_id = self.vendor_id,
                            product_id = self.product_id,
                            %err,
                            "unable to close stream reader after failed attachment"
                        );
                    }
                    let out_number = out.descriptor().number;
                    return Err(self.backend_error(Operation::OpenWriter(out_number), source));
                },
            },
            None => None,
        };

        Ok(Streams {
            in_endpoint,
            reader,
            out_endpoint,
            writer,
        })
    }

    /// Releases the attachment and closes the device.
    ///
    /// Resources are released in the order stream reader, stream writer,
    /// interface, config, device. Every failure is collected into a single
    /// [`CloseError`]. Closing an unattached device closes only the device;
    /// closing a closed device does nothing.
    pub fn close(&mut self) -> Result<(), DeviceError> {
        let mut failures = Vec::new();

        if let Some(attachment) = self.attachment.take() {
            let config_number = self.info.config_number().unwrap_or_default();
            let interface_number = self.info.interface_number().unwrap_or_default();
            let Attachment {
                config,
                interface,
                in_endpoint,
                reader,
                out_endpoint,
                writer,
            } = attachment;

            if let Err(source) = reader.close() {
                let number = in_endpoint.descriptor().number;
                failures.push(self.backend_error(Operation::CloseReader(number), source));
            }
            if let (Some(out), Some(writer)) = (out_endpoint, writer) {
                if let Err(source) = writer.close() {
                    let number = out.descriptor().number;
                    failures.push(self.backend_error(Operation::CloseWriter(number), source));
                }
            }
            if let Err(source) = interface.close() {
                failures.push(
                    self.backend_error(Operation::ReleaseInterface(interface_number), source),
                );
            }
            if let Err(source) = config.close() {
                failures.push(self.backend_error(Operation::ReleaseConfig(config_number), source));
            }
        }
        self.info = DeviceInfo::default();

        if let Some(device) = self.device.take() {
            if let Err(source) = device.close() {
                failures.push(self.backend_error(Operation::CloseDevice, source));
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(CloseError { failures }.into())
        }
    }

    /// Writes an output report.
    ///
    /// The first byte of `data` is the report ID. A report ID of `0x00`
    /// means the device uses a single report; the byte is not transmitted but
    /// still counted in the returned length.
    ///
    /// Uses the interrupt OUT stream if the attached alternate setting has an
    /// OUT endpoint and falls back to [`Self::send_output_report`] otherwise.
    pub async fn write_output(
        &mut self,
        cancel: &CancellationToken,
        data: &[u8],
    ) -> Result<usize, DeviceError> {
        let Some((&report_id, rest)) = data.split_first() else {
            return Err(DeviceError::EmptyData);
        };
        self.device()?;

        match &self.attachment {
            None => return Err(DeviceError::UninitializedEndpoint),
            Some(attachment) if attachment.writer.is_none() => {
                return self.send_output_report(data);
            },
            Some(_) => {},
        }

        let (vendor_id, product_id) = (self.vendor_id, self.product_id);
        let Some(writer) = self
            .attachment
            .as_mut()
            .and_then(|attachment| attachment.writer.as_mut())
        else {
            return Err(DeviceError::UninitializedEndpoint);
        };

        let (payload, skipped) = strip_report_id(report_id, data, rest);
        match writer.write(cancel, payload).await {
            Ok(written) => Ok(written + skipped),
            Err(err) => Err(DeviceError::from_stream(
                vendor_id,
                product_id,
                Operation::WriteOutput,
                err,
            )),
        }
    }

    /// Reads the next input report from the interrupt IN stream.
    ///
    /// An empty buffer returns `Ok(0)` without touching the device.
    pub async fn read_input(
        &mut self,
        cancel: &CancellationToken,
        buf: &mut [u8],
    ) -> Result<usize, DeviceError> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.device()?;

        let (vendor_id, product_id) = (self.vendor_id, self.product_id);
        let Some(attachment) = self.attachment.as_mut() else {
            return Err(DeviceError::UninitializedEndpoint);
        };

        attachment
            .reader
            .read(cancel, buf)
            .await
            .map_err(|err| DeviceError::from_stream(vendor_id, product_id, Operation::ReadInput, err))
    }

    fn set_report(
        &self,
        report_type: ReportType,
        data: &[u8],
        operation: Operation,
    ) -> Result<usize, DeviceError> {
        let Some((&report_id, rest)) = data.split_first() else {
            return Err(DeviceError::EmptyData);
        };
        let device = self.device()?;
        let interface = self.info.interface_number()?;

        let (payload, skipped) = strip_report_id(report_id, data, rest);
        let setup = ControlSetup::set_report(report_type, report_id, interface);
        debug!(?setup, len = payload.len(), "SET_REPORT");

        let sent = device
            .control_out(setup, payload)
            .map_err(self.backend(operation))?;
        Ok(sent + skipped)
    }

    fn get_report(
        &self,
        report_type: ReportType,
        data: &mut [u8],
        operation: Operation,
    ) -> Result<usize, DeviceError> {
        let Some(&report_id) = data.first() else {
            return Err(DeviceError::EmptyData);
        };
        let device = self.device()?;
        let interface = self.info.interface_number()?;

        let (payload, skipped) = if report_id == 0x00 {
            (&mut data[1..], 1)
        } else {
            (data, 0)
        };
        let setup = ControlSetup::get_report(report_type, report_id, interface);
        debug!(?setup, len = payload.len(), "GET_REPORT");

        let received = device
            .control_in(setup, payload)
            .map_err(self.backend(operation))?;
        Ok(received + skipped)
    }

    /// Sends a feature report using `SET_REPORT` on the control endpoint.
    ///
    /// The first byte of `data` is the report ID, see [`Self::write_output`].
    pub fn send_feature_report(&self, data: &[u8]) -> Result<usize, DeviceError> {
        self.set_report(ReportType::Feature, data, Operation::SendFeatureReport)
    }

    /// Retrieves a feature report using `GET_REPORT` on the control endpoint.
    ///
    /// The first byte of `data` selects the report ID and is overwritten by
    /// the reply unless it is `0x00`.
    pub fn get_feature_report(&self, data: &mut [u8]) -> Result<usize, DeviceError> {
        self.get_report(ReportType::Feature, data, Operation::GetFeatureReport)
    }

    /// Sends an output report using `SET_REPORT` on the control endpoint.
    pub fn send_output_report(&self, data: &[u8]) -> Result<usize, DeviceError> {
        self.set_report(ReportType::Output, data, Operation::SendOutputReport)
    }

    /// Retrieves an input report using `GET_REPORT` on the control endpoint.
    pub fn get_input_report(&self, data: &mut [u8]) -> Result<usize, DeviceError> {
        self.get_report(ReportType::Input, data, Operation::GetInputReport)
    }

    /// Retrieves the report descriptor of the attached interface.
    pub fn get_report_descriptor(&self) -> Result<ReportDescriptor, DeviceError> {
        let device = self.device()?;
        let interface = self.info.interface_number()?;

        let mut buf = vec![0u8; MAX_REPORT_DESCRIPTOR_LENGTH];
        let len = device
            .control_in(
                ControlSetup::get_descriptor(DescriptorType::Report, 0, interface),
                &mut buf,
            )
            .map_err(self.backend(Operation::GetReportDescriptor))?;

        buf.truncate(len);
        Ok(ReportDescriptor::from(buf))
    }

    /// Retrieves the HID descriptor of the attached interface.
    ///
    /// The descriptor is requested with room for a single class descriptor
    /// first. If it announces more, it is requested again at its full size.
    pub fn get_hid_descriptor(&self) -> Result<HidDescriptor, DeviceError> {
        let device = self.device()?;
        let interface = self.info.interface_number()?;
        let setup = ControlSetup::get_descriptor(DescriptorType::Hid, 0, interface);

        let mut buf = vec![0u8; HID_DESCRIPTOR_LENGTH];
        let len = device
            .control_in(setup, &mut buf)
            .map_err(self.backend(Operation::GetHidDescriptor))?;
        let desc = HidDescriptor::decode_prefix(&buf[..len.min(buf.len())])?;

        if desc.num_descriptors <= 1 {
            return Ok(desc);
        }

        let mut buf = vec![0u8; desc.total_length()];
        let len = device
            .control_in(setup, &mut buf)
            .map_err(self.backend(Operation::GetHidDescriptor))?;

        Ok(HidDescriptor::decode(&buf[..len.min(buf.len())])?)
    }

    /// Retrieves the idle rate of a report. `0` means the device only reports
    /// on change.
    pub fn get_idle(&self, report_id: u8) -> Result<Duration, DeviceError> {
        let device = self.device()?;
        let interface = self.info.interface_number()?;

        let mut buf = [0u8; 1];
        let len = device
            .control_in(ControlSetup::get_idle(report_id, interface), &mut buf)
            .map_err(self.backend(Operation::GetIdle))?;
        if len != 1 {
            return Err(DeviceError::UnexpectedResponse(Operation::GetIdle));
        }

        Ok(Duration::from_millis(u64::from(buf[0]) * 4))
    }

    /// Sets the idle rate of a report, or of all reports if `report_id` is
    /// `0`. The rate has a resolution of 4 ms and saturates at 1020 ms.
    pub fn set_idle(&self, rate: Duration, report_id: u8) -> Result<(), DeviceError> {
        let device = self.device()?;
        let interface = self.info.interface_number()?;

        let duration = u8::try_from(rate.as_millis() / 4).unwrap_or(u8::MAX);
        device
            .control_out(ControlSetup::set_idle(duration, report_id, interface), &[])
            .map_err(self.backend(Operation::SetIdle))?;

        Ok(())
    }

    /// Retrieves the protocol a boot interface currently uses.
    pub fn get_protocol(&self) -> Result<Protocol, DeviceError> {
        let device = self.device()?;
        let interface = self.info.interface_number()?;

        let mut buf = [0u8; 1];
        let len = device
            .control_in(ControlSetup::get_protocol(interface), &mut buf)
            .map_err(self.backend(Operation::GetProtocol))?;
        if len != 1 {
            return Err(DeviceError::UnexpectedResponse(Operation::GetProtocol));
        }

        Protocol::try_from(buf[0]).map_err(|_| DeviceError::UnexpectedResponse(Operation::GetProtocol))
    }

    /// Switches a boot interface between the boot and report protocols.
    pub fn set_protocol(&self, protocol: Protocol) -> Result<(), DeviceError> {
        let device = self.device()?;
        let interface = self.info.interface_number()?;

        device
            .control_out(ControlSetup::set_protocol(protocol, interface), &[])
            .map_err(self.backend(Operation::SetProtocol))?;

        Ok(())
    }

    /// Retrieves an indexed string descriptor.
    pub fn get_string_descriptor(&self, index: u8) -> Result<String, DeviceError> {
        self.device()?
            .string_descriptor(index)
            .map_err(self.backend(Operation::GetStringDescriptor(index)))
    }

    pub fn get_manufacturer(&self) -> Result<String, DeviceError> {
        self.device()?
            .manufacturer()
            .map_err(self.backend(Operation::GetManufacturer))
    }

    pub fn get_product(&self) -> Result<String, DeviceError> {
        self.device()?
            .product()
            .map_err(self.backend(Operation::GetProduct))
    }

    pub fn get_serial_number(&self) -> Result<String, DeviceError> {
        self.device()?
            .serial_number()
            .map_err(self.backend(Operation::GetSerialNumber))
    }
}

impl Drop for HidDevice {
    fn drop(&mut self) {
        if self.device.is_none() && self.attachment.is_none() {
            return;
        }

        if let Err(err) = self.close() {
            error!(
                vendor_id = self.vendor_id,
                product_id = self.product_id,
                %err,
                "unable to release HID device"
            );
        }
    }
}

/// Applies the report ID convention to outgoing data.
///
/// Returns the bytes to transmit and the number of bytes skipped.
fn strip_report_id<'a>(report_id: u8, data: &'a [u8], rest: &'a [u8]) -> (&'a [u8], usize) {
    if report_id == 0x00 { (rest, 1) } else { (data, 0) }
}

/// Collects every failure that occurred while closing a [`HidDevice`].
#[derive(Debug)]
pub struct CloseError {
    failures: Vec<DeviceError>,
}

impl CloseError {
    /// The failures, in the order the resources were released.
    pub fn failures(&self) -> &[DeviceError] {
        &self.failures
    }
}

impl fmt::Display for CloseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unable to close HID device")?;
        for (i, failure) in self.failures.iter().enumerate() {
            write!(f, "{} {}", if i == 0 { ":" } else { ";" }, failure)?;
            if let Some(source) = std::error::Error::source(failure) {
                write!(f, " ({})", source)?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for CloseError {}

/// Represents an error that occurred when attaching or talking to a
/// [`HidDevice`].
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DeviceError {
    /// Indicates that a report call was given an empty buffer.
    #[error("empty data")]
    EmptyData,

    /// Indicates that the device has been closed.
    #[error("uninitialized device")]
    UninitializedDevice,

    /// Indicates that an interrupt transfer was attempted before an interface
    /// was attached.
    #[error("uninitialized endpoint")]
    UninitializedEndpoint,

    /// Indicates that the profile could not be resolved or read.
    #[error(transparent)]
    Profile(#[from] ProfileError),

    /// Indicates that the chosen alternate setting has no IN endpoint.
    #[error(
        "endpoint IN not found for the device {vendor_id:04x}:{product_id:04x}, conf #{config}, intf #{interface}, alt #{alt}"
    )]
    EndpointInNotFound {
        vendor_id: u16,
        product_id: u16,
        config: u8,
        interface: u8,
        alt: u8,
    },

    /// Indicates that the backend returned an error.
    #[error("unable to {operation} for device {vendor_id:04x}:{product_id:04x}")]
    Backend {
        vendor_id: u16,
        product_id: u16,
        operation: Operation,
        #[source]
        source: BackendError,
    },

    /// Indicates that a stream transfer failed.
    #[error("unable to {operation} for device {vendor_id:04x}:{product_id:04x}")]
    Transfer {
        vendor_id: u16,
        product_id: u16,
        operation: Operation,
        #[source]
        source: StreamError,
    },

    /// Indicates that a stream transfer was cancelled.
    #[error("the transfer was cancelled after {transferred} bytes")]
    TransferCancelled { transferred: usize },

    /// Indicates that the device answered a request with unexpected data.
    #[error("unexpected response to {0}")]
    UnexpectedResponse(Operation),

    /// Indicates that the HID descriptor could not be decoded.
    #[error("unable to decode HID descriptor")]
    HidDescriptor(#[from] HidDescriptorError),

    /// Indicates that one or more resources could not be released.
    #[error(transparent)]
    Close(#[from] CloseError),
}

impl DeviceError {
    fn from_stream(
        vendor_id: u16,
        product_id: u16,
        operation: Operation,
        err: StreamError,
    ) -> Self {
        match err {
            StreamError::Cancelled { transferred } => Self::TransferCancelled { transferred },
            err => Self::Transfer {
                vendor_id,
                product_id,
                operation,
                source: err,
            },
        }
    }

    /// The number of bytes a stream transfer moved before it stopped.
    pub fn transferred(&self) -> usize {
        match self {
            Self::TransferCancelled { transferred } => *transferred,
            Self::Transfer { source, .. } => source.transferred(),
            _ => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use futures::executor::block_on;

    use super::*;
    use crate::{
        backend::memory::{ControlData, Event, Fault, MemoryDevice},
        profile::tests::descriptor,
    };

    const TRIPLE: [u8; 15] = [
        0x0f, 0x21, 0x10, 0x01, 0x01, 0x03, 0x22, 0x3f, 0x00, 0x22, 0x41, 0x00, 0x22, 0x42, 0x00,
    ];

    fn memory() -> MemoryDevice {
        MemoryDevice::new(descriptor(0xff01, 0x0001))
    }

    fn open(dev: &MemoryDevice) -> HidDevice {
        HidDevice::new(dev.open(), DeviceConfig::default())
    }

    fn controls(dev: &MemoryDevice) -> Vec<(ControlSetup, Vec<u8>)> {
        dev.events()
            .into_iter()
            .filter_map(|event| match event {
                Event::Control { setup, data } => Some((setup, data)),
                _ => None,
            })
            .collect()
    }

    fn setup(request_type: u8, request: u8, value: u16, index: u16) -> ControlSetup {
        ControlSetup {
            request_type,
            request,
            value,
            index,
        }
    }

    #[test]
    fn attach_and_interrupt_round_trip() {
        let dev = memory();
        let mut hid = open(&dev);
        let cancel = CancellationToken::new();

        hid.set_target(1, 1, 0).unwrap();
        assert!(hid.is_attached());
        assert_eq!(hid.device_info().interface_number(), Ok(1));

        let events = dev.events();
        assert_eq!(events[0], Event::ConfigClaimed(1));
        assert_eq!(events[1], Event::InterfaceClaimed { number: 1, alt: 0 });
        assert!(events.contains(&Event::ReaderOpened {
            address: 0x81,
            lanes: DEFAULT_STREAM_LANE_COUNT
        }));
        assert!(events.contains(&Event::WriterOpened {
            address: 0x01,
            lanes: DEFAULT_STREAM_LANE_COUNT
        }));

        let written = block_on(hid.write_output(&cancel, &[0x00, 0x01, 0x02, 0x03, 0x04, 0x05]));
        assert_eq!(written.unwrap(), 6);
        assert_eq!(dev.take_output(), Some(vec![0x01, 0x02, 0x03, 0x04, 0x05]));

        dev.push_input([0x01, 0x01, 0x02, 0x03, 0x04, 0x05]);
        let mut buf = [0u8; 6];
        let read = block_on(hid.read_input(&cancel, &mut buf));
        assert_eq!(read.unwrap(), 6);
        assert_eq!(buf, [0x01, 0x01, 0x02, 0x03, 0x04, 0x05]);
    }

    #[test]
    fn write_output_with_report_id_is_sent_unchanged() {
        let dev = memory();
        let mut hid = open(&dev);
        hid.set_target(1, 1, 0).unwrap();

        let written = block_on(hid.write_output(&CancellationToken::new(), &[0x02, 0xaa, 0xbb]));
        assert_eq!(written.unwrap(), 3);
        assert_eq!(dev.take_output(), Some(vec![0x02, 0xaa, 0xbb]));
    }

    #[test]
    fn write_output_falls_back_to_control_without_out_endpoint() {
        let dev = memory().on_control(|_, data| match data {
            ControlData::Out(data) => Ok(data.len()),
            ControlData::In(_) => Ok(0),
        });
        let mut hid = open(&dev);

        hid.set_target(1, 3, 0).unwrap();
        assert!(
            !dev.events()
                .iter()
                .any(|event| matches!(event, Event::WriterOpened { .. }))
        );

        let written = block_on(hid.write_output(
            &CancellationToken::new(),
            &[0x00, 0x01, 0x02, 0x03, 0x04, 0x05],
        ));
        assert_eq!(written.unwrap(), 6);
        assert_eq!(
            controls(&dev),
            vec![(
                setup(0x21, 0x09, 0x0200, 0x0003),
                vec![0x01, 0x02, 0x03, 0x04, 0x05]
            )]
        );
        assert_eq!(dev.take_output(), None);
    }

    #[test]
    fn get_feature_report_with_report_id() {
        let dev = memory().on_control(|_, data| match data {
            ControlData::In(buf) => {
                buf.copy_from_slice(&[0x01, 0x01, 0x02, 0x03, 0x04, 0x05]);
                Ok(6)
            },
            ControlData::Out(_) => Ok(0),
        });
        let mut hid = open(&dev);
        hid.set_target(1, 1, 0).unwrap();

        let mut buf = [0x01, 0, 0, 0, 0, 0];
        assert_eq!(hid.get_feature_report(&mut buf).unwrap(), 6);
        assert_eq!(buf, [0x01, 0x01, 0x02, 0x03, 0x04, 0x05]);
        assert_eq!(
            controls(&dev),
            vec![(setup(0xa1, 0x01, 0x0301, 1), vec![0x01, 0, 0, 0, 0, 0])]
        );
    }

    #[test]
    fn control_reports_strip_zero_report_id() {
        let dev = memory().on_control(|_, data| match data {
            ControlData::In(buf) => {
                buf.fill(0xee);
                Ok(buf.len())
            },
            ControlData::Out(data) => Ok(data.len()),
        });
        let mut hid = open(&dev);
        hid.set_target(1, 1, 0).unwrap();

        assert_eq!(hid.send_feature_report(&[0x00, 0x0a, 0x0b]).unwrap(), 3);
        assert_eq!(hid.send_output_report(&[0x00, 0x0c]).unwrap(), 2);

        let mut feature = [0x00, 0, 0, 0];
        assert_eq!(hid.get_feature_report(&mut feature).unwrap(), 4);
        assert_eq!(feature, [0x00, 0xee, 0xee, 0xee]);

        let mut input = [0x00, 0];
        assert_eq!(hid.get_input_report(&mut input).unwrap(), 2);

        assert_eq!(
            controls(&dev),
            vec![
                (setup(0x21, 0x09, 0x0300, 1), vec![0x0a, 0x0b]),
                (setup(0x21, 0x09, 0x0200, 1), vec![0x0c]),
                (setup(0xa1, 0x01, 0x0300, 1), vec![0, 0, 0]),
                (setup(0xa1, 0x01, 0x0100, 1), vec![0]),
            ]
        );
    }

    #[test]
    fn control_reports_keep_non_zero_report_id() {
        let dev = memory().on_control(|_, data| match data {
            ControlData::In(buf) => Ok(buf.len()),
            ControlData::Out(data) => Ok(data.len()),
        });
        let mut hid = open(&dev);
        hid.set_target(1, 1, 0).unwrap();

        assert_eq!(hid.send_feature_report(&[0x03, 0x0a]).unwrap(), 2);
        assert_eq!(hid.send_output_report(&[0x04, 0x0b]).unwrap(), 2);
        assert_eq!(hid.get_input_report(&mut [0x05, 0]).unwrap(), 2);

        assert_eq!(
            controls(&dev),
            vec![
                (setup(0x21, 0x09, 0x0303, 1), vec![0x03, 0x0a]),
                (setup(0x21, 0x09, 0x0204, 1), vec![0x04, 0x0b]),
                (setup(0xa1, 0x01, 0x0105, 1), vec![0x05, 0]),
            ]
        );
    }

    #[test]
    fn empty_buffers() {
        let dev = memory();
        let mut hid = open(&dev);
        let cancel = CancellationToken::new();
        hid.set_target(1, 1, 0).unwrap();

        assert!(matches!(
            block_on(hid.write_output(&cancel, &[])),
            Err(DeviceError::EmptyData)
        ));
        assert!(matches!(
            hid.send_feature_report(&[]),
            Err(DeviceError::EmptyData)
        ));
        assert!(matches!(
            hid.get_feature_report(&mut []),
            Err(DeviceError::EmptyData)
        ));
        assert!(matches!(
            hid.send_output_report(&[]),
            Err(DeviceError::EmptyData)
        ));
        assert!(matches!(
            hid.get_input_report(&mut []),
            Err(DeviceError::EmptyData)
        ));
        assert_eq!(block_on(hid.read_input(&cancel, &mut [])).unwrap(), 0);
        assert!(controls(&dev).is_empty());
    }

    #[test]
    fn transfers_before_attachment() {
        let dev = memory();
        let mut hid = open(&dev);
        let cancel = CancellationToken::new();

        assert!(matches!(
            block_on(hid.write_output(&cancel, &[0x00, 0x01])),
            Err(DeviceError::UninitializedEndpoint)
        ));
        assert!(matches!(
            block_on(hid.read_input(&cancel, &mut [0; 4])),
            Err(DeviceError::UninitializedEndpoint)
        ));
        assert!(matches!(
            hid.send_feature_report(&[0x00, 0x01]),
            Err(DeviceError::Profile(ProfileError::DescriptorMissing))
        ));
        assert!(matches!(
            hid.get_report_descriptor(),
            Err(DeviceError::Profile(ProfileError::DescriptorMissing))
        ));
        assert_eq!(
            hid.device_info().config_number(),
            Err(ProfileError::DescriptorMissing)
        );
    }

    #[test]
    fn two_phase_hid_descriptor() {
        let dev = memory().on_control(|_, data| match data {
            ControlData::In(buf) => {
                let len = buf.len().min(TRIPLE.len());
                buf[..len].copy_from_slice(&TRIPLE[..len]);
                Ok(len)
            },
            ControlData::Out(_) => Ok(0),
        });
        let mut hid = open(&dev);
        hid.set_target(1, 1, 0).unwrap();

        let desc = hid.get_hid_descriptor().unwrap();
        assert_eq!(desc.num_descriptors, 3);
        assert_eq!(desc.class_descriptor_length, 0x3f);
        assert_eq!(desc.optional_descriptors.len(), 2);
        assert_eq!(desc.optional_descriptors[0].length, 0x41);
        assert_eq!(desc.optional_descriptors[1].length, 0x42);

        let requests = controls(&dev);
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].0, setup(0x81, 0x06, 0x2100, 1));
        assert_eq!(requests[0].1.len(), 9);
        assert_eq!(requests[1].0, setup(0x81, 0x06, 0x2100, 1));
        assert_eq!(requests[1].1.len(), 15);
    }

    #[test]
    fn single_phase_hid_descriptor() {
        let dev = memory().on_control(|_, data| match data {
            ControlData::In(buf) => {
                buf.copy_from_slice(&[0x09, 0x21, 0x11, 0x01, 0x00, 0x01, 0x22, 0x34, 0x00]);
                Ok(9)
            },
            ControlData::Out(_) => Ok(0),
        });
        let mut hid = open(&dev);
        hid.set_target(1, 1, 0).unwrap();

        let desc = hid.get_hid_descriptor().unwrap();
        assert_eq!(desc.hid_version, 0x0111);
        assert_eq!(desc.report_descriptor_length(), Some(0x34));
        assert_eq!(controls(&dev).len(), 1);
    }

    #[test]
    fn hid_descriptor_control_failure() {
        let dev = memory();
        let mut hid = open(&dev);
        hid.set_target(1, 1, 0).unwrap();
        dev.inject(Fault::Control);

        let err = hid.get_hid_descriptor().unwrap_err();
        assert!(matches!(
            err,
            DeviceError::Backend {
                operation: Operation::GetHidDescriptor,
                ..
            }
        ));
    }

    #[test]
    fn report_descriptor() {
        let dev = memory().on_control(|_, data| match data {
            ControlData::In(buf) => {
                buf[..4].copy_from_slice(&[0x05, 0x01, 0x09, 0x02]);
                Ok(4)
            },
            ControlData::Out(_) => Ok(0),
        });
        let mut hid = open(&dev);
        hid.set_target(1, 3, 0).unwrap();

        let desc = hid.get_report_descriptor().unwrap();
        assert_eq!(desc.as_bytes(), &[0x05, 0x01, 0x09, 0x02]);

        let requests = controls(&dev);
        assert_eq!(requests[0].0, setup(0x81, 0x06, 0x2200, 3));
        assert_eq!(requests[0].1.len(), MAX_REPORT_DESCRIPTOR_LENGTH);
    }

    #[test]
    fn missing_in_endpoint_rejects_attachment() {
        let dev = memory();
        let mut hid = open(&dev);

        let err = hid.set_target(1, 4, 0).unwrap_err();
        assert!(matches!(
            err,
            DeviceError::EndpointInNotFound {
                config: 1,
                interface: 4,
                alt: 0,
                ..
            }
        ));
        assert!(!hid.is_attached());
        assert!(!hid.device_info().is_resolved());
        assert_eq!(
            dev.events(),
            vec![
                Event::ConfigClaimed(1),
                Event::InterfaceClaimed { number: 4, alt: 0 },
                Event::InterfaceReleased { number: 4, alt: 0 },
                Event::ConfigReleased(1),
            ]
        );
    }

    #[test]
    fn retarget_releases_previous_attachment_once() {
        let dev = memory();
        let mut hid = open(&dev);

        hid.set_target(1, 1, 0).unwrap();
        dev.clear_events();
        dev.inject(Fault::CloseWriter);
        dev.inject(Fault::ReleaseInterface);

        hid.set_target(1, 1, 0).unwrap();
        assert!(hid.is_attached());

        let events = dev.events();
        let released: Vec<_> = events
            .iter()
            .filter(|event| {
                matches!(
                    event,
                    Event::WriterClosed { .. }
                        | Event::ReaderClosed { .. }
                        | Event::InterfaceReleased { .. }
                        | Event::ConfigReleased(_)
                )
            })
            .cloned()
            .collect();
        assert_eq!(
            released,
            vec![
                Event::WriterClosed { address: 0x01 },
                Event::ReaderClosed { address: 0x81 },
                Event::InterfaceReleased { number: 1, alt: 0 },
                Event::ConfigReleased(1),
            ]
        );
        assert_eq!(events[4], Event::ConfigClaimed(1));
    }

    #[test]
    fn retarget_to_another_interface() {
        let dev = memory();
        let mut hid = open(&dev);

        hid.set_target(1, 1, 0).unwrap();
        hid.set_target(1, 3, 0).unwrap();

        assert_eq!(hid.device_info().interface_number(), Ok(3));
        assert!(
            dev.events()
                .contains(&Event::InterfaceReleased { number: 1, alt: 0 })
        );
        assert!(dev.events().contains(&Event::ReaderOpened {
            address: 0x83,
            lanes: DEFAULT_STREAM_LANE_COUNT
        }));
    }

    #[test]
    fn unknown_profile_keeps_attachment() {
        let dev = memory();
        let mut hid = open(&dev);
        hid.set_target(1, 1, 0).unwrap();
        dev.clear_events();

        let err = hid.set_target(1, 2, 0).unwrap_err();
        assert!(matches!(
            err,
            DeviceError::Profile(ProfileError::ProfileNotFound { interface: 2, .. })
        ));
        assert!(hid.is_attached());
        assert_eq!(hid.device_info().interface_number(), Ok(1));
        assert!(dev.events().is_empty());
    }

    #[test]
    fn failed_writer_rolls_back_attachment() {
        let dev = memory();
        dev.inject(Fault::OpenWriter);
        let mut hid = open(&dev);

        let err = hid.set_target(1, 1, 0).unwrap_err();
        assert!(matches!(
            err,
            DeviceError::Backend {
                operation: Operation::OpenWriter(1),
                ..
            }
        ));
        assert!(!hid.is_attached());

        let events = dev.events();
        assert_eq!(
            events[events.len() - 3..],
            [
                Event::ReaderClosed { address: 0x81 },
                Event::InterfaceReleased { number: 1, alt: 0 },
                Event::ConfigReleased(1),
            ]
        );
    }

    /// Counts the claims and streams in `events` that were not released.
    fn still_claimed(events: &[Event]) -> isize {
        events
            .iter()
            .map(|event| match event {
                Event::ConfigClaimed(_)
                | Event::InterfaceClaimed { .. }
                | Event::ReaderOpened { .. }
                | Event::WriterOpened { .. } => 1,
                Event::ConfigReleased(_)
                | Event::InterfaceReleased { .. }
                | Event::ReaderClosed { .. }
                | Event::WriterClosed { .. } => -1,
                _ => 0,
            })
            .sum()
    }

    #[test]
    fn failed_config_claims_nothing() {
        let dev = memory();
        dev.inject(Fault::ClaimConfig);
        let mut hid = open(&dev);

        let err = hid.set_target(1, 1, 0).unwrap_err();
        assert!(matches!(
            err,
            DeviceError::Backend {
                operation: Operation::ClaimConfig(1),
                ..
            }
        ));
        assert!(!hid.is_attached());
        assert!(!hid.device_info().is_resolved());
        assert_eq!(still_claimed(&dev.events()), 0);
        assert!(!dev.events().contains(&Event::InterfaceClaimed { number: 1, alt: 0 }));
    }

    #[test]
    fn failed_in_endpoint_rolls_back_attachment() {
        let dev = memory();
        dev.inject(Fault::OpenInEndpoint);
        let mut hid = open(&dev);

        let err = hid.set_target(1, 1, 0).unwrap_err();
        assert!(matches!(
            err,
            DeviceError::Backend {
                operation: Operation::OpenInEndpoint(1),
                ..
            }
        ));
        assert!(!hid.is_attached());
        assert_eq!(still_claimed(&dev.events()), 0);
        assert_eq!(
            dev.events(),
            vec![
                Event::ConfigClaimed(1),
                Event::InterfaceClaimed { number: 1, alt: 0 },
                Event::InterfaceReleased { number: 1, alt: 0 },
                Event::ConfigReleased(1),
            ]
        );
    }

    #[test]
    fn failed_reader_rolls_back_attachment() {
        let dev = memory();
        dev.inject(Fault::OpenReader);
        let mut hid = open(&dev);

        let err = hid.set_target(1, 1, 0).unwrap_err();
        assert!(matches!(
            err,
            DeviceError::Backend {
                operation: Operation::OpenReader(1),
                ..
            }
        ));
        assert!(!hid.is_attached());
        assert_eq!(still_claimed(&dev.events()), 0);
        assert!(!dev.events().iter().any(|event| matches!(
            event,
            Event::ReaderOpened { .. } | Event::WriterOpened { .. }
        )));

        // The device is usable again once the fault is gone.
        dev.clear(Fault::OpenReader);
        hid.set_target(1, 1, 0).unwrap();
        assert!(hid.is_attached());
    }

    #[test]
    fn failed_retarget_discards_previous_attachment() {
        let dev = memory();
        let mut hid = open(&dev);
        hid.set_target(1, 1, 0).unwrap();
        dev.clear_events();
        dev.inject(Fault::ClaimInterface);

        let err = hid.set_target(1, 3, 0).unwrap_err();
        assert!(matches!(
            err,
            DeviceError::Backend {
                operation: Operation::ClaimInterface { number: 3, alt: 0 },
                ..
            }
        ));
        assert!(!hid.is_attached());
        assert!(!hid.device_info().is_resolved());
        assert_eq!(
            dev.events(),
            vec![
                Event::WriterClosed { address: 0x01 },
                Event::ReaderClosed { address: 0x81 },
                Event::InterfaceReleased { number: 1, alt: 0 },
                Event::ConfigReleased(1),
                Event::ConfigClaimed(1),
                Event::ConfigReleased(1),
            ]
        );
    }

    #[test]
    fn close_releases_in_order() {
        let dev = memory();
        let mut hid = open(&dev);
        hid.set_target(1, 1, 0).unwrap();
        dev.clear_events();

        hid.close().unwrap();
        assert_eq!(
            dev.events(),
            vec![
                Event::ReaderClosed { address: 0x81 },
                Event::WriterClosed { address: 0x01 },
                Event::InterfaceReleased { number: 1, alt: 0 },
                Event::ConfigReleased(1),
                Event::DeviceClosed,
            ]
        );
    }

    #[test]
    fn close_collects_every_failure() {
        let dev = memory();
        let mut hid = open(&dev);
        hid.set_target(1, 1, 0).unwrap();
        dev.inject(Fault::CloseReader);
        dev.inject(Fault::ReleaseConfig);
        dev.inject(Fault::CloseDevice);

        let Err(DeviceError::Close(err)) = hid.close() else {
            panic!("close should fail");
        };
        let operations: Vec<_> = err
            .failures()
            .iter()
            .map(|failure| match failure {
                DeviceError::Backend { operation, .. } => *operation,
                other => panic!("unexpected failure {:?}", other),
            })
            .collect();
        assert_eq!(
            operations,
            vec![
                Operation::CloseReader(1),
                Operation::ReleaseConfig(1),
                Operation::CloseDevice
            ]
        );
        assert!(err.to_string().contains("close stream reader for endpoint #1"));

        // Every resource was released regardless.
        assert!(dev.events().ends_with(&[
            Event::ReaderClosed { address: 0x81 },
            Event::WriterClosed { address: 0x01 },
            Event::InterfaceReleased { number: 1, alt: 0 },
            Event::ConfigReleased(1),
            Event::DeviceClosed,
        ]));
    }

    #[test]
    fn close_unattached_closes_only_device() {
        let dev = memory();
        let mut hid = open(&dev);

        hid.close().unwrap();
        assert_eq!(dev.events(), vec![Event::DeviceClosed]);

        // A second close is a no-op.
        hid.close().unwrap();
        assert_eq!(dev.events(), vec![Event::DeviceClosed]);
    }

    #[test]
    fn closed_device_rejects_operations() {
        let dev = memory();
        let mut hid = open(&dev);
        hid.set_target(1, 1, 0).unwrap();
        hid.close().unwrap();

        assert!(matches!(
            hid.set_target(1, 1, 0),
            Err(DeviceError::UninitializedDevice)
        ));
        assert!(matches!(
            hid.get_product(),
            Err(DeviceError::UninitializedDevice)
        ));
        assert!(matches!(
            block_on(hid.read_input(&CancellationToken::new(), &mut [0; 4])),
            Err(DeviceError::UninitializedDevice)
        ));
    }

    #[test]
    fn drop_releases_resources() {
        let dev = memory();
        let mut hid = open(&dev);
        hid.set_target(1, 1, 0).unwrap();
        dev.clear_events();

        drop(hid);
        assert_eq!(dev.events().len(), 5);
        assert_eq!(dev.events().last(), Some(&Event::DeviceClosed));
    }

    #[test]
    fn cancelled_transfers_report_partial_counts() {
        let dev = memory();
        let mut hid = open(&dev);
        hid.set_target(1, 1, 0).unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = block_on(hid.read_input(&cancel, &mut [0; 8])).unwrap_err();
        assert!(matches!(err, DeviceError::TransferCancelled { transferred: 0 }));

        dev.interrupt_writes_after(3);
        let err = block_on(hid.write_output(&CancellationToken::new(), &[0x00, 1, 2, 3, 4, 5]))
            .unwrap_err();
        assert!(matches!(err, DeviceError::TransferCancelled { transferred: 3 }));
        assert_eq!(err.transferred(), 3);
        assert_eq!(dev.take_output(), Some(vec![1, 2, 3]));
    }

    #[test]
    fn failed_transfers_keep_context() {
        let dev = memory();
        let mut hid = open(&dev);
        hid.set_target(1, 1, 0).unwrap();
        dev.inject(Fault::Read);

        let err = block_on(hid.read_input(&CancellationToken::new(), &mut [0; 8])).unwrap_err();
        assert!(matches!(
            err,
            DeviceError::Transfer {
                operation: Operation::ReadInput,
                vendor_id: 0xff01,
                ..
            }
        ));
        assert_eq!(err.transferred(), 0);
    }

    #[test]
    fn strings_and_identity() {
        let dev = memory()
            .with_identity("ntch.dev", "Echo", "0001")
            .with_string(4, "Made by ntch.dev");
        let hid = open(&dev);

        assert_eq!(hid.get_manufacturer().unwrap(), "ntch.dev");
        assert_eq!(hid.get_product().unwrap(), "Echo");
        assert_eq!(hid.get_serial_number().unwrap(), "0001");
        assert_eq!(hid.get_string_descriptor(4).unwrap(), "Made by ntch.dev");
        assert!(matches!(
            hid.get_string_descriptor(9),
            Err(DeviceError::Backend {
                operation: Operation::GetStringDescriptor(9),
                ..
            })
        ));
    }

    #[test]
    fn auto_detach() {
        let dev = memory();
        let hid = open(&dev);

        hid.set_auto_detach(true).unwrap();
        assert_eq!(dev.events(), vec![Event::AutoDetach(true)]);

        dev.inject(Fault::SetAutoDetach);
        let err = hid.set_auto_detach(true).unwrap_err();
        assert_eq!(
            err.to_string(),
            "unable to set auto detach for device ff01:0001"
        );
    }

    #[test]
    fn idle_and_protocol() {
        let dev = memory().on_control(|setup, data| match data {
            ControlData::In(buf) => {
                buf[0] = if setup.request == 0x02 { 0x7d } else { 0x01 };
                Ok(1)
            },
            ControlData::Out(_) => Ok(0),
        });
        let mut hid = open(&dev);
        hid.set_target(1, 1, 0).unwrap();

        hid.set_idle(Duration::from_millis(500), 0).unwrap();
        assert_eq!(hid.get_idle(0).unwrap(), Duration::from_millis(500));
        hid.set_protocol(Protocol::Boot).unwrap();
        assert_eq!(hid.get_protocol().unwrap(), Protocol::Report);

        let requests: Vec<_> = controls(&dev).into_iter().map(|(setup, _)| setup).collect();
        assert_eq!(
            requests,
            vec![
                setup(0x21, 0x0a, 0x7d00, 1),
                setup(0xa1, 0x02, 0x0000, 1),
                setup(0x21, 0x0b, 0x0000, 1),
                setup(0xa1, 0x03, 0x0000, 1),
            ]
        );
    }
}
