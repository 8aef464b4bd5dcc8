//! A backend simulating USB devices in memory.
//!
//! Devices are built from a [`DeviceDescriptor`] and can be scripted:
//! control transfers are answered by a handler, input reports are queued with
//! [`MemoryDevice::push_input`] and output reports written to interrupt
//! endpoints are collected by [`MemoryDevice::take_output`]. Every claim,
//! release and transfer is recorded in a journal ([`MemoryDevice::events`]),
//! and any operation can be made to fail using [`MemoryDevice::inject`].

use std::{
    collections::{HashMap, HashSet},
    sync::{
        Arc,
        Mutex,
        MutexGuard,
        PoisonError,
        atomic::{AtomicBool, Ordering},
    },
};

use async_trait::async_trait;
use futures::{FutureExt, select};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use super::{
    BackendError,
    InEndpoint,
    OutEndpoint,
    StreamError,
    StreamReader,
    StreamWriter,
    UsbConfig,
    UsbContext,
    UsbDevice,
    UsbInterface,
};
use crate::{
    descriptor::{AltSetting, DeviceDescriptor, Direction, EndpointDescriptor},
    request::ControlSetup,
};

/// An operation of the simulated device that can be made to fail.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Fault {
    SetAutoDetach,
    ClaimConfig,
    ClaimInterface,
    OpenInEndpoint,
    OpenOutEndpoint,
    OpenReader,
    OpenWriter,
    Read,
    Write,
    Control,
    StringDescriptor,
    CloseReader,
    CloseWriter,
    ReleaseInterface,
    ReleaseConfig,
    CloseDevice,
}

/// An entry of the journal of a simulated device.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Event {
    AutoDetach(bool),
    ConfigClaimed(u8),
    ConfigReleased(u8),
    InterfaceClaimed { number: u8, alt: u8 },
    InterfaceReleased { number: u8, alt: u8 },
    ReaderOpened { address: u8, lanes: usize },
    ReaderClosed { address: u8 },
    WriterOpened { address: u8, lanes: usize },
    WriterClosed { address: u8 },

    /// A control transfer. `data` holds the outgoing payload, or the content
    /// of the buffer handed in for incoming transfers.
    Control { setup: ControlSetup, data: Vec<u8> },

    DeviceClosed,
}

/// The data stage of a control transfer handed to a [`ControlHandler`].
pub enum ControlData<'a> {
    In(&'a mut [u8]),
    Out(&'a [u8]),
}

/// Answers control transfers of a simulated device.
///
/// Returns the amount of transferred bytes.
pub type ControlHandler =
    Box<dyn FnMut(&ControlSetup, ControlData<'_>) -> Result<usize, BackendError> + Send>;

/// Represents an error returned by the memory backend.
#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("injected fault: {0:?}")]
    Fault(Fault),

    #[error("no device {vendor_id:04x}:{product_id:04x} is connected")]
    NoSuchDevice { vendor_id: u16, product_id: u16 },

    #[error("configuration #{0} does not exist")]
    NoSuchConfig(u8),

    #[error("interface #{number} has no alternate setting #{alt}")]
    NoSuchInterface { number: u8, alt: u8 },

    #[error("endpoint #{number} ({direction:?}) does not exist")]
    NoSuchEndpoint { number: u8, direction: Direction },

    #[error("string descriptor #{0} does not exist")]
    NoSuchString(u8),

    #[error("the device was closed")]
    Closed,

    #[error("device enumeration failed")]
    Enumeration,
}

#[derive(Default)]
struct State {
    strings: HashMap<u8, String>,
    manufacturer: Option<u8>,
    product: Option<u8>,
    serial_number: Option<u8>,
    control: Option<ControlHandler>,
    faults: HashSet<Fault>,
    events: Vec<Event>,
    write_limit: Option<usize>,
}

struct Shared {
    descriptor: Arc<DeviceDescriptor>,
    state: Mutex<State>,
    input: (flume::Sender<Vec<u8>>, flume::Receiver<Vec<u8>>),
    output: (flume::Sender<Vec<u8>>, flume::Receiver<Vec<u8>>),
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, event: Event) {
        self.state().events.push(event);
    }

    fn check(&self, fault: Fault) -> Result<(), MemoryError> {
        if self.state().faults.contains(&fault) {
            Err(MemoryError::Fault(fault))
        } else {
            Ok(())
        }
    }

    fn string(&self, index: Option<u8>) -> Result<String, BackendError> {
        self.check(Fault::StringDescriptor)?;
        let index = index.unwrap_or(0);
        self.state()
            .strings
            .get(&index)
            .cloned()
            .ok_or_else(|| MemoryError::NoSuchString(index).into())
    }
}

/// A simulated USB device.
///
/// Clones share the same state, so a test can keep a handle to the device
/// while the code under test owns the opened connection.
#[derive(Clone)]
pub struct MemoryDevice {
    shared: Arc<Shared>,
}

impl MemoryDevice {
    /// Creates a device answering every incoming control transfer with zero
    /// bytes and accepting every outgoing one.
    pub fn new(descriptor: DeviceDescriptor) -> Self {
        Self {
            shared: Arc::new(Shared {
                descriptor: Arc::new(descriptor),
                state: Mutex::new(State::default()),
                input: flume::unbounded(),
                output: flume::unbounded(),
            }),
        }
    }

    /// Registers a string descriptor.
    pub fn with_string(self, index: u8, value: impl Into<String>) -> Self {
        self.shared.state().strings.insert(index, value.into());
        self
    }

    /// Registers the manufacturer, product and serial number strings at the
    /// indices 1, 2 and 3.
    pub fn with_identity(self, manufacturer: &str, product: &str, serial_number: &str) -> Self {
        {
            let mut state = self.shared.state();
            state.manufacturer = Some(1);
            state.product = Some(2);
            state.serial_number = Some(3);
        }

        self.with_string(1, manufacturer)
            .with_string(2, product)
            .with_string(3, serial_number)
    }

    /// Installs the handler answering control transfers.
    pub fn on_control(
        self,
        handler: impl FnMut(&ControlSetup, ControlData<'_>) -> Result<usize, BackendError>
        + Send
        + 'static,
    ) -> Self {
        self.shared.state().control = Some(Box::new(handler));
        self
    }

    /// Makes an operation fail from now on.
    pub fn inject(&self, fault: Fault) {
        self.shared.state().faults.insert(fault);
    }

    /// Makes an operation succeed again.
    pub fn clear(&self, fault: Fault) {
        self.shared.state().faults.remove(&fault);
    }

    /// Makes every following write stop after `bytes` bytes, as if it was
    /// cancelled while in flight.
    pub fn interrupt_writes_after(&self, bytes: usize) {
        self.shared.state().write_limit = Some(bytes);
    }

    /// Queues a chunk of data to be returned by the next read of any IN
    /// stream.
    pub fn push_input(&self, data: impl Into<Vec<u8>>) {
        // The receiving end lives as long as `self`.
        let _ = self.shared.input.0.send(data.into());
    }

    /// Takes the oldest chunk written to any OUT stream.
    pub fn take_output(&self) -> Option<Vec<u8>> {
        self.shared.output.1.try_recv().ok()
    }

    /// Returns a copy of the journal.
    pub fn events(&self) -> Vec<Event> {
        self.shared.state().events.clone()
    }

    /// Empties the journal.
    pub fn clear_events(&self) {
        self.shared.state().events.clear();
    }

    pub fn descriptor(&self) -> Arc<DeviceDescriptor> {
        Arc::clone(&self.shared.descriptor)
    }

    /// Opens a connection to the device without going through a context.
    pub fn open(&self) -> Box<dyn UsbDevice> {
        Box::new(MemoryHandle {
            shared: Arc::clone(&self.shared),
        })
    }
}

/// A context listing a fixed set of simulated devices.
pub struct MemoryContext {
    devices: Vec<MemoryDevice>,
    fail_iteration: AtomicBool,
    closed: AtomicBool,
}

impl MemoryContext {
    pub fn new(devices: impl IntoIterator<Item = MemoryDevice>) -> Self {
        Self {
            devices: devices.into_iter().collect(),
            fail_iteration: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    /// Makes device iteration fail.
    pub fn fail_iteration(&self) {
        self.fail_iteration.store(true, Ordering::SeqCst);
    }

    /// Whether [`UsbContext::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl UsbContext for MemoryContext {
    fn iterate_devices(
        &self,
        visitor: &mut dyn FnMut(Arc<DeviceDescriptor>),
    ) -> Result<(), BackendError> {
        if self.fail_iteration.load(Ordering::SeqCst) {
            return Err(MemoryError::Enumeration.into());
        }

        for device in &self.devices {
            visitor(device.descriptor());
        }

        Ok(())
    }

    fn open_device(
        &self,
        vendor_id: u16,
        product_id: u16,
    ) -> Result<Box<dyn UsbDevice>, BackendError> {
        self.devices
            .iter()
            .find(|dev| {
                dev.shared.descriptor.vendor_id == vendor_id
                    && dev.shared.descriptor.product_id == product_id
            })
            .map(MemoryDevice::open)
            .ok_or_else(|| {
                MemoryError::NoSuchDevice {
                    vendor_id,
                    product_id,
                }
                .into()
            })
    }

    fn close(&self) -> Result<(), BackendError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct MemoryHandle {
    shared: Arc<Shared>,
}

impl MemoryHandle {
    fn control(&self, setup: ControlSetup, data: ControlData<'_>) -> Result<usize, BackendError> {
        let snapshot = match &data {
            ControlData::In(buf) => buf.to_vec(),
            ControlData::Out(buf) => buf.to_vec(),
        };
        self.shared.record(Event::Control {
            setup,
            data: snapshot,
        });
        self.shared.check(Fault::Control)?;

        let mut state = self.shared.state();
        match (state.control.as_mut(), data) {
            (Some(handler), data) => handler(&setup, data),
            (None, ControlData::In(_)) => Ok(0),
            (None, ControlData::Out(data)) => Ok(data.len()),
        }
    }
}

impl UsbDevice for MemoryHandle {
    fn set_auto_detach(&self, auto_detach: bool) -> Result<(), BackendError> {
        self.shared.check(Fault::SetAutoDetach)?;
        self.shared.record(Event::AutoDetach(auto_detach));
        Ok(())
    }

    fn config(&self, number: u8) -> Result<Box<dyn UsbConfig>, BackendError> {
        self.shared.check(Fault::ClaimConfig)?;
        if !self
            .shared
            .descriptor
            .configs
            .iter()
            .any(|config| config.number == number)
        {
            return Err(MemoryError::NoSuchConfig(number).into());
        }

        self.shared.record(Event::ConfigClaimed(number));
        Ok(Box::new(MemoryConfig {
            shared: Arc::clone(&self.shared),
            number,
        }))
    }

    fn descriptor(&self) -> Arc<DeviceDescriptor> {
        Arc::clone(&self.shared.descriptor)
    }

    fn control_in(&self, setup: ControlSetup, buf: &mut [u8]) -> Result<usize, BackendError> {
        self.control(setup, ControlData::In(buf))
    }

    fn control_out(&self, setup: ControlSetup, data: &[u8]) -> Result<usize, BackendError> {
        self.control(setup, ControlData::Out(data))
    }

    fn string_descriptor(&self, index: u8) -> Result<String, BackendError> {
        self.shared.string(Some(index))
    }

    fn manufacturer(&self) -> Result<String, BackendError> {
        let index = self.shared.state().manufacturer;
        self.shared.string(index)
    }

    fn product(&self) -> Result<String, BackendError> {
        let index = self.shared.state().product;
        self.shared.string(index)
    }

    fn serial_number(&self) -> Result<String, BackendError> {
        let index = self.shared.state().serial_number;
        self.shared.string(index)
    }

    fn close(self: Box<Self>) -> Result<(), BackendError> {
        self.shared.record(Event::DeviceClosed);
        self.shared.check(Fault::CloseDevice)?;
        Ok(())
    }
}

struct MemoryConfig {
    shared: Arc<Shared>,
    number: u8,
}

impl UsbConfig for MemoryConfig {
    fn interface(&self, number: u8, alt: u8) -> Result<Box<dyn UsbInterface>, BackendError> {
        self.shared.check(Fault::ClaimInterface)?;

        let setting = self
            .shared
            .descriptor
            .configs
            .iter()
            .filter(|config| config.number == self.number)
            .flat_map(|config| &config.interfaces)
            .filter(|intf| intf.number == number)
            .flat_map(|intf| &intf.alt_settings)
            .find(|setting| setting.alternate == alt)
            .cloned()
            .ok_or(MemoryError::NoSuchInterface { number, alt })?;

        self.shared
            .record(Event::InterfaceClaimed { number, alt });
        Ok(Box::new(MemoryInterface {
            shared: Arc::clone(&self.shared),
            setting,
        }))
    }

    fn close(self: Box<Self>) -> Result<(), BackendError> {
        self.shared.record(Event::ConfigReleased(self.number));
        self.shared.check(Fault::ReleaseConfig)?;
        Ok(())
    }
}

struct MemoryInterface {
    shared: Arc<Shared>,
    setting: AltSetting,
}

impl MemoryInterface {
    fn endpoint(&self, number: u8, direction: Direction) -> Result<EndpointDescriptor, MemoryError> {
        self.setting
            .endpoint(number, direction)
            .cloned()
            .ok_or(MemoryError::NoSuchEndpoint { number, direction })
    }
}

impl UsbInterface for MemoryInterface {
    fn in_endpoint(&self, number: u8) -> Result<Box<dyn InEndpoint>, BackendError> {
        self.shared.check(Fault::OpenInEndpoint)?;
        Ok(Box::new(MemoryInEndpoint {
            shared: Arc::clone(&self.shared),
            descriptor: self.endpoint(number, Direction::In)?,
        }))
    }

    fn out_endpoint(&self, number: u8) -> Result<Box<dyn OutEndpoint>, BackendError> {
        self.shared.check(Fault::OpenOutEndpoint)?;
        Ok(Box::new(MemoryOutEndpoint {
            shared: Arc::clone(&self.shared),
            descriptor: self.endpoint(number, Direction::Out)?,
        }))
    }

    fn close(self: Box<Self>) -> Result<(), BackendError> {
        self.shared.record(Event::InterfaceReleased {
            number: self.setting.number,
            alt: self.setting.alternate,
        });
        self.shared.check(Fault::ReleaseInterface)?;
        Ok(())
    }
}

struct MemoryInEndpoint {
    shared: Arc<Shared>,
    descriptor: EndpointDescriptor,
}

impl InEndpoint for MemoryInEndpoint {
    fn descriptor(&self) -> &EndpointDescriptor {
        &self.descriptor
    }

    fn new_stream(&self, lanes: usize) -> Result<Box<dyn StreamReader>, BackendError> {
        self.shared.check(Fault::OpenReader)?;
        self.shared.record(Event::ReaderOpened {
            address: self.descriptor.address,
            lanes: lanes.max(1),
        });

        Ok(Box::new(MemoryStreamReader {
            shared: Arc::clone(&self.shared),
            address: self.descriptor.address,
            input: self.shared.input.1.clone(),
        }))
    }
}

struct MemoryOutEndpoint {
    shared: Arc<Shared>,
    descriptor: EndpointDescriptor,
}

impl OutEndpoint for MemoryOutEndpoint {
    fn descriptor(&self) -> &EndpointDescriptor {
        &self.descriptor
    }

    fn new_stream(&self, lanes: usize) -> Result<Box<dyn StreamWriter>, BackendError> {
        self.shared.check(Fault::OpenWriter)?;
        self.shared.record(Event::WriterOpened {
            address: self.descriptor.address,
            lanes: lanes.max(1),
        });

        Ok(Box::new(MemoryStreamWriter {
            shared: Arc::clone(&self.shared),
            address: self.descriptor.address,
            output: self.shared.output.0.clone(),
        }))
    }
}

struct MemoryStreamReader {
    shared: Arc<Shared>,
    address: u8,
    input: flume::Receiver<Vec<u8>>,
}

#[async_trait]
impl StreamReader for MemoryStreamReader {
    async fn read(
        &mut self,
        cancel: &CancellationToken,
        buf: &mut [u8],
    ) -> Result<usize, StreamError> {
        if let Err(err) = self.shared.check(Fault::Read) {
            return Err(StreamError::Failed {
                transferred: 0,
                source: err.into(),
            });
        }

        let chunk = select! {
            _ = cancel.cancelled().fuse() => {
                return Err(StreamError::Cancelled { transferred: 0 });
            },
            res = self.input.recv_async().fuse() => res,
        };

        let Ok(chunk) = chunk else {
            return Err(StreamError::Failed {
                transferred: 0,
                source: MemoryError::Closed.into(),
            });
        };

        let len = chunk.len().min(buf.len());
        buf[..len].copy_from_slice(&chunk[..len]);
        Ok(len)
    }

    fn close(self: Box<Self>) -> Result<(), BackendError> {
        self.shared.record(Event::ReaderClosed {
            address: self.address,
        });
        self.shared.check(Fault::CloseReader)?;
        Ok(())
    }
}

struct MemoryStreamWriter {
    shared: Arc<Shared>,
    address: u8,
    output: flume::Sender<Vec<u8>>,
}

#[async_trait]
impl StreamWriter for MemoryStreamWriter {
    async fn write(
        &mut self,
        cancel: &CancellationToken,
        data: &[u8],
    ) -> Result<usize, StreamError> {
        if cancel.is_cancelled() {
            return Err(StreamError::Cancelled { transferred: 0 });
        }
        if let Err(err) = self.shared.check(Fault::Write) {
            return Err(StreamError::Failed {
                transferred: 0,
                source: err.into(),
            });
        }

        let limit = self.shared.state().write_limit;
        let len = limit.map_or(data.len(), |limit| limit.min(data.len()));
        if self.output.send(data[..len].to_vec()).is_err() {
            return Err(StreamError::Failed {
                transferred: 0,
                source: MemoryError::Closed.into(),
            });
        }

        match limit {
            Some(_) => Err(StreamError::Cancelled { transferred: len }),
            None => Ok(len),
        }
    }

    fn close(self: Box<Self>) -> Result<(), BackendError> {
        self.shared.record(Event::WriterClosed {
            address: self.address,
        });
        self.shared.check(Fault::CloseWriter)?;
        Ok(())
    }
}
