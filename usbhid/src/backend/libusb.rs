//! A backend talking to real devices through libusb, using [`rusb`].
//!
//! libusb transfers are blocking, so every stream runs its transfers on a
//! dedicated worker thread and hands the results over a bounded channel.
//! The capacity of that channel is the lane count of the stream.

use std::{
    sync::{
        Arc,
        PoisonError,
        RwLock,
        RwLockReadGuard,
        RwLockWriteGuard,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use async_trait::async_trait;
use futures::{FutureExt, select};
use rusb::{Context, DeviceHandle, UsbContext as _};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

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
    descriptor::{
        AltSetting,
        ConfigDescriptor,
        DeviceDescriptor,
        Direction,
        EndpointDescriptor,
        InterfaceDescriptor,
        Speed,
        TransferType,
    },
    request::ControlSetup,
};

/// The default timeout of control transfers and endpoint writes.
pub const DEFAULT_CONTROL_TIMEOUT: Duration = Duration::from_secs(1);

/// How long a read worker waits for data before checking whether it should
/// stop.
const POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Represents an error returned by the libusb backend.
#[derive(Debug, Error)]
pub enum LibusbError {
    #[error(transparent)]
    Usb(#[from] rusb::Error),

    #[error("no device {vendor_id:04x}:{product_id:04x} is connected")]
    NoSuchDevice { vendor_id: u16, product_id: u16 },

    #[error("interface #{number} has no alternate setting #{alt}")]
    NoSuchInterface { number: u8, alt: u8 },

    #[error("endpoint #{number} ({direction:?}) does not exist")]
    NoSuchEndpoint { number: u8, direction: Direction },

    #[error("the device declares no {0} string")]
    NoSuchString(&'static str),

    #[error("the device declares no string descriptor languages")]
    NoLanguage,

    #[error("kernel driver detachment is not supported on this platform")]
    DetachUnsupported,

    #[error("unable to spawn transfer worker")]
    Spawn(#[source] std::io::Error),

    #[error("the transfer worker panicked")]
    WorkerPanicked,

    #[error("the transfer worker stopped")]
    WorkerStopped,
}

/// A libusb context.
pub struct LibusbContext {
    context: Context,
    control_timeout: Duration,
}

impl LibusbContext {
    pub fn new() -> Result<Self, LibusbError> {
        Ok(Self {
            context: Context::new()?,
            control_timeout: DEFAULT_CONTROL_TIMEOUT,
        })
    }

    /// Sets the timeout of control transfers and endpoint writes of devices
    /// opened from now on.
    pub fn with_control_timeout(mut self, control_timeout: Duration) -> Self {
        self.control_timeout = control_timeout;
        self
    }
}

impl UsbContext for LibusbContext {
    fn iterate_devices(
        &self,
        visitor: &mut dyn FnMut(Arc<DeviceDescriptor>),
    ) -> Result<(), BackendError> {
        for device in self.context.devices()?.iter() {
            match read_descriptor(&device) {
                Ok(desc) => visitor(Arc::new(desc)),
                Err(err) => debug!(
                    bus = device.bus_number(),
                    address = device.address(),
                    %err,
                    "skipping device with unreadable descriptors"
                ),
            }
        }

        Ok(())
    }

    fn open_device(
        &self,
        vendor_id: u16,
        product_id: u16,
    ) -> Result<Box<dyn UsbDevice>, BackendError> {
        let devices = self.context.devices()?;
        let device = find_device(devices.iter(), vendor_id, product_id, |device| {
            device
                .device_descriptor()
                .map(|raw| (raw.vendor_id(), raw.product_id()))
        })
        .ok_or(LibusbError::NoSuchDevice {
            vendor_id,
            product_id,
        })?;

        let raw = device.device_descriptor()?;
        let descriptor = Arc::new(read_descriptor(&device)?);
        let handle = device.open()?;
        debug!(
            vendor_id,
            product_id,
            bus = descriptor.bus,
            address = descriptor.address,
            "opened device"
        );

        Ok(Box::new(LibusbDevice {
            shared: Arc::new(Shared {
                handle: RwLock::new(handle),
                descriptor,
                manufacturer: raw.manufacturer_string_index(),
                product: raw.product_string_index(),
                serial_number: raw.serial_number_string_index(),
                timeout: self.control_timeout,
            }),
        }))
    }

    fn close(&self) -> Result<(), BackendError> {
        // The libusb context is released once the last device opened from it
        // is dropped.
        Ok(())
    }
}

/// Picks the first device with the given IDs. Devices whose IDs cannot be
/// read are skipped.
fn find_device<D>(
    devices: impl IntoIterator<Item = D>,
    vendor_id: u16,
    product_id: u16,
    ids: impl Fn(&D) -> Result<(u16, u16), rusb::Error>,
) -> Option<D> {
    devices.into_iter().find(|device| match ids(device) {
        Ok(found) => found == (vendor_id, product_id),
        Err(err) => {
            debug!(%err, "skipping device with unreadable descriptor");
            false
        },
    })
}

fn read_descriptor(device: &rusb::Device<Context>) -> Result<DeviceDescriptor, rusb::Error> {
    let raw = device.device_descriptor()?;
    let speed = match device.speed() {
        rusb::Speed::Low => Speed::Low,
        rusb::Speed::Full => Speed::Full,
        rusb::Speed::High => Speed::High,
        rusb::Speed::Super => Speed::Super,
        rusb::Speed::SuperPlus => Speed::SuperPlus,
        _ => Speed::Unknown,
    };

    let mut configs = Vec::with_capacity(usize::from(raw.num_configurations()));
    for index in 0..raw.num_configurations() {
        let config = device.config_descriptor(index)?;
        configs.push(ConfigDescriptor {
            number: config.number(),
            self_powered: config.self_powered(),
            remote_wakeup: config.remote_wakeup(),
            max_power: config.max_power(),
            interfaces: config
                .interfaces()
                .map(|intf| InterfaceDescriptor {
                    number: intf.number(),
                    alt_settings: intf
                        .descriptors()
                        .map(|setting| AltSetting {
                            number: setting.interface_number(),
                            alternate: setting.setting_number(),
                            class: setting.class_code(),
                            sub_class: setting.sub_class_code(),
                            protocol: setting.protocol_code(),
                            endpoints: setting
                                .endpoint_descriptors()
                                .map(|ep| (ep.address(), endpoint(&ep, speed)))
                                .collect(),
                        })
                        .collect(),
                })
                .collect(),
        });
    }

    Ok(DeviceDescriptor {
        bus: device.bus_number(),
        address: device.address(),
        speed,
        usb_version: bcd(raw.usb_version()),
        device_version: bcd(raw.device_version()),
        vendor_id: raw.vendor_id(),
        product_id: raw.product_id(),
        class: raw.class_code(),
        sub_class: raw.sub_class_code(),
        protocol: raw.protocol_code(),
        max_control_packet_size: raw.max_packet_size(),
        configs,
    })
}

fn endpoint(ep: &rusb::EndpointDescriptor<'_>, speed: Speed) -> EndpointDescriptor {
    EndpointDescriptor {
        address: ep.address(),
        number: ep.number(),
        direction: match ep.direction() {
            rusb::Direction::In => Direction::In,
            rusb::Direction::Out => Direction::Out,
        },
        max_packet_size: ep.max_packet_size(),
        transfer_type: match ep.transfer_type() {
            rusb::TransferType::Control => TransferType::Control,
            rusb::TransferType::Isochronous => TransferType::Isochronous,
            rusb::TransferType::Bulk => TransferType::Bulk,
            rusb::TransferType::Interrupt => TransferType::Interrupt,
        },
        poll_interval: poll_interval(speed, ep.interval()),
    }
}

/// Converts a `bInterval` value into a duration.
///
/// Low and full speed devices count in frames of 1 ms. Faster devices use an
/// exponent over microframes of 125 µs.
fn poll_interval(speed: Speed, interval: u8) -> Duration {
    match speed {
        Speed::High | Speed::Super | Speed::SuperPlus => {
            Duration::from_micros(125u64 << (interval.clamp(1, 16) - 1))
        },
        _ => Duration::from_millis(u64::from(interval)),
    }
}

fn bcd(version: rusb::Version) -> u16 {
    (u16::from(version.major()) << 8)
        | (u16::from(version.minor() & 0x0f) << 4)
        | u16::from(version.sub_minor() & 0x0f)
}

struct Shared {
    handle: RwLock<DeviceHandle<Context>>,
    descriptor: Arc<DeviceDescriptor>,
    manufacturer: Option<u8>,
    product: Option<u8>,
    serial_number: Option<u8>,
    timeout: Duration,
}

impl Shared {
    /// Locks the handle for transfers, which may run concurrently.
    fn handle(&self) -> RwLockReadGuard<'_, DeviceHandle<Context>> {
        self.handle.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Locks the handle for changing the device state.
    fn handle_mut(&self) -> RwLockWriteGuard<'_, DeviceHandle<Context>> {
        self.handle.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn string(&self, index: u8) -> Result<String, BackendError> {
        let handle = self.handle();
        let language = handle
            .read_languages(self.timeout)?
            .first()
            .copied()
            .ok_or(LibusbError::NoLanguage)?;

        Ok(handle.read_string_descriptor(language, index, self.timeout)?)
    }
}

/// Decides whether a request to change auto detach has to reach libusb.
///
/// Disabling it on a platform without kernel driver detachment is a no-op.
fn detach_supported(auto_detach: bool, supported: bool) -> Result<bool, LibusbError> {
    match (auto_detach, supported) {
        (_, true) => Ok(true),
        (true, false) => Err(LibusbError::DetachUnsupported),
        (false, false) => Ok(false),
    }
}

struct LibusbDevice {
    shared: Arc<Shared>,
}

impl UsbDevice for LibusbDevice {
    fn set_auto_detach(&self, auto_detach: bool) -> Result<(), BackendError> {
        if detach_supported(auto_detach, rusb::supports_detach_kernel_driver())? {
            self.shared
                .handle_mut()
                .set_auto_detach_kernel_driver(auto_detach)?;
        }
        Ok(())
    }

    fn config(&self, number: u8) -> Result<Box<dyn UsbConfig>, BackendError> {
        let mut handle = self.shared.handle_mut();
        if handle.active_configuration()? != number {
            handle.set_active_configuration(number)?;
        }

        Ok(Box::new(LibusbConfig {
            shared: Arc::clone(&self.shared),
            number,
        }))
    }

    fn descriptor(&self) -> Arc<DeviceDescriptor> {
        Arc::clone(&self.shared.descriptor)
    }

    fn control_in(&self, setup: ControlSetup, buf: &mut [u8]) -> Result<usize, BackendError> {
        Ok(self.shared.handle().read_control(
            setup.request_type,
            setup.request,
            setup.value,
            setup.index,
            buf,
            self.shared.timeout,
        )?)
    }

    fn control_out(&self, setup: ControlSetup, data: &[u8]) -> Result<usize, BackendError> {
        Ok(self.shared.handle().write_control(
            setup.request_type,
            setup.request,
            setup.value,
            setup.index,
            data,
            self.shared.timeout,
        )?)
    }

    fn string_descriptor(&self, index: u8) -> Result<String, BackendError> {
        self.shared.string(index)
    }

    fn manufacturer(&self) -> Result<String, BackendError> {
        let index = self
            .shared
            .manufacturer
            .ok_or(LibusbError::NoSuchString("manufacturer"))?;
        self.shared.string(index)
    }

    fn product(&self) -> Result<String, BackendError> {
        let index = self
            .shared
            .product
            .ok_or(LibusbError::NoSuchString("product"))?;
        self.shared.string(index)
    }

    fn serial_number(&self) -> Result<String, BackendError> {
        let index = self
            .shared
            .serial_number
            .ok_or(LibusbError::NoSuchString("serial number"))?;
        self.shared.string(index)
    }

    fn close(self: Box<Self>) -> Result<(), BackendError> {
        // The handle is closed once the last config, interface and stream
        // sharing it is gone.
        Ok(())
    }
}

struct LibusbConfig {
    shared: Arc<Shared>,
    number: u8,
}

impl UsbConfig for LibusbConfig {
    fn interface(&self, number: u8, alt: u8) -> Result<Box<dyn UsbInterface>, BackendError> {
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
            .ok_or(LibusbError::NoSuchInterface { number, alt })?;

        let mut handle = self.shared.handle_mut();
        handle.claim_interface(number)?;
        if alt != 0 {
            if let Err(err) = handle.set_alternate_setting(number, alt) {
                if let Err(release) = handle.release_interface(number) {
                    warn!(number, %release, "unable to release interface");
                }
                return Err(err.into());
            }
        }

        Ok(Box::new(LibusbInterface {
            shared: Arc::clone(&self.shared),
            setting,
        }))
    }

    fn close(self: Box<Self>) -> Result<(), BackendError> {
        // libusb has nothing to release for a configuration.
        Ok(())
    }
}

struct LibusbInterface {
    shared: Arc<Shared>,
    setting: AltSetting,
}

impl LibusbInterface {
    fn endpoint(&self, number: u8, direction: Direction) -> Result<EndpointDescriptor, LibusbError> {
        self.setting
            .endpoint(number, direction)
            .cloned()
            .ok_or(LibusbError::NoSuchEndpoint { number, direction })
    }
}

impl UsbInterface for LibusbInterface {
    fn in_endpoint(&self, number: u8) -> Result<Box<dyn InEndpoint>, BackendError> {
        Ok(Box::new(LibusbInEndpoint {
            shared: Arc::clone(&self.shared),
            descriptor: self.endpoint(number, Direction::In)?,
        }))
    }

    fn out_endpoint(&self, number: u8) -> Result<Box<dyn OutEndpoint>, BackendError> {
        Ok(Box::new(LibusbOutEndpoint {
            shared: Arc::clone(&self.shared),
            descriptor: self.endpoint(number, Direction::Out)?,
        }))
    }

    fn close(self: Box<Self>) -> Result<(), BackendError> {
        self.shared
            .handle_mut()
            .release_interface(self.setting.number)?;
        Ok(())
    }
}

struct LibusbInEndpoint {
    shared: Arc<Shared>,
    descriptor: EndpointDescriptor,
}

impl InEndpoint for LibusbInEndpoint {
    fn descriptor(&self) -> &EndpointDescriptor {
        &self.descriptor
    }

    fn new_stream(&self, lanes: usize) -> Result<Box<dyn StreamReader>, BackendError> {
        let (tx, rx) = flume::bounded(lanes.max(1));
        let stop = Arc::new(AtomicBool::new(false));

        let worker = thread::Builder::new()
            .name(format!("usbhid-in-{:02x}", self.descriptor.address))
            .spawn({
                let shared = Arc::clone(&self.shared);
                let endpoint = self.descriptor.clone();
                let stop = Arc::clone(&stop);
                move || read_loop(&shared, &endpoint, &stop, &tx)
            })
            .map_err(LibusbError::Spawn)?;

        Ok(Box::new(LibusbStreamReader {
            rx,
            stop,
            worker: Some(worker),
        }))
    }
}

type Chunk = Result<Vec<u8>, rusb::Error>;

/// Reads from an IN endpoint until asked to stop or the endpoint fails.
fn read_loop(
    shared: &Shared,
    endpoint: &EndpointDescriptor,
    stop: &AtomicBool,
    tx: &flume::Sender<Chunk>,
) {
    let mut buf = vec![0u8; usize::from(endpoint.max_packet_size.max(1))];

    while !stop.load(Ordering::Relaxed) {
        let res = {
            let handle = shared.handle();
            match endpoint.transfer_type {
                TransferType::Bulk => handle.read_bulk(endpoint.address, &mut buf, POLL_TIMEOUT),
                _ => handle.read_interrupt(endpoint.address, &mut buf, POLL_TIMEOUT),
            }
        };

        let mut chunk = match res {
            Ok(len) => Ok(buf[..len].to_vec()),
            Err(rusb::Error::Timeout) => continue,
            Err(err) => Err(err),
        };
        let failed = chunk.is_err();

        // Wait for a free lane without missing a stop request.
        loop {
            match tx.send_timeout(chunk, POLL_TIMEOUT) {
                Ok(()) => break,
                Err(flume::SendTimeoutError::Timeout(back)) if !stop.load(Ordering::Relaxed) => {
                    chunk = back;
                },
                Err(_) => return,
            }
        }

        if failed {
            return;
        }
    }
}

struct LibusbStreamReader {
    rx: flume::Receiver<Chunk>,
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

#[async_trait]
impl StreamReader for LibusbStreamReader {
    async fn read(
        &mut self,
        cancel: &CancellationToken,
        buf: &mut [u8],
    ) -> Result<usize, StreamError> {
        let chunk = select! {
            _ = cancel.cancelled().fuse() => {
                return Err(StreamError::Cancelled { transferred: 0 });
            },
            res = self.rx.recv_async().fuse() => res,
        };

        match chunk {
            Ok(Ok(data)) => {
                let len = data.len().min(buf.len());
                buf[..len].copy_from_slice(&data[..len]);
                Ok(len)
            },
            Ok(Err(err)) => Err(StreamError::Failed {
                transferred: 0,
                source: err.into(),
            }),
            Err(_) => Err(StreamError::Failed {
                transferred: 0,
                source: LibusbError::WorkerStopped.into(),
            }),
        }
    }

    fn close(mut self: Box<Self>) -> Result<(), BackendError> {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(worker) = self.worker.take() {
            worker.join().map_err(|_| LibusbError::WorkerPanicked)?;
        }
        Ok(())
    }
}

impl Drop for LibusbStreamReader {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

struct LibusbOutEndpoint {
    shared: Arc<Shared>,
    descriptor: EndpointDescriptor,
}

impl OutEndpoint for LibusbOutEndpoint {
    fn descriptor(&self) -> &EndpointDescriptor {
        &self.descriptor
    }

    fn new_stream(&self, lanes: usize) -> Result<Box<dyn StreamWriter>, BackendError> {
        let (jobs, rx) = flume::bounded(lanes.max(1));

        let worker = thread::Builder::new()
            .name(format!("usbhid-out-{:02x}", self.descriptor.address))
            .spawn({
                let shared = Arc::clone(&self.shared);
                let endpoint = self.descriptor.clone();
                move || write_loop(&shared, &endpoint, &rx)
            })
            .map_err(LibusbError::Spawn)?;

        Ok(Box::new(LibusbStreamWriter {
            jobs: Some(jobs),
            worker: Some(worker),
        }))
    }
}

struct WriteJob {
    data: Vec<u8>,
    cancel: CancellationToken,
    reply: flume::Sender<Result<usize, StreamError>>,
}

/// Writes queued jobs to an OUT endpoint until the queue is closed.
fn write_loop(shared: &Shared, endpoint: &EndpointDescriptor, jobs: &flume::Receiver<WriteJob>) {
    for job in jobs.iter() {
        let res = if job.cancel.is_cancelled() {
            Err(StreamError::Cancelled { transferred: 0 })
        } else {
            let handle = shared.handle();
            let written = match endpoint.transfer_type {
                TransferType::Bulk => handle.write_bulk(endpoint.address, &job.data, shared.timeout),
                _ => handle.write_interrupt(endpoint.address, &job.data, shared.timeout),
            };
            written.map_err(|err| StreamError::Failed {
                transferred: 0,
                source: err.into(),
            })
        };

        // The writer stops waiting for the reply when it is cancelled.
        let _ = job.reply.send(res);
    }
}

/// Writes to an OUT endpoint.
///
/// A write cancelled after the worker picked it up may still reach the
/// device.
struct LibusbStreamWriter {
    jobs: Option<flume::Sender<WriteJob>>,
    worker: Option<JoinHandle<()>>,
}

#[async_trait]
impl StreamWriter for LibusbStreamWriter {
    async fn write(
        &mut self,
        cancel: &CancellationToken,
        data: &[u8],
    ) -> Result<usize, StreamError> {
        if cancel.is_cancelled() {
            return Err(StreamError::Cancelled { transferred: 0 });
        }
        let Some(jobs) = &self.jobs else {
            return Err(StreamError::Failed {
                transferred: 0,
                source: LibusbError::WorkerStopped.into(),
            });
        };

        let (reply, response) = flume::bounded(1);
        let job = WriteJob {
            data: data.to_vec(),
            cancel: cancel.clone(),
            reply,
        };

        select! {
            _ = cancel.cancelled().fuse() => {
                return Err(StreamError::Cancelled { transferred: 0 });
            },
            res = jobs.send_async(job).fuse() => {
                if res.is_err() {
                    return Err(StreamError::Failed {
                        transferred: 0,
                        source: LibusbError::WorkerStopped.into(),
                    });
                }
            },
        }

        select! {
            _ = cancel.cancelled().fuse() => Err(StreamError::Cancelled { transferred: 0 }),
            res = response.recv_async().fuse() => match res {
                Ok(res) => res,
                Err(_) => Err(StreamError::Failed {
                    transferred: 0,
                    source: LibusbError::WorkerStopped.into(),
                }),
            },
        }
    }

    fn close(mut self: Box<Self>) -> Result<(), BackendError> {
        // Closing the queue lets the worker finish what is pending and exit.
        drop(self.jobs.take());
        if let Some(worker) = self.worker.take() {
            worker.join().map_err(|_| LibusbError::WorkerPanicked)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poll_intervals() {
        assert_eq!(poll_interval(Speed::Full, 10), Duration::from_millis(10));
        assert_eq!(poll_interval(Speed::Low, 0), Duration::ZERO);
        assert_eq!(poll_interval(Speed::High, 1), Duration::from_micros(125));
        assert_eq!(poll_interval(Speed::High, 4), Duration::from_millis(1));
        assert_eq!(poll_interval(Speed::Super, 0), Duration::from_micros(125));
    }

    #[test]
    fn auto_detach_without_platform_support() {
        assert!(detach_supported(true, true).unwrap());
        assert!(detach_supported(false, true).unwrap());
        assert!(!detach_supported(false, false).unwrap());
        assert!(matches!(
            detach_supported(true, false),
            Err(LibusbError::DetachUnsupported)
        ));
    }

    #[test]
    fn unreadable_devices_are_skipped_when_opening() {
        let devices = [
            Err(rusb::Error::Io),
            Ok((0x1234, 0x0001)),
            Err(rusb::Error::Access),
            Ok((0x046d, 0xc52b)),
            Ok((0x046d, 0xc52b)),
        ];
        let ids = |device: &(usize, Result<(u16, u16), rusb::Error>)| device.1;

        let found = find_device(devices.iter().copied().enumerate(), 0x046d, 0xc52b, ids);
        assert_eq!(found.map(|(index, _)| index), Some(3));

        let found = find_device(devices.iter().copied().enumerate(), 0x046d, 0x0001, ids);
        assert!(found.is_none());
    }

    #[test]
    fn versions_as_bcd() {
        for version in [0x0200, 0x0110, 0x0321] {
            assert_eq!(bcd(rusb::Version::from_bcd(version)), version);
        }
    }
}
