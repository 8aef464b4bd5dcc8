//! The capability surface this crate needs from a USB stack.
//!
//! The HID core never talks to a USB library directly. Instead, it drives
//! the traits of this module, which mirror the levels of a USB device:
//!
//! - [`UsbContext`]: lists and opens devices
//! - [`UsbDevice`]: an opened device, owning the default control endpoint
//! - [`UsbConfig`]: a claimed configuration
//! - [`UsbInterface`]: a claimed interface in one of its alternate settings
//! - [`InEndpoint`] / [`OutEndpoint`]: endpoints of a claimed interface
//! - [`StreamReader`] / [`StreamWriter`]: transfer streams on an endpoint
//!
//! Every acquisition has a paired release. Releasing consumes the resource,
//! so it cannot be used afterwards.
//!
//! Two implementations are provided: [`memory`], which simulates devices
//! entirely in memory, and `libusb` (behind the `libusb` feature), which
//! uses [`rusb`](https://docs.rs/rusb).

use std::{error::Error, sync::Arc};

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::{
    descriptor::{DeviceDescriptor, EndpointDescriptor},
    request::ControlSetup,
};

#[cfg(feature = "libusb")]
pub mod libusb;
pub mod memory;

/// An error returned by a backend implementation.
///
/// The core treats these as opaque and only wraps them with context.
pub type BackendError = Box<dyn Error + Send + Sync>;

/// Represents an error of a stream transfer.
///
/// Both variants carry the number of bytes transferred before the transfer
/// stopped.
#[derive(Debug, Error)]
pub enum StreamError {
    /// Indicates that the cancellation token was triggered.
    #[error("the transfer was cancelled after {transferred} bytes")]
    Cancelled { transferred: usize },

    /// Indicates that the backend failed to complete the transfer.
    #[error("the transfer failed after {transferred} bytes")]
    Failed {
        transferred: usize,
        #[source]
        source: BackendError,
    },
}

impl StreamError {
    /// The number of bytes transferred before the transfer stopped.
    pub fn transferred(&self) -> usize {
        match self {
            Self::Cancelled { transferred } => *transferred,
            Self::Failed { transferred, .. } => *transferred,
        }
    }
}

/// Represents the connection between this crate and the USB devices of the
/// local machine.
pub trait UsbContext: Send + Sync {
    /// Calls `visitor` once for every connected device.
    fn iterate_devices(
        &self,
        visitor: &mut dyn FnMut(Arc<DeviceDescriptor>),
    ) -> Result<(), BackendError>;

    /// Opens the first device matching the given vendor and product IDs.
    fn open_device(&self, vendor_id: u16, product_id: u16)
    -> Result<Box<dyn UsbDevice>, BackendError>;

    /// Releases the context.
    fn close(&self) -> Result<(), BackendError>;
}

impl<T: UsbContext + ?Sized> UsbContext for Arc<T> {
    fn iterate_devices(
        &self,
        visitor: &mut dyn FnMut(Arc<DeviceDescriptor>),
    ) -> Result<(), BackendError> {
        (**self).iterate_devices(visitor)
    }

    fn open_device(
        &self,
        vendor_id: u16,
        product_id: u16,
    ) -> Result<Box<dyn UsbDevice>, BackendError> {
        (**self).open_device(vendor_id, product_id)
    }

    fn close(&self) -> Result<(), BackendError> {
        (**self).close()
    }
}

impl<T: UsbContext + ?Sized> UsbContext for Box<T> {
    fn iterate_devices(
        &self,
        visitor: &mut dyn FnMut(Arc<DeviceDescriptor>),
    ) -> Result<(), BackendError> {
        (**self).iterate_devices(visitor)
    }

    fn open_device(
        &self,
        vendor_id: u16,
        product_id: u16,
    ) -> Result<Box<dyn UsbDevice>, BackendError> {
        (**self).open_device(vendor_id, product_id)
    }

    fn close(&self) -> Result<(), BackendError> {
        (**self).close()
    }
}

/// Represents an opened USB device.
pub trait UsbDevice: Send + Sync {
    /// Sets whether kernel drivers are detached automatically when an
    /// interface is claimed, and reattached when it is released.
    fn set_auto_detach(&self, auto_detach: bool) -> Result<(), BackendError>;

    /// Claims a configuration by its number.
    fn config(&self, number: u8) -> Result<Box<dyn UsbConfig>, BackendError>;

    /// Returns the descriptor tree of the device.
    fn descriptor(&self) -> Arc<DeviceDescriptor>;

    /// Performs a control transfer reading from the device into `buf`.
    ///
    /// Returns the exact amount of transferred bytes.
    fn control_in(&self, setup: ControlSetup, buf: &mut [u8]) -> Result<usize, BackendError>;

    /// Performs a control transfer writing `data` to the device.
    ///
    /// Returns the exact amount of transferred bytes.
    fn control_out(&self, setup: ControlSetup, data: &[u8]) -> Result<usize, BackendError>;

    /// Retrieves an indexed string descriptor.
    fn string_descriptor(&self, index: u8) -> Result<String, BackendError>;

    fn manufacturer(&self) -> Result<String, BackendError>;

    fn product(&self) -> Result<String, BackendError>;

    fn serial_number(&self) -> Result<String, BackendError>;

    /// Closes the device.
    fn close(self: Box<Self>) -> Result<(), BackendError>;
}

/// Represents a claimed configuration.
pub trait UsbConfig: Send + Sync {
    /// Claims an interface in the given alternate setting.
    fn interface(&self, number: u8, alt: u8) -> Result<Box<dyn UsbInterface>, BackendError>;

    /// Releases the configuration.
    fn close(self: Box<Self>) -> Result<(), BackendError>;
}

/// Represents a claimed interface.
pub trait UsbInterface: Send + Sync {
    /// Opens an IN endpoint by its number.
    fn in_endpoint(&self, number: u8) -> Result<Box<dyn InEndpoint>, BackendError>;

    /// Opens an OUT endpoint by its number.
    fn out_endpoint(&self, number: u8) -> Result<Box<dyn OutEndpoint>, BackendError>;

    /// Releases the interface.
    fn close(self: Box<Self>) -> Result<(), BackendError>;
}

/// Represents an IN endpoint of a claimed interface.
pub trait InEndpoint: Send + Sync {
    fn descriptor(&self) -> &EndpointDescriptor;

    /// Creates a stream reading from the endpoint using `lanes` concurrent
    /// transfers.
    fn new_stream(&self, lanes: usize) -> Result<Box<dyn StreamReader>, BackendError>;
}

/// Represents an OUT endpoint of a claimed interface.
pub trait OutEndpoint: Send + Sync {
    fn descriptor(&self) -> &EndpointDescriptor;

    /// Creates a stream writing to the endpoint using `lanes` concurrent
    /// transfers.
    fn new_stream(&self, lanes: usize) -> Result<Box<dyn StreamWriter>, BackendError>;
}

/// Reads data from an IN endpoint.
#[async_trait]
pub trait StreamReader: Send + Sync {
    /// Reads the next chunk of data into `buf`.
    ///
    /// If the chunk is larger than `buf`, the remainder is discarded.
    ///
    /// Returns the exact amount of read bytes on success.
    async fn read(
        &mut self,
        cancel: &CancellationToken,
        buf: &mut [u8],
    ) -> Result<usize, StreamError>;

    /// Stops the stream and releases its transfers.
    fn close(self: Box<Self>) -> Result<(), BackendError>;
}

/// Writes data to an OUT endpoint.
#[async_trait]
pub trait StreamWriter: Send + Sync {
    /// Writes `data` to the endpoint.
    ///
    /// Returns the exact amount of written bytes on success.
    async fn write(&mut self, cancel: &CancellationToken, data: &[u8])
    -> Result<usize, StreamError>;

    /// Flushes pending transfers, stops the stream and releases it.
    fn close(self: Box<Self>) -> Result<(), BackendError>;
}
