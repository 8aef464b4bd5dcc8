//! Talk to USB HID devices by claiming their interfaces directly.
//!
//! Operating systems usually expose HID devices through a kernel driver
//! (`hidraw`, `IOHIDManager`, `hid.dll`) that owns the device and hides its
//! USB structure. This crate skips that layer: it claims a HID interface like
//! any other USB interface, reads input reports from its interrupt IN
//! endpoint, writes output reports to its interrupt OUT endpoint and issues
//! the HID class requests (`GET_REPORT`, `SET_REPORT`, `GET_DESCRIPTOR` and
//! friends) on the default control endpoint.
//!
//! This is useful for devices without a HID driver, for devices whose driver
//! should be bypassed, and for looking at the raw descriptors of a device.
//!
//! # Quickstart
//!
//! ## Pick a backend
//!
//! The crate does not talk to a USB stack itself. Everything it needs from
//! one is described by the traits of [`backend`], starting with
//! [`backend::UsbContext`]. Two implementations are included:
//!
//! - [`backend::memory`] simulates devices and is what the tests of this crate
//!   run against.
//! - `backend::libusb`, enabled by the `libusb` feature, talks to real
//!   devices through [`rusb`](https://crates.io/crates/rusb).
//!
//! Stream transfers are async methods defined using [`mod@async_trait`], which
//! is re-exported for annotating your own backend types.
//!
//! ## Find and attach a device
//!
//! ```ignore
//! use usbhid::{
//!     CancellationToken,
//!     Manager,
//!     backend::libusb::LibusbContext,
//!     device::DeviceConfig,
//! };
//!
//! let manager = Manager::new(LibusbContext::new().expect("could not open libusb"));
//!
//! // Every HID alternate setting of every matching device is listed as a
//! // profile. A vendor or product ID of `0` matches any device.
//! let profiles = manager.enumerate(0x046d, 0).expect("could not enumerate");
//! print!("{}", profiles);
//!
//! // Opening a device does not claim anything yet.
//! let mut device = manager
//!     .open(0x046d, 0xc52b, DeviceConfig::default())
//!     .expect("could not open device");
//!
//! // Kernels usually bind their own HID driver, which has to let go first.
//! device.set_auto_detach(true).expect("could not enable auto detach");
//!
//! // Claim configuration #1, interface #2 in its alternate setting #0.
//! device.set_target(1, 2, 0).expect("could not attach interface");
//!
//! // The first byte of every report is its report ID. `0x00` means the
//! // device only uses a single report and is not sent over the wire.
//! let cancel = CancellationToken::new();
//! device
//!     .write_output(&cancel, &[0x10, 0xff, 0x00, 0x00])
//!     .await
//!     .expect("could not write report");
//!
//! let mut buf = [0u8; 64];
//! let len = device
//!     .read_input(&cancel, &mut buf)
//!     .await
//!     .expect("could not read report");
//! println!("{:02x?}", &buf[..len]);
//!
//! // Cancelling the token from another task aborts pending transfers. The
//! // error reports how many bytes made it through until then.
//!
//! device.close().expect("could not release device");
//! ```

pub use async_trait::async_trait;
pub use tokio_util::sync::CancellationToken;

pub mod backend;
pub mod descriptor;
pub mod device;
pub mod manager;
pub mod profile;
pub mod request;

pub use device::{DeviceConfig, DeviceError, HidDevice};
pub use manager::{Manager, ManagerError};
pub use profile::{DeviceInfo, DeviceInfos, ProfileError};
