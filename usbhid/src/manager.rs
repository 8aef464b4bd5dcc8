//! Implements listing and opening HID devices of a [`UsbContext`].

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, error};

use crate::{
    backend::{BackendError, UsbContext},
    device::{DeviceConfig, HidDevice},
    profile::{DeviceInfo, DeviceInfos, ProfileError},
};

/// The entry point of the crate.
///
/// A manager owns a backend context. It lists the HID alternate settings of
/// the connected devices and opens devices as [`HidDevice`]s.
pub struct Manager<C: UsbContext> {
    context: C,
}

impl<C: UsbContext> Manager<C> {
    pub fn new(context: C) -> Self {
        Self { context }
    }

    pub fn context(&self) -> &C {
        &self.context
    }

    /// Lists one profile per HID alternate setting of every connected device
    /// matching the given IDs. An ID of `0` matches any device.
    ///
    /// A device whose descriptor cannot be resolved is logged and left out.
    /// Only a failure of the device iteration itself is returned.
    pub fn enumerate(&self, vendor_id: u16, product_id: u16) -> Result<DeviceInfos, ManagerError> {
        let mut infos = Vec::new();

        self.context
            .iterate_devices(&mut |desc| {
                if (vendor_id != 0 && desc.vendor_id != vendor_id)
                    || (product_id != 0 && desc.product_id != product_id)
                {
                    return;
                }

                let profiles: Result<Vec<_>, ProfileError> = desc
                    .hid_settings()
                    .map(|(config, interface, setting)| {
                        DeviceInfo::from_device_descriptor(
                            Arc::clone(&desc),
                            config,
                            interface,
                            setting.alternate,
                        )
                    })
                    .collect();

                match profiles {
                    Ok(profiles) => {
                        debug!(
                            vendor_id = desc.vendor_id,
                            product_id = desc.product_id,
                            count = profiles.len(),
                            "found HID profiles"
                        );
                        infos.extend(profiles);
                    },
                    Err(err) => error!(
                        vendor_id = desc.vendor_id,
                        product_id = desc.product_id,
                        %err,
                        "unable to resolve device profiles"
                    ),
                }
            })
            .map_err(|source| ManagerError::Enumerate {
                vendor_id,
                product_id,
                source,
            })?;

        Ok(DeviceInfos(infos))
    }

    /// Opens the first device matching the given IDs.
    ///
    /// No interface is claimed yet, see [`HidDevice::set_target`].
    pub fn open(
        &self,
        vendor_id: u16,
        product_id: u16,
        config: DeviceConfig,
    ) -> Result<HidDevice, ManagerError> {
        let device = self
            .context
            .open_device(vendor_id, product_id)
            .map_err(|source| ManagerError::Open {
                vendor_id,
                product_id,
                source,
            })?;

        Ok(HidDevice::new(device, config))
    }

    /// Closes the backend context.
    ///
    /// Devices opened before stay usable as far as the backend allows.
    pub fn close(self) -> Result<(), ManagerError> {
        self.context.close().map_err(ManagerError::Close)
    }
}

/// Represents an error that occurred when listing or opening devices.
#[derive(Debug, Error)]
pub enum ManagerError {
    /// Indicates that the backend was unable to iterate devices.
    #[error("unable to enumerate devices {vendor_id:04x}:{product_id:04x}")]
    Enumerate {
        vendor_id: u16,
        product_id: u16,
        #[source]
        source: BackendError,
    },

    /// Indicates that the backend was unable to open a device.
    #[error("unable to open device {vendor_id:04x}:{product_id:04x}")]
    Open {
        vendor_id: u16,
        product_id: u16,
        #[source]
        source: BackendError,
    },

    /// Indicates that the backend was unable to release its context.
    #[error("unable to close the USB context")]
    Close(#[source] BackendError),
}
