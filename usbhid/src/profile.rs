//! Resolves a `(configuration, interface, alternate setting)` coordinate
//! inside a device descriptor.

use std::{collections::HashMap, fmt, sync::Arc};

use thiserror::Error;

use crate::descriptor::{
    AltSetting,
    DeviceDescriptor,
    Direction,
    EndpointDescriptor,
    HidProtocol,
    HidSubclass,
};

/// A HID alternate setting of a specific device.
///
/// A profile is a snapshot: it shares the descriptor it was resolved from and
/// owns no I/O resources. The default value is an empty profile whose
/// accessors fail with [`ProfileError::DescriptorMissing`].
#[derive(Clone, Default)]
pub struct DeviceInfo {
    /// The resolved descriptor, together with the positions of the
    /// configuration, interface and alternate setting inside it.
    target: Option<(Arc<DeviceDescriptor>, [usize; 3])>,
}

impl DeviceInfo {
    /// Resolves a profile by the descriptor numbers of a configuration, an
    /// interface and an alternate setting.
    ///
    /// Returns [`ProfileError::ProfileNotFound`] if no such alternate setting
    /// exists or if it does not belong to the HID class.
    pub fn from_device_descriptor(
        desc: Arc<DeviceDescriptor>,
        config: u8,
        interface: u8,
        alt: u8,
    ) -> Result<Self, ProfileError> {
        let mut found = None;

        'search: for (ci, conf) in desc.configs.iter().enumerate() {
            if conf.number != config {
                continue;
            }
            for (ii, intf) in conf.interfaces.iter().enumerate() {
                if intf.number != interface {
                    continue;
                }
                for (si, setting) in intf.alt_settings.iter().enumerate() {
                    if setting.alternate == alt && setting.is_hid() {
                        found = Some([ci, ii, si]);
                        break 'search;
                    }
                }
            }
        }

        let Some(indices) = found else {
            return Err(ProfileError::ProfileNotFound {
                vendor_id: desc.vendor_id,
                product_id: desc.product_id,
                config,
                interface,
                alt,
            });
        };

        Ok(Self {
            target: Some((desc, indices)),
        })
    }

    fn resolved(&self) -> Result<(&DeviceDescriptor, [usize; 3]), ProfileError> {
        self.target
            .as_ref()
            .map(|(desc, indices)| (desc.as_ref(), *indices))
            .ok_or(ProfileError::DescriptorMissing)
    }

    fn setting(&self) -> Result<&AltSetting, ProfileError> {
        let (desc, [ci, ii, si]) = self.resolved()?;
        Ok(&desc.configs[ci].interfaces[ii].alt_settings[si])
    }

    /// Whether this profile has been resolved.
    pub fn is_resolved(&self) -> bool {
        self.target.is_some()
    }

    /// The descriptor this profile was resolved from.
    pub fn device_descriptor(&self) -> Result<&Arc<DeviceDescriptor>, ProfileError> {
        self.target
            .as_ref()
            .map(|(desc, _)| desc)
            .ok_or(ProfileError::DescriptorMissing)
    }

    pub fn config_number(&self) -> Result<u8, ProfileError> {
        let (desc, [ci, ..]) = self.resolved()?;
        Ok(desc.configs[ci].number)
    }

    pub fn interface_number(&self) -> Result<u8, ProfileError> {
        let (desc, [ci, ii, _]) = self.resolved()?;
        Ok(desc.configs[ci].interfaces[ii].number)
    }

    pub fn alt_setting_number(&self) -> Result<u8, ProfileError> {
        Ok(self.setting()?.alternate)
    }

    /// The endpoints of the alternate setting, keyed by endpoint address.
    ///
    /// The iteration order of the returned map is unspecified.
    pub fn endpoints(&self) -> Result<&HashMap<u8, EndpointDescriptor>, ProfileError> {
        Ok(&self.setting()?.endpoints)
    }

    /// The HID subclass of the alternate setting, if it is a known one.
    pub fn subclass(&self) -> Result<Option<HidSubclass>, ProfileError> {
        Ok(HidSubclass::try_from(self.setting()?.sub_class).ok())
    }

    /// The boot protocol of the alternate setting, if it is a known one.
    pub fn protocol(&self) -> Result<Option<HidProtocol>, ProfileError> {
        Ok(HidProtocol::try_from(self.setting()?.protocol).ok())
    }
}

impl PartialEq for DeviceInfo {
    fn eq(&self, other: &Self) -> bool {
        match (&self.target, &other.target) {
            (None, None) => true,
            (Some((a, ai)), Some((b, bi))) => ai == bi && (Arc::ptr_eq(a, b) || a == b),
            _ => false,
        }
    }
}

impl Eq for DeviceInfo {}

impl fmt::Debug for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.resolved() {
            Ok(_) => write!(f, "DeviceInfo({})", self),
            Err(_) => f.write_str("DeviceInfo(<empty>)"),
        }
    }
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Ok((desc, [ci, ii, si])) = self.resolved() else {
            return f.write_str("[empty profile]");
        };
        let config = &desc.configs[ci];
        let intf = &config.interfaces[ii];
        let setting = &intf.alt_settings[si];

        write!(
            f,
            "[{:04x}:{:04x}] Conf #{} Intf #{} Sett #{} Speed: {}, CtrlSize: {}, Ep:[",
            desc.vendor_id,
            desc.product_id,
            config.number,
            intf.number,
            setting.alternate,
            desc.speed,
            desc.max_control_packet_size,
        )?;

        let mut endpoints: Vec<_> = setting.endpoints.values().collect();
        endpoints.sort_by_key(|ep| ep.address);
        for (i, ep) in endpoints.into_iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            match ep.direction {
                Direction::In => write!(f, "#{}(IN)", ep.number)?,
                Direction::Out => write!(f, "#{}(OUT)", ep.number)?,
            }
        }

        f.write_str("]")
    }
}

/// A list of profiles, displayed one per line.
#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct DeviceInfos(pub Vec<DeviceInfo>);

impl fmt::Display for DeviceInfos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for info in &self.0 {
            writeln!(f, "{}", info)?;
        }
        Ok(())
    }
}

impl std::ops::Deref for DeviceInfos {
    type Target = Vec<DeviceInfo>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl IntoIterator for DeviceInfos {
    type Item = DeviceInfo;
    type IntoIter = std::vec::IntoIter<DeviceInfo>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// Represents an error that occurred when resolving or reading a profile.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProfileError {
    /// Indicates that no HID alternate setting matches the coordinate.
    #[error(
        "no HID profile conf #{config} intf #{interface} alt #{alt} on device {vendor_id:04x}:{product_id:04x}"
    )]
    ProfileNotFound {
        vendor_id: u16,
        product_id: u16,
        config: u8,
        interface: u8,
        alt: u8,
    },

    /// Indicates that the profile has not been resolved.
    #[error("the profile has no device descriptor")]
    DescriptorMissing,
}
