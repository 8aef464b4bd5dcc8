use std::io::{BufWriter, Write};

use anyhow::{Context, Result};
use clap::Args;
use itertools::Itertools;
use owo_colors::OwoColorize;
use serde::Serialize;
use serde_json::json;
use usbhid::{DeviceInfo, Manager, backend::libusb::LibusbContext, descriptor::Direction};

use super::{Cli, hex};

/// List the HID interfaces of connected devices.
#[derive(Args)]
pub struct ListCommand {
    /// Only list devices with this vendor ID, in hex
    #[arg(long, value_parser = hex::parse_u16, default_value = "0")]
    vid: u16,

    /// Only list devices with this product ID, in hex
    #[arg(long, value_parser = hex::parse_u16, default_value = "0")]
    pid: u16,
}

impl ListCommand {
    pub async fn execute(&self, root: &Cli) -> Result<()> {
        let mut stdout = BufWriter::new(anstream::stdout());

        let manager =
            Manager::new(LibusbContext::new().context("unable to initialize libusb")?);
        let infos = manager.enumerate(self.vid, self.pid)?;
        manager.close()?;

        let profiles = infos
            .iter()
            .map(ListedProfile::try_from)
            .collect::<Result<Vec<_>>>()?;

        if root.json {
            writeln!(stdout, "{}", json!(profiles))?;
            return Ok(());
        }

        if profiles.is_empty() {
            writeln!(stdout, "{}", "No HID devices were found.".bright_black())?;
            return Ok(());
        }

        let devices = profiles
            .iter()
            .chunk_by(|profile| (profile.bus, profile.address));
        for (device_i, (_, device)) in (&devices).into_iter().enumerate() {
            let device: Vec<_> = device.collect();
            let first = device[0];

            if device_i != 0 {
                writeln!(stdout)?;
            }
            writeln!(
                stdout,
                "{:04x}:{:04x} {}",
                first.vendor_id,
                first.product_id,
                format!("(bus {} address {}, {} speed)", first.bus, first.address, first.speed)
                    .bright_black()
            )?;

            let len = device.len();
            for (profile_i, profile) in device.into_iter().enumerate() {
                let endpoints = profile
                    .endpoints
                    .iter()
                    .map(|ep| format!("{:#04x} {}", ep.address, ep.direction))
                    .join(", ");

                writeln!(
                    stdout,
                    " {} {} {} {}",
                    if profile_i == len - 1 { "╰─" } else { "├─" },
                    format!(
                        "conf #{} intf #{} alt #{}",
                        profile.config, profile.interface, profile.alt
                    )
                    .bright_blue(),
                    match (profile.subclass, profile.protocol) {
                        (1, 1) => "boot keyboard".green().to_string(),
                        (1, 2) => "boot mouse".green().to_string(),
                        _ => "report".to_string(),
                    },
                    format!("[{}]", endpoints).bright_black()
                )?;
            }
        }

        stdout.flush()?;

        Ok(())
    }
}

#[derive(Clone, PartialEq, Eq, Hash, Debug, Serialize)]
struct ListedProfile {
    vendor_id: u16,
    product_id: u16,
    bus: u8,
    address: u8,
    speed: String,
    config: u8,
    interface: u8,
    alt: u8,
    subclass: u8,
    protocol: u8,
    endpoints: Vec<ListedEndpoint>,
}

#[derive(Clone, PartialEq, Eq, Hash, Debug, Serialize)]
struct ListedEndpoint {
    address: u8,
    direction: &'static str,
    max_packet_size: u16,
    poll_interval_us: u64,
}

impl TryFrom<&DeviceInfo> for ListedProfile {
    type Error = anyhow::Error;

    fn try_from(info: &DeviceInfo) -> Result<Self> {
        let desc = info.device_descriptor()?;
        let mut endpoints: Vec<_> = info
            .endpoints()?
            .values()
            .map(|ep| ListedEndpoint {
                address: ep.address,
                direction: match ep.direction {
                    Direction::In => "IN",
                    Direction::Out => "OUT",
                },
                max_packet_size: ep.max_packet_size,
                poll_interval_us: u64::try_from(ep.poll_interval.as_micros()).unwrap_or(u64::MAX),
            })
            .collect();
        endpoints.sort_by_key(|ep| ep.address);

        Ok(Self {
            vendor_id: desc.vendor_id,
            product_id: desc.product_id,
            bus: desc.bus,
            address: desc.address,
            speed: desc.speed.to_string(),
            config: info.config_number()?,
            interface: info.interface_number()?,
            alt: info.alt_setting_number()?,
            subclass: info.subclass()?.map_or(0, u8::from),
            protocol: info.protocol()?.map_or(0, u8::from),
            endpoints,
        })
    }
}
