use std::io::{BufWriter, Write};

use anyhow::Result;
use clap::Args;
use owo_colors::OwoColorize;
use serde::Serialize;
use serde_json::json;
use usbhid::HidDevice;

use super::{Cli, DeviceArgs, hex};

/// Show the strings and HID descriptors of a device interface.
#[derive(Args)]
pub struct InfoCommand {
    #[command(flatten)]
    device: DeviceArgs,
}

impl InfoCommand {
    pub async fn execute(&self, root: &Cli) -> Result<()> {
        let mut stdout = BufWriter::new(anstream::stdout());

        let mut device = self.device.open()?;
        let info = inspect(&device);
        device.close()?;
        let info = info?;

        if root.json {
            writeln!(stdout, "{}", json!(info))?;
            return Ok(());
        }

        writeln!(
            stdout,
            "{:04x}:{:04x} {}",
            self.device.vid,
            self.device.pid,
            info.profile.bright_black()
        )?;

        let mut properties = Vec::new();
        for (name, value) in [
            ("MANUFACTURER", &info.manufacturer),
            ("PRODUCT", &info.product),
            ("SERIAL NUMBER", &info.serial_number),
        ] {
            if let Some(value) = value {
                properties.push(format!("{}: {}", name, value.bright_black()));
            }
        }
        properties.push(format!(
            "HID: {} {}",
            info.hid_descriptor.hid_version.green(),
            format!("(country code {})", info.hid_descriptor.country_code).bright_black()
        ));
        for desc in &info.hid_descriptor.class_descriptors {
            properties.push(format!(
                "CLASS DESCRIPTOR: {:#04x} {}",
                desc.descriptor_type.blue(),
                format!("({} bytes)", desc.length).bright_black()
            ));
        }
        properties.push(format!(
            "REPORT DESCRIPTOR: {} {}",
            format!("{} bytes", info.report_descriptor.length).blue(),
            match &info.report_descriptor.reports {
                Some(reports) => format!(
                    "({} input, {} output, {} feature reports)",
                    reports.input, reports.output, reports.feature
                ),
                None => "(unparsable)".to_string(),
            }
            .bright_black()
        ));

        let len = properties.len();
        for (i, property) in properties.into_iter().enumerate() {
            writeln!(
                stdout,
                " {} {}",
                if i == len - 1 { "╰─" } else { "├─" },
                property
            )?;
        }

        writeln!(stdout)?;
        for line in info.report_descriptor.bytes.chunks(16) {
            writeln!(stdout, "   {}", hex::format(line).bright_black())?;
        }

        stdout.flush()?;

        Ok(())
    }
}

fn inspect(device: &HidDevice) -> Result<InterfaceInfo> {
    let hid = device.get_hid_descriptor()?;
    let report = device.get_report_descriptor()?;
    let [major, minor] = hid.hid_version.to_be_bytes();

    let reports = report.parse().ok().map(|parsed| ReportCounts {
        input: parsed.input_reports().len(),
        output: parsed.output_reports().len(),
        feature: parsed.feature_reports().len(),
    });

    Ok(InterfaceInfo {
        profile: device.device_info().to_string(),
        manufacturer: device.get_manufacturer().ok(),
        product: device.get_product().ok(),
        serial_number: device.get_serial_number().ok(),
        hid_descriptor: HidInfo {
            hid_version: format!("{:x}.{:02x}", major, minor),
            country_code: hid.country_code,
            class_descriptors: hid
                .class_descriptors()
                .map(|desc| ClassInfo {
                    descriptor_type: desc.descriptor_type,
                    length: desc.length,
                })
                .collect(),
        },
        report_descriptor: ReportInfo {
            length: report.len(),
            reports,
            bytes: report.into_bytes(),
        },
    })
}

#[derive(Clone, PartialEq, Eq, Hash, Debug, Serialize)]
struct InterfaceInfo {
    profile: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    manufacturer: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    product: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    serial_number: Option<String>,

    hid_descriptor: HidInfo,
    report_descriptor: ReportInfo,
}

#[derive(Clone, PartialEq, Eq, Hash, Debug, Serialize)]
struct HidInfo {
    hid_version: String,
    country_code: u8,
    class_descriptors: Vec<ClassInfo>,
}

#[derive(Clone, PartialEq, Eq, Hash, Debug, Serialize)]
struct ClassInfo {
    descriptor_type: u8,
    length: u16,
}

#[derive(Clone, PartialEq, Eq, Hash, Debug, Serialize)]
struct ReportInfo {
    length: usize,

    #[serde(skip_serializing_if = "Option::is_none")]
    reports: Option<ReportCounts>,

    bytes: Vec<u8>,
}

#[derive(Clone, PartialEq, Eq, Hash, Debug, Serialize)]
struct ReportCounts {
    input: usize,
    output: usize,
    feature: usize,
}
