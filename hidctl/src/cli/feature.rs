use std::io::{BufWriter, Write};

use anyhow::Result;
use clap::{Args, Subcommand};
use owo_colors::OwoColorize;
use serde_json::json;

use super::{Cli, DeviceArgs, hex};

/// Exchange feature reports over the control endpoint.
#[derive(Args)]
pub struct FeatureCommand {
    #[command(subcommand)]
    action: FeatureAction,
}

#[derive(Subcommand)]
enum FeatureAction {
    /// Retrieve a feature report
    Get {
        #[command(flatten)]
        device: DeviceArgs,

        /// The report ID, in hex, 00 if the device does not use report IDs
        #[arg(value_parser = hex::parse_u8)]
        report_id: u8,

        /// The size of the report, including the report ID
        #[arg(long, default_value_t = 64)]
        size: usize,
    },

    /// Send a feature report, starting with its report ID
    Set {
        #[command(flatten)]
        device: DeviceArgs,

        /// The report, in hex
        #[arg(value_parser = hex::parse_bytes)]
        data: ::std::vec::Vec<u8>,
    },
}

impl FeatureCommand {
    pub async fn execute(&self, root: &Cli) -> Result<()> {
        let mut stdout = BufWriter::new(anstream::stdout());

        match &self.action {
            FeatureAction::Get {
                device,
                report_id,
                size,
            } => {
                let mut device = device.open()?;
                let mut buf = vec![0u8; (*size).max(1)];
                buf[0] = *report_id;

                let res = device.get_feature_report(&mut buf);
                device.close()?;
                let len = res?.min(buf.len());

                if root.json {
                    writeln!(stdout, "{}", json!({ "report": &buf[..len] }))?;
                } else {
                    writeln!(
                        stdout,
                        "{} {}",
                        format!("{:>4}", len).bright_black(),
                        hex::format(&buf[..len])
                    )?;
                }
            },
            FeatureAction::Set { device, data } => {
                let mut device = device.open()?;
                let res = device.send_feature_report(data);
                device.close()?;
                let written = res?;

                if root.json {
                    writeln!(stdout, "{}", json!({ "written": written }))?;
                } else {
                    writeln!(
                        stdout,
                        "{} {}",
                        "Sent".green(),
                        format!("{} bytes", written).bright_black()
                    )?;
                }
            },
        }

        stdout.flush()?;

        Ok(())
    }
}
