use std::io::{BufWriter, Write};

use anyhow::{Result, anyhow};
use clap::Args;
use owo_colors::OwoColorize;
use serde_json::json;
use usbhid::DeviceError;

use super::{Cli, DeviceArgs, deadline, hex, interrupt};

/// Write an output report. The first byte is the report ID, 00 if the device
/// does not use report IDs.
#[derive(Args)]
pub struct WriteCommand {
    #[command(flatten)]
    device: DeviceArgs,

    /// The report, in hex
    #[arg(value_parser = hex::parse_bytes)]
    data: ::std::vec::Vec<u8>,

    /// Give up when the report is not taken within this many milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,
}

impl WriteCommand {
    pub async fn execute(&self, root: &Cli) -> Result<()> {
        let mut stdout = BufWriter::new(anstream::stdout());

        let mut device = self.device.open()?;
        let (token, timer) = deadline(&interrupt(), self.timeout_ms);
        let res = device.write_output(&token, &self.data).await;
        if let Some(timer) = timer {
            timer.abort();
        }
        device.close()?;

        let written = match res {
            Ok(written) => written,
            Err(DeviceError::TransferCancelled { transferred }) => {
                return Err(anyhow!(
                    "the write was cancelled after {} of {} bytes",
                    transferred,
                    self.data.len()
                ));
            },
            Err(err) => return Err(err.into()),
        };

        if root.json {
            writeln!(stdout, "{}", json!({ "written": written }))?;
        } else {
            writeln!(
                stdout,
                "{} {}",
                "Wrote".green(),
                format!("{} bytes", written).bright_black()
            )?;
        }
        stdout.flush()?;

        Ok(())
    }
}
