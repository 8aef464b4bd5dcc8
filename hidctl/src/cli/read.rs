use std::io::{BufWriter, Write};

use anyhow::{Result, bail};
use clap::Args;
use owo_colors::OwoColorize;
use serde_json::json;
use usbhid::DeviceError;

use super::{Cli, DeviceArgs, deadline, hex, interrupt};

/// Read input reports from the interrupt IN endpoint.
#[derive(Args)]
pub struct ReadCommand {
    #[command(flatten)]
    device: DeviceArgs,

    /// Stop after this many reports, 0 reads until interrupted
    #[arg(long, default_value_t = 0)]
    count: usize,

    /// Size of the receive buffer
    #[arg(long, default_value_t = 64)]
    size: usize,

    /// Give up when no report arrives within this many milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,
}

impl ReadCommand {
    pub async fn execute(&self, root: &Cli) -> Result<()> {
        let mut stdout = BufWriter::new(anstream::stdout());

        let mut device = self.device.open()?;
        let cancel = interrupt();
        let mut buf = vec![0u8; self.size.max(1)];
        let mut received = 0;

        let res = loop {
            if self.count != 0 && received == self.count {
                break Ok(());
            }

            let (token, timer) = deadline(&cancel, self.timeout_ms);
            let read = device.read_input(&token, &mut buf).await;
            if let Some(timer) = timer {
                timer.abort();
            }

            let len = match read {
                Ok(len) => len,
                Err(DeviceError::TransferCancelled { .. }) if cancel.is_cancelled() => {
                    break Ok(());
                },
                Err(DeviceError::TransferCancelled { .. }) => {
                    break Err(anyhow::anyhow!(
                        "no input report within {} ms",
                        self.timeout_ms.unwrap_or_default()
                    ));
                },
                Err(err) => break Err(err.into()),
            };
            received += 1;

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
            stdout.flush()?;
        };

        device.close()?;
        res?;

        if received == 0 && self.count != 0 {
            bail!("no input report was received");
        }

        Ok(())
    }
}
