mod feature;
mod hex;
mod info;
mod list;
mod read;
mod write;

use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use feature::FeatureCommand;
use info::InfoCommand;
use list::ListCommand;
use read::ReadCommand;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tracing_subscriber::EnvFilter;
use usbhid::{
    DeviceConfig,
    HidDevice,
    Manager,
    backend::libusb::LibusbContext,
    device::DEFAULT_STREAM_LANE_COUNT,
};
use write::WriteCommand;

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(flatten)]
    color: colorchoice_clap::Color,

    #[command(subcommand)]
    command: Commands,

    /// Output plain JSON without color and interactivity
    #[arg(short, long, global = true)]
    json: bool,

    /// Log what the library is doing (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    List(ListCommand),
    Info(InfoCommand),
    Read(ReadCommand),
    Write(WriteCommand),
    Feature(FeatureCommand),
}

pub async fn execute() -> Result<()> {
    let cli = Cli::parse();

    cli.color.write_global();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if cli.verbose { "debug" } else { "warn" }));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match &cli.command {
        Commands::List(cmd) => cmd.execute(&cli).await,
        Commands::Info(cmd) => cmd.execute(&cli).await,
        Commands::Read(cmd) => cmd.execute(&cli).await,
        Commands::Write(cmd) => cmd.execute(&cli).await,
        Commands::Feature(cmd) => cmd.execute(&cli).await,
    }
}

/// Selects a device and the HID interface to attach.
#[derive(Args)]
struct DeviceArgs {
    /// Vendor ID, in hex
    #[arg(long, value_parser = hex::parse_u16)]
    vid: u16,

    /// Product ID, in hex
    #[arg(long, value_parser = hex::parse_u16)]
    pid: u16,

    /// Configuration number
    #[arg(long, default_value_t = 1)]
    config: u8,

    /// Interface number
    #[arg(long, default_value_t = 0)]
    interface: u8,

    /// Alternate setting number
    #[arg(long, default_value_t = 0)]
    alt: u8,

    /// Concurrent transfers per interrupt stream
    #[arg(long, default_value_t = DEFAULT_STREAM_LANE_COUNT)]
    lanes: usize,

    /// Leave kernel drivers bound to the interface
    #[arg(long)]
    no_detach: bool,
}

impl DeviceArgs {
    /// Opens the device and attaches the selected interface.
    fn open(&self) -> Result<HidDevice> {
        let manager =
            Manager::new(LibusbContext::new().context("unable to initialize libusb")?);
        let mut device = manager.open(
            self.vid,
            self.pid,
            DeviceConfig::default().with_stream_lane_count(self.lanes),
        )?;
        manager.close()?;

        if !self.no_detach {
            if let Err(err) = device.set_auto_detach(true) {
                warn!(%err, "kernel drivers cannot be detached automatically");
            }
        }

        device
            .set_target(self.config, self.interface, self.alt)
            .with_context(|| {
                format!(
                    "unable to attach conf #{} intf #{} alt #{}",
                    self.config, self.interface, self.alt
                )
            })?;

        Ok(device)
    }
}

/// Cancels a child of `parent` once `timeout` has passed.
///
/// The returned task has to be aborted when the guarded operation finishes
/// first.
fn deadline(
    parent: &CancellationToken,
    timeout: Option<u64>,
) -> (CancellationToken, Option<JoinHandle<()>>) {
    let token = parent.child_token();
    let timer = timeout.map(|ms| {
        let token = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            token.cancel();
        })
    });

    (token, timer)
}

/// Creates a token that is cancelled on Ctrl-C.
fn interrupt() -> CancellationToken {
    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        }
    });

    cancel
}
