mod config;
mod logging;

use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::RecvTimeoutError;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use jlink_rtt::rtt::parse_scan_region;
use jlink_rtt::{Interface, ReadMode, RttPoller, RttWrapper, ScanRegion};
use parking_lot::FairMutex;
use signal_hook::consts::signal;

use crate::config::Config;
use crate::logging::LevelFilter;

#[derive(Debug, clap::Parser)]
#[clap(
    name = "rtthost",
    about = "Host program for debugging microcontrollers using the RTT (real-time transfer) protocol over a J-Link probe."
)]
pub struct Opts {
    #[clap(
        long,
        help = "Configuration file. Defaults to RttHost.toml in the working directory, if it exists."
    )]
    config: Option<PathBuf>,

    #[clap(short, long, help = "Target device name as known to the J-Link software.")]
    device: Option<String>,

    #[clap(long, help = "Debug interface, 'swd' or 'jtag'.")]
    interface: Option<Interface>,

    #[clap(long, help = "Interface speed in kHz.")]
    speed: Option<u32>,

    #[clap(
        long,
        value_parser = parse_scan_region,
        help = "Where the RTT control block is. You can specify either an exact starting address '0x1000' or a range such as '0x0000..0x1000'. Both decimal and hex are accepted."
    )]
    scan_region: Option<ScanRegion>,

    #[clap(long, help = "How to read channels: 'auto', 'native' or 'soft'.")]
    mode: Option<ReadMode>,

    #[clap(long, help = "Largest number of bytes read in one go.")]
    buffer_capacity: Option<usize>,

    #[clap(short, long, help = "Number of up channel to output. Defaults to 0.")]
    up: Option<u32>,

    #[clap(long, help = "Milliseconds between two polls of the up channel.")]
    poll_interval_ms: Option<u64>,

    #[clap(short, long, help = "List RTT channels and exit.")]
    list: bool,

    #[clap(long, value_enum, help = "Log level. Overrides RUST_LOG.")]
    log_level: Option<LevelFilter>,
}

fn main() -> anyhow::Result<()> {
    let opts = Opts::parse();
    let config = Config::load(&opts).with_context(|| {
        format!(
            "Failed to load the configuration from {}",
            config::config_path(&opts).display()
        )
    })?;

    logging::setup_logging(config.host.log_level);
    tracing::debug!("Configuration: {config:?}");

    run(config, opts.list)
}

fn run(config: Config, list: bool) -> anyhow::Result<()> {
    let mut rtt = RttWrapper::connect(&config.probe, config.rtt.clone())
        .context("Failed to connect to the probe")?;

    eprintln!("Attaching to RTT...");
    let control_block = rtt.attach().context("Failed to attach to RTT")?;
    eprintln!("Found control block at {:#010x}", control_block.ptr());

    if list {
        let channels = rtt.up_channels().context("Failed to read the channel list")?;

        println!("Up channels:");
        if channels.is_empty() {
            println!("  (none)");
        }
        for channel in channels {
            println!("  {channel}");
        }

        rtt.close()?;
        return Ok(());
    }

    let up_channel = config.host.up_channel;
    if up_channel >= control_block.max_up_channels() {
        anyhow::bail!("Up channel {up_channel} does not exist.");
    }

    let rtt = Arc::new(FairMutex::new(rtt));
    let poller = RttPoller::spawn(
        rtt.clone(),
        up_channel,
        Duration::from_millis(config.host.poll_interval_ms),
    )
    .context("Failed to start polling")?;

    let exit = Arc::new(AtomicBool::new(false));
    let sig_id = signal_hook::flag::register(signal::SIGINT, exit.clone())?;

    let streamed = stream(&poller, &exit);

    signal_hook::low_level::unregister(sig_id);

    let polled = poller.stop();
    if rtt.lock().is_degraded() {
        tracing::warn!("Some output may have been repeated, the probe failed to acknowledge it");
    }
    rtt.lock().close()?;

    streamed.context("Error writing to stdout")?;
    polled.context("Error reading from RTT")?;
    Ok(())
}

/// Copies channel data to stdout until Ctrl-C is pressed or polling ends.
fn stream(poller: &RttPoller, exit: &AtomicBool) -> std::io::Result<()> {
    let mut stdout = std::io::stdout().lock();

    while !exit.load(Ordering::Relaxed) {
        match poller.receiver().recv_timeout(Duration::from_millis(100)) {
            Ok(data) => {
                stdout.write_all(&data)?;
                stdout.flush()?;
            }
            Err(RecvTimeoutError::Timeout) if poller.is_finished() => break,
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    Ok(())
}
