use std::path::PathBuf;
use std::process::exit;
use std::time::Duration;

use _core::logging;
use _core::{BluezConnector, ConnectorSettings, DeviceAddress, Measurements, Scale, ScaleConfig};
use anyhow::{Context, Result};
use clap::Parser;
use tokio::runtime::Runtime;

#[derive(Parser, Debug)]
#[command(name = "bf915", about = "Read body-composition measurements from a Beurer BF 915 scale")]
struct Args {
    /// TOML config with the scale address and the user roster
    #[arg(short, long)]
    config: PathBuf,
    /// Bluetooth MAC address, overriding the config (e.g., C8:B2:1E:XX:XX:XX)
    #[arg(short, long)]
    address: Option<String>,
    /// Keep polling instead of running a single update
    #[arg(short, long)]
    watch: bool,
    /// Seconds between updates in watch mode (default: config's poll_interval_secs)
    #[arg(short, long)]
    interval: Option<u64>,
}

fn main() {
    logging::init_rust_logging();
    if let Err(e) = run() {
        eprintln!("Error: {e:#}");
        exit(1);
    }
}

fn run() -> Result<()> {
    let args = Args::parse();

    let config = ScaleConfig::load(&args.config)
        .with_context(|| format!("failed to load config from {}", args.config.display()))?;
    let roster = config.roster()?;
    let address: DeviceAddress = match &args.address {
        Some(mac) => mac.parse()?,
        None => config.device_address()?,
    };
    let interval = args
        .interval
        .map(Duration::from_secs)
        .unwrap_or_else(|| config.timing.poll_interval());

    let rt = Runtime::new().context("tokio runtime init failed")?;
    rt.block_on(async {
        let connector = BluezConnector::new(ConnectorSettings::default()).await?;
        let scale = Scale::new(address, roster, connector).with_timing(config.timing.session());

        println!("--- Beurer BF 915 at {} ({} users) ---", address, scale.roster().len());

        if !args.watch {
            let readings = scale.run_cycle().await;
            return report(&scale, &readings);
        }

        println!("Polling every {:?}", interval);
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let readings = scale.run_cycle().await;
            report(&scale, &readings)?;
        }
    })
}

fn report(scale: &Scale<BluezConnector>, readings: &Measurements) -> Result<()> {
    if let Some(err) = scale.last_error() {
        eprintln!("Update failed: {err}");
    }
    println!("{}", serde_json::to_string_pretty(readings)?);
    Ok(())
}
