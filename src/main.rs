use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use log::info;
use smartport_relay::{init_logger, Listener, RelayConfig, SimulatedDevice};
use std::path::PathBuf;
use std::time::Duration;
use tokio::net::TcpStream;

/// How often `listen` logs the device table.
const DEVICE_TABLE_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "sprelay")]
#[command(about = "Relay SmartPort block devices over SLIP-framed TCP links")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct BindArgs {
    /// JSON configuration file; overrides the address and port flags
    #[arg(short, long)]
    config: Option<PathBuf>,
    #[arg(short, long, default_value = "0.0.0.0")]
    address: String,
    #[arg(short, long, default_value = "1985")]
    port: u16,
}

impl BindArgs {
    fn load(&self) -> anyhow::Result<RelayConfig> {
        match &self.config {
            Some(path) => RelayConfig::load(path)
                .with_context(|| format!("loading config from {}", path.display())),
            None => {
                let mut config = RelayConfig::default();
                config.check_and_set_address(&self.address);
                config.port = self.port;
                Ok(config)
            }
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Accept device links until Ctrl-C
    Listen {
        #[command(flatten)]
        bind: BindArgs,
    },
    /// Accept links for a while, then print what was discovered
    Status {
        #[command(flatten)]
        bind: BindArgs,
        /// Seconds to wait for devices to connect
        #[arg(short, long, default_value = "10")]
        wait: u64,
    },
    /// Connect to a relay and serve simulated disks
    Simulate {
        #[arg(short, long, default_value = "127.0.0.1:1985")]
        connect: String,
        #[arg(short, long, default_value = "2")]
        units: usize,
    },
}

fn log_device_table(listener: &Listener) {
    let devices = listener.all_connections();
    if devices.is_empty() {
        info!("No devices connected");
        return;
    }
    for (device_id, connection) in devices {
        info!("Device {device_id:3} -> {}", connection.peer());
    }
}

async fn listen(config: RelayConfig) -> anyhow::Result<()> {
    let listener = Listener::new(&config);
    listener.start(&config.address, config.port).await?;

    let mut ticker = tokio::time::interval(DEVICE_TABLE_INTERVAL);
    loop {
        tokio::select! {
            _ = ticker.tick() => log_device_table(&listener),
            signal = tokio::signal::ctrl_c() => {
                signal.context("waiting for Ctrl-C")?;
                break;
            }
        }
    }

    info!("Shutting down");
    listener.stop().await;
    Ok(())
}

async fn status(config: RelayConfig, wait: Duration) -> anyhow::Result<()> {
    let listener = Listener::new(&config);
    let addr = listener.start(&config.address, config.port).await?;
    info!("Waiting {wait:?} for devices on {addr}");
    tokio::time::sleep(wait).await;

    println!("{} device(s) on {} link(s)", listener.total_device_count(), listener.connection_count());
    for range in listener.device_ranges() {
        println!("  ids {range}");
    }
    let disks = listener.first_two_disk_devices().await;
    let show = |slot: Option<u8>| slot.map_or_else(|| "none".to_string(), |id| id.to_string());
    println!("first disk: {}, second disk: {}", show(disks.first), show(disks.second));

    listener.stop().await;
    Ok(())
}

async fn simulate(connect: &str, units: usize) -> anyhow::Result<()> {
    let stream = TcpStream::connect(connect)
        .await
        .with_context(|| format!("connecting to {connect}"))?;
    info!("Serving {units} simulated disk(s) to {connect}");
    let handle = SimulatedDevice::with_disks(units).spawn(stream);

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Interrupted"),
        _ = async {
            while !handle.is_finished() {
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
        } => info!("Relay closed the link"),
    }
    handle.shutdown().await;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logger();

    let cli = Cli::parse();
    match cli.command {
        Commands::Listen { bind } => listen(bind.load()?).await,
        Commands::Status { bind, wait } => status(bind.load()?, Duration::from_secs(wait)).await,
        Commands::Simulate { connect, units } => simulate(&connect, units).await,
    }
}
