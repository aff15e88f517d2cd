use std::time::Duration;

use clap::Parser;
use dalyread::{BleConfig, BleConnector, BmsClient, ClientConfig, ReconnectPolicy, TelemetryKind};
use tracing_subscriber::EnvFilter;

/// Poll a Daly BMS over Bluetooth and print its telemetry.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// Advertised name of the BMS. Without it the first device offering the BMS service is used.
    #[arg(long, env = "DALYREAD_NAME")]
    name: Option<String>,

    /// Milliseconds between two polling cycles
    #[arg(long, env = "DALYREAD_INTERVAL_MS", default_value_t = 1000, value_parser = clap::value_parser!(u64).range(1..))]
    interval_ms: u64,

    /// Reconnect attempts after the link drops before giving up
    #[arg(long, env = "DALYREAD_MAX_RECONNECTS", default_value_t = 5)]
    max_reconnects: u32,

    /// Seconds to scan for the BMS
    #[arg(long, env = "DALYREAD_SCAN_SECS", default_value_t = 30)]
    scan_secs: u64,

    /// Read every value once and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let ble_config = BleConfig {
        device_name: cli.name,
        discovery_timeout: Duration::from_secs(cli.scan_secs),
        ..BleConfig::default()
    };
    let config = ClientConfig {
        poll_interval: Duration::from_millis(cli.interval_ms),
        reconnect: ReconnectPolicy {
            max_retries: cli.max_reconnects,
            ..ReconnectPolicy::default()
        },
        ..ClientConfig::default()
    };

    println!("Scanning for {}s", cli.scan_secs);
    let connector = BleConnector::discover(ble_config).await?;
    let mut client = BmsClient::new(connector, config);

    if cli.once {
        for event in client.fetch_once().await? {
            println!("{:?}", event.telemetry);
        }
        return Ok(());
    }

    for kind in TelemetryKind::ALL {
        client.subscribe(kind, move |event| println!("{kind}: {:?}", event.telemetry));
    }
    client.on_error(|err| eprintln!("error: {err}"));

    let (stop, shutdown) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = stop.send(());
        }
    });

    client.run(shutdown).await?;
    Ok(())
}
