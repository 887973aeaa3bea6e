use anyhow::Context;
use clap::Parser;
use dsc_reader::domain::models::{DscEvent, DscReadings};
use dsc_reader::domain::settings::SettingsService;
use dsc_reader::infrastructure::bluetooth::protocol::GattIdentifiers;
use dsc_reader::infrastructure::bluetooth::simulated::{
    encode_azel, SimulatedPeripheral, SimulatedTransport,
};
use dsc_reader::infrastructure::bluetooth::transport::{
    transport_channel, Transport, TransportEventSender,
};
use dsc_reader::infrastructure::bluetooth::{BluetoothService, SessionManager};
use dsc_reader::infrastructure::logging;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

const SIMULATED_ADDRESS: &str = "00:00:00:00:00:00";

/// Read azimuth and elevation from a DSC server over Bluetooth LE
#[derive(Debug, Parser)]
#[command(name = "dsc-reader", version)]
struct Args {
    /// Peripheral address (AA:BB:CC:DD:EE:FF). Defaults to the last one used.
    address: Option<String>,

    /// Talk to an in-process simulated DSC server instead of real hardware
    #[arg(long)]
    simulate: bool,

    /// Print events as JSON lines
    #[arg(long)]
    json: bool,

    /// Settings file to use instead of the per-user one
    #[arg(long, value_name = "PATH")]
    settings: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut settings = match &args.settings {
        Some(path) => SettingsService::from_path(path.clone()),
        None => SettingsService::new()?,
    };

    let _logging_guard = logging::init_logger(&settings.get().log_settings)
        .map_err(|e| eprintln!("Failed to initialize logging: {:#}", e))
        .ok();

    info!("Starting DSC reader");
    info!("Settings file: {}", settings.path().display());

    let ids = settings.get().gatt_identifiers()?;
    let address = match (&args.address, args.simulate) {
        (Some(address), _) => address.clone(),
        (None, true) => SIMULATED_ADDRESS.to_string(),
        (None, false) => settings
            .get()
            .last_connected_address
            .clone()
            .context("No address given and none remembered")?,
    };

    let (transport_tx, transport_rx) = transport_channel();
    let transport = if args.simulate {
        simulated_transport(&ids, transport_tx)
    } else {
        native_transport(transport_tx).await?
    };

    let (event_tx, mut events) = mpsc::unbounded_channel();
    let manager = SessionManager::new(transport, event_tx, ids)
        .with_raw_data_logging(settings.get().debug_raw_data_logging);
    let (client, service) = BluetoothService::spawn(manager, transport_rx);

    client
        .connect(address.as_str())
        .await
        .with_context(|| format!("Failed to connect to {}", address))?;
    if !args.simulate {
        if let Err(e) = settings.remember_address(&address) {
            warn!("Failed to save settings: {:#}", e);
        }
    }

    let mut readings = DscReadings::default();
    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                readings.apply(&event);
                print_event(&event, &readings, args.json)?;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, disconnecting");
                break;
            }
        }
    }

    if client.disconnect().await.is_ok() {
        // Give the transport a moment to confirm
        let _ = tokio::time::timeout(Duration::from_secs(2), async {
            while let Some(event) = events.recv().await {
                if event == DscEvent::Disconnected {
                    break;
                }
            }
        })
        .await;
    }
    client.close().await;
    drop(client);
    service.await?;

    info!("Bye");
    Ok(())
}

fn print_event(event: &DscEvent, readings: &DscReadings, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string(event)?);
        return Ok(());
    }

    match event {
        DscEvent::Fault(e) => println!("! {}", e),
        _ => println!("{}", readings),
    }
    Ok(())
}

/// Auto-responding simulator plus a task that slowly sweeps the telescope.
fn simulated_transport(ids: &GattIdentifiers, events: TransportEventSender) -> Box<dyn Transport> {
    let (transport, sim) = SimulatedTransport::new(SimulatedPeripheral::dsc(ids), events);
    sim.set_auto_respond(true);

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_millis(500));
        let (mut azimuth, mut elevation) = (0.0f32, 10.0f32);
        loop {
            ticker.tick().await;
            sim.notify(encode_azel(azimuth, elevation));
            azimuth = (azimuth + 1.5) % 360.0;
            elevation = if elevation >= 80.0 { 10.0 } else { elevation + 0.5 };
        }
    });

    Box::new(transport)
}

#[cfg(windows)]
async fn native_transport(events: TransportEventSender) -> anyhow::Result<Box<dyn Transport>> {
    use dsc_reader::infrastructure::bluetooth::winrt::WinRtTransport;
    Ok(Box::new(WinRtTransport::new(events).await))
}

#[cfg(not(windows))]
async fn native_transport(_events: TransportEventSender) -> anyhow::Result<Box<dyn Transport>> {
    anyhow::bail!("No native Bluetooth backend on this platform; try --simulate")
}
