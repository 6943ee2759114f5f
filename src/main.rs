//! Headless console frontend for the garage opener core.
//!
//! Wires the connection manager to the system BLE adapter, prints lifecycle
//! events, and injects the signals a UI would: open, rescan, and
//! background/foreground transitions.

use anyhow::Result;
use garage_opener::domain::models::{ManagerEvent, MessageSeverity};
use garage_opener::domain::settings::SettingsService;
use garage_opener::domain::signal;
use garage_opener::infrastructure::bluetooth::central::CentralAdapter;
use garage_opener::infrastructure::bluetooth::{AppSignal, BleAdapter, ConnectionManager, ManagerConfig};
use garage_opener::infrastructure::logging;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let settings = SettingsService::new()?;
    let _logging_guard = logging::init_logger(&settings.get().log_settings)?;
    info!("Starting garage opener");

    let config = ManagerConfig::from_settings(settings.get())?;
    let settings = Arc::new(Mutex::new(settings));

    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let (adapter_tx, mut adapter_rx) = mpsc::unbounded_channel();

    let adapter: Arc<dyn BleAdapter> = CentralAdapter::new(adapter_tx).await?;
    let (manager, handle) = ConnectionManager::new(config, adapter, event_tx);
    tokio::spawn(manager.run());

    // Funnel adapter callbacks into the manager's serial context.
    {
        let handle = handle.clone();
        tokio::spawn(async move {
            while let Some(event) = adapter_rx.recv().await {
                handle.adapter_event(event);
            }
        });
    }

    tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            print_event(&event);
        }
    });

    println!("Commands: open | rescan | bg | fg | status | password <pw> | quit");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim();
        match line {
            "open" => {
                let password = settings.lock().unwrap().get().door_password.clone();
                handle.signal(AppSignal::RequestOpen { password });
            }
            "rescan" => handle.signal(AppSignal::RequestRescan),
            "bg" => handle.signal(AppSignal::EnteredBackground),
            "fg" => handle.signal(AppSignal::EnteredForeground),
            "status" => {
                let status = handle.status();
                let device = status
                    .peripheral
                    .as_ref()
                    .map(|p| p.display_name().to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "phase: {:?}  device: {device}  rssi: {}",
                    status.phase,
                    status
                        .last_rssi
                        .map(|r| format!("{r} dBm"))
                        .unwrap_or_else(|| "-".to_string())
                );
            }
            "quit" | "exit" => break,
            "" => {}
            other => {
                if let Some(password) = other.strip_prefix("password ") {
                    let config = {
                        let mut service = settings.lock().unwrap();
                        service.set_password(password.to_string())?;
                        ManagerConfig::from_settings(service.get())?
                    };
                    handle.signal(AppSignal::SettingsChanged(Box::new(config)));
                    println!("password updated");
                } else {
                    println!("unknown command: {other}");
                }
            }
        }
    }

    info!("Exiting");
    Ok(())
}

fn print_event(event: &ManagerEvent) {
    match event {
        ManagerEvent::Scanning => println!("Scanning"),
        ManagerEvent::FoundDevice { peripheral, rssi } => {
            println!("Found Device: {} ({rssi} dBm)", peripheral.display_name());
        }
        ManagerEvent::Ready { name } => println!("Connected to {name}"),
        ManagerEvent::Disconnected { peripheral } => {
            println!("Disconnected from {}", peripheral.display_name());
        }
        ManagerEvent::BluetoothOff => println!("Bluetooth Off"),
        ManagerEvent::ScanTimedOut => println!("Device not found. Type 'rescan' to retry."),
        ManagerEvent::LowSignal { rssi } => println!("Low Signal: {rssi}"),
        ManagerEvent::RssiUpdated { rssi } => {
            let bars = signal::bar_count(signal::quality_percent(*rssi));
            println!("Signal {} ({rssi} dBm)", signal::connection_bar(bars));
        }
        ManagerEvent::AdapterInfo { state } => println!("Bluetooth: {}", state.label()),
        ManagerEvent::Status(status) => match status.severity {
            MessageSeverity::Warning | MessageSeverity::Error => {
                println!("! {}", status.message);
            }
            MessageSeverity::Info | MessageSeverity::Success => {
                println!("{}", status.message);
            }
        },
    }
}
