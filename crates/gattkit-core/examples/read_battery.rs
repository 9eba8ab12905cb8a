//! Example: Reading the Battery Level
//!
//! This example connects to a peripheral, waits for service discovery,
//! reads the standard Battery Level characteristic and disconnects.
//!
//! Run with: `cargo run --example read_battery -- <DEVICE_ADDRESS>`
//!
//! Pass `--mock` instead of an address to run against the in-memory
//! transport.

use std::env;
use std::sync::Arc;
use std::time::Duration;

use gattkit_core::uuids::{self, BATTERY_LEVEL, BATTERY_SERVICE};
use gattkit_core::{
    BtleplugTransport, GattEvent, GattManager, GattTransport, MockTransport, OperationOptions,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gattkit_core=info".into()),
        )
        .init();

    let args: Vec<String> = env::args().collect();
    let Some(target) = args.get(1) else {
        eprintln!("Usage: {} <DEVICE_ADDRESS | --mock>", args[0]);
        eprintln!();
        eprintln!("Example:");
        eprintln!("  {} AA:BB:CC:DD:EE:FF", args[0]);
        std::process::exit(1);
    };

    let (transport, address): (Arc<dyn GattTransport>, String) = if target == "--mock" {
        let address = MockTransport::random_address().to_string();
        (Arc::new(MockTransport::new()), address)
    } else {
        (Arc::new(BtleplugTransport::new().await?), target.clone())
    };

    let manager = GattManager::new(transport)?;
    let mut events = manager.subscribe();
    let session = manager.get_session(&address)?;

    println!("Connecting to {}...", address);
    session.connect(false, OperationOptions::new())?;

    let deadline = tokio::time::sleep(Duration::from_secs(30));
    tokio::pin!(deadline);

    loop {
        let event = tokio::select! {
            event = events.recv() => event?.event,
            _ = &mut deadline => {
                eprintln!("Timed out");
                break;
            }
        };

        match event {
            GattEvent::ServicesDiscovered {
                services, success, ..
            } => {
                if !success {
                    eprintln!("Service discovery failed");
                    continue;
                }
                println!("Services:");
                for service in &services {
                    println!("  {}", uuids::describe(service.uuid));
                }
                session.characteristic_read(
                    BATTERY_SERVICE,
                    BATTERY_LEVEL,
                    OperationOptions::new(),
                )?;
            }
            GattEvent::CharacteristicRead {
                value,
                success: true,
                ..
            } => {
                match value.first() {
                    Some(level) => println!("Battery: {}%", level),
                    None => println!("Battery: (empty value)"),
                }
                session.disconnect();
            }
            GattEvent::Disconnected { reason, .. } => {
                println!("Disconnected ({})", reason);
                break;
            }
            _ => {}
        }
    }

    manager.close();
    Ok(())
}
