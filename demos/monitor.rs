use std::env;
use std::time::Duration;

use aircon_lan::{DeviceConfig, DeviceManager, QueueEvent, TemperatureUnit};

#[tokio::main]
async fn main() -> aircon_lan::Result<()> {
    tracing_subscriber::fmt::init();

    let args: Vec<String> = env::args().collect();
    let host = args
        .get(1)
        .expect("usage: monitor <host> [--celsius] [--set <field>=<value>]...");

    let mut config = DeviceConfig::new(host.as_str());
    if args.iter().any(|a| a == "--celsius") {
        config.unit = TemperatureUnit::Celsius;
    }
    let changes: Vec<(String, String)> = args
        .windows(2)
        .filter(|w| w[0] == "--set")
        .filter_map(|w| w[1].split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

    let manager = DeviceManager::from_config(config)?;
    manager.subscribe(|state| println!("{state}"));

    let mut events = manager.queue_events();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                QueueEvent::Executed { id, command } => println!("command {id} executed: {command:?}"),
                QueueEvent::Error { id, attempt, message, will_retry } => {
                    println!("command {id} attempt {attempt} failed: {message} (retry: {will_retry})")
                }
                QueueEvent::MaxRetriesReached { id, attempts, .. } => {
                    println!("command {id} abandoned after {attempts} attempts")
                }
            }
        }
    });

    println!("Polling {host}...");
    let state = manager.update_device_state(false).await;
    println!("{state}");

    if !changes.is_empty() {
        let mut desired = manager.device_state();
        for (field, value) in &changes {
            if !desired.set_from_str(field, value) {
                eprintln!("ignored {field}={value}");
            }
        }
        if let Err(e) = manager.apply_state_to_device(&mut desired).await {
            eprintln!("Apply failed: {e}");
        }
    }

    manager.start();
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = tokio::time::sleep(Duration::from_secs(24 * 60 * 60)) => {}
    }

    manager.cleanup();
    Ok(())
}
