//! Connect to a receiver by address, launch an application, adjust the
//! volume and print device events.
//!
//! Usage: cargo run --example control -- <host> [port] [app-id]

use castlink::{
    CastClient, ConnectionCallbacks, ConnectionHint, DeviceRecord, SocketMultiplexer, Status,
    SuspensionCause,
};
use std::sync::Arc;
use std::time::Duration;

struct LogCallbacks;

impl ConnectionCallbacks for LogCallbacks {
    fn on_connected(&self, hint: &ConnectionHint) {
        println!("connected, hint: {:?}", hint.get("device"));
    }
    fn on_connection_suspended(&self, cause: SuspensionCause) {
        println!("suspended: {:?}", cause);
    }
    fn on_connection_failed(&self, status: Status) {
        println!("connection failed: {status}");
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let mut args = std::env::args().skip(1);
    let host = args.next().unwrap_or_else(|| {
        eprintln!("usage: control <host> [port] [app-id]");
        std::process::exit(2);
    });
    let port: u16 = args.next().and_then(|p| p.parse().ok()).unwrap_or(8009);
    let app_id = args.next().unwrap_or_else(|| "CC1AD845".to_string());

    let mux = SocketMultiplexer::spawn();
    let device = DeviceRecord::for_address(host, port);
    let client = CastClient::new(device, mux, Arc::new(LogCallbacks));

    let status = client.blocking_connect(Duration::from_secs(20)).await;
    if !status.is_success() {
        return Err(format!("connect failed: {status}").into());
    }

    let mut events = client.subscribe_events();

    println!("launching {app_id}...");
    let launch = client.launch_application(app_id);
    let outcome = launch.result_timeout(Duration::from_secs(30)).await;
    println!("launch settled: {}", outcome.status);
    if let Some(receiver) = outcome.value {
        if let Some(app) = receiver.application() {
            println!(
                "running: {} (session {}, transport {})",
                app.display_name, app.session_id, app.transport_id
            );
        }
    }

    let _ = client.set_volume(0.2);

    println!("watching events for 30s, ctrl-c to quit earlier");
    let watch = async {
        while let Ok(event) = events.recv().await {
            println!("event: {:?}", event);
        }
    };
    let _ = tokio::time::timeout(Duration::from_secs(30), watch).await;

    client.disconnect();
    tokio::time::sleep(Duration::from_millis(500)).await;
    Ok(())
}
