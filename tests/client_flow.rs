//! End-to-end client tests against the loopback fake receiver.

mod common;

use castlink::{
    CastClient, ConnectionCallbacks, ConnectionHint, DeviceEvent, DeviceRecord, ManagerState,
    NullCallbacks, SocketMultiplexer, Status, SuspensionCause, NS_CONNECTION, NS_RECEIVER,
};
use common::{FakeReceiver, REJECTED_APP};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::timeout;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

fn device_for(receiver: &FakeReceiver) -> DeviceRecord {
    let mut record = DeviceRecord::for_address("127.0.0.1", receiver.port);
    record.friendly_name = "Test Receiver".to_string();
    record
}

async fn connected_client(receiver: &FakeReceiver) -> CastClient {
    let mux = SocketMultiplexer::spawn();
    let client = CastClient::new(device_for(receiver), mux, Arc::new(NullCallbacks));
    let status = client.blocking_connect(CONNECT_TIMEOUT).await;
    assert_eq!(status, Status::Success);
    client
}

async fn eventually<F: Fn() -> bool>(what: &str, check: F) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {what}");
}

#[derive(Default)]
struct RecordingCallbacks {
    connected: AtomicU32,
    hints: Mutex<Vec<ConnectionHint>>,
    suspended: Mutex<Vec<SuspensionCause>>,
    failed: Mutex<Vec<Status>>,
}

impl ConnectionCallbacks for RecordingCallbacks {
    fn on_connected(&self, hint: &ConnectionHint) {
        self.connected.fetch_add(1, Ordering::SeqCst);
        self.hints.lock().unwrap().push(hint.clone());
    }
    fn on_connection_suspended(&self, cause: SuspensionCause) {
        self.suspended.lock().unwrap().push(cause);
    }
    fn on_connection_failed(&self, status: Status) {
        self.failed.lock().unwrap().push(status);
    }
}

#[tokio::test]
async fn connect_performs_virtual_handshake() {
    let receiver = FakeReceiver::spawn().await;
    let mux = SocketMultiplexer::spawn();
    let callbacks = Arc::new(RecordingCallbacks::default());
    let client = CastClient::with_package(
        device_for(&receiver),
        mux,
        callbacks.clone(),
        "com.example.sender",
    );

    assert_eq!(client.blocking_connect(CONNECT_TIMEOUT).await, Status::Success);
    assert_eq!(client.state(), ManagerState::Connected);

    eventually("CONNECT frame", || {
        !receiver.received(NS_CONNECTION).is_empty()
    })
    .await;
    let connects = receiver.payloads(NS_CONNECTION);
    assert_eq!(connects[0]["type"], "CONNECT");
    assert_eq!(connects[0]["origin"]["package"], "com.example.sender");

    eventually("connected callback", || {
        callbacks.connected.load(Ordering::SeqCst) == 1
    })
    .await;
    let hints = callbacks.hints.lock().unwrap();
    assert_eq!(hints[0].get("device").unwrap()["friendlyName"], "Test Receiver");
}

#[tokio::test]
async fn launch_returns_running_application() {
    let receiver = FakeReceiver::spawn().await;
    let client = connected_client(&receiver).await;
    let mut events = client.subscribe_events();

    let outcome = client
        .launch_application("CC1AD845")
        .result_timeout(Duration::from_secs(10))
        .await;
    assert_eq!(outcome.status, Status::Success);
    let status = outcome.value.expect("status payload");
    let app = status.application().expect("running application");
    assert_eq!(app.app_id, "CC1AD845");
    assert_eq!(app.transport_id, "transport-1");

    // The status diff surfaced the launch as an event too
    let event = timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await.unwrap() {
                DeviceEvent::ApplicationStarted(app) => break app,
                _ => continue,
            }
        }
    })
    .await
    .expect("application event");
    assert_eq!(event.session_id, "session-1");

    // Snapshot reflects the running app without another round trip
    eventually("snapshot update", || {
        client.receiver_status().application().is_some()
    })
    .await;
}

#[tokio::test]
async fn rejected_launch_maps_reason_to_status() {
    let receiver = FakeReceiver::spawn().await;
    let client = connected_client(&receiver).await;

    let outcome = client
        .launch_application(REJECTED_APP)
        .result_timeout(Duration::from_secs(10))
        .await;
    assert_eq!(outcome.status, Status::ApplicationNotFound);
}

#[tokio::test]
async fn volume_round_trip_and_event() {
    let receiver = FakeReceiver::spawn().await;
    let client = connected_client(&receiver).await;
    let mut events = client.subscribe_events();

    let outcome = client
        .set_volume(0.2)
        .result_timeout(Duration::from_secs(10))
        .await;
    assert_eq!(outcome.status, Status::Success);
    assert!((outcome.value.unwrap().volume.level - 0.2).abs() < 1e-9);

    // Skip any earlier status-derived volume events; wait for ours
    let volume = timeout(Duration::from_secs(5), async {
        loop {
            if let DeviceEvent::VolumeChanged(v) = events.recv().await.unwrap() {
                if (v.level - 0.2).abs() < 1e-9 {
                    break v;
                }
            }
        }
    })
    .await
    .expect("volume event");
    assert!((volume.level - 0.2).abs() < 1e-9);
}

#[tokio::test]
async fn operations_queued_while_connecting_run_after_connect() {
    let receiver = FakeReceiver::spawn().await;
    let mux = SocketMultiplexer::spawn();
    let client = CastClient::new(device_for(&receiver), mux, Arc::new(NullCallbacks));

    // No await between connect and the operation: it must queue
    client.connect();
    let launch = client.launch_application("CC1AD845");

    let outcome = launch.result_timeout(Duration::from_secs(10)).await;
    assert_eq!(outcome.status, Status::Success);
    assert!(client.is_connected());
}

#[tokio::test]
async fn operation_while_disconnected_is_canceled() {
    let receiver = FakeReceiver::spawn().await;
    let mux = SocketMultiplexer::spawn();
    let client = CastClient::new(device_for(&receiver), mux, Arc::new(NullCallbacks));

    let outcome = client
        .request_status()
        .result_timeout(Duration::from_secs(5))
        .await;
    assert_eq!(outcome.status, Status::Canceled);
}

#[tokio::test]
async fn stop_clears_running_application() {
    let receiver = FakeReceiver::spawn().await;
    let client = connected_client(&receiver).await;

    let launch = client
        .launch_application("CC1AD845")
        .result_timeout(Duration::from_secs(10))
        .await;
    assert_eq!(launch.status, Status::Success);

    let stop = client
        .stop_application("session-1")
        .result_timeout(Duration::from_secs(10))
        .await;
    assert_eq!(stop.status, Status::Success);
    assert!(stop.value.unwrap().application().is_none());
}

#[tokio::test]
async fn disconnect_sends_close_and_settles() {
    let receiver = FakeReceiver::spawn().await;
    let client = connected_client(&receiver).await;

    client.disconnect();
    eventually("disconnected state", || {
        client.state() == ManagerState::Disconnected
    })
    .await;

    eventually("CLOSE frame", || {
        receiver
            .payloads(NS_CONNECTION)
            .iter()
            .any(|p| p["type"] == "CLOSE")
    })
    .await;
}

#[tokio::test]
async fn connect_failure_reaches_callbacks() {
    // Nothing listens on this port
    let port = {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };
    let mux = SocketMultiplexer::spawn();
    let callbacks = Arc::new(RecordingCallbacks::default());
    let client = CastClient::new(
        DeviceRecord::for_address("127.0.0.1", port),
        mux,
        callbacks.clone(),
    );

    let status = client.blocking_connect(CONNECT_TIMEOUT).await;
    assert_eq!(status, Status::NetworkError);
    assert_eq!(client.state(), ManagerState::Disconnected);

    eventually("failure callback", || {
        callbacks.failed.lock().unwrap().as_slice() == [Status::NetworkError]
    })
    .await;
}

#[tokio::test]
async fn second_request_of_same_kind_is_rejected_locally() {
    let receiver = FakeReceiver::spawn().await;
    let client = connected_client(&receiver).await;

    // Two launches back to back: the second must fail without a second
    // LAUNCH frame on the wire
    let first = client.launch_application("CC1AD845");
    let second = client.launch_application("CC1AD845");

    let second_outcome = second.result_timeout(Duration::from_secs(10)).await;
    let first_outcome = first.result_timeout(Duration::from_secs(10)).await;

    assert_eq!(first_outcome.status, Status::Success);
    assert_eq!(second_outcome.status, Status::InvalidRequest);

    let launches = receiver
        .payloads(NS_RECEIVER)
        .iter()
        .filter(|p| p["type"] == "LAUNCH")
        .count();
    assert_eq!(launches, 1);
}

#[tokio::test]
async fn reconnect_establishes_a_fresh_session() {
    let receiver = FakeReceiver::spawn().await;
    let client = connected_client(&receiver).await;

    client.reconnect();
    eventually("reconnected", || client.is_connected()).await;

    let outcome = client
        .request_status()
        .result_timeout(Duration::from_secs(10))
        .await;
    assert_eq!(outcome.status, Status::Success);

    // Two sessions each performed their own virtual handshake
    let connects = receiver
        .payloads(NS_CONNECTION)
        .iter()
        .filter(|p| p["type"] == "CONNECT")
        .count();
    assert_eq!(connects, 2);
}
