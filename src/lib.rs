//! Rust library for discovering and controlling cast-style networked
//! media receivers
//!
//! This library provides an async client for receivers speaking a
//! namespace-multiplexed, JSON-framed TCP protocol. It supports:
//!
//! - Connecting to receivers from discovery-produced device records
//! - Launching, joining and stopping receiver applications
//! - Volume and mute control
//! - Heartbeat keep-alive and automatic bounded reconnect
//! - Real-time device event subscriptions
//!
//! Device discovery itself (SSDP/mDNS) is out of scope; any scanner
//! that yields a [`DeviceRecord`] can feed this client.
//!
//! # Quick Start
//!
//! ```no_run
//! use castlink::{CastClient, DeviceRecord, NullCallbacks, SocketMultiplexer};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // One transport loop per process, injected where needed
//!     let mux = SocketMultiplexer::spawn();
//!
//!     let device = DeviceRecord::for_address("192.168.1.50", 8009);
//!     let client = CastClient::new(device, mux, Arc::new(NullCallbacks));
//!
//!     let status = client.blocking_connect(Duration::from_secs(20)).await;
//!     if !status.is_success() {
//!         return Err(format!("connect failed: {status}").into());
//!     }
//!
//!     // Launch an application and wait for the receiver to report it
//!     let launch = client.launch_application("CC1AD845");
//!     let outcome = launch.result_timeout(Duration::from_secs(30)).await;
//!     println!("launch: {}", outcome.status);
//!
//!     client.set_volume(0.3);
//!
//!     // Watch device events
//!     let mut events = client.subscribe_events();
//!     while let Ok(event) = events.recv().await {
//!         println!("event: {:?}", event);
//!         break;
//!     }
//!
//!     client.disconnect();
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! The library is organized into several layers:
//!
//! - **Client**: composition root tying the manager to the device link
//! - **Manager**: connection lifecycle state machine over pluggable
//!   sub-connections, with task queueing and bounded auto-retry
//! - **Device link**: the sub-connection owning the socket and the
//!   protocol channels (heartbeat, virtual connections, receiver
//!   control)
//! - **Multiplexer**: one event-loop task owning every socket and its
//!   ring-buffered, length-prefixed framing
//! - **Result**: single-assignment pending results with await,
//!   callback, timeout and release semantics

mod channel;
mod client;
mod connection_control;
mod device;
mod dispatch;
mod error;
mod framing;
mod heartbeat;
mod manager;
mod multiplexer;
mod protocol;
mod receiver_control;
mod result;
mod socket;
mod status;
mod subscription;
mod tracker;
mod types;

// Public exports
pub use client::CastClient;
pub use device::DeviceLink;
pub use dispatch::Dispatcher;
pub use error::{CastError, Result};
pub use manager::{
    ConnectAttempt, ConnectionCallbacks, ConnectionManager, ManagerState, NullCallbacks,
    PendingTask, SubConnection, SubLinkEvents,
};
pub use multiplexer::{MultiplexerHandle, SocketMultiplexer};
pub use protocol::{CastFrame, Payload, NS_CONNECTION, NS_HEARTBEAT, NS_RECEIVER};
pub use result::{OperationResult, PendingResult};
pub use socket::{ConnectTarget, SocketEvent, SocketId};
pub use status::Status;
pub use subscription::{DeviceEvent, DeviceEventReceiver};
pub use types::{
    ApplicationStatus, ConnectionFailure, ConnectionHint, DeviceIcon, DeviceRecord,
    DisconnectReason, ReceiverStatus, SuspensionCause, VolumeState,
};
