use crate::channel::{CastSink, RequestIds};
use crate::connection_control::ConnectionControl;
use crate::dispatch::{Dispatcher, EventQueue, Task};
use crate::heartbeat::{Heartbeat, HeartbeatVerdict};
use crate::manager::{ConnectAttempt, SubConnection, SubLinkEvents};
use crate::multiplexer::MultiplexerHandle;
use crate::protocol::{
    request_id_of, CastFrame, NS_CONNECTION, NS_HEARTBEAT, NS_RECEIVER, PLATFORM_RECEIVER_ID,
};
use crate::receiver_control::{ReceiverControl, ReceiverNotice};
use crate::result::{OperationResult, PendingResult};
use crate::socket::{ConnectTarget, SocketEvent, SocketId};
use crate::status::{status_for_error, Status};
use crate::subscription::{DeviceEvent, DeviceEventReceiver};
use crate::types::{
    ConnectionFailure, ConnectionHint, DeviceRecord, DisconnectReason, ReceiverStatus,
    SuspensionCause,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;

/// Failure aggregation rank of the device link (lower ranks win)
const DEVICE_LINK_PRIORITY: i32 = 2;

const EVENT_CHANNEL_CAPACITY: usize = 100;

/// The device-link sub-connection.
///
/// Owns one socket on the multiplexer plus the three protocol channels,
/// and runs them all on its own event queue task. The manager drives
/// `connect`/`disconnect`; operations arrive as queued tasks once the
/// manager is connected.
pub struct DeviceLink {
    shared: Arc<LinkShared>,
}

struct LinkShared {
    queue: EventQueue<LinkMsg>,
    device: DeviceRecord,
    events_tx: broadcast::Sender<DeviceEvent>,
    connected: AtomicBool,
    status: Mutex<ReceiverStatus>,
}

enum LinkMsg {
    Attach(SubLinkEvents),
    Connect(ConnectAttempt),
    Disconnect,
    Socket(SocketEvent),
    SendFailed {
        frame: CastFrame,
        status: Status,
    },
    HeartbeatTick {
        epoch: u64,
    },
    Launch {
        app_id: String,
        result: PendingResult<ReceiverStatus>,
    },
    Stop {
        session_id: String,
        result: PendingResult<ReceiverStatus>,
    },
    GetStatus {
        result: PendingResult<ReceiverStatus>,
    },
    SetVolume {
        level: f64,
        result: PendingResult<ReceiverStatus>,
    },
    SetMute {
        muted: bool,
        result: PendingResult<ReceiverStatus>,
    },
    JoinApplication {
        transport_id: String,
    },
    Run(Task),
    Shutdown,
}

impl DeviceLink {
    /// Build the link and spawn its event queue task.
    pub fn new(
        device: DeviceRecord,
        mux: MultiplexerHandle,
        package: impl Into<String>,
    ) -> Arc<Self> {
        let (queue, rx) = EventQueue::channel();
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let shared = Arc::new(LinkShared {
            queue: queue.clone(),
            device,
            events_tx,
            connected: AtomicBool::new(false),
            status: Mutex::new(ReceiverStatus::default()),
        });

        let dispatcher = {
            let queue = queue.clone();
            Dispatcher::new(move |task| queue.post(LinkMsg::Run(task)))
        };
        let driver = LinkDriver {
            shared: shared.clone(),
            mux,
            dispatcher,
            package: package.into(),
            sender_id: format!(
                "sender-{}",
                &uuid::Uuid::new_v4().simple().to_string()[..8]
            )
            .into(),
            state: LinkState::Idle,
            epoch: 0,
            manager_events: None,
        };
        tokio::spawn(run(rx, driver));

        Arc::new(Self { shared })
    }

    /// Subscribe to device events.
    pub fn subscribe(&self) -> DeviceEventReceiver {
        DeviceEventReceiver::new(self.shared.events_tx.subscribe())
    }

    /// Last-known receiver status snapshot; no round trip.
    pub fn receiver_status(&self) -> ReceiverStatus {
        self.shared.status.lock().unwrap().clone()
    }

    pub fn device(&self) -> &DeviceRecord {
        &self.shared.device
    }

    /// Open a virtual connection to a running application's transport
    /// id, joining it for namespaced messaging.
    pub fn join_application(&self, transport_id: impl Into<String>) {
        self.shared.queue.post(LinkMsg::JoinApplication {
            transport_id: transport_id.into(),
        });
    }

    pub(crate) fn launch(&self, app_id: String, result: PendingResult<ReceiverStatus>) {
        self.shared.queue.post(LinkMsg::Launch { app_id, result });
    }

    pub(crate) fn stop(&self, session_id: String, result: PendingResult<ReceiverStatus>) {
        self.shared
            .queue
            .post(LinkMsg::Stop { session_id, result });
    }

    pub(crate) fn get_status(&self, result: PendingResult<ReceiverStatus>) {
        self.shared.queue.post(LinkMsg::GetStatus { result });
    }

    pub(crate) fn set_volume(&self, level: f64, result: PendingResult<ReceiverStatus>) {
        self.shared.queue.post(LinkMsg::SetVolume { level, result });
    }

    pub(crate) fn set_mute(&self, muted: bool, result: PendingResult<ReceiverStatus>) {
        self.shared.queue.post(LinkMsg::SetMute { muted, result });
    }
}

impl SubConnection for DeviceLink {
    fn attach(&self, events: SubLinkEvents) {
        self.shared.queue.post(LinkMsg::Attach(events));
    }

    fn connect(&self, attempt: ConnectAttempt) {
        self.shared.queue.post(LinkMsg::Connect(attempt));
    }

    fn disconnect(&self) {
        self.shared.queue.post(LinkMsg::Disconnect);
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }
}

impl Drop for DeviceLink {
    fn drop(&mut self) {
        self.shared.queue.post(LinkMsg::Shutdown);
    }
}

enum LinkState {
    Idle,
    Connecting {
        socket: SocketId,
        attempt: Option<ConnectAttempt>,
        channels: Channels,
    },
    Connected {
        socket: SocketId,
        channels: Channels,
    },
    Disconnecting {
        socket: SocketId,
        /// Suspension to report once the socket confirms teardown
        suspend: Option<SuspensionCause>,
        /// Connect that arrived mid-teardown; started fresh afterwards
        pending_attempt: Option<ConnectAttempt>,
    },
}

struct Channels {
    heartbeat: Heartbeat,
    connection: ConnectionControl,
    receiver: ReceiverControl,
}

struct LinkDriver {
    shared: Arc<LinkShared>,
    mux: MultiplexerHandle,
    dispatcher: Dispatcher,
    package: String,
    sender_id: Arc<str>,
    state: LinkState,
    /// Bumped per connect attempt; stale heartbeat ticks are dropped
    /// by epoch mismatch
    epoch: u64,
    manager_events: Option<SubLinkEvents>,
}

async fn run(mut rx: mpsc::UnboundedReceiver<LinkMsg>, mut driver: LinkDriver) {
    while let Some(msg) = rx.recv().await {
        if matches!(msg, LinkMsg::Shutdown) {
            driver.handle_disconnect();
            break;
        }
        driver.handle(msg);
    }
}

impl LinkDriver {
    fn handle(&mut self, msg: LinkMsg) {
        match msg {
            LinkMsg::Attach(events) => self.manager_events = Some(events),
            LinkMsg::Connect(attempt) => self.handle_connect(attempt),
            LinkMsg::Disconnect => self.handle_disconnect(),
            LinkMsg::Socket(event) => self.handle_socket(event),
            LinkMsg::SendFailed { frame, status } => self.handle_send_failed(frame, status),
            LinkMsg::HeartbeatTick { epoch } => self.handle_heartbeat_tick(epoch),
            LinkMsg::Launch { app_id, result } => {
                self.run_op(result, |channels| channels.receiver.launch(&app_id))
            }
            LinkMsg::Stop { session_id, result } => {
                self.run_op(result, |channels| channels.receiver.stop(&session_id))
            }
            LinkMsg::GetStatus { result } => {
                self.run_op(result, |channels| channels.receiver.get_status())
            }
            LinkMsg::SetVolume { level, result } => {
                self.run_op(result, |channels| channels.receiver.set_volume(level))
            }
            LinkMsg::SetMute { muted, result } => {
                self.run_op(result, |channels| channels.receiver.set_mute(muted))
            }
            LinkMsg::JoinApplication { transport_id } => {
                if let LinkState::Connected { channels, .. } = &mut self.state {
                    if let Err(e) = channels.connection.connect(&transport_id) {
                        tracing::warn!("join {} failed: {}", transport_id, e);
                    }
                }
            }
            LinkMsg::Run(task) => task(),
            LinkMsg::Shutdown => {}
        }
    }

    fn handle_connect(&mut self, attempt: ConnectAttempt) {
        if matches!(self.state, LinkState::Idle) {
            self.start_connect(attempt);
            return;
        }
        if let LinkState::Disconnecting {
            pending_attempt, ..
        } = &mut self.state
        {
            // The old socket is still flushing; pick the attempt up
            // once it confirms teardown
            if pending_attempt.is_none() {
                *pending_attempt = Some(attempt);
                return;
            }
        }
        tracing::warn!("connect while link busy");
        attempt.failed(ConnectionFailure::new(
            Status::InternalError,
            DEVICE_LINK_PRIORITY,
        ));
    }

    fn start_connect(&mut self, attempt: ConnectAttempt) {
        self.epoch += 1;
        let device = &self.shared.device;
        let target = ConnectTarget {
            host: device.host.clone(),
            port: device.port,
            tls: device.tls,
        };

        // Socket events hop from the multiplexer onto this queue
        let (sock_tx, mut sock_rx) = mpsc::unbounded_channel();
        let socket = self.mux.connect(target, sock_tx);
        {
            let queue = self.shared.queue.clone();
            tokio::spawn(async move {
                while let Some(event) = sock_rx.recv().await {
                    if !queue.post(LinkMsg::Socket(event)) {
                        break;
                    }
                }
            });
        }

        // Outbound frames drain through the multiplexer in order;
        // backpressure comes back as a SendFailed message. When every
        // sink is gone the pump flushes what is queued and then asks
        // for the graceful disconnect, so teardown can never overtake
        // the final CLOSE frames.
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<CastFrame>();
        {
            let queue = self.shared.queue.clone();
            let mux = self.mux.clone();
            tokio::spawn(async move {
                while let Some(frame) = out_rx.recv().await {
                    if let Err(e) = mux.send(socket, frame.clone()).await {
                        let status = status_for_error(&e);
                        tracing::warn!("send on {} failed: {}", frame.namespace, e);
                        if !queue.post(LinkMsg::SendFailed { frame, status }) {
                            break;
                        }
                    }
                }
                mux.disconnect(socket);
            });
        }

        let sink = CastSink::new(self.sender_id.clone(), out_tx);
        let channels = Channels {
            heartbeat: Heartbeat::new(sink.clone(), Instant::now()),
            connection: ConnectionControl::new(sink.clone(), self.package.clone()),
            receiver: ReceiverControl::new(sink, RequestIds::new(), self.dispatcher.clone()),
        };
        self.state = LinkState::Connecting {
            socket,
            attempt: Some(attempt),
            channels,
        };
    }

    fn handle_disconnect(&mut self) {
        match std::mem::replace(&mut self.state, LinkState::Idle) {
            LinkState::Idle => {}
            LinkState::Connecting {
                socket,
                attempt,
                channels,
            } => {
                // The resulting ConnectFailed(ExplicitClose) reports
                // the cancellation to the attempt
                self.mux.disconnect(socket);
                self.state = LinkState::Connecting {
                    socket,
                    attempt,
                    channels,
                };
            }
            LinkState::Connected {
                socket,
                mut channels,
            } => {
                channels.connection.close_all();
                channels.receiver.reset(Status::Canceled);
                self.shared.connected.store(false, Ordering::SeqCst);
                // Dropping the channels drops every sink; the pump
                // flushes the CLOSE frames and then disconnects
                drop(channels);
                self.state = LinkState::Disconnecting {
                    socket,
                    suspend: None,
                    pending_attempt: None,
                };
            }
            LinkState::Disconnecting {
                socket,
                suspend,
                pending_attempt,
            } => {
                if let Some(attempt) = pending_attempt {
                    attempt.failed(ConnectionFailure::new(
                        Status::Canceled,
                        DEVICE_LINK_PRIORITY,
                    ));
                }
                self.state = LinkState::Disconnecting {
                    socket,
                    suspend,
                    pending_attempt: None,
                };
            }
        }
    }

    fn handle_socket(&mut self, event: SocketEvent) {
        match event {
            SocketEvent::Connected(id) => self.on_socket_connected(id),
            SocketEvent::Frame(id, frame) => self.on_frame(id, frame),
            SocketEvent::ConnectFailed(id, reason) => self.on_connect_failed(id, reason),
            SocketEvent::Disconnected(id, reason) => self.on_disconnected(id, reason),
        }
    }

    fn current_socket(&self) -> Option<SocketId> {
        match &self.state {
            LinkState::Idle => None,
            LinkState::Connecting { socket, .. }
            | LinkState::Connected { socket, .. }
            | LinkState::Disconnecting { socket, .. } => Some(*socket),
        }
    }

    fn on_socket_connected(&mut self, id: SocketId) {
        if self.current_socket() != Some(id) {
            return;
        }
        if !matches!(self.state, LinkState::Connecting { .. }) {
            tracing::debug!("spurious socket connect event");
            return;
        }
        let LinkState::Connecting {
            socket,
            attempt,
            mut channels,
        } = std::mem::replace(&mut self.state, LinkState::Idle)
        else {
            unreachable!()
        };

        if let Err(e) = channels.connection.connect(PLATFORM_RECEIVER_ID) {
            tracing::error!("platform CONNECT failed: {}", e);
        }
        // Prime the status snapshot; the answer flows through the
        // normal RECEIVER_STATUS path
        if let Err(e) = channels.receiver.get_status() {
            tracing::debug!("initial status request not sent: {}", e);
        }

        let epoch = self.epoch;
        self.shared
            .queue
            .post_delayed(Heartbeat::tick_interval(), LinkMsg::HeartbeatTick { epoch });

        self.shared.connected.store(true, Ordering::SeqCst);
        self.state = LinkState::Connected { socket, channels };

        if let Some(attempt) = attempt {
            let mut hint = ConnectionHint::new();
            hint.insert(
                "device",
                json!({
                    "friendlyName": self.shared.device.friendly_name,
                    "model": self.shared.device.model,
                }),
            );
            attempt.connected(hint);
        }
    }

    fn on_connect_failed(&mut self, id: SocketId, reason: DisconnectReason) {
        if self.current_socket() != Some(id) {
            return;
        }
        let state = std::mem::replace(&mut self.state, LinkState::Idle);
        if let LinkState::Connecting { attempt, .. } = state {
            if let Some(attempt) = attempt {
                attempt.failed(ConnectionFailure::new(
                    reason.connect_status(),
                    DEVICE_LINK_PRIORITY,
                ));
            }
        }
    }

    fn on_disconnected(&mut self, id: SocketId, reason: DisconnectReason) {
        if self.current_socket() != Some(id) {
            return;
        }
        let state = std::mem::replace(&mut self.state, LinkState::Idle);
        self.shared.connected.store(false, Ordering::SeqCst);
        *self.shared.status.lock().unwrap() = ReceiverStatus::default();

        match state {
            LinkState::Connected { mut channels, .. } => {
                // Unexpected loss of an established link
                tracing::warn!("device socket lost: {:?}", reason);
                channels.receiver.reset(Status::NetworkError);
                if let Some(events) = &self.manager_events {
                    events.suspended(SuspensionCause::ServiceDisconnected);
                }
            }
            LinkState::Disconnecting {
                suspend,
                pending_attempt,
                ..
            } => {
                if let (Some(cause), Some(events)) = (suspend, &self.manager_events) {
                    events.suspended(cause);
                }
                if let Some(attempt) = pending_attempt {
                    self.start_connect(attempt);
                }
            }
            LinkState::Connecting { attempt, .. } => {
                if let Some(attempt) = attempt {
                    attempt.failed(ConnectionFailure::new(
                        reason.connect_status(),
                        DEVICE_LINK_PRIORITY,
                    ));
                }
            }
            LinkState::Idle => {}
        }
    }

    fn on_frame(&mut self, id: SocketId, frame: CastFrame) {
        if self.current_socket() != Some(id) {
            return;
        }
        if frame.destination_id != self.sender_id.as_ref() && frame.destination_id != "*" {
            tracing::debug!("frame for {} ignored", frame.destination_id);
            return;
        }
        let channels = match &mut self.state {
            LinkState::Connecting { channels, .. } | LinkState::Connected { channels, .. } => {
                channels
            }
            _ => return,
        };

        channels.heartbeat.on_traffic(Instant::now());

        match frame.namespace.as_str() {
            NS_HEARTBEAT => {
                if let Err(e) = channels.heartbeat.on_message(&frame) {
                    tracing::warn!("heartbeat message error: {}", e);
                }
            }
            NS_CONNECTION => match channels.connection.on_message(&frame) {
                Ok(Some(transport_id)) => {
                    let _ = self
                        .shared
                        .events_tx
                        .send(DeviceEvent::VirtualConnectionClosed(transport_id));
                }
                Ok(None) => {}
                Err(e) => tracing::warn!("connection message error: {}", e),
            },
            NS_RECEIVER => match channels.receiver.on_message(&frame) {
                Ok(notices) => {
                    let snapshot = channels.receiver.status().clone();
                    let changed = {
                        let mut held = self.shared.status.lock().unwrap();
                        let changed = *held != snapshot;
                        *held = snapshot.clone();
                        changed
                    };
                    for notice in notices {
                        let event = match notice {
                            ReceiverNotice::ApplicationStarted(app) => {
                                DeviceEvent::ApplicationStarted(app)
                            }
                            ReceiverNotice::ApplicationStopped(tid) => {
                                DeviceEvent::ApplicationStopped(tid)
                            }
                            ReceiverNotice::VolumeChanged(volume) => {
                                DeviceEvent::VolumeChanged(volume)
                            }
                        };
                        let _ = self.shared.events_tx.send(event);
                    }
                    if changed {
                        let _ = self
                            .shared
                            .events_tx
                            .send(DeviceEvent::StatusUpdated(snapshot));
                    }
                }
                Err(e) => tracing::warn!("receiver message error: {}", e),
            },
            other => {
                tracing::debug!("no channel for namespace {}", other);
            }
        }
    }

    fn handle_send_failed(&mut self, frame: CastFrame, status: Status) {
        if frame.namespace != NS_RECEIVER {
            return;
        }
        let LinkState::Connected { channels, .. } = &mut self.state else {
            return;
        };
        if let Ok(payload) = frame.payload_json() {
            if let Some(request_id) = request_id_of(&payload) {
                channels.receiver.fail_request(request_id, status);
            }
        }
    }

    fn handle_heartbeat_tick(&mut self, epoch: u64) {
        if epoch != self.epoch {
            return;
        }
        let verdict = match &mut self.state {
            LinkState::Connected { channels, .. } => channels.heartbeat.on_tick(Instant::now()),
            _ => return,
        };
        match verdict {
            Ok(HeartbeatVerdict::Alive) => {
                self.shared
                    .queue
                    .post_delayed(Heartbeat::tick_interval(), LinkMsg::HeartbeatTick { epoch });
            }
            Ok(HeartbeatVerdict::LinkDead) => {
                let LinkState::Connected {
                    socket,
                    mut channels,
                } = std::mem::replace(&mut self.state, LinkState::Idle)
                else {
                    unreachable!()
                };
                channels.receiver.reset(Status::NetworkError);
                self.shared.connected.store(false, Ordering::SeqCst);
                // Dropping the channels makes the pump disconnect the
                // dead socket
                drop(channels);
                self.state = LinkState::Disconnecting {
                    socket,
                    suspend: Some(SuspensionCause::ServiceDisconnected),
                    pending_attempt: None,
                };
            }
            Err(e) => {
                // The link is going down; the socket event will follow
                tracing::debug!("heartbeat send failed: {}", e);
            }
        }
    }

    /// Run one receiver operation against the connected channel set,
    /// bridging the tracker's pending result into the caller's.
    fn run_op(
        &mut self,
        result: PendingResult<ReceiverStatus>,
        op: impl FnOnce(&mut Channels) -> crate::error::Result<PendingResult<Value>>,
    ) {
        let LinkState::Connected { channels, .. } = &mut self.state else {
            result.post_result(OperationResult::failure(Status::NetworkError));
            return;
        };
        match op(channels) {
            Ok(inner) => {
                inner.set_callback(move |out: OperationResult<Value>| {
                    result.post_result(map_receiver_outcome(out));
                });
            }
            Err(e) => {
                result.post_result(OperationResult::failure(status_for_error(&e)));
            }
        }
    }
}

/// Lift a raw RECEIVER_STATUS payload outcome into a typed one.
fn map_receiver_outcome(out: OperationResult<Value>) -> OperationResult<ReceiverStatus> {
    if !out.is_success() {
        return OperationResult::failure(out.status);
    }
    let parsed = out
        .value
        .as_ref()
        .and_then(|payload| payload.get("status"))
        .and_then(|status| serde_json::from_value::<ReceiverStatus>(status.clone()).ok());
    match parsed {
        Some(status) => OperationResult::success(status),
        None => OperationResult::failure(Status::InternalError),
    }
}
