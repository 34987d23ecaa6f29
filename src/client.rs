use crate::device::DeviceLink;
use crate::dispatch::Dispatcher;
use crate::manager::{
    ConnectionCallbacks, ConnectionManager, ManagerState, PendingTask, SubConnection,
};
use crate::multiplexer::MultiplexerHandle;
use crate::result::PendingResult;
use crate::status::Status;
use crate::subscription::DeviceEventReceiver;
use crate::types::{DeviceRecord, ReceiverStatus};
use std::sync::Arc;
use std::time::Duration;

/// Default sender origin package advertised in the CONNECT payload
const DEFAULT_PACKAGE: &str = "castlink";

/// Index of the device link among the manager's sub-connections
const DEVICE_LINK: usize = 0;

/// Client for one cast receiver device.
///
/// Composes the connection manager with the device-link sub-connection
/// and exposes the receiver operations. Every operation returns a
/// [`PendingResult`] that can be awaited or given a callback; while the
/// client is still connecting, operations queue and run once the
/// connection is up.
pub struct CastClient {
    manager: ConnectionManager,
    link: Arc<DeviceLink>,
}

impl CastClient {
    /// Build a client for `device` on the given multiplexer.
    ///
    /// The multiplexer handle is injected so several clients (and
    /// tests) can share or isolate transport loops as they choose.
    pub fn new(
        device: DeviceRecord,
        mux: MultiplexerHandle,
        callbacks: Arc<dyn ConnectionCallbacks>,
    ) -> Self {
        Self::with_package(device, mux, callbacks, DEFAULT_PACKAGE)
    }

    /// Like [`CastClient::new`], with an explicit sender origin
    /// package for the virtual-connection handshake.
    pub fn with_package(
        device: DeviceRecord,
        mux: MultiplexerHandle,
        callbacks: Arc<dyn ConnectionCallbacks>,
        package: impl Into<String>,
    ) -> Self {
        let link = DeviceLink::new(device, mux, package);
        let subs: Vec<Arc<dyn SubConnection>> = vec![link.clone()];
        let manager = ConnectionManager::new(subs, callbacks);
        Self { manager, link }
    }

    /// The device this client talks to.
    pub fn device(&self) -> &DeviceRecord {
        self.link.device()
    }

    /// Begin connecting in the background.
    pub fn connect(&self) {
        self.manager.connect();
    }

    /// Connect and wait for the attempt to settle.
    pub async fn blocking_connect(&self, timeout: Duration) -> Status {
        self.manager.blocking_connect(timeout).await
    }

    /// Tear the connection down.
    pub fn disconnect(&self) {
        self.manager.disconnect();
    }

    pub fn reconnect(&self) {
        self.manager.reconnect();
    }

    pub fn state(&self) -> ManagerState {
        self.manager.state()
    }

    pub fn is_connected(&self) -> bool {
        self.manager.is_connected()
    }

    /// Dispatcher for callbacks tied to this connection's event queue.
    pub fn dispatcher(&self) -> Dispatcher {
        self.manager.dispatcher()
    }

    /// Subscribe to device events (volume, application transitions).
    pub fn subscribe_events(&self) -> DeviceEventReceiver {
        self.link.subscribe()
    }

    /// Last-known receiver status without a round trip.
    pub fn receiver_status(&self) -> ReceiverStatus {
        self.link.receiver_status()
    }

    /// Launch the receiver application `app_id`.
    pub fn launch_application(&self, app_id: impl Into<String>) -> PendingResult<ReceiverStatus> {
        let app_id = app_id.into();
        self.submit(move |link, result| link.launch(app_id, result))
    }

    /// Stop the receiver application session `session_id`.
    pub fn stop_application(&self, session_id: impl Into<String>) -> PendingResult<ReceiverStatus> {
        let session_id = session_id.into();
        self.submit(move |link, result| link.stop(session_id, result))
    }

    /// Ask the receiver for a fresh status report.
    pub fn request_status(&self) -> PendingResult<ReceiverStatus> {
        self.submit(|link, result| link.get_status(result))
    }

    /// Set the receiver volume level, 0.0 to 1.0.
    pub fn set_volume(&self, level: f64) -> PendingResult<ReceiverStatus> {
        self.submit(move |link, result| link.set_volume(level, result))
    }

    /// Mute or unmute the receiver.
    pub fn set_mute(&self, muted: bool) -> PendingResult<ReceiverStatus> {
        self.submit(move |link, result| link.set_mute(muted, result))
    }

    /// Join a running application's virtual connection so namespaced
    /// messages can flow to it.
    pub fn join_application(&self, transport_id: impl Into<String>) {
        self.link.join_application(transport_id);
    }

    fn submit(
        &self,
        op: impl FnOnce(Arc<DeviceLink>, PendingResult<ReceiverStatus>) + Send + 'static,
    ) -> PendingResult<ReceiverStatus> {
        let result = PendingResult::new(self.manager.dispatcher());
        let link = self.link.clone();
        let run_result = result.clone();
        let cancel_result = result.clone();
        self.manager.execute(PendingTask::new(
            DEVICE_LINK,
            move || op(link, run_result),
            move || cancel_result.cancel_locally(Status::Canceled),
        ));
        result
    }
}
