use crate::channel::{CastSink, RequestIds};
use crate::dispatch::Dispatcher;
use crate::error::Result;
use crate::protocol::{
    receiver, request_id_of, CastFrame, MessageType, NS_RECEIVER, PLATFORM_RECEIVER_ID,
};
use crate::result::{OperationResult, PendingResult};
use crate::status::{status_for_reason, Status};
use crate::tracker::RequestTracker;
use crate::types::{ApplicationStatus, ReceiverStatus, VolumeState};
use serde_json::Value;
use std::time::Duration;

const LAUNCH_TIMEOUT: Duration = Duration::from_secs(30);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(3);

/// Changes detected by diffing consecutive receiver status reports.
///
/// These fire independently of request/response correlation: a status
/// pushed by the receiver on its own surfaces the same notices as one
/// answering our request.
#[derive(Debug, Clone)]
pub enum ReceiverNotice {
    ApplicationStarted(ApplicationStatus),
    ApplicationStopped(String),
    VolumeChanged(VolumeState),
}

/// Receiver-control channel: application launch/stop, status polling,
/// volume and mute, one tracker per operation kind.
pub struct ReceiverControl {
    sink: CastSink,
    ids: RequestIds,
    launch: RequestTracker,
    stop: RequestTracker,
    status: RequestTracker,
    volume: RequestTracker,
    mute: RequestTracker,
    last_status: ReceiverStatus,
    last_transport_id: Option<String>,
    last_volume: Option<VolumeState>,
}

impl ReceiverControl {
    pub fn new(sink: CastSink, ids: RequestIds, dispatcher: Dispatcher) -> Self {
        Self {
            sink,
            ids,
            launch: RequestTracker::new("launch", LAUNCH_TIMEOUT, dispatcher.clone()),
            stop: RequestTracker::new("stop", REQUEST_TIMEOUT, dispatcher.clone()),
            status: RequestTracker::new("get-status", REQUEST_TIMEOUT, dispatcher.clone()),
            volume: RequestTracker::new("set-volume", REQUEST_TIMEOUT, dispatcher.clone()),
            mute: RequestTracker::new("set-mute", REQUEST_TIMEOUT, dispatcher),
            last_status: ReceiverStatus::default(),
            last_transport_id: None,
            last_volume: None,
        }
    }

    /// Last-known receiver state, updated on every RECEIVER_STATUS.
    pub fn status(&self) -> &ReceiverStatus {
        &self.last_status
    }

    pub fn launch(&mut self, app_id: &str) -> Result<PendingResult<Value>> {
        let request_id = self.ids.next();
        let pending = self.launch.track(request_id)?;
        self.send_or_fail(&self.launch, request_id, receiver::launch(request_id, app_id));
        Ok(pending)
    }

    pub fn stop(&mut self, session_id: &str) -> Result<PendingResult<Value>> {
        let request_id = self.ids.next();
        let pending = self.stop.track(request_id)?;
        self.send_or_fail(&self.stop, request_id, receiver::stop(request_id, session_id));
        Ok(pending)
    }

    pub fn get_status(&mut self) -> Result<PendingResult<Value>> {
        let request_id = self.ids.next();
        let pending = self.status.track(request_id)?;
        self.send_or_fail(&self.status, request_id, receiver::get_status(request_id));
        Ok(pending)
    }

    pub fn set_volume(&mut self, level: f64) -> Result<PendingResult<Value>> {
        let request_id = self.ids.next();
        let pending = self.volume.track(request_id)?;
        self.send_or_fail(&self.volume, request_id, receiver::set_volume(request_id, level));
        Ok(pending)
    }

    pub fn set_mute(&mut self, muted: bool) -> Result<PendingResult<Value>> {
        let request_id = self.ids.next();
        let pending = self.mute.track(request_id)?;
        self.send_or_fail(&self.mute, request_id, receiver::set_mute(request_id, muted));
        Ok(pending)
    }

    fn send_or_fail(&self, tracker: &RequestTracker, request_id: i32, payload: Value) {
        if self
            .sink
            .send(PLATFORM_RECEIVER_ID, NS_RECEIVER, &payload)
            .is_err()
        {
            tracker.complete(
                request_id,
                OperationResult::failure(Status::NetworkError),
            );
        }
    }

    /// Fail the tracked request carrying `request_id`, whichever kind
    /// it is. Used when an already-queued frame could not be delivered
    /// (send-buffer backpressure).
    pub fn fail_request(&self, request_id: i32, status: Status) {
        for tracker in self.trackers() {
            if tracker.complete(request_id, OperationResult::failure(status)) {
                return;
            }
        }
    }

    /// Cancel every outstanding request; used on channel reset.
    pub fn reset(&mut self, status: Status) {
        for tracker in self.trackers() {
            tracker.reset(status);
        }
        self.last_transport_id = None;
        self.last_volume = None;
        self.last_status = ReceiverStatus::default();
    }

    fn trackers(&self) -> [&RequestTracker; 5] {
        [
            &self.launch,
            &self.stop,
            &self.status,
            &self.volume,
            &self.mute,
        ]
    }

    /// Handle a frame on the receiver namespace.
    pub fn on_message(&mut self, frame: &CastFrame) -> Result<Vec<ReceiverNotice>> {
        let payload = frame.payload_json()?;
        match MessageType::of(&payload) {
            Some(MessageType::ReceiverStatus) => {
                if let Some(request_id) = request_id_of(&payload) {
                    for tracker in self.trackers() {
                        if tracker.complete(request_id, OperationResult::success(payload.clone())) {
                            break;
                        }
                    }
                }
                self.apply_status(&payload)
            }
            Some(MessageType::LaunchError) => {
                let status = reason_status(&payload);
                tracing::warn!("launch error: {:?}", status);
                if let Some(request_id) = request_id_of(&payload) {
                    self.launch
                        .complete(request_id, OperationResult::failure(status));
                }
                Ok(Vec::new())
            }
            Some(MessageType::InvalidRequest) => {
                let status = reason_status(&payload);
                tracing::warn!("receiver rejected request: {:?}", status);
                if let Some(request_id) = request_id_of(&payload) {
                    self.fail_request(request_id, status);
                }
                Ok(Vec::new())
            }
            _ => {
                tracing::debug!("ignoring receiver message: {}", payload);
                Ok(Vec::new())
            }
        }
    }

    /// Update the snapshot and diff it against the previous one.
    fn apply_status(&mut self, payload: &Value) -> Result<Vec<ReceiverNotice>> {
        let Some(status_value) = payload.get("status") else {
            return Ok(Vec::new());
        };
        let status: ReceiverStatus = serde_json::from_value(status_value.clone())?;
        let mut notices = Vec::new();

        let transport_id = status.application().map(|a| a.transport_id.clone());
        match (&self.last_transport_id, &transport_id) {
            (old, Some(new)) if old.as_deref() != Some(new.as_str()) => {
                if let Some(old) = old.clone() {
                    notices.push(ReceiverNotice::ApplicationStopped(old));
                }
                if let Some(app) = status.application() {
                    notices.push(ReceiverNotice::ApplicationStarted(app.clone()));
                }
            }
            (Some(old), None) => {
                notices.push(ReceiverNotice::ApplicationStopped(old.clone()));
            }
            _ => {}
        }

        if self.last_volume.is_some_and(|v| v != status.volume)
            || (self.last_volume.is_none() && status.volume != VolumeState::default())
        {
            notices.push(ReceiverNotice::VolumeChanged(status.volume));
        }

        self.last_transport_id = transport_id;
        self.last_volume = Some(status.volume);
        self.last_status = status;
        Ok(notices)
    }
}

fn reason_status(payload: &Value) -> Status {
    payload
        .get("reason")
        .and_then(|v| v.as_str())
        .map(status_for_reason)
        .unwrap_or(Status::InternalError)
}
