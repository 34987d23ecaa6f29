use crate::error::{CastError, Result};
use crate::types::{ApplicationStatus, ReceiverStatus, TransportId, VolumeState};
use tokio::sync::broadcast;

/// Notification from a connected device
#[derive(Debug, Clone)]
pub enum DeviceEvent {
    /// A receiver application started (or replaced the previous one)
    ApplicationStarted(ApplicationStatus),
    /// The application on the given transport id went away
    ApplicationStopped(TransportId),
    /// Receiver volume or mute changed
    VolumeChanged(VolumeState),
    /// The receiver closed a virtual connection from its side
    VirtualConnectionClosed(TransportId),
    /// Fresh receiver status snapshot (every RECEIVER_STATUS)
    StatusUpdated(ReceiverStatus),
}

/// Receiver for device events
pub struct DeviceEventReceiver {
    rx: broadcast::Receiver<DeviceEvent>,
}

impl DeviceEventReceiver {
    pub(crate) fn new(rx: broadcast::Receiver<DeviceEvent>) -> Self {
        Self { rx }
    }

    /// Receive the next device event.
    pub async fn recv(&mut self) -> Result<DeviceEvent> {
        self.rx.recv().await.map_err(|e| match e {
            broadcast::error::RecvError::Closed => CastError::ConnectionClosed,
            broadcast::error::RecvError::Lagged(n) => {
                CastError::ChannelError(format!("Lagged by {} events", n))
            }
        })
    }

    /// Try to receive a device event without waiting.
    ///
    /// Returns `None` if no event is queued.
    pub fn try_recv(&mut self) -> Result<Option<DeviceEvent>> {
        match self.rx.try_recv() {
            Ok(event) => Ok(Some(event)),
            Err(broadcast::error::TryRecvError::Empty) => Ok(None),
            Err(broadcast::error::TryRecvError::Closed) => Err(CastError::ConnectionClosed),
            Err(broadcast::error::TryRecvError::Lagged(n)) => {
                Err(CastError::ChannelError(format!("Lagged by {} events", n)))
            }
        }
    }
}
