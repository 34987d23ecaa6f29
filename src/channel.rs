use crate::error::{CastError, Result};
use crate::protocol::CastFrame;
use serde_json::Value;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Outbound half shared by every protocol channel on one device link.
///
/// Frames flow into the link's forwarder, which pushes them onto the
/// socket write ring; backpressure surfaces there, not here.
#[derive(Clone)]
pub struct CastSink {
    source_id: Arc<str>,
    tx: mpsc::UnboundedSender<CastFrame>,
}

impl CastSink {
    pub fn new(source_id: impl Into<Arc<str>>, tx: mpsc::UnboundedSender<CastFrame>) -> Self {
        Self {
            source_id: source_id.into(),
            tx,
        }
    }

    /// Local sender id stamped on every outbound frame.
    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    /// Send one JSON payload on `namespace` to `destination`.
    pub fn send(&self, destination: &str, namespace: &str, payload: &Value) -> Result<()> {
        let frame = CastFrame::text(self.source_id.as_ref(), destination, namespace, payload);
        tracing::debug!("-> {} {}: {}", destination, namespace, payload);
        self.tx
            .send(frame)
            .map_err(|_| CastError::ConnectionClosed)
    }
}

/// Monotonic request-id allocator shared by the channels of one link.
///
/// Every request carries one of these ids; the receiver echoes it in
/// the matching response.
#[derive(Clone)]
pub struct RequestIds {
    next: Arc<AtomicI32>,
}

impl RequestIds {
    pub fn new() -> Self {
        Self {
            next: Arc::new(AtomicI32::new(1)),
        }
    }

    pub fn next(&self) -> i32 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for RequestIds {
    fn default() -> Self {
        Self::new()
    }
}
