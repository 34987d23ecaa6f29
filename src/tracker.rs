use crate::dispatch::{DelayedHandle, Dispatcher};
use crate::error::{CastError, Result};
use crate::result::{OperationResult, PendingResult};
use crate::status::Status;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use serde_json::Value;

/// Correlates one outstanding request id with its pending result and
/// deadline.
///
/// Each logical operation kind on a channel owns one tracker, so a
/// second request of the same kind is rejected while the first is in
/// flight. Completion, deadline expiry, and channel reset all clear
/// the slot.
pub struct RequestTracker {
    kind: &'static str,
    timeout: Duration,
    dispatcher: Dispatcher,
    slot: Arc<Mutex<Option<Tracked>>>,
}

struct Tracked {
    request_id: i32,
    result: PendingResult<Value>,
    deadline: DelayedHandle,
}

impl RequestTracker {
    pub fn new(kind: &'static str, timeout: Duration, dispatcher: Dispatcher) -> Self {
        Self {
            kind,
            timeout,
            dispatcher,
            slot: Arc::new(Mutex::new(None)),
        }
    }

    /// Operation kind this tracker guards.
    pub fn kind(&self) -> &'static str {
        self.kind
    }

    /// Whether a request is currently outstanding.
    pub fn is_tracking(&self) -> bool {
        self.slot.lock().unwrap().is_some()
    }

    /// Begin tracking `request_id`.
    ///
    /// Fails with `RequestInFlight` while another request of this kind
    /// is outstanding; the caller must not send the new request. The
    /// deadline fires on the owning event queue and resolves the
    /// result with TIMEOUT.
    pub fn track(&self, request_id: i32) -> Result<PendingResult<Value>> {
        let mut slot = self.slot.lock().unwrap();
        if slot.is_some() {
            return Err(CastError::RequestInFlight { kind: self.kind });
        }

        let result = PendingResult::new(self.dispatcher.clone());
        let slot_ref = self.slot.clone();
        result.set_unregister_hook(move || {
            let mut slot = slot_ref.lock().unwrap();
            if slot
                .as_ref()
                .is_some_and(|t| t.request_id == request_id)
            {
                *slot = None;
            }
        });

        let deadline = {
            let slot_ref = self.slot.clone();
            let kind = self.kind;
            self.dispatcher.dispatch_delayed(self.timeout, move || {
                let tracked = {
                    let mut slot = slot_ref.lock().unwrap();
                    match slot.as_ref() {
                        Some(t) if t.request_id == request_id => slot.take(),
                        _ => None,
                    }
                };
                if let Some(tracked) = tracked {
                    tracing::warn!("{} request {} deadline expired", kind, request_id);
                    tracked
                        .result
                        .post_result(OperationResult::failure(Status::Timeout));
                }
            })
        };

        *slot = Some(Tracked {
            request_id,
            result: result.clone(),
            deadline,
        });
        Ok(result)
    }

    /// Resolve the tracked request if `request_id` matches it.
    ///
    /// Returns false when nothing matched (stale or unrelated id).
    pub fn complete(&self, request_id: i32, outcome: OperationResult<Value>) -> bool {
        let tracked = {
            let mut slot = self.slot.lock().unwrap();
            match slot.as_ref() {
                Some(t) if t.request_id == request_id => slot.take(),
                _ => None,
            }
        };
        match tracked {
            Some(tracked) => {
                tracked.deadline.cancel();
                tracked.result.post_result(outcome);
                true
            }
            None => false,
        }
    }

    /// Drop any outstanding request, resolving it with `status`.
    /// Called when the channel or connection is torn down.
    pub fn reset(&self, status: Status) {
        let tracked = self.slot.lock().unwrap().take();
        if let Some(tracked) = tracked {
            tracked.deadline.cancel();
            tracked.result.post_result(OperationResult::failure(status));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tracker(timeout: Duration) -> RequestTracker {
        RequestTracker::new("launch", timeout, Dispatcher::immediate())
    }

    #[tokio::test]
    async fn completes_matching_request() {
        let tracker = tracker(Duration::from_secs(3));
        let result = tracker.track(1).unwrap();
        assert!(tracker.is_tracking());

        assert!(tracker.complete(1, OperationResult::success(json!({"ok": true}))));
        let out = result.result().await;
        assert_eq!(out.status, Status::Success);
        assert!(!tracker.is_tracking());
    }

    #[tokio::test]
    async fn rejects_second_request_of_same_kind() {
        let tracker = tracker(Duration::from_secs(3));
        let _first = tracker.track(1).unwrap();
        assert!(matches!(
            tracker.track(2),
            Err(CastError::RequestInFlight { kind: "launch" })
        ));
        // The outstanding request is untouched
        assert!(tracker.is_tracking());
        assert!(tracker.complete(1, OperationResult::success(json!(null))));
    }

    #[tokio::test]
    async fn stale_completion_is_ignored() {
        let tracker = tracker(Duration::from_secs(3));
        let _result = tracker.track(5).unwrap();
        assert!(!tracker.complete(4, OperationResult::success(json!(null))));
        assert!(tracker.is_tracking());
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_resolves_with_timeout() {
        let tracker = tracker(Duration::from_millis(100));
        let result = tracker.track(1).unwrap();

        let out = result.result().await;
        assert_eq!(out.status, Status::Timeout);
        assert!(!tracker.is_tracking());

        // Frees the slot for the next request of this kind
        assert!(tracker.track(2).is_ok());
    }

    #[tokio::test]
    async fn reset_cancels_outstanding_request() {
        let tracker = tracker(Duration::from_secs(3));
        let result = tracker.track(1).unwrap();
        tracker.reset(Status::Canceled);
        let out = result.result().await;
        assert_eq!(out.status, Status::Canceled);
        assert!(!tracker.is_tracking());
    }
}
