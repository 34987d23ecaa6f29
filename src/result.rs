use crate::dispatch::{DelayedHandle, Dispatcher};
use crate::status::Status;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

/// Outcome of an asynchronous device operation.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationResult<T> {
    pub status: Status,
    pub value: Option<T>,
}

impl<T> OperationResult<T> {
    pub fn success(value: T) -> Self {
        Self {
            status: Status::Success,
            value: Some(value),
        }
    }

    pub fn failure(status: Status) -> Self {
        Self {
            status,
            value: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

type Callback<T> = Box<dyn FnOnce(OperationResult<T>) + Send>;
type ReleaseHook<T> = Box<dyn FnOnce(&OperationResult<T>) + Send>;
type UnregisterHook = Box<dyn FnOnce() + Send>;

struct State<T> {
    result: Option<OperationResult<T>>,
    /// Consumed by await or callback delivery; at most once
    consumed: bool,
    /// A locally synthesized timeout/interrupt is final
    locally_resolved: bool,
    released: bool,
    callback: Option<Callback<T>>,
    release_hook: Option<ReleaseHook<T>>,
    unregister: Option<UnregisterHook>,
    callback_timer: Option<DelayedHandle>,
}

struct Inner<T> {
    state: Mutex<State<T>>,
    ready_tx: watch::Sender<bool>,
    dispatcher: Dispatcher,
}

/// Single-assignment container for the result of one device operation.
///
/// Every asynchronous call against the device returns one of these.
/// Exactly one of {posted result, locally synthesized TIMEOUT,
/// locally synthesized INTERRUPTED} is ever observed, no matter how a
/// late completion races a local cancellation. Consuming twice, or
/// posting twice, is a programmer error and panics.
pub struct PendingResult<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for PendingResult<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Send + 'static> PendingResult<T> {
    /// Create an unresolved result whose callbacks dispatch through
    /// `dispatcher`.
    pub fn new(dispatcher: Dispatcher) -> Self {
        let (ready_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    result: None,
                    consumed: false,
                    locally_resolved: false,
                    released: false,
                    callback: None,
                    release_hook: None,
                    unregister: None,
                    callback_timer: None,
                }),
                ready_tx,
                dispatcher,
            }),
        }
    }

    /// Whether an outcome is available without waiting.
    pub fn is_ready(&self) -> bool {
        self.inner.state.lock().unwrap().result.is_some()
    }

    /// Hook run once when the result is consumed or locally resolved,
    /// so the owner can drop this task from its outstanding set.
    pub(crate) fn set_unregister_hook(&self, hook: impl FnOnce() + Send + 'static) {
        self.inner.state.lock().unwrap().unregister = Some(Box::new(hook));
    }

    /// Hook run on a result that is discarded instead of delivered,
    /// and on a result that arrives after `release()`.
    pub(crate) fn set_release_hook(
        &self,
        hook: impl FnOnce(&OperationResult<T>) + Send + 'static,
    ) {
        self.inner.state.lock().unwrap().release_hook = Some(Box::new(hook));
    }

    /// Deliver the real outcome.
    ///
    /// If the caller already timed out or was interrupted locally, the
    /// late result is released and discarded, never delivered. Posting
    /// a second real result panics.
    pub fn post_result(&self, result: OperationResult<T>) {
        let (late, hook) = {
            let mut state = self.inner.state.lock().unwrap();
            if state.locally_resolved {
                // Late completion after a local timeout/interrupt
                (true, state.release_hook.take())
            } else {
                assert!(state.result.is_none(), "result posted twice");
                if let Some(timer) = state.callback_timer.take() {
                    timer.cancel();
                }
                let hook = if state.released {
                    state.release_hook.take()
                } else {
                    None
                };
                (false, hook)
            }
        };
        if let Some(hook) = hook {
            hook(&result);
        }
        if late {
            // Released and discarded, never delivered
            return;
        }
        self.inner.state.lock().unwrap().result = Some(result);
        self.inner.ready_tx.send_replace(true);
        self.deliver_stored_callback();
    }

    /// Register a completion callback, dispatched on the owning event
    /// queue. Dispatches immediately if the result is already in.
    pub fn set_callback(&self, callback: impl FnOnce(OperationResult<T>) + Send + 'static) {
        self.set_callback_impl(Box::new(callback), None);
    }

    /// Register a completion callback and arm a local timeout: if no
    /// result arrives within `timeout`, the callback receives a
    /// synthesized TIMEOUT outcome and any late result is discarded.
    pub fn set_callback_timeout(
        &self,
        callback: impl FnOnce(OperationResult<T>) + Send + 'static,
        timeout: Duration,
    ) {
        self.set_callback_impl(Box::new(callback), Some(timeout));
    }

    fn set_callback_impl(&self, callback: Callback<T>, timeout: Option<Duration>) {
        {
            let mut state = self.inner.state.lock().unwrap();
            assert!(!state.consumed, "result already consumed");
            assert!(state.callback.is_none(), "callback already registered");
            if state.result.is_none() {
                state.callback = Some(callback);
                if let Some(timeout) = timeout {
                    let this = self.clone();
                    state.callback_timer = Some(self.inner.dispatcher.dispatch_delayed(
                        timeout,
                        move || this.cancel_locally(Status::Timeout),
                    ));
                }
                return;
            }
            state.callback = Some(callback);
        }
        self.deliver_stored_callback();
    }

    /// Wait for the outcome.
    pub async fn result(&self) -> OperationResult<T> {
        let mut rx = self.inner.ready_tx.subscribe();
        // A send can only be missed before subscribe; borrow catches it
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                break;
            }
        }
        self.consume()
    }

    /// Wait for the outcome, at most `timeout`.
    ///
    /// On expiry a TIMEOUT outcome is synthesized, returned, and made
    /// final; a real result arriving later is released and discarded.
    pub async fn result_timeout(&self, timeout: Duration) -> OperationResult<T> {
        let mut rx = self.inner.ready_tx.subscribe();
        let wait = async {
            while !*rx.borrow_and_update() {
                if rx.changed().await.is_err() {
                    break;
                }
            }
        };
        match tokio::time::timeout(timeout, wait).await {
            Ok(()) => self.consume(),
            Err(_) => self.resolve_locally_and_take(Status::Timeout),
        }
    }

    /// Resolve locally with INTERRUPTED; a late real result is
    /// released and discarded.
    pub fn interrupt(&self) -> OperationResult<T> {
        self.resolve_locally_and_take(Status::Interrupted)
    }

    /// Mark this result released. A stored or later-arriving result
    /// runs the release hook; `await` still returns it, but a released
    /// result is never delivered to a callback.
    pub fn release(&self) {
        let hook_and_result = {
            let mut state = self.inner.state.lock().unwrap();
            state.released = true;
            match (&state.result, state.release_hook.is_some()) {
                (Some(_), true) => {
                    let hook = state.release_hook.take().unwrap();
                    Some((hook, state.result.as_ref().unwrap().clone_for_hook()))
                }
                _ => None,
            }
        };
        if let Some((hook, result)) = hook_and_result {
            hook(&result);
        }
    }

    /// Consume the stored result; panics if consumed before or still
    /// unresolved.
    fn consume(&self) -> OperationResult<T> {
        let (result, unregister) = {
            let mut state = self.inner.state.lock().unwrap();
            assert!(!state.consumed, "result already consumed");
            let result = state
                .result
                .take()
                .expect("consume called with no result stored");
            state.consumed = true;
            (result, state.unregister.take())
        };
        if let Some(unregister) = unregister {
            unregister();
        }
        result
    }

    /// Synthesize a local outcome, mark it final, and return it.
    fn resolve_locally_and_take(&self, status: Status) -> OperationResult<T> {
        let (result, unregister) = {
            let mut state = self.inner.state.lock().unwrap();
            if let Some(result) = state.result.take() {
                // The real result won the race
                assert!(!state.consumed, "result already consumed");
                state.consumed = true;
                (result, state.unregister.take())
            } else {
                assert!(!state.consumed, "result already consumed");
                state.locally_resolved = true;
                state.consumed = true;
                if let Some(timer) = state.callback_timer.take() {
                    timer.cancel();
                }
                (OperationResult::failure(status), state.unregister.take())
            }
        };
        if let Some(unregister) = unregister {
            unregister();
        }
        result
    }

    /// Owner-side local resolution: store a synthesized failure and
    /// make it final. Awaiters and callbacks observe the synthesized
    /// outcome; a real result arriving later is released and
    /// discarded. No-op once any outcome exists.
    pub fn cancel_locally(&self, status: Status) {
        {
            let mut state = self.inner.state.lock().unwrap();
            if state.consumed || state.result.is_some() || state.locally_resolved {
                return;
            }
            state.locally_resolved = true;
            state.result = Some(OperationResult::failure(status));
            if let Some(timer) = state.callback_timer.take() {
                timer.cancel();
            }
        }
        self.inner.ready_tx.send_replace(true);
        self.deliver_stored_callback();
    }

    /// Deliver a stored result to a stored callback, if both exist.
    fn deliver_stored_callback(&self) {
        let (callback, result, unregister, released) = {
            let mut state = self.inner.state.lock().unwrap();
            if state.consumed || state.result.is_none() || state.callback.is_none() {
                return;
            }
            let callback = state.callback.take().unwrap();
            let result = state.result.take().unwrap();
            state.consumed = true;
            (
                callback,
                result,
                state.unregister.take(),
                state.released,
            )
        };
        if let Some(unregister) = unregister {
            unregister();
        }
        if released {
            // Released results are discarded, not delivered
            return;
        }
        let this_dispatcher = self.inner.dispatcher.clone();
        this_dispatcher.dispatch(move || callback(result));
    }
}

impl<T> OperationResult<T> {
    /// Shallow copy for release hooks: status only, no value clone.
    fn clone_for_hook(&self) -> OperationResult<T> {
        OperationResult {
            status: self.status,
            value: None,
        }
    }
}
