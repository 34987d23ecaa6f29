use crate::dispatch::{DelayedHandle, Dispatcher, EventQueue, Task};
use crate::status::Status;
use crate::types::{ConnectionFailure, ConnectionHint, SuspensionCause};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;

/// Automatic reconnect attempts after a SERVICE_DISCONNECTED suspension
const RETRY_BUDGET: u32 = 2;

/// Fixed delay between automatic reconnect attempts
const RETRY_DELAY: Duration = Duration::from_millis(5000);

/// Lifecycle callbacks delivered to the application.
///
/// Always invoked on the manager's event queue, never inline from the
/// transport or from the caller's task.
pub trait ConnectionCallbacks: Send + Sync {
    fn on_connected(&self, _hint: &ConnectionHint) {}
    fn on_connection_suspended(&self, _cause: SuspensionCause) {}
    fn on_connection_failed(&self, _status: Status) {}
}

/// No-op callbacks for callers that only poll state.
pub struct NullCallbacks;
impl ConnectionCallbacks for NullCallbacks {}

/// One pluggable connection unit driven by the manager.
///
/// `connect` must make the attempt report exactly once, through either
/// `ConnectAttempt::connected` or `ConnectAttempt::failed`.
pub trait SubConnection: Send + Sync {
    /// Wire the suspension-reporting path. Called once when the
    /// manager is built.
    fn attach(&self, events: SubLinkEvents);
    fn connect(&self, attempt: ConnectAttempt);
    fn disconnect(&self);
    fn is_connected(&self) -> bool;
}

/// Completion reporter for one sub-connection connect attempt.
/// Consuming methods make double reporting impossible.
pub struct ConnectAttempt {
    queue: EventQueue<ManagerMsg>,
    index: usize,
    epoch: u64,
}

impl ConnectAttempt {
    pub fn connected(self, hint: ConnectionHint) {
        self.queue.post(ManagerMsg::SubConnected {
            index: self.index,
            epoch: self.epoch,
            hint,
        });
    }

    pub fn failed(self, failure: ConnectionFailure) {
        self.queue.post(ManagerMsg::SubFailed {
            index: self.index,
            epoch: self.epoch,
            failure,
        });
    }
}

/// Standing event path from a sub-connection back to its manager.
#[derive(Clone)]
pub struct SubLinkEvents {
    queue: EventQueue<ManagerMsg>,
}

impl SubLinkEvents {
    /// Report that the established link went away.
    pub fn suspended(&self, cause: SuspensionCause) {
        self.queue.post(ManagerMsg::Suspended { cause });
    }
}

/// Manager lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// A queued unit of work bound to one sub-connection.
///
/// Queued while the manager is connecting, executed exactly once on
/// connect, or canceled on teardown.
pub struct PendingTask {
    target: usize,
    run: Box<dyn FnOnce() + Send>,
    cancel: Box<dyn FnOnce() + Send>,
}

impl PendingTask {
    pub fn new(
        target: usize,
        run: impl FnOnce() + Send + 'static,
        cancel: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            target,
            run: Box::new(run),
            cancel: Box::new(cancel),
        }
    }
}

enum ManagerMsg {
    Connect,
    Disconnect {
        cause: SuspensionCause,
    },
    SubConnected {
        index: usize,
        epoch: u64,
        hint: ConnectionHint,
    },
    SubFailed {
        index: usize,
        epoch: u64,
        failure: ConnectionFailure,
    },
    Suspended {
        cause: SuspensionCause,
    },
    Retry {
        generation: u64,
    },
    Submit {
        task: PendingTask,
    },
    AwaitSettle {
        reply: oneshot::Sender<Status>,
    },
    Run(Task),
}

struct StateData {
    state: ManagerState,
    /// Disconnect arrived mid-connect with queued work; resolve once
    /// the in-flight attempt settles
    pending_cancel: bool,
    /// Sub-connections still to report in the current attempt
    remaining: usize,
    attempt_epoch: u64,
    hint: ConnectionHint,
    failure: Option<ConnectionFailure>,
    last_outcome: Option<Status>,
    tasks: VecDeque<PendingTask>,
    retry: Option<DelayedHandle>,
    retry_generation: u64,
    retries_left: u32,
    waiters: Vec<oneshot::Sender<Status>>,
}

struct Inner {
    subs: Vec<Arc<dyn SubConnection>>,
    callbacks: Arc<dyn ConnectionCallbacks>,
    queue: EventQueue<ManagerMsg>,
    dispatcher: Dispatcher,
    data: Mutex<StateData>,
}

/// Top-level connection state machine.
///
/// Owns every sub-connection, aggregates their connect outcomes,
/// queues work while connecting, and drives teardown, suspension
/// handling and the bounded auto-retry.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(
        subs: Vec<Arc<dyn SubConnection>>,
        callbacks: Arc<dyn ConnectionCallbacks>,
    ) -> Self {
        assert!(!subs.is_empty(), "manager needs at least one sub-connection");
        let (queue, mut rx) = EventQueue::channel();
        let dispatcher = {
            let queue = queue.clone();
            Dispatcher::new(move |task| queue.post(ManagerMsg::Run(task)))
        };
        let inner = Arc::new(Inner {
            subs,
            callbacks,
            queue: queue.clone(),
            dispatcher,
            data: Mutex::new(StateData {
                state: ManagerState::Disconnected,
                pending_cancel: false,
                remaining: 0,
                attempt_epoch: 0,
                hint: ConnectionHint::new(),
                failure: None,
                last_outcome: None,
                tasks: VecDeque::new(),
                retry: None,
                retry_generation: 0,
                retries_left: 0,
                waiters: Vec::new(),
            }),
        });

        for sub in &inner.subs {
            sub.attach(SubLinkEvents {
                queue: queue.clone(),
            });
        }

        let weak = Arc::downgrade(&inner);
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let Some(inner) = weak.upgrade() else { break };
                handle(&inner, msg);
            }
        });

        Self { inner }
    }

    pub fn state(&self) -> ManagerState {
        self.inner.data.lock().unwrap().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ManagerState::Connected
    }

    /// Begin connecting. No-op while already connected or connecting.
    pub fn connect(&self) {
        self.inner.queue.post(ManagerMsg::Connect);
    }

    /// Tear the connection down. Cancels any scheduled auto-retry.
    pub fn disconnect(&self) {
        self.inner.queue.post(ManagerMsg::Disconnect {
            cause: SuspensionCause::Canceled,
        });
    }

    pub fn reconnect(&self) {
        self.disconnect();
        self.connect();
    }

    /// Connect and wait for the attempt to settle.
    ///
    /// Suspends the caller (never the event queue) until the manager
    /// reaches CONNECTED or gives up, returning SUCCESS, the recorded
    /// failure, CANCELED, or TIMEOUT after `timeout`.
    pub async fn blocking_connect(&self, timeout: Duration) -> Status {
        self.connect();
        let (reply_tx, reply_rx) = oneshot::channel();
        self.inner
            .queue
            .post(ManagerMsg::AwaitSettle { reply: reply_tx });
        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(status)) => status,
            Ok(Err(_)) => Status::Interrupted,
            Err(_) => Status::Timeout,
        }
    }

    /// Queue or run one unit of work against sub-connection `target`.
    ///
    /// Runs immediately (after flushing the queue) when connected,
    /// queues while connecting, and cancels right away otherwise.
    pub fn execute(&self, task: PendingTask) {
        self.inner.queue.post(ManagerMsg::Submit { task });
    }

    /// Dispatcher bound to this manager's event queue.
    pub fn dispatcher(&self) -> Dispatcher {
        self.inner.dispatcher.clone()
    }
}

fn handle(inner: &Arc<Inner>, msg: ManagerMsg) {
    match msg {
        ManagerMsg::Connect => handle_connect(inner),
        ManagerMsg::Disconnect { cause } => handle_disconnect(inner, cause),
        ManagerMsg::SubConnected { index, epoch, hint } => {
            handle_sub_connected(inner, index, epoch, hint)
        }
        ManagerMsg::SubFailed {
            index,
            epoch,
            failure,
        } => handle_sub_failed(inner, index, epoch, failure),
        ManagerMsg::Suspended { cause } => handle_suspended(inner, cause),
        ManagerMsg::Retry { generation } => handle_retry(inner, generation),
        ManagerMsg::Submit { task } => handle_submit(inner, task),
        ManagerMsg::AwaitSettle { reply } => handle_await_settle(inner, reply),
        ManagerMsg::Run(task) => task(),
    }
}

fn handle_connect(inner: &Arc<Inner>) {
    let epoch = {
        let mut d = inner.data.lock().unwrap();
        match d.state {
            ManagerState::Connected | ManagerState::Connecting => {
                tracing::debug!("connect ignored in state {:?}", d.state);
                return;
            }
            ManagerState::Disconnecting => {
                tracing::warn!("connect ignored while disconnecting");
                return;
            }
            ManagerState::Disconnected => {}
        }
        if let Some(retry) = d.retry.take() {
            retry.cancel();
        }
        d.state = ManagerState::Connecting;
        d.pending_cancel = false;
        d.failure = None;
        d.last_outcome = None;
        d.hint = ConnectionHint::new();
        d.remaining = inner.subs.len();
        d.attempt_epoch += 1;
        d.attempt_epoch
    };

    tracing::info!("connecting ({} sub-connections)", inner.subs.len());
    for (index, sub) in inner.subs.iter().enumerate() {
        sub.connect(ConnectAttempt {
            queue: inner.queue.clone(),
            index,
            epoch,
        });
    }
}

fn handle_sub_connected(inner: &Arc<Inner>, index: usize, epoch: u64, hint: ConnectionHint) {
    let settle = {
        let mut d = inner.data.lock().unwrap();
        if d.state != ManagerState::Connecting || epoch != d.attempt_epoch {
            // A stale attempt finished after the manager moved on;
            // the sub is up but nobody wants it
            drop(d);
            tracing::debug!("stale connect report from sub {}", index);
            inner.subs[index].disconnect();
            return;
        }
        tracing::debug!("sub {} connected", index);
        d.hint.merge(hint);
        d.remaining -= 1;
        d.remaining == 0
    };
    if settle {
        settle_attempt(inner);
    }
}

fn handle_sub_failed(inner: &Arc<Inner>, index: usize, epoch: u64, failure: ConnectionFailure) {
    let settle = {
        let mut d = inner.data.lock().unwrap();
        if d.state != ManagerState::Connecting || epoch != d.attempt_epoch {
            tracing::debug!("stale failure report from sub {}", index);
            return;
        }
        tracing::warn!(
            "sub {} failed: {} (priority {})",
            index,
            failure.status,
            failure.priority
        );
        // Lowest priority rank wins; first report wins ties
        let keep = match &d.failure {
            None => true,
            Some(current) => failure.priority < current.priority,
        };
        if keep {
            d.failure = Some(failure);
        }
        d.remaining -= 1;
        d.remaining == 0
    };
    if settle {
        settle_attempt(inner);
    }
}

/// Every sub-connection has reported: commit the attempt's outcome.
fn settle_attempt(inner: &Arc<Inner>) {
    enum Outcome {
        Connected {
            hint: ConnectionHint,
            tasks: Vec<PendingTask>,
        },
        Failed {
            status: Status,
            canceled: bool,
            drained: Vec<PendingTask>,
        },
    }

    let (outcome, waiters) = {
        let mut d = inner.data.lock().unwrap();
        debug_assert_eq!(d.state, ManagerState::Connecting);
        let outcome = if let Some(failure) = d.failure.clone() {
            d.state = ManagerState::Disconnecting;
            let drained = d.tasks.drain(..).collect();
            d.state = ManagerState::Disconnected;
            d.last_outcome = Some(failure.status);
            // One consumed auto-retry attempt may be rearmed below;
            // otherwise the budget is cleared
            if d.retries_left > 0 && !d.pending_cancel {
                d.retries_left -= 1;
                d.retry_generation += 1;
                let generation = d.retry_generation;
                tracing::info!(
                    "connect failed, retrying in {:?} ({} attempts left)",
                    RETRY_DELAY,
                    d.retries_left
                );
                d.retry = Some(
                    inner
                        .queue
                        .post_delayed(RETRY_DELAY, ManagerMsg::Retry { generation }),
                );
            } else {
                d.retries_left = 0;
            }
            d.pending_cancel = false;
            Outcome::Failed {
                status: failure.status,
                canceled: false,
                drained,
            }
        } else if d.pending_cancel {
            d.state = ManagerState::Disconnecting;
            let drained = d.tasks.drain(..).collect();
            d.state = ManagerState::Disconnected;
            d.pending_cancel = false;
            d.last_outcome = Some(Status::Canceled);
            Outcome::Failed {
                status: Status::Canceled,
                canceled: true,
                drained,
            }
        } else {
            d.state = ManagerState::Connected;
            d.last_outcome = Some(Status::Success);
            Outcome::Connected {
                hint: std::mem::take(&mut d.hint),
                tasks: d.tasks.drain(..).collect(),
            }
        };
        (outcome, std::mem::take(&mut d.waiters))
    };

    match outcome {
        Outcome::Connected { hint, tasks } => {
            tracing::info!("connected");
            for waiter in waiters {
                let _ = waiter.send(Status::Success);
            }
            // Flush in FIFO order before anything else runs
            for task in tasks {
                (task.run)();
            }
            let callbacks = inner.callbacks.clone();
            inner.dispatcher.dispatch(move || callbacks.on_connected(&hint));
        }
        Outcome::Failed {
            status,
            canceled,
            drained,
        } => {
            tracing::warn!("connect attempt settled with {}", status);
            for task in drained {
                (task.cancel)();
            }
            disconnect_connected_subs(inner);
            for waiter in waiters {
                let _ = waiter.send(status);
            }
            let callbacks = inner.callbacks.clone();
            if canceled {
                inner
                    .dispatcher
                    .dispatch(move || callbacks.on_connection_suspended(SuspensionCause::Canceled));
            } else {
                inner
                    .dispatcher
                    .dispatch(move || callbacks.on_connection_failed(status));
            }
        }
    }
}

fn handle_disconnect(inner: &Arc<Inner>, cause: SuspensionCause) {
    let explicit = cause == SuspensionCause::Canceled;
    enum Plan {
        Nothing,
        Deferred { drained: Vec<PendingTask> },
        Teardown { drained: Vec<PendingTask> },
    }

    let (plan, waiters) = {
        let mut d = inner.data.lock().unwrap();
        if let Some(retry) = d.retry.take() {
            retry.cancel();
        }
        if explicit {
            d.retries_left = 0;
        }
        match d.state {
            ManagerState::Disconnected => (Plan::Nothing, Vec::new()),
            ManagerState::Connecting => {
                // Drain, never execute, work queued during the attempt
                let drained: Vec<PendingTask> = d.tasks.drain(..).collect();
                if d.failure.is_none() && !drained.is_empty() {
                    // Mid-connect cancel with queued work: resolve once
                    // the in-flight attempt settles
                    d.pending_cancel = true;
                    tracing::info!("disconnect deferred until connect settles");
                    (Plan::Deferred { drained }, Vec::new())
                } else {
                    d.state = ManagerState::Disconnected;
                    d.pending_cancel = false;
                    d.last_outcome = Some(Status::Canceled);
                    (
                        Plan::Teardown { drained },
                        std::mem::take(&mut d.waiters),
                    )
                }
            }
            ManagerState::Connected | ManagerState::Disconnecting => {
                d.state = ManagerState::Disconnecting;
                let drained: Vec<PendingTask> = d.tasks.drain(..).collect();
                d.state = ManagerState::Disconnected;
                d.last_outcome = Some(Status::Canceled);
                (
                    Plan::Teardown { drained },
                    std::mem::take(&mut d.waiters),
                )
            }
        }
    };

    match plan {
        Plan::Nothing => {}
        Plan::Deferred { drained } => {
            for task in drained {
                (task.cancel)();
            }
        }
        Plan::Teardown { drained } => {
            tracing::info!("disconnected ({:?})", cause);
            for task in drained {
                (task.cancel)();
            }
            disconnect_connected_subs(inner);
            for waiter in waiters {
                let _ = waiter.send(Status::Canceled);
            }
            if !explicit {
                let callbacks = inner.callbacks.clone();
                inner
                    .dispatcher
                    .dispatch(move || callbacks.on_connection_suspended(cause));
            }
        }
    }
}

fn handle_suspended(inner: &Arc<Inner>, cause: SuspensionCause) {
    tracing::warn!("connection suspended: {:?}", cause);
    handle_disconnect(inner, cause);

    match cause {
        SuspensionCause::NetworkLost => {
            // The network came and went; try again right away
            handle_connect(inner);
        }
        SuspensionCause::ServiceDisconnected => {
            let mut d = inner.data.lock().unwrap();
            if d.retry.is_none() && d.state == ManagerState::Disconnected {
                d.retries_left = RETRY_BUDGET;
                d.retries_left -= 1;
                d.retry_generation += 1;
                let generation = d.retry_generation;
                tracing::info!("auto-retry armed in {:?}", RETRY_DELAY);
                d.retry = Some(
                    inner
                        .queue
                        .post_delayed(RETRY_DELAY, ManagerMsg::Retry { generation }),
                );
            }
        }
        SuspensionCause::Canceled => {}
    }
}

fn handle_retry(inner: &Arc<Inner>, generation: u64) {
    {
        let mut d = inner.data.lock().unwrap();
        if generation != d.retry_generation {
            return;
        }
        d.retry = None;
        if d.state != ManagerState::Disconnected {
            return;
        }
    }
    tracing::info!("auto-retry firing");
    handle_connect(inner);
}

fn handle_submit(inner: &Arc<Inner>, task: PendingTask) {
    enum Plan {
        Run(Vec<PendingTask>),
        Queued,
        Cancel(PendingTask),
    }
    let plan = {
        let mut d = inner.data.lock().unwrap();
        match d.state {
            ManagerState::Connected => {
                let mut tasks: Vec<PendingTask> = d.tasks.drain(..).collect();
                tasks.push(task);
                Plan::Run(tasks)
            }
            ManagerState::Connecting => {
                d.tasks.push_back(task);
                Plan::Queued
            }
            _ => Plan::Cancel(task),
        }
    };
    match plan {
        Plan::Run(tasks) => {
            for task in tasks {
                debug_assert!(task.target < inner.subs.len());
                (task.run)();
            }
        }
        Plan::Queued => {}
        Plan::Cancel(task) => (task.cancel)(),
    }
}

fn handle_await_settle(inner: &Arc<Inner>, reply: oneshot::Sender<Status>) {
    let mut d = inner.data.lock().unwrap();
    match d.state {
        ManagerState::Connected => {
            let _ = reply.send(Status::Success);
        }
        ManagerState::Connecting | ManagerState::Disconnecting => {
            d.waiters.push(reply);
        }
        ManagerState::Disconnected => {
            let _ = reply.send(d.last_outcome.unwrap_or(Status::Canceled));
        }
    }
}

fn disconnect_connected_subs(inner: &Arc<Inner>) {
    for sub in &inner.subs {
        if sub.is_connected() {
            sub.disconnect();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    /// Scripted sub-connection: each connect attempt pops the next
    /// planned outcome.
    struct FakeSub {
        outcomes: Mutex<VecDeque<Result<ConnectionHint, ConnectionFailure>>>,
        events: Mutex<Option<SubLinkEvents>>,
        connected: AtomicBool,
        connects: AtomicU32,
        disconnects: AtomicU32,
        /// When set, attempts are parked instead of reported
        hold: AtomicBool,
        held: Mutex<Vec<ConnectAttempt>>,
    }

    impl FakeSub {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                outcomes: Mutex::new(VecDeque::new()),
                events: Mutex::new(None),
                connected: AtomicBool::new(false),
                connects: AtomicU32::new(0),
                disconnects: AtomicU32::new(0),
                hold: AtomicBool::new(false),
                held: Mutex::new(Vec::new()),
            })
        }

        fn plan_ok(self: &Arc<Self>) -> Arc<Self> {
            let mut hint = ConnectionHint::new();
            hint.insert("fake", serde_json::json!(true));
            self.outcomes.lock().unwrap().push_back(Ok(hint));
            self.clone()
        }

        fn plan_fail(self: &Arc<Self>, status: Status, priority: i32) -> Arc<Self> {
            self.outcomes
                .lock()
                .unwrap()
                .push_back(Err(ConnectionFailure::new(status, priority)));
            self.clone()
        }

        fn suspend(&self, cause: SuspensionCause) {
            self.connected.store(false, Ordering::SeqCst);
            self.events
                .lock()
                .unwrap()
                .as_ref()
                .expect("not attached")
                .suspended(cause);
        }

        fn release_held(&self) {
            let held: Vec<ConnectAttempt> = self.held.lock().unwrap().drain(..).collect();
            for attempt in held {
                self.report(attempt);
            }
        }

        fn report(&self, attempt: ConnectAttempt) {
            match self.outcomes.lock().unwrap().pop_front() {
                Some(Ok(hint)) => {
                    self.connected.store(true, Ordering::SeqCst);
                    attempt.connected(hint);
                }
                Some(Err(failure)) => attempt.failed(failure),
                None => {
                    self.connected.store(true, Ordering::SeqCst);
                    attempt.connected(ConnectionHint::new());
                }
            }
        }
    }

    impl SubConnection for FakeSub {
        fn attach(&self, events: SubLinkEvents) {
            *self.events.lock().unwrap() = Some(events);
        }

        fn connect(&self, attempt: ConnectAttempt) {
            self.connects.fetch_add(1, Ordering::SeqCst);
            if self.hold.load(Ordering::SeqCst) {
                self.held.lock().unwrap().push(attempt);
            } else {
                self.report(attempt);
            }
        }

        fn disconnect(&self) {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
            self.connected.store(false, Ordering::SeqCst);
        }

        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }
    }

    #[derive(Default)]
    struct RecordingCallbacks {
        connected: AtomicU32,
        suspended: Mutex<Vec<SuspensionCause>>,
        failed: Mutex<Vec<Status>>,
    }

    impl ConnectionCallbacks for RecordingCallbacks {
        fn on_connected(&self, _hint: &ConnectionHint) {
            self.connected.fetch_add(1, Ordering::SeqCst);
        }
        fn on_connection_suspended(&self, cause: SuspensionCause) {
            self.suspended.lock().unwrap().push(cause);
        }
        fn on_connection_failed(&self, status: Status) {
            self.failed.lock().unwrap().push(status);
        }
    }

    async fn drain() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn connect_reaches_connected_and_notifies() {
        let sub = FakeSub::new().plan_ok();
        let callbacks = Arc::new(RecordingCallbacks::default());
        let manager = ConnectionManager::new(vec![sub], callbacks.clone());

        let status = manager.blocking_connect(Duration::from_secs(5)).await;
        assert_eq!(status, Status::Success);
        assert_eq!(manager.state(), ManagerState::Connected);
        drain().await;
        assert_eq!(callbacks.connected.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn lowest_priority_failure_wins() {
        // API-A fails with rank 2, API-B with rank 5: A's status surfaces
        let api_a = FakeSub::new().plan_fail(Status::NetworkError, 2);
        let api_b = FakeSub::new().plan_fail(Status::InternalError, 5);
        let callbacks = Arc::new(RecordingCallbacks::default());
        let manager = ConnectionManager::new(vec![api_b, api_a], callbacks.clone());

        let status = manager.blocking_connect(Duration::from_secs(5)).await;
        assert_eq!(status, Status::NetworkError);
        assert_eq!(manager.state(), ManagerState::Disconnected);
        drain().await;
        assert_eq!(*callbacks.failed.lock().unwrap(), vec![Status::NetworkError]);
    }

    #[tokio::test]
    async fn partial_failure_disconnects_the_winner() {
        let good = FakeSub::new().plan_ok();
        let bad = FakeSub::new().plan_fail(Status::NetworkError, 1);
        let manager = ConnectionManager::new(
            vec![good.clone(), bad],
            Arc::new(RecordingCallbacks::default()),
        );

        let status = manager.blocking_connect(Duration::from_secs(5)).await;
        assert_eq!(status, Status::NetworkError);
        drain().await;
        // The sub that did connect was torn down with the attempt
        assert_eq!(good.disconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn tasks_queued_while_connecting_flush_in_order() {
        let sub = FakeSub::new();
        sub.hold.store(true, Ordering::SeqCst);
        let manager =
            ConnectionManager::new(vec![sub.clone()], Arc::new(RecordingCallbacks::default()));

        manager.connect();
        drain().await;
        assert_eq!(manager.state(), ManagerState::Connecting);

        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let order = order.clone();
            manager.execute(PendingTask::new(
                0,
                move || order.lock().unwrap().push(i),
                || panic!("task canceled"),
            ));
        }
        drain().await;
        assert!(order.lock().unwrap().is_empty());

        sub.release_held();
        drain().await;
        assert_eq!(manager.state(), ManagerState::Connected);
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn execute_fails_fast_when_disconnected() {
        let manager =
            ConnectionManager::new(vec![FakeSub::new()], Arc::new(RecordingCallbacks::default()));
        let canceled = Arc::new(AtomicBool::new(false));
        let canceled_clone = canceled.clone();
        manager.execute(PendingTask::new(
            0,
            || panic!("must not run"),
            move || canceled_clone.store(true, Ordering::SeqCst),
        ));
        drain().await;
        assert!(canceled.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn disconnect_mid_connect_with_queued_work_defers_then_cancels() {
        let sub = FakeSub::new();
        sub.hold.store(true, Ordering::SeqCst);
        let callbacks = Arc::new(RecordingCallbacks::default());
        let manager = ConnectionManager::new(vec![sub.clone()], callbacks.clone());

        manager.connect();
        drain().await;

        let canceled = Arc::new(AtomicU32::new(0));
        let canceled_clone = canceled.clone();
        manager.execute(PendingTask::new(
            0,
            || panic!("must not run"),
            move || {
                canceled_clone.fetch_add(1, Ordering::SeqCst);
            },
        ));
        drain().await;

        manager.disconnect();
        drain().await;
        // Still waiting for the in-flight attempt; queued work is gone
        assert_eq!(manager.state(), ManagerState::Connecting);
        assert_eq!(canceled.load(Ordering::SeqCst), 1);

        sub.release_held();
        drain().await;
        assert_eq!(manager.state(), ManagerState::Disconnected);
        // Settle notified a disconnect, not a connect
        assert_eq!(callbacks.connected.load(Ordering::SeqCst), 0);
        assert_eq!(
            *callbacks.suspended.lock().unwrap(),
            vec![SuspensionCause::Canceled]
        );
        // The sub that came up for the canceled attempt was released
        assert_eq!(sub.disconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn service_disconnected_retries_twice_then_gives_up() {
        let sub = FakeSub::new();
        sub.plan_ok();
        let callbacks = Arc::new(RecordingCallbacks::default());
        let manager = ConnectionManager::new(vec![sub.clone()], callbacks.clone());

        assert_eq!(
            manager.blocking_connect(Duration::from_secs(5)).await,
            Status::Success
        );

        // Every later attempt fails
        sub.plan_fail(Status::NetworkError, 1)
            .plan_fail(Status::NetworkError, 1)
            .plan_fail(Status::NetworkError, 1);
        sub.suspend(SuspensionCause::ServiceDisconnected);
        drain().await;
        assert_eq!(manager.state(), ManagerState::Disconnected);
        assert_eq!(sub.connects.load(Ordering::SeqCst), 1);

        // First retry after the fixed delay
        tokio::time::sleep(Duration::from_millis(5100)).await;
        drain().await;
        assert_eq!(sub.connects.load(Ordering::SeqCst), 2);

        // Second and last retry
        tokio::time::sleep(Duration::from_millis(5100)).await;
        drain().await;
        assert_eq!(sub.connects.load(Ordering::SeqCst), 3);

        // Budget exhausted: no further attempts
        tokio::time::sleep(Duration::from_secs(30)).await;
        drain().await;
        assert_eq!(sub.connects.load(Ordering::SeqCst), 3);
        assert_eq!(manager.state(), ManagerState::Disconnected);
    }

    #[tokio::test]
    async fn network_lost_reconnects_immediately() {
        let sub = FakeSub::new();
        sub.plan_ok().plan_ok();
        let manager =
            ConnectionManager::new(vec![sub.clone()], Arc::new(RecordingCallbacks::default()));

        assert_eq!(
            manager.blocking_connect(Duration::from_secs(5)).await,
            Status::Success
        );
        sub.suspend(SuspensionCause::NetworkLost);
        drain().await;
        assert_eq!(manager.state(), ManagerState::Connected);
        assert_eq!(sub.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_disconnect_cancels_scheduled_retry() {
        let sub = FakeSub::new();
        sub.plan_ok();
        let manager =
            ConnectionManager::new(vec![sub.clone()], Arc::new(RecordingCallbacks::default()));
        assert_eq!(
            manager.blocking_connect(Duration::from_secs(5)).await,
            Status::Success
        );

        sub.suspend(SuspensionCause::ServiceDisconnected);
        drain().await;
        manager.disconnect();
        drain().await;

        tokio::time::sleep(Duration::from_secs(30)).await;
        drain().await;
        // Only the original connect ever happened
        assert_eq!(sub.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn blocking_connect_times_out_locally() {
        let sub = FakeSub::new();
        sub.hold.store(true, Ordering::SeqCst);
        let manager =
            ConnectionManager::new(vec![sub.clone()], Arc::new(RecordingCallbacks::default()));

        let status = manager.blocking_connect(Duration::from_millis(200)).await;
        assert_eq!(status, Status::Timeout);
        assert_eq!(manager.state(), ManagerState::Connecting);
    }

    #[tokio::test]
    async fn reconnect_runs_disconnect_then_connect() {
        let sub = FakeSub::new();
        sub.plan_ok().plan_ok();
        let manager =
            ConnectionManager::new(vec![sub.clone()], Arc::new(RecordingCallbacks::default()));
        assert_eq!(
            manager.blocking_connect(Duration::from_secs(5)).await,
            Status::Success
        );

        manager.reconnect();
        drain().await;
        assert_eq!(manager.state(), ManagerState::Connected);
        assert_eq!(sub.connects.load(Ordering::SeqCst), 2);
        assert_eq!(sub.disconnects.load(Ordering::SeqCst), 1);
    }
}
