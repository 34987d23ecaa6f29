use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// A unit of work posted onto an event queue.
pub type Task = Box<dyn FnOnce() + Send>;

/// Sending half of a single-consumer event queue.
///
/// Every logical connection owns one queue and one task draining it, so
/// everything posted here (messages, application callbacks, timer
/// firings) runs serialized on that task.
pub struct EventQueue<M> {
    tx: mpsc::UnboundedSender<M>,
}

impl<M> Clone for EventQueue<M> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<M: Send + 'static> EventQueue<M> {
    /// Create a queue and its receiving end.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<M>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Post a message. Returns false once the consumer is gone.
    pub fn post(&self, msg: M) -> bool {
        self.tx.send(msg).is_ok()
    }

    /// Post a message after `delay`.
    ///
    /// There is no timer thread: a helper task sleeps and then posts,
    /// so the firing is serialized with normal message handling. The
    /// returned handle cancels the delivery, not the sleep.
    pub fn post_delayed(&self, delay: Duration, msg: M) -> DelayedHandle {
        let handle = DelayedHandle::new();
        let canceled = handle.flag();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if !canceled.load(Ordering::Acquire) {
                let _ = tx.send(msg);
            }
        });
        handle
    }
}

/// Cancellation handle for a deferred message.
#[derive(Clone)]
pub struct DelayedHandle {
    canceled: Arc<AtomicBool>,
}

impl DelayedHandle {
    fn new() -> Self {
        Self {
            canceled: Arc::new(AtomicBool::new(false)),
        }
    }

    fn flag(&self) -> Arc<AtomicBool> {
        self.canceled.clone()
    }

    /// Prevent the deferred message from being delivered.
    pub fn cancel(&self) {
        self.canceled.store(true, Ordering::Release);
    }
}

/// Handle that routes closures onto some event queue.
///
/// `PendingResult` and the channels hold one of these instead of a
/// typed queue, so callback delivery always lands on the owning
/// connection's queue and never runs inline on the caller's task.
#[derive(Clone)]
pub struct Dispatcher {
    post: Arc<dyn Fn(Task) -> bool + Send + Sync>,
}

impl Dispatcher {
    /// Wrap a posting function, typically one that boxes the task into
    /// the owner's message enum.
    pub fn new(post: impl Fn(Task) -> bool + Send + Sync + 'static) -> Self {
        Self {
            post: Arc::new(post),
        }
    }

    /// Run `f` on the owning event queue.
    pub fn dispatch(&self, f: impl FnOnce() + Send + 'static) -> bool {
        (self.post)(Box::new(f))
    }

    /// Run `f` on the owning event queue after `delay`.
    pub fn dispatch_delayed(
        &self,
        delay: Duration,
        f: impl FnOnce() + Send + 'static,
    ) -> DelayedHandle {
        let handle = DelayedHandle::new();
        let canceled = handle.flag();
        let post = self.post.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if !canceled.load(Ordering::Acquire) {
                post(Box::new(f));
            }
        });
        handle
    }

    /// Dispatcher that runs tasks at the call site. Test use only.
    #[cfg(test)]
    pub(crate) fn immediate() -> Self {
        Self::new(|task| {
            task();
            true
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn delayed_post_fires_after_delay() {
        let (queue, mut rx) = EventQueue::<u32>::channel();
        queue.post_delayed(Duration::from_millis(500), 7);

        tokio::time::sleep(Duration::from_millis(499)).await;
        assert!(rx.try_recv().is_err());

        tokio::time::sleep(Duration::from_millis(2)).await;
        tokio::task::yield_now().await;
        assert_eq!(rx.try_recv().unwrap(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn canceled_delayed_post_never_fires() {
        let (queue, mut rx) = EventQueue::<u32>::channel();
        let handle = queue.post_delayed(Duration::from_millis(100), 7);
        handle.cancel();

        tokio::time::sleep(Duration::from_millis(200)).await;
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn dispatcher_posts_tasks_in_order() {
        let (queue, mut rx) = EventQueue::<Task>::channel();
        let dispatcher = Dispatcher::new(move |task| queue.post(task));

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<u32>();
        for i in 0..3 {
            let out_tx = out_tx.clone();
            dispatcher.dispatch(move || {
                let _ = out_tx.send(i);
            });
        }
        for _ in 0..3 {
            (rx.recv().await.unwrap())();
        }
        assert_eq!(out_rx.recv().await, Some(0));
        assert_eq!(out_rx.recv().await, Some(1));
        assert_eq!(out_rx.recv().await, Some(2));
    }
}
