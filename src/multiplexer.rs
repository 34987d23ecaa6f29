use crate::error::{CastError, Result};
use crate::protocol::CastFrame;
use crate::socket::{
    ConnectTarget, DriveOutcome, Socket, SocketEvent, SocketId, SocketState,
};
use crate::types::DisconnectReason;
use futures_util::future::select_all;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

/// Bounded select interval while any socket is mid-connect or
/// mid-disconnect, so their deadlines get polled.
const POLL_INTERVAL: Duration = Duration::from_millis(1000);

enum Command {
    Connect {
        id: SocketId,
        target: ConnectTarget,
        events: mpsc::UnboundedSender<SocketEvent>,
    },
    Send {
        id: SocketId,
        frame: CastFrame,
        reply: oneshot::Sender<Result<()>>,
    },
    Disconnect {
        id: SocketId,
    },
    Shutdown,
}

/// The transport event loop.
///
/// One dedicated task owns every socket, its ring buffers and its
/// state; nothing else touches them. Cross-task interaction happens by
/// sending a command, which also wakes the loop. The composition root
/// spawns one of these and injects the handle wherever sockets are
/// opened; there is no process-global instance.
pub struct SocketMultiplexer;

impl SocketMultiplexer {
    /// Spawn the loop task and return its handle.
    pub fn spawn() -> MultiplexerHandle {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        tokio::spawn(run(cmd_rx));
        MultiplexerHandle {
            cmd_tx,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }
}

/// Cloneable handle to a running multiplexer.
#[derive(Clone)]
pub struct MultiplexerHandle {
    cmd_tx: mpsc::UnboundedSender<Command>,
    next_id: Arc<AtomicU64>,
}

impl MultiplexerHandle {
    /// Enqueue a new socket and wake the loop. Lifecycle progress is
    /// reported through `events`.
    pub fn connect(
        &self,
        target: ConnectTarget,
        events: mpsc::UnboundedSender<SocketEvent>,
    ) -> SocketId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let _ = self.cmd_tx.send(Command::Connect { id, target, events });
        id
    }

    /// Queue one frame on a connected socket.
    ///
    /// Fails with `SendBufferFull` when the write ring has no room and
    /// `MessageTooLarge` when it never could; nothing is dropped
    /// silently.
    pub async fn send(&self, id: SocketId, frame: CastFrame) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Send {
                id,
                frame,
                reply: reply_tx,
            })
            .map_err(|_| CastError::ConnectionClosed)?;
        reply_rx.await.map_err(|_| CastError::ConnectionClosed)?
    }

    /// Begin a graceful disconnect of one socket.
    pub fn disconnect(&self, id: SocketId) {
        let _ = self.cmd_tx.send(Command::Disconnect { id });
    }

    /// Tear down every socket and stop the loop task.
    pub fn shutdown(&self) {
        let _ = self.cmd_tx.send(Command::Shutdown);
    }
}

enum Wake {
    Cmd(Option<Command>),
    Io(SocketId, DriveOutcome),
    Tick,
}

async fn run(mut cmd_rx: mpsc::UnboundedReceiver<Command>) {
    let mut sockets: HashMap<SocketId, Socket> = HashMap::new();
    tracing::debug!("multiplexer loop started");

    loop {
        let tick_bounded = sockets.values().any(Socket::needs_poll_tick);

        let wake = {
            let io_futs: Vec<Pin<Box<dyn Future<Output = (SocketId, DriveOutcome)> + Send + '_>>> =
                sockets
                    .iter_mut()
                    .filter(|(_, s)| s.wants_io())
                    .map(|(id, s)| {
                        let id = *id;
                        Box::pin(async move { (id, s.drive().await) }) as _
                    })
                    .collect();

            if io_futs.is_empty() {
                if tick_bounded {
                    tokio::select! {
                        cmd = cmd_rx.recv() => Wake::Cmd(cmd),
                        _ = tokio::time::sleep(POLL_INTERVAL) => Wake::Tick,
                    }
                } else {
                    Wake::Cmd(cmd_rx.recv().await)
                }
            } else {
                let io = select_all(io_futs);
                if tick_bounded {
                    tokio::select! {
                        cmd = cmd_rx.recv() => Wake::Cmd(cmd),
                        ((id, out), _, _) = io => Wake::Io(id, out),
                        _ = tokio::time::sleep(POLL_INTERVAL) => Wake::Tick,
                    }
                } else {
                    tokio::select! {
                        cmd = cmd_rx.recv() => Wake::Cmd(cmd),
                        ((id, out), _, _) = io => Wake::Io(id, out),
                    }
                }
            }
        };

        match wake {
            Wake::Cmd(Some(command)) => {
                if !handle_command(&mut sockets, command) {
                    break;
                }
            }
            Wake::Cmd(None) => {
                // All handles dropped
                break;
            }
            Wake::Io(id, outcome) => handle_io(&mut sockets, id, outcome),
            Wake::Tick => {}
        }

        sweep_deadlines(&mut sockets);
    }

    for (_, mut socket) in sockets.drain() {
        socket.teardown(DisconnectReason::ExplicitClose);
    }
    tracing::debug!("multiplexer loop stopped");
}

/// Returns false when the loop should stop.
fn handle_command(sockets: &mut HashMap<SocketId, Socket>, command: Command) -> bool {
    match command {
        Command::Connect { id, target, events } => {
            sockets.insert(id, Socket::connect(id, target, events));
        }
        Command::Send { id, frame, reply } => {
            let result = match sockets.get_mut(&id) {
                Some(socket) => socket.queue_frame(&frame),
                None => Err(CastError::ConnectionClosed),
            };
            let _ = reply.send(result);
        }
        Command::Disconnect { id } => {
            if let Some(socket) = sockets.get_mut(&id) {
                if socket.begin_disconnect() {
                    let mut socket = sockets.remove(&id).unwrap();
                    socket.teardown(DisconnectReason::ExplicitClose);
                }
            }
        }
        Command::Shutdown => return false,
    }
    true
}

fn handle_io(sockets: &mut HashMap<SocketId, Socket>, id: SocketId, outcome: DriveOutcome) {
    let Some(socket) = sockets.get_mut(&id) else {
        return;
    };
    match outcome {
        DriveOutcome::ConnectDone => socket.mark_connected(),
        DriveOutcome::ConnectError(reason, detail) => {
            tracing::error!("socket {}: connect error: {}", id, detail);
            remove_and_teardown(sockets, id, reason);
        }
        DriveOutcome::Read(n) => {
            tracing::trace!("socket {}: read {} bytes", id, n);
            match socket.take_frames() {
                Ok(frames) => {
                    for frame in frames {
                        socket.send_event_frame(frame);
                    }
                }
                Err(e) => {
                    tracing::error!("socket {}: framing error: {}", id, e);
                    remove_and_teardown(sockets, id, DisconnectReason::IoError);
                }
            }
        }
        DriveOutcome::Wrote(n) => {
            tracing::trace!("socket {}: wrote {} bytes", id, n);
            if socket.state() == SocketState::Disconnecting && socket.write_ring_empty() {
                remove_and_teardown(sockets, id, DisconnectReason::ExplicitClose);
            }
        }
        DriveOutcome::Eof => {
            tracing::info!("socket {}: peer closed", id);
            remove_and_teardown(sockets, id, DisconnectReason::IoError);
        }
        DriveOutcome::IoError(e) => {
            tracing::error!("socket {}: io error: {}", id, e);
            remove_and_teardown(sockets, id, DisconnectReason::IoError);
        }
    }
}

fn sweep_deadlines(sockets: &mut HashMap<SocketId, Socket>) {
    let now = Instant::now();
    let expired: Vec<(SocketId, DisconnectReason)> = sockets
        .values()
        .filter_map(|s| s.expired_deadline(now).map(|r| (s.id(), r)))
        .collect();
    for (id, reason) in expired {
        if reason == DisconnectReason::ExplicitClose {
            tracing::warn!("socket {}: flush window expired, closing", id);
        }
        remove_and_teardown(sockets, id, reason);
    }
}

fn remove_and_teardown(
    sockets: &mut HashMap<SocketId, Socket>,
    id: SocketId,
    reason: DisconnectReason,
) {
    if let Some(mut socket) = sockets.remove(&id) {
        socket.teardown(reason);
    }
}
