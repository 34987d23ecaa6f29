use crate::channel::CastSink;
use crate::error::Result;
use crate::protocol::{heartbeat, CastFrame, MessageType, NS_HEARTBEAT, PLATFORM_RECEIVER_ID};
use std::time::Duration;
use tokio::time::Instant;

/// Quiet-window length; the link is suspect once half of it passes
/// without inbound traffic.
pub(crate) const HEARTBEAT_WINDOW: Duration = Duration::from_secs(10);

/// Unanswered PINGs tolerated before the link is declared dead
const MAX_UNANSWERED_PINGS: u32 = 5;

/// Verdict of one heartbeat tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatVerdict {
    Alive,
    /// Too many unanswered PINGs; tear the transport down
    LinkDead,
}

/// Keep-alive channel.
///
/// Any inbound frame on any namespace counts as traffic and resets the
/// window. Ticks arrive every half window as deferred messages on the
/// link's event queue.
pub struct Heartbeat {
    sink: CastSink,
    last_traffic: Instant,
    unanswered_pings: u32,
}

impl Heartbeat {
    pub fn new(sink: CastSink, now: Instant) -> Self {
        Self {
            sink,
            last_traffic: now,
            unanswered_pings: 0,
        }
    }

    /// How often the owner should tick this channel.
    pub fn tick_interval() -> Duration {
        HEARTBEAT_WINDOW / 2
    }

    /// Note inbound traffic on any namespace.
    pub fn on_traffic(&mut self, now: Instant) {
        self.last_traffic = now;
        self.unanswered_pings = 0;
    }

    /// Handle a frame on the heartbeat namespace. The receiver's own
    /// PINGs get an immediate PONG.
    pub fn on_message(&mut self, frame: &CastFrame) -> Result<()> {
        let payload = frame.payload_json()?;
        if MessageType::of(&payload) == Some(MessageType::Ping) {
            self.sink
                .send(&frame.source_id, NS_HEARTBEAT, &heartbeat::pong())?;
        }
        Ok(())
    }

    /// Half-window tick: send a PING once the window is half idle;
    /// declare the link dead after `MAX_UNANSWERED_PINGS` PINGs drew
    /// no traffic at all.
    pub fn on_tick(&mut self, now: Instant) -> Result<HeartbeatVerdict> {
        let idle = now.saturating_duration_since(self.last_traffic);
        if idle >= HEARTBEAT_WINDOW && self.unanswered_pings >= MAX_UNANSWERED_PINGS {
            tracing::error!(
                "no heartbeat traffic for {:?} after {} pings, link dead",
                idle,
                self.unanswered_pings
            );
            return Ok(HeartbeatVerdict::LinkDead);
        }
        if idle >= HEARTBEAT_WINDOW / 2 {
            self.sink
                .send(PLATFORM_RECEIVER_ID, NS_HEARTBEAT, &heartbeat::ping())?;
            self.unanswered_pings += 1;
        }
        Ok(HeartbeatVerdict::Alive)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn fixture() -> (Heartbeat, mpsc::UnboundedReceiver<CastFrame>, Instant) {
        let (tx, rx) = mpsc::unbounded_channel();
        let start = Instant::now();
        (Heartbeat::new(CastSink::new("sender-0", tx), start), rx, start)
    }

    fn sent_types(rx: &mut mpsc::UnboundedReceiver<CastFrame>) -> Vec<MessageType> {
        let mut out = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            out.push(MessageType::of(&frame.payload_json().unwrap()).unwrap());
        }
        out
    }

    #[tokio::test]
    async fn quiet_half_window_sends_ping() {
        let (mut hb, mut rx, start) = fixture();
        assert_eq!(
            hb.on_tick(start + HEARTBEAT_WINDOW / 2).unwrap(),
            HeartbeatVerdict::Alive
        );
        assert_eq!(sent_types(&mut rx), vec![MessageType::Ping]);
    }

    #[tokio::test]
    async fn traffic_resets_window_and_ping_count() {
        let (mut hb, mut rx, start) = fixture();
        hb.on_tick(start + HEARTBEAT_WINDOW / 2).unwrap();
        assert_eq!(sent_types(&mut rx).len(), 1);

        hb.on_traffic(start + HEARTBEAT_WINDOW);
        assert_eq!(
            hb.on_tick(start + HEARTBEAT_WINDOW + HEARTBEAT_WINDOW / 4).unwrap(),
            HeartbeatVerdict::Alive
        );
        // Within half a window of the reset, no new ping
        assert!(sent_types(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn dead_only_after_five_unanswered_pings() {
        let (mut hb, mut rx, start) = fixture();
        let step = HEARTBEAT_WINDOW / 2;

        // Ticks at 5s, 10s, ... with no traffic: five PINGs go out
        let mut pings = 0;
        let mut t = start;
        for _ in 0..5 {
            t += step;
            assert_eq!(hb.on_tick(t).unwrap(), HeartbeatVerdict::Alive);
            pings += sent_types(&mut rx).len();
        }
        assert_eq!(pings, 5);

        // The fifth ping also drew nothing: next tick declares death
        t += step;
        assert_eq!(hb.on_tick(t).unwrap(), HeartbeatVerdict::LinkDead);
    }

    #[tokio::test]
    async fn replies_pong_to_receiver_ping() {
        let (mut hb, mut rx, _) = fixture();
        let ping = CastFrame::text("receiver-0", "sender-0", NS_HEARTBEAT, &heartbeat::ping());
        hb.on_message(&ping).unwrap();

        let frame = rx.try_recv().unwrap();
        assert_eq!(frame.destination_id, "receiver-0");
        assert_eq!(
            MessageType::of(&frame.payload_json().unwrap()),
            Some(MessageType::Pong)
        );
    }
}
