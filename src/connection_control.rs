use crate::channel::CastSink;
use crate::error::Result;
use crate::protocol::{connection, CastFrame, MessageType, NS_CONNECTION};
use std::collections::HashSet;

/// User agent advertised in the CONNECT payload
const USER_AGENT: &str = concat!("castlink/", env!("CARGO_PKG_VERSION"));

/// Virtual-connection channel.
///
/// A CONNECT must be sent to a transport id before any other namespace
/// may talk to it; CLOSE releases the virtual channel again. The
/// platform receiver (`receiver-0`) and each launched application get
/// their own virtual connection.
pub struct ConnectionControl {
    sink: CastSink,
    package: String,
    connected: HashSet<String>,
}

impl ConnectionControl {
    pub fn new(sink: CastSink, package: impl Into<String>) -> Self {
        Self {
            sink,
            package: package.into(),
            connected: HashSet::new(),
        }
    }

    /// Open a virtual connection to `transport_id`. Idempotent.
    pub fn connect(&mut self, transport_id: &str) -> Result<()> {
        if self.connected.contains(transport_id) {
            return Ok(());
        }
        self.sink.send(
            transport_id,
            NS_CONNECTION,
            &connection::connect(&self.package, USER_AGENT),
        )?;
        self.connected.insert(transport_id.to_string());
        Ok(())
    }

    /// Release the virtual connection to `transport_id`.
    pub fn close(&mut self, transport_id: &str) -> Result<()> {
        if self.connected.remove(transport_id) {
            self.sink
                .send(transport_id, NS_CONNECTION, &connection::close())?;
        }
        Ok(())
    }

    /// Release every open virtual connection; used during teardown.
    pub fn close_all(&mut self) {
        let open: Vec<String> = self.connected.drain().collect();
        for transport_id in open {
            if let Err(e) = self
                .sink
                .send(&transport_id, NS_CONNECTION, &connection::close())
            {
                tracing::debug!("close to {} not sent: {}", transport_id, e);
            }
        }
    }

    pub fn is_connected(&self, transport_id: &str) -> bool {
        self.connected.contains(transport_id)
    }

    /// Handle a frame on the connection namespace. A receiver-initiated
    /// CLOSE drops the virtual connection; the closed transport id is
    /// returned so the owner can notify listeners.
    pub fn on_message(&mut self, frame: &CastFrame) -> Result<Option<String>> {
        let payload = frame.payload_json()?;
        if MessageType::of(&payload) == Some(MessageType::Close) {
            let transport_id = frame.source_id.clone();
            self.connected.remove(&transport_id);
            tracing::info!("receiver closed virtual connection to {}", transport_id);
            return Ok(Some(transport_id));
        }
        Ok(None)
    }
}
