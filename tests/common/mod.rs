//! Loopback fake receiver for integration tests.
//!
//! Listens on an ephemeral port, speaks the `<len>:<json>` framing and
//! emulates enough of the receiver protocol (PONG, CONNECT bookkeeping,
//! LAUNCH/STOP/GET_STATUS/SET_VOLUME with RECEIVER_STATUS replies) to
//! exercise the client end to end.

use castlink::{CastFrame, NS_HEARTBEAT, NS_RECEIVER};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// App id the fake receiver refuses to launch
pub const REJECTED_APP: &str = "REJECTED";

pub struct FakeReceiver {
    pub port: u16,
    /// Every frame the receiver has accepted, in arrival order
    pub frames: Arc<Mutex<Vec<CastFrame>>>,
}

impl FakeReceiver {
    pub async fn spawn() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let frames: Arc<Mutex<Vec<CastFrame>>> = Arc::new(Mutex::new(Vec::new()));

        let accept_frames = frames.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(serve(stream, accept_frames.clone()));
            }
        });

        Self { port, frames }
    }

    /// Frames received so far on `namespace`.
    pub fn received(&self, namespace: &str) -> Vec<CastFrame> {
        self.frames
            .lock()
            .unwrap()
            .iter()
            .filter(|f| f.namespace == namespace)
            .cloned()
            .collect()
    }

    pub fn payloads(&self, namespace: &str) -> Vec<Value> {
        self.received(namespace)
            .iter()
            .map(|f| f.payload_json().unwrap())
            .collect()
    }
}

async fn serve(mut stream: TcpStream, frames: Arc<Mutex<Vec<CastFrame>>>) {
    let mut buf: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 4096];
    let mut volume = json!({ "level": 0.5, "muted": false });
    let mut app: Option<Value> = None;

    loop {
        let n = match stream.read(&mut chunk).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        buf.extend_from_slice(&chunk[..n]);

        while let Some(frame) = next_frame(&mut buf) {
            frames.lock().unwrap().push(frame.clone());
            let payload = frame.payload_json().unwrap();
            let request_id = payload.get("requestId").cloned().unwrap_or(json!(0));
            let msg_type = payload["type"].as_str().unwrap_or_default();

            let reply = match (frame.namespace.as_str(), msg_type) {
                (NS_HEARTBEAT, "PING") => Some((NS_HEARTBEAT, json!({ "type": "PONG" }))),
                (NS_RECEIVER, "GET_STATUS") => {
                    Some((NS_RECEIVER, status_reply(&request_id, &volume, &app)))
                }
                (NS_RECEIVER, "LAUNCH") => {
                    if payload["appId"] == REJECTED_APP {
                        Some((
                            NS_RECEIVER,
                            json!({
                                "type": "LAUNCH_ERROR",
                                "requestId": request_id,
                                "reason": "NOT_FOUND"
                            }),
                        ))
                    } else {
                        app = Some(json!({
                            "appId": payload["appId"],
                            "sessionId": "session-1",
                            "transportId": "transport-1",
                            "displayName": "Fake App"
                        }));
                        Some((NS_RECEIVER, status_reply(&request_id, &volume, &app)))
                    }
                }
                (NS_RECEIVER, "STOP") => {
                    app = None;
                    Some((NS_RECEIVER, status_reply(&request_id, &volume, &app)))
                }
                (NS_RECEIVER, "SET_VOLUME") => {
                    if let Some(level) = payload["volume"].get("level") {
                        volume["level"] = level.clone();
                    }
                    if let Some(muted) = payload["volume"].get("muted") {
                        volume["muted"] = muted.clone();
                    }
                    Some((NS_RECEIVER, status_reply(&request_id, &volume, &app)))
                }
                _ => None,
            };

            if let Some((namespace, payload)) = reply {
                let out = CastFrame::text("receiver-0", &frame.source_id, namespace, &payload);
                if write_frame(&mut stream, &out).await.is_err() {
                    return;
                }
            }
        }
    }
}

fn status_reply(request_id: &Value, volume: &Value, app: &Option<Value>) -> Value {
    let applications: Vec<Value> = app.iter().cloned().collect();
    json!({
        "type": "RECEIVER_STATUS",
        "requestId": request_id,
        "status": {
            "volume": volume,
            "applications": applications
        }
    })
}

/// Pop one `<len>:<json>` frame off the front of `buf`, if complete.
fn next_frame(buf: &mut Vec<u8>) -> Option<CastFrame> {
    let colon = buf.iter().position(|&b| b == b':')?;
    let len: usize = std::str::from_utf8(&buf[..colon]).ok()?.parse().ok()?;
    if buf.len() < colon + 1 + len {
        return None;
    }
    let frame = serde_json::from_slice(&buf[colon + 1..colon + 1 + len]).ok()?;
    buf.drain(..colon + 1 + len);
    Some(frame)
}

pub async fn write_frame(stream: &mut TcpStream, frame: &CastFrame) -> std::io::Result<()> {
    let body = serde_json::to_string(frame).unwrap();
    let encoded = format!("{}:{}", body.len(), body);
    stream.write_all(encoded.as_bytes()).await
}
