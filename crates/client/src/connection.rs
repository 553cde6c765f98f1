use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use {
    futures::{SinkExt, StreamExt},
    tokio::sync::{Mutex, mpsc, oneshot},
    tokio_tungstenite::{connect_async, tungstenite::Message},
    tracing::{debug, info, warn},
};

use clawdis_protocol::{
    ClientDescriptor, ErrorShape, EventFrame, GatewayFrame, HANDSHAKE_TIMEOUT_MS, HelloAuth,
    HelloOk, HelloParams, PROTOCOL_VERSION, RequestFrame,
};

use crate::error::{Error, Result};

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Events surfaced to the consumer's event channel.
#[derive(Debug)]
pub enum ClientEvent {
    Connected(Box<HelloOk>),
    /// A server-push event frame, after gap accounting.
    Event(EventFrame),
    /// A hole in the broadcast sequence: events between `expected` and
    /// `received` never arrived on this connection.
    Gap { expected: u64, received: u64 },
    Disconnected,
    Error(String),
}

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub url: String,
    pub token: Option<String>,
    pub client: ClientDescriptor,
}

impl ClientOptions {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: None,
            client: ClientDescriptor {
                name: "clawdis-client".into(),
                version: env!("CARGO_PKG_VERSION").into(),
                platform: std::env::consts::OS.into(),
                mode: "cli".into(),
                instance_id: Some(uuid::Uuid::new_v4().to_string()),
            },
        }
    }
}

#[derive(Debug, Default)]
pub struct RequestOpts {
    /// Long-running ack-then-final methods set this so intermediate
    /// `accepted` payloads never settle the request early.
    pub expect_final: bool,
}

struct Pending {
    tx: oneshot::Sender<Result<serde_json::Value>>,
    expect_final: bool,
}

struct Shared {
    /// Present only while a connection is open and past its handshake.
    write_tx: Mutex<Option<mpsc::UnboundedSender<String>>>,
    pending: Mutex<HashMap<String, Pending>>,
    last_seq: AtomicU64,
    stopped: AtomicBool,
}

/// Handle to a gateway connection that survives reconnects.
pub struct GatewayClient {
    shared: Arc<Shared>,
}

impl GatewayClient {
    /// Spawn the connection loop. Returns immediately; handshakes, frames,
    /// and reconnects are reported through `event_tx`.
    pub fn spawn(options: ClientOptions, event_tx: mpsc::UnboundedSender<ClientEvent>) -> Self {
        let shared = Arc::new(Shared {
            write_tx: Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
            last_seq: AtomicU64::new(0),
            stopped: AtomicBool::new(false),
        });
        tokio::spawn(connection_loop(options, Arc::clone(&shared), event_tx));
        Self { shared }
    }

    /// Issue one RPC. Fails with [`Error::NotOpen`] before any suspension
    /// when the socket is not open; otherwise resolves on the matching `res`.
    pub async fn request(
        &self,
        method: impl Into<String>,
        params: Option<serde_json::Value>,
        opts: RequestOpts,
    ) -> Result<serde_json::Value> {
        let Some(write_tx) = self.shared.write_tx.lock().await.clone() else {
            return Err(Error::NotOpen);
        };

        let id = uuid::Uuid::new_v4().to_string();
        let json = GatewayFrame::Request(RequestFrame {
            id: id.clone(),
            method: method.into(),
            params,
        })
        .to_json()?;

        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().await.insert(id.clone(), Pending {
            tx,
            expect_final: opts.expect_final,
        });

        if write_tx.send(json).is_err() {
            self.shared.pending.lock().await.remove(&id);
            return Err(Error::NotOpen);
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::Closed),
        }
    }

    /// Mark the client closed and prevent further reconnects.
    pub async fn stop(&self) {
        self.shared.stopped.store(true, Ordering::SeqCst);
        // Dropping the sender ends the current connection's forward loop.
        *self.shared.write_tx.lock().await = None;
    }
}

fn next_backoff(current: Duration) -> Duration {
    (current * 2).min(MAX_BACKOFF)
}

fn detect_gap(last: u64, seq: u64) -> Option<(u64, u64)> {
    (seq > last + 1).then_some((last + 1, seq))
}

fn is_accepted(payload: &Option<serde_json::Value>) -> bool {
    payload
        .as_ref()
        .and_then(|p| p.get("status"))
        .and_then(|s| s.as_str())
        == Some("accepted")
}

/// Main connection loop with auto-reconnect.
async fn connection_loop(
    options: ClientOptions,
    shared: Arc<Shared>,
    event_tx: mpsc::UnboundedSender<ClientEvent>,
) {
    let mut backoff = INITIAL_BACKOFF;

    loop {
        if shared.stopped.load(Ordering::SeqCst) {
            break;
        }
        info!(url = %options.url, "connecting to gateway");

        match connect_and_run(&options, &shared, &event_tx, &mut backoff).await {
            Ok(()) => debug!("connection closed cleanly"),
            Err(e) => {
                warn!(error = %e, "connection error");
                let _ = event_tx.send(ClientEvent::Error(e.to_string()));
            },
        }

        *shared.write_tx.lock().await = None;
        reject_all_pending(&shared).await;
        let _ = event_tx.send(ClientEvent::Disconnected);

        if shared.stopped.load(Ordering::SeqCst) {
            break;
        }
        info!(delay_ms = backoff.as_millis(), "reconnecting after delay");
        tokio::time::sleep(backoff).await;
        backoff = next_backoff(backoff);
    }
}

async fn reject_all_pending(shared: &Shared) {
    let mut pending = shared.pending.lock().await;
    for (_, entry) in pending.drain() {
        let _ = entry.tx.send(Err(Error::Closed));
    }
}

fn build_hello(options: &ClientOptions) -> HelloParams {
    HelloParams {
        min_protocol: PROTOCOL_VERSION,
        max_protocol: PROTOCOL_VERSION,
        client: options.client.clone(),
        caps: Some(vec![]),
        auth: options.token.clone().map(|token| HelloAuth { token: Some(token) }),
    }
}

/// Single connection attempt: connect, handshake, then multiplex frames.
async fn connect_and_run(
    options: &ClientOptions,
    shared: &Arc<Shared>,
    event_tx: &mpsc::UnboundedSender<ClientEvent>,
    backoff: &mut Duration,
) -> Result<()> {
    let (ws, _response) = connect_async(&options.url).await?;
    let (mut sink, mut stream) = ws.split();

    let hello_json = GatewayFrame::Hello(build_hello(options)).to_json()?;
    sink.send(Message::Text(hello_json.into())).await?;

    let hello_ok = wait_for_hello_ok(&mut stream).await?;
    info!(
        server_version = %hello_ok.server.version,
        conn_id = %hello_ok.server.conn_id,
        "connected to gateway"
    );
    *backoff = INITIAL_BACKOFF;

    let (write_tx, mut write_rx) = mpsc::unbounded_channel::<String>();
    *shared.write_tx.lock().await = Some(write_tx);
    let _ = event_tx.send(ClientEvent::Connected(Box::new(hello_ok)));

    loop {
        tokio::select! {
            // Incoming frames from the gateway
            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        handle_frame(shared, event_tx, &text).await;
                    },
                    Some(Ok(Message::Binary(data))) => {
                        if let Ok(text) = String::from_utf8(data.to_vec()) {
                            handle_frame(shared, event_tx, &text).await;
                        }
                    },
                    Some(Ok(Message::Ping(data))) => {
                        sink.send(Message::Pong(data)).await?;
                    },
                    Some(Ok(Message::Close(_))) | None => {
                        debug!("websocket closed by server");
                        return Ok(());
                    },
                    Some(Ok(_)) => {},
                    Some(Err(e)) => return Err(Error::WebSocket(e)),
                }
            },
            // Outgoing frames from request()
            json = write_rx.recv() => {
                match json {
                    Some(text) => sink.send(Message::Text(text.into())).await?,
                    None => {
                        // stop() dropped the sender
                        let _ = sink.send(Message::Close(None)).await;
                        return Ok(());
                    },
                }
            },
        }
    }
}

async fn handle_frame(
    shared: &Arc<Shared>,
    event_tx: &mpsc::UnboundedSender<ClientEvent>,
    text: &str,
) {
    let frame: GatewayFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            debug!(error = %e, "ignoring undecodable frame");
            return;
        },
    };

    match frame {
        GatewayFrame::Response(res) => {
            let mut pending = shared.pending.lock().await;
            let Some(entry) = pending.get(&res.id) else {
                debug!(id = %res.id, "response for unknown request");
                return;
            };
            if entry.expect_final && res.ok && is_accepted(&res.payload) {
                debug!(id = %res.id, "ignoring accepted intermediate");
                return;
            }
            if let Some(entry) = pending.remove(&res.id) {
                let result = if res.ok {
                    Ok(res.payload.unwrap_or(serde_json::Value::Null))
                } else {
                    Err(Error::Rpc(res.error.unwrap_or_else(|| {
                        ErrorShape::new("UNAVAILABLE", "response carried no error shape")
                    })))
                };
                let _ = entry.tx.send(result);
            }
        },
        GatewayFrame::Event(event) => {
            if let Some(seq) = event.seq {
                let last = shared.last_seq.load(Ordering::SeqCst);
                if let Some((expected, received)) = detect_gap(last, seq) {
                    warn!(expected, received, "broadcast sequence gap");
                    let _ = event_tx.send(ClientEvent::Gap { expected, received });
                }
                shared.last_seq.store(seq, Ordering::SeqCst);
            }
            let _ = event_tx.send(ClientEvent::Event(event));
        },
        GatewayFrame::HelloError(err) => {
            warn!(reason = %err.reason, "hello-error outside handshake");
        },
        GatewayFrame::Hello(_) | GatewayFrame::HelloOk(_) | GatewayFrame::Request(_) => {
            debug!("ignoring unexpected frame from gateway");
        },
    }
}

/// Wait for the handshake result frame.
async fn wait_for_hello_ok(
    stream: &mut (impl StreamExt<
        Item = std::result::Result<Message, tokio_tungstenite::tungstenite::Error>,
    > + Unpin),
) -> Result<HelloOk> {
    let deadline = Duration::from_millis(HANDSHAKE_TIMEOUT_MS);

    let result = tokio::time::timeout(deadline, async {
        while let Some(msg) = stream.next().await {
            match msg? {
                Message::Text(text) => match serde_json::from_str::<GatewayFrame>(&text) {
                    Ok(GatewayFrame::HelloOk(hello)) => return Ok(hello),
                    Ok(GatewayFrame::HelloError(err)) => return Err(Error::Handshake(err.reason)),
                    // Not the handshake result; skip.
                    Ok(_) | Err(_) => {},
                },
                Message::Close(_) => {
                    return Err(Error::Protocol(
                        "server closed connection during handshake".into(),
                    ));
                },
                _ => {},
            }
        }
        Err(Error::Protocol("connection closed before handshake".into()))
    })
    .await;

    match result {
        Ok(inner) => inner,
        Err(_) => Err(Error::Protocol("handshake timed out".into())),
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps_at_thirty_seconds() {
        let mut backoff = INITIAL_BACKOFF;
        let mut observed = Vec::new();
        for _ in 0..7 {
            observed.push(backoff.as_secs());
            backoff = next_backoff(backoff);
        }
        assert_eq!(observed, vec![1, 2, 4, 8, 16, 30, 30]);
    }

    #[test]
    fn gap_is_detected_only_when_sequence_skips() {
        assert_eq!(detect_gap(0, 1), None);
        assert_eq!(detect_gap(1, 2), None);
        assert_eq!(detect_gap(1, 4), Some((2, 4)));
        // Out-of-order or duplicate delivery is not a gap.
        assert_eq!(detect_gap(5, 5), None);
        assert_eq!(detect_gap(5, 3), None);
    }

    #[test]
    fn accepted_intermediates_are_recognized() {
        assert!(is_accepted(&Some(
            serde_json::json!({ "runId": "r", "status": "accepted" })
        )));
        assert!(!is_accepted(&Some(serde_json::json!({ "status": "ok" }))));
        assert!(!is_accepted(&None));
    }

    #[test]
    fn hello_carries_protocol_bounds_and_token() {
        let mut options = ClientOptions::new("ws://127.0.0.1:18789/ws");
        options.token = Some("secret".into());
        let hello = build_hello(&options);
        assert_eq!(hello.min_protocol, PROTOCOL_VERSION);
        assert_eq!(hello.max_protocol, PROTOCOL_VERSION);
        assert_eq!(
            hello.auth.and_then(|a| a.token).as_deref(),
            Some("secret")
        );
    }
}
