use std::{net::SocketAddr, sync::Arc};

use {
    axum::extract::ws::{CloseFrame, Message, WebSocket},
    futures::{SinkExt, stream::StreamExt},
    tracing::{debug, info, warn},
};

use clawdis_protocol::{
    ErrorShape, Features, GatewayFrame, HANDSHAKE_TIMEOUT_MS, HelloError, HelloOk, HelloParams,
    PROTOCOL_VERSION, Policy, ResponseFrame, ServerInfo, events,
    validate::{format_issues, validate_frame, validate_hello},
};

use crate::{
    broadcast::broadcast_presence,
    methods::{MethodContext, MethodRegistry},
    state::{ConnSender, ConnectedClient, GatewayState, Outbound},
};

/// Handle a single WebSocket connection through its full lifecycle:
/// handshake (protocol + token checks) → message loop → cleanup.
pub async fn handle_connection(
    socket: WebSocket,
    state: Arc<GatewayState>,
    methods: Arc<MethodRegistry>,
    remote_addr: SocketAddr,
) {
    let conn_id = uuid::Uuid::new_v4().to_string();
    info!(conn_id = %conn_id, remote_ip = %remote_addr.ip(), "ws: new connection");

    let (mut ws_tx, mut ws_rx) = socket.split();
    let (sender, mut outbound_rx) = ConnSender::channel();

    // Write loop: the only task touching the socket's send half, so outbound
    // frames to this connection are serialized.
    let write_sender = sender.clone();
    let write_conn_id = conn_id.clone();
    let write_handle = tokio::spawn(async move {
        while let Some(outbound) = outbound_rx.recv().await {
            match outbound {
                Outbound::Frame(json) => {
                    let len = json.len();
                    let result = ws_tx.send(Message::Text(json.into())).await;
                    write_sender.debit(len);
                    if result.is_err() {
                        debug!(conn_id = %write_conn_id, "ws: write loop closed");
                        break;
                    }
                },
                Outbound::Close { code, reason } => {
                    let _ = ws_tx
                        .send(Message::Close(Some(CloseFrame {
                            code,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                },
            }
        }
    });

    // ── Handshake phase ──────────────────────────────────────────────────

    let hello = match tokio::time::timeout(
        std::time::Duration::from_millis(HANDSHAKE_TIMEOUT_MS),
        wait_for_hello(&mut ws_rx),
    )
    .await
    {
        Ok(HelloOutcome::Valid(params)) => params,
        Ok(HelloOutcome::Invalid(reason)) => {
            warn!(conn_id = %conn_id, reason, "ws: invalid hello");
            send_frame(&sender, &GatewayFrame::HelloError(HelloError::new(&reason)));
            sender.close(1008, reason);
            let _ = write_handle.await;
            return;
        },
        Ok(HelloOutcome::Gone) => {
            // Parse failure or close before a hello: no frame goes out.
            debug!(conn_id = %conn_id, "ws: connection gone before handshake");
            drop(sender);
            write_handle.abort();
            return;
        },
        Err(_) => {
            warn!(conn_id = %conn_id, "ws: handshake timeout");
            drop(sender);
            write_handle.abort();
            return;
        },
    };

    if hello.min_protocol > PROTOCOL_VERSION || hello.max_protocol < PROTOCOL_VERSION {
        warn!(
            conn_id = %conn_id,
            client_min = hello.min_protocol,
            client_max = hello.max_protocol,
            "ws: protocol mismatch"
        );
        send_frame(
            &sender,
            &GatewayFrame::HelloError(HelloError::protocol_mismatch()),
        );
        sender.close(1002, "protocol mismatch");
        let _ = write_handle.await;
        return;
    }

    if let Some(expected) = &state.config.token {
        let provided = hello.auth.as_ref().and_then(|a| a.token.as_deref());
        if provided != Some(expected.as_str()) {
            warn!(conn_id = %conn_id, "ws: auth failed");
            send_frame(
                &sender,
                &GatewayFrame::HelloError(HelloError::new("unauthorized")),
            );
            sender.close(1008, "unauthorized");
            let _ = write_handle.await;
            return;
        }
    }

    let snapshot = state.snapshot().await;
    let hello_ok = HelloOk {
        protocol: PROTOCOL_VERSION,
        server: ServerInfo {
            version: state.config.version.clone(),
            commit: state.config.commit.clone(),
            host: Some(state.hostname.clone()),
            conn_id: conn_id.clone(),
        },
        features: Features {
            methods: methods.method_names(),
            events: events::ALL.iter().map(|s| s.to_string()).collect(),
        },
        snapshot,
        policy: Policy::default_policy(),
    };
    send_frame(&sender, &GatewayFrame::HelloOk(hello_ok));

    info!(
        conn_id = %conn_id,
        client_name = %hello.client.name,
        client_version = %hello.client.version,
        mode = %hello.client.mode,
        "ws: handshake complete"
    );

    let now = std::time::Instant::now();
    let presence_key = state
        .presence
        .write()
        .await
        .record_connect(&hello.client, &conn_id);
    state
        .register_client(ConnectedClient {
            conn_id: conn_id.clone(),
            descriptor: hello.client.clone(),
            presence_key: presence_key.clone(),
            sender: sender.clone(),
            connected_at: now,
            last_activity: now,
        })
        .await;
    broadcast_presence(&state).await;

    // ── Message loop ─────────────────────────────────────────────────────

    while let Some(msg) = ws_rx.next().await {
        let text = match msg {
            Ok(Message::Text(t)) => t.to_string(),
            Ok(Message::Binary(b)) => match String::from_utf8(b.to_vec()) {
                Ok(s) => s,
                Err(_) => {
                    respond_invalid(&sender, "invalid", "binary frames must be UTF-8 JSON".into());
                    continue;
                },
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!(conn_id = %conn_id, error = %e, "ws: read error");
                break;
            },
        };

        let value: serde_json::Value = match serde_json::from_str(&text) {
            Ok(v) => v,
            Err(e) => {
                warn!(conn_id = %conn_id, error = %e, "ws: unparseable frame");
                respond_invalid(&sender, "invalid", format!("invalid frame: {e}"));
                continue;
            },
        };

        if let Err(issues) = validate_frame(&value) {
            let message = format_issues(&issues);
            warn!(conn_id = %conn_id, message, "ws: invalid frame");
            respond_invalid(&sender, &extract_id(&value), message);
            continue;
        }

        let frame: GatewayFrame = match serde_json::from_value(value.clone()) {
            Ok(f) => f,
            Err(e) => {
                warn!(conn_id = %conn_id, error = %e, "ws: undecodable frame");
                respond_invalid(&sender, &extract_id(&value), format!("invalid frame: {e}"));
                continue;
            },
        };

        if let Some(client) = state.clients.write().await.get_mut(&conn_id) {
            client.touch();
        }

        match frame {
            GatewayFrame::Request(req) => {
                let ctx = MethodContext {
                    request_id: req.id.clone(),
                    method: req.method.clone(),
                    params: req.params.unwrap_or(serde_json::Value::Null),
                    conn_id: conn_id.clone(),
                    state: Arc::clone(&state),
                };
                // Handlers may suspend on collaborator I/O; each request runs
                // on its own task so this loop keeps consuming frames.
                let methods = Arc::clone(&methods);
                let sender = sender.clone();
                tokio::spawn(async move {
                    let dispatched = methods.dispatch(ctx).await;
                    send_frame(&sender, &GatewayFrame::Response(dispatched.response));
                    if let Some(followup) = dispatched.followup {
                        followup.await;
                    }
                });
            },
            GatewayFrame::Hello(_) => {
                // A second hello does not re-initialize anything.
                warn!(conn_id = %conn_id, "ws: hello after handshake");
                respond_invalid(&sender, "invalid", "unexpected hello after handshake".into());
            },
            GatewayFrame::Response(res) => {
                respond_invalid(&sender, &res.id, "unexpected res frame".into());
            },
            GatewayFrame::Event(_) => {
                respond_invalid(&sender, "invalid", "unexpected event frame".into());
            },
            GatewayFrame::HelloOk(_) => {
                respond_invalid(&sender, "invalid", "unexpected hello-ok frame".into());
            },
            GatewayFrame::HelloError(_) => {
                respond_invalid(&sender, "invalid", "unexpected hello-error frame".into());
            },
        }
    }

    // ── Cleanup ──────────────────────────────────────────────────────────

    state.presence.write().await.record_disconnect(&presence_key);
    broadcast_presence(&state).await;

    let duration = state
        .remove_client(&conn_id)
        .await
        .map(|c| c.connected_at.elapsed())
        .unwrap_or_default();
    info!(
        conn_id = %conn_id,
        duration_secs = duration.as_secs(),
        "ws: connection closed"
    );

    drop(sender);
    write_handle.abort();
}

enum HelloOutcome {
    Valid(HelloParams),
    /// Well-formed JSON but not an acceptable hello; reported via hello-error.
    Invalid(String),
    /// Parse failure or close before a hello; the socket closes silently.
    Gone,
}

async fn wait_for_hello(rx: &mut futures::stream::SplitStream<WebSocket>) -> HelloOutcome {
    while let Some(msg) = rx.next().await {
        let text = match msg {
            Ok(Message::Text(t)) => t.to_string(),
            Ok(Message::Binary(b)) => match String::from_utf8(b.to_vec()) {
                Ok(s) => s,
                Err(_) => return HelloOutcome::Gone,
            },
            Ok(Message::Close(_)) => return HelloOutcome::Gone,
            Ok(_) => continue,
            Err(_) => return HelloOutcome::Gone,
        };

        let value: serde_json::Value = match serde_json::from_str(&text) {
            Ok(v) => v,
            Err(_) => return HelloOutcome::Gone,
        };

        if value.get("type").and_then(|v| v.as_str()) != Some("hello") {
            return HelloOutcome::Invalid("expected hello".into());
        }
        if let Err(issues) = validate_hello(&value) {
            return HelloOutcome::Invalid(format_issues(&issues));
        }
        return match serde_json::from_value(value) {
            Ok(GatewayFrame::Hello(params)) => HelloOutcome::Valid(params),
            _ => HelloOutcome::Invalid("expected hello".into()),
        };
    }
    HelloOutcome::Gone
}

fn send_frame(sender: &ConnSender, frame: &GatewayFrame) -> bool {
    match frame.to_json() {
        Ok(json) => sender.send_frame(json),
        Err(e) => {
            warn!(error = %e, "ws: failed to serialize frame");
            false
        },
    }
}

fn respond_invalid(sender: &ConnSender, id: &str, message: String) {
    let response = ResponseFrame::err(id, ErrorShape::invalid_request(message));
    send_frame(sender, &GatewayFrame::Response(response));
}

/// Pull the correlation id out of a rejected frame, falling back to the
/// literal `"invalid"` when none is extractable.
fn extract_id(value: &serde_json::Value) -> String {
    value
        .get("id")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .unwrap_or("invalid")
        .to_string()
}
