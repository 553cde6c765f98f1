use std::sync::Arc;

use tracing::{debug, warn};

use clawdis_protocol::{
    EventFrame, GatewayFrame, MAX_BUFFERED_BYTES, StateVersion, events, now_ms,
};

use crate::state::GatewayState;

// ── Broadcast options ────────────────────────────────────────────────────────

#[derive(Default)]
pub struct BroadcastOpts {
    /// Skip connections over the buffered-bytes watermark instead of closing
    /// them. Only the periodic tick opts in.
    pub drop_if_slow: bool,
    pub state_version: Option<StateVersion>,
}

// ── Broadcaster ──────────────────────────────────────────────────────────────

/// Broadcast an event to every READY connection.
///
/// Sequence assignment and fan-out happen under one gate so `seq` values
/// arrive at each connection in assignment order. Connections over the
/// buffered-bytes watermark either miss the event (`drop_if_slow`) or are
/// closed as slow consumers.
pub async fn broadcast(
    state: &Arc<GatewayState>,
    event: &str,
    payload: serde_json::Value,
    opts: BroadcastOpts,
) {
    let _gate = state.broadcast_gate.lock().await;

    let seq = state.next_seq();
    let mut frame = EventFrame::new(event, payload, seq);
    frame.state_version = opts.state_version;
    let json = match GatewayFrame::Event(frame).to_json() {
        Ok(json) => json,
        Err(e) => {
            warn!(event, error = %e, "failed to serialize broadcast event");
            return;
        },
    };

    let mut slow = Vec::new();
    {
        let clients = state.clients.read().await;
        debug!(event, seq, clients = clients.len(), "broadcasting event");
        for client in clients.values() {
            if client.sender.buffered_bytes() > MAX_BUFFERED_BYTES {
                if opts.drop_if_slow {
                    debug!(conn_id = %client.conn_id, event, "dropping event for slow consumer");
                    continue;
                }
                warn!(conn_id = %client.conn_id, event, "closing slow consumer");
                client.sender.close(1008, "slow consumer");
                slow.push(client.conn_id.clone());
                continue;
            }
            client.sender.send_frame(json.clone());
        }
    }

    // Closed slow consumers get no further frames.
    for conn_id in slow {
        state.remove_client(&conn_id).await;
    }
}

/// Broadcast the periodic tick. Droppable by contract.
pub async fn broadcast_tick(state: &Arc<GatewayState>) {
    broadcast(
        state,
        events::TICK,
        serde_json::json!({ "ts": now_ms() }),
        BroadcastOpts {
            drop_if_slow: true,
            ..Default::default()
        },
    )
    .await;
}

/// Broadcast the current presence list with the updated version pair.
pub async fn broadcast_presence(state: &Arc<GatewayState>) {
    let presence = state.presence.write().await.list();
    let state_version = state.state_version().await;
    broadcast(
        state,
        events::PRESENCE,
        serde_json::json!({ "presence": presence }),
        BroadcastOpts {
            drop_if_slow: false,
            state_version: Some(state_version),
        },
    )
    .await;
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use std::time::Instant;

    use clawdis_protocol::ClientDescriptor;

    use {
        super::*,
        crate::{
            config::GatewayConfig,
            services::GatewayServices,
            state::{ConnSender, ConnectedClient, Outbound},
        },
    };

    fn descriptor() -> ClientDescriptor {
        ClientDescriptor {
            name: "t".into(),
            version: "1".into(),
            platform: "test".into(),
            mode: "test".into(),
            instance_id: None,
        }
    }

    async fn state_with_client(
        conn_id: &str,
    ) -> (Arc<GatewayState>, tokio::sync::mpsc::UnboundedReceiver<Outbound>, ConnSender) {
        let (state, _bus_rx) = GatewayState::new(GatewayConfig::default(), GatewayServices::noop());
        let (sender, rx) = ConnSender::channel();
        let now = Instant::now();
        state
            .register_client(ConnectedClient {
                conn_id: conn_id.into(),
                descriptor: descriptor(),
                presence_key: conn_id.into(),
                sender: sender.clone(),
                connected_at: now,
                last_activity: now,
            })
            .await;
        (state, rx, sender)
    }

    #[tokio::test]
    async fn events_carry_strictly_increasing_seq() {
        let (state, mut rx, _sender) = state_with_client("c1").await;
        broadcast(&state, "tick", serde_json::json!({}), BroadcastOpts::default()).await;
        broadcast(&state, "tick", serde_json::json!({}), BroadcastOpts::default()).await;

        let mut last = 0;
        for _ in 0..2 {
            let Outbound::Frame(json) = rx.try_recv().unwrap() else {
                panic!("expected frame");
            };
            let value: serde_json::Value = serde_json::from_str(&json).unwrap();
            let seq = value["seq"].as_u64().unwrap();
            assert_eq!(seq, last + 1);
            last = seq;
        }
    }

    #[tokio::test]
    async fn droppable_events_skip_slow_consumers() {
        let (state, mut rx, sender) = state_with_client("c1").await;
        // Fill the queue past the watermark without draining it.
        sender.send_frame("x".repeat(MAX_BUFFERED_BYTES + 1));

        broadcast_tick(&state).await;

        // Only the filler frame is queued; the tick was dropped and the
        // connection survived.
        let Outbound::Frame(filler) = rx.try_recv().unwrap() else {
            panic!("expected filler frame");
        };
        assert_eq!(filler.len(), MAX_BUFFERED_BYTES + 1);
        assert!(rx.try_recv().is_err());
        assert_eq!(state.client_count().await, 1);
    }

    #[tokio::test]
    async fn non_droppable_events_close_slow_consumers() {
        let (state, mut rx, sender) = state_with_client("c1").await;
        sender.send_frame("x".repeat(MAX_BUFFERED_BYTES + 1));

        broadcast_presence(&state).await;

        let Outbound::Frame(_filler) = rx.try_recv().unwrap() else {
            panic!("expected filler frame");
        };
        match rx.try_recv().unwrap() {
            Outbound::Close { code, reason } => {
                assert_eq!(code, 1008);
                assert_eq!(reason, "slow consumer");
            },
            other => panic!("unexpected outbound: {other:?}"),
        }
        assert_eq!(state.client_count().await, 0);
    }

    #[tokio::test]
    async fn healthy_peers_still_receive_during_slow_consumer_close() {
        let (state, mut slow_rx, slow_sender) = state_with_client("slow").await;
        let (healthy_sender, mut healthy_rx) = ConnSender::channel();
        let now = Instant::now();
        state
            .register_client(ConnectedClient {
                conn_id: "healthy".into(),
                descriptor: descriptor(),
                presence_key: "healthy".into(),
                sender: healthy_sender,
                connected_at: now,
                last_activity: now,
            })
            .await;
        slow_sender.send_frame("x".repeat(MAX_BUFFERED_BYTES + 1));

        broadcast_presence(&state).await;

        let Outbound::Frame(json) = healthy_rx.try_recv().unwrap() else {
            panic!("expected frame");
        };
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["event"], "presence");
        assert!(value["stateVersion"]["presence"].is_u64());

        // The slow one got a close, not the event.
        let _filler = slow_rx.try_recv().unwrap();
        assert!(matches!(
            slow_rx.try_recv().unwrap(),
            Outbound::Close { code: 1008, .. }
        ));
        assert_eq!(state.client_count().await, 1);
    }
}
