use std::{net::SocketAddr, sync::Arc, time::Duration};

use {
    axum::{
        Router,
        extract::{ConnectInfo, State, WebSocketUpgrade},
        response::Response,
        routing::get,
    },
    tokio::sync::mpsc,
    tokio_util::sync::CancellationToken,
    tracing::{info, warn},
};

use clawdis_protocol::{
    DEDUPE_SWEEP_INTERVAL_MS, MAX_PAYLOAD_BYTES, TICK_INTERVAL_MS, events,
};

use crate::{
    broadcast::{BroadcastOpts, broadcast, broadcast_tick},
    bus::AgentEvent,
    config::GatewayConfig,
    methods::MethodRegistry,
    services::GatewayServices,
    state::GatewayState,
    ws,
};

#[derive(Clone)]
struct AppState {
    state: Arc<GatewayState>,
    methods: Arc<MethodRegistry>,
}

/// Build the axum app serving the WebSocket endpoint.
pub fn build_gateway_app(state: Arc<GatewayState>, methods: Arc<MethodRegistry>) -> Router {
    Router::new()
        .route("/ws", get(ws_upgrade))
        .with_state(AppState { state, methods })
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    State(app): State<AppState>,
) -> Response {
    // Oversized inbound frames are rejected here, at the transport layer.
    ws.max_message_size(MAX_PAYLOAD_BYTES)
        .on_upgrade(move |socket| ws::handle_connection(socket, app.state, app.methods, remote_addr))
}

/// Start the tick, dedupe-sweep, and agent-bus pump tasks.
pub fn spawn_background_tasks(
    state: &Arc<GatewayState>,
    mut bus_rx: mpsc::UnboundedReceiver<AgentEvent>,
    shutdown: CancellationToken,
) {
    let tick_state = Arc::clone(state);
    let tick_shutdown = shutdown.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(TICK_INTERVAL_MS));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        interval.tick().await; // immediate first tick is not wanted
        loop {
            tokio::select! {
                _ = tick_shutdown.cancelled() => break,
                _ = interval.tick() => broadcast_tick(&tick_state).await,
            }
        }
    });

    let sweep_state = Arc::clone(state);
    let sweep_shutdown = shutdown.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(DEDUPE_SWEEP_INTERVAL_MS));
        interval.tick().await;
        loop {
            tokio::select! {
                _ = sweep_shutdown.cancelled() => break,
                _ = interval.tick() => sweep_state.dedupe.write().await.sweep(),
            }
        }
    });

    let pump_state = Arc::clone(state);
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = bus_rx.recv() => {
                    let Some(event) = event else { break };
                    match serde_json::to_value(&event) {
                        Ok(payload) => {
                            broadcast(&pump_state, events::AGENT, payload, BroadcastOpts::default())
                                .await;
                        },
                        Err(e) => warn!(error = %e, "failed to serialize agent event"),
                    }
                },
            }
        }
    });
}

/// Announce shutdown to every connection, then close them all.
pub async fn shutdown_gateway(state: &Arc<GatewayState>, reason: &str) {
    info!(reason, "gateway shutting down");
    broadcast(
        state,
        events::SHUTDOWN,
        serde_json::json!({ "reason": reason }),
        BroadcastOpts::default(),
    )
    .await;
    state.close_all(1012, "service restart").await;
}

/// Run the gateway until the shutdown token fires.
pub async fn run_gateway(
    config: GatewayConfig,
    services: GatewayServices,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let addr = config.bind_addr();
    anyhow::ensure!(
        addr.ip().is_loopback(),
        "gateway must bind a loopback address, got {addr}"
    );

    let (state, bus_rx) = GatewayState::new(config, services);
    let methods = Arc::new(MethodRegistry::new());
    spawn_background_tasks(&state, bus_rx, shutdown.clone());

    let app = build_gateway_app(Arc::clone(&state), methods);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, version = %state.config.version, "gateway listening");

    // Announce + close sockets as soon as shutdown fires so graceful
    // shutdown is not held open by idle WebSocket connections.
    let teardown_state = Arc::clone(&state);
    let teardown = shutdown.clone();
    tokio::spawn(async move {
        teardown.cancelled().await;
        shutdown_gateway(&teardown_state, "shutdown").await;
    });

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown.cancelled_owned())
    .await?;
    Ok(())
}
