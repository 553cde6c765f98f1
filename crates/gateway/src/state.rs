use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
    time::Instant,
};

use {
    tokio::sync::{Mutex, RwLock, mpsc},
    tracing::debug,
};

use clawdis_protocol::{ClientDescriptor, Snapshot, StateVersion};

use crate::{
    bus::{AgentEvent, AgentEventBus},
    config::GatewayConfig,
    dedupe::DedupeCache,
    presence::PresenceRegistry,
    services::GatewayServices,
};

// ── Outbound channel ─────────────────────────────────────────────────────────

/// What the per-connection write loop consumes.
#[derive(Debug)]
pub enum Outbound {
    /// A serialized JSON frame to put on the wire.
    Frame(String),
    /// Close the socket with the given code and reason, then stop writing.
    Close { code: u16, reason: String },
}

/// Handle for enqueueing frames to one connection's serialized write loop.
///
/// Tracks the byte count of queued-but-unwritten frames; the broadcast path
/// reads it to apply the slow-consumer policy.
#[derive(Clone)]
pub struct ConnSender {
    tx: mpsc::UnboundedSender<Outbound>,
    buffered: Arc<AtomicUsize>,
}

impl ConnSender {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                buffered: Arc::new(AtomicUsize::new(0)),
            },
            rx,
        )
    }

    /// Enqueue a frame. Returns false when the write loop is gone.
    pub fn send_frame(&self, json: String) -> bool {
        self.buffered.fetch_add(json.len(), Ordering::Relaxed);
        self.tx.send(Outbound::Frame(json)).is_ok()
    }

    /// Ask the write loop to close the socket.
    pub fn close(&self, code: u16, reason: impl Into<String>) -> bool {
        self.tx
            .send(Outbound::Close {
                code,
                reason: reason.into(),
            })
            .is_ok()
    }

    /// Called by the write loop once a frame left the queue.
    pub fn debit(&self, bytes: usize) {
        self.buffered.fetch_sub(bytes, Ordering::Relaxed);
    }

    pub fn buffered_bytes(&self) -> usize {
        self.buffered.load(Ordering::Relaxed)
    }
}

// ── Connected client ─────────────────────────────────────────────────────────

/// A WebSocket client that completed the handshake.
pub struct ConnectedClient {
    pub conn_id: String,
    pub descriptor: ClientDescriptor,
    /// Key of this connection's entry in the presence registry.
    pub presence_key: String,
    pub sender: ConnSender,
    pub connected_at: Instant,
    pub last_activity: Instant,
}

impl ConnectedClient {
    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }
}

// ── Gateway state ────────────────────────────────────────────────────────────

/// Shared gateway runtime state, wrapped in `Arc` for use across tasks.
pub struct GatewayState {
    /// All READY connections, keyed by conn_id.
    pub clients: RwLock<HashMap<String, ConnectedClient>>,
    /// Monotonically increasing sequence counter for broadcast events.
    seq: AtomicU64,
    /// Serializes seq assignment + fan-out so events reach every connection
    /// in assignment order.
    pub broadcast_gate: Mutex<()>,
    /// Idempotency cache for mutating methods.
    pub dedupe: RwLock<DedupeCache>,
    /// Known nodes with TTL and version counter.
    pub presence: RwLock<PresenceRegistry>,
    health_version: AtomicU64,
    pub services: GatewayServices,
    /// Publish handle for agent runtimes; the matching receiver is pumped by
    /// the server into `agent` broadcasts.
    pub bus: AgentEventBus,
    pub config: GatewayConfig,
    pub hostname: String,
    started_at: Instant,
}

impl GatewayState {
    /// Build the state and hand back the bus receiver for the server's pump
    /// task.
    pub fn new(
        config: GatewayConfig,
        services: GatewayServices,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<AgentEvent>) {
        let hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown".into());
        let (bus, bus_rx) = AgentEventBus::channel();

        let state = Arc::new(Self {
            clients: RwLock::new(HashMap::new()),
            seq: AtomicU64::new(0),
            broadcast_gate: Mutex::new(()),
            dedupe: RwLock::new(DedupeCache::new()),
            presence: RwLock::new(PresenceRegistry::new(&hostname, &config.version)),
            health_version: AtomicU64::new(0),
            services,
            bus,
            config,
            hostname,
            started_at: Instant::now(),
        });
        (state, bus_rx)
    }

    pub fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn uptime_ms(&self) -> u64 {
        self.started_at.elapsed().as_millis() as u64
    }

    pub fn bump_health_version(&self) {
        self.health_version.fetch_add(1, Ordering::Relaxed);
    }

    /// Current `{presence, health}` version pair.
    pub async fn state_version(&self) -> StateVersion {
        StateVersion {
            presence: self.presence.read().await.version(),
            health: self.health_version.load(Ordering::Relaxed),
        }
    }

    /// Complete handshake-time view: presence + health + versions + uptime.
    pub async fn snapshot(&self) -> Snapshot {
        let health = match self.services.health.snapshot().await {
            Ok(value) => {
                self.bump_health_version();
                value
            },
            Err(e) => {
                debug!(error = %e, "health port unavailable for snapshot");
                serde_json::Value::Null
            },
        };
        let presence = self.presence.write().await.list();
        Snapshot {
            presence,
            health,
            state_version: self.state_version().await,
            uptime_ms: self.uptime_ms(),
        }
    }

    pub async fn register_client(&self, client: ConnectedClient) {
        let conn_id = client.conn_id.clone();
        self.clients.write().await.insert(conn_id, client);
    }

    pub async fn remove_client(&self, conn_id: &str) -> Option<ConnectedClient> {
        self.clients.write().await.remove(conn_id)
    }

    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Ask every connection's write loop to close, clearing the registry.
    pub async fn close_all(&self, code: u16, reason: &str) {
        let mut clients = self.clients.write().await;
        for client in clients.values() {
            client.sender.close(code, reason);
        }
        clients.clear();
    }
}
