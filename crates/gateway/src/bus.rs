use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// One streamed agent event, published by an agent runtime and fanned out to
/// every ready connection as an `agent` broadcast.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentEvent {
    #[serde(rename = "runId")]
    pub run_id: String,
    pub stream: String,
    pub seq: u64,
    pub ts: u64,
    pub data: serde_json::Value,
}

/// Process-local pub/sub for agent stream events.
///
/// Multi-producer, single-consumer: any number of producers hold a cloned
/// handle and `publish`; the gateway takes the sole receiver at startup and
/// pumps it into the broadcast path. Ordering is per-producer.
#[derive(Clone)]
pub struct AgentEventBus {
    tx: mpsc::UnboundedSender<AgentEvent>,
}

impl AgentEventBus {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<AgentEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Publish one event. Returns false once the gateway subscriber is gone.
    pub fn publish(&self, event: AgentEvent) -> bool {
        self.tx.send(event).is_ok()
    }
}
