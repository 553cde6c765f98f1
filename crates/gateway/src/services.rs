//! Trait interfaces for the collaborator ports the gateway delegates to.
//! Each trait has a `Noop` implementation that returns empty/default
//! responses, allowing the gateway to run standalone before the real
//! collaborators are wired in.

use std::sync::Arc;

use {async_trait::async_trait, serde_json::Value};

use crate::bus::AgentEventBus;

/// Error type returned by port methods. Stringly typed on purpose: the
/// method handlers map every port failure onto the wire error taxonomy.
pub type ServiceError = String;
pub type ServiceResult<T = Value> = Result<T, ServiceError>;

// ── Health ───────────────────────────────────────────────────────────────────

#[async_trait]
pub trait HealthService: Send + Sync {
    /// Opaque health snapshot, surfaced verbatim to clients.
    async fn snapshot(&self) -> ServiceResult;
}

pub struct NoopHealthService;

#[async_trait]
impl HealthService for NoopHealthService {
    async fn snapshot(&self) -> ServiceResult {
        Ok(serde_json::json!({ "status": "ok" }))
    }
}

// ── Status ───────────────────────────────────────────────────────────────────

#[async_trait]
pub trait StatusService: Send + Sync {
    /// Opaque status summary, surfaced verbatim to clients.
    async fn summary(&self) -> ServiceResult;
}

pub struct NoopStatusService;

#[async_trait]
impl StatusService for NoopStatusService {
    async fn summary(&self) -> ServiceResult {
        Ok(serde_json::json!({}))
    }
}

// ── Delivery ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct DeliveryInput {
    pub to: String,
    pub message: String,
    pub media_url: Option<String>,
    pub provider: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DeliveryReceipt {
    pub message_id: String,
    pub to_jid: String,
}

#[async_trait]
pub trait DeliveryService: Send + Sync {
    async fn send(&self, input: DeliveryInput) -> ServiceResult<DeliveryReceipt>;
}

pub struct NoopDeliveryService;

#[async_trait]
impl DeliveryService for NoopDeliveryService {
    async fn send(&self, input: DeliveryInput) -> ServiceResult<DeliveryReceipt> {
        Ok(DeliveryReceipt {
            message_id: uuid::Uuid::new_v4().to_string(),
            to_jid: input.to,
        })
    }
}

// ── Agent ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct AgentRun {
    pub run_id: String,
    pub message: String,
    pub to: Option<String>,
    pub session_id: Option<String>,
    pub thinking: Option<String>,
    pub deliver: bool,
}

#[derive(Debug, Clone)]
pub struct AgentOutcome {
    pub status: String,
    pub summary: String,
}

#[async_trait]
pub trait AgentService: Send + Sync {
    /// Run one agent turn to completion. Streamed output goes out through
    /// the bus; the returned outcome becomes the final response payload.
    async fn run(&self, run: AgentRun, bus: AgentEventBus) -> ServiceResult<AgentOutcome>;
}

pub struct NoopAgentService;

#[async_trait]
impl AgentService for NoopAgentService {
    async fn run(&self, _run: AgentRun, _bus: AgentEventBus) -> ServiceResult<AgentOutcome> {
        Ok(AgentOutcome {
            status: "ok".into(),
            summary: "completed".into(),
        })
    }
}

// ── System-event queue ───────────────────────────────────────────────────────

#[async_trait]
pub trait SystemEventSink: Send + Sync {
    async fn push(&self, text: &str) -> ServiceResult<()>;
}

pub struct NoopSystemEventSink;

#[async_trait]
impl SystemEventSink for NoopSystemEventSink {
    async fn push(&self, _text: &str) -> ServiceResult<()> {
        Ok(())
    }
}

// ── Bundle ───────────────────────────────────────────────────────────────────

/// The collaborator ports handed to the gateway at construction time.
#[derive(Clone)]
pub struct GatewayServices {
    pub health: Arc<dyn HealthService>,
    pub status: Arc<dyn StatusService>,
    pub delivery: Arc<dyn DeliveryService>,
    pub agent: Arc<dyn AgentService>,
    pub system_events: Arc<dyn SystemEventSink>,
}

impl GatewayServices {
    pub fn noop() -> Self {
        Self {
            health: Arc::new(NoopHealthService),
            status: Arc::new(NoopStatusService),
            delivery: Arc::new(NoopDeliveryService),
            agent: Arc::new(NoopAgentService),
            system_events: Arc::new(NoopSystemEventSink),
        }
    }
}
