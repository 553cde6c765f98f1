use std::{collections::HashMap, future::Future, pin::Pin, sync::Arc};

use tracing::{debug, warn};

use clawdis_protocol::{
    ErrorShape, ResponseFrame,
    validate::{format_issues, validate_method_params},
};

use crate::{
    dedupe::{CachedOutcome, DedupeCache},
    state::GatewayState,
};

mod gateway;
mod services;

// ── Types ────────────────────────────────────────────────────────────────────

/// Context passed to every method handler.
pub struct MethodContext {
    pub request_id: String,
    pub method: String,
    pub params: serde_json::Value,
    pub conn_id: String,
    pub state: Arc<GatewayState>,
}

/// Work a handler defers until after its response frame is enqueued. Used by
/// `system-event` so the presence broadcast follows the originating `res`.
pub type Followup = Pin<Box<dyn Future<Output = ()> + Send>>;

/// A handler's successful reply: the response payload plus optional deferred
/// work.
pub struct MethodReply {
    pub payload: serde_json::Value,
    pub followup: Option<Followup>,
}

impl MethodReply {
    pub fn with_followup(payload: serde_json::Value, followup: Followup) -> Self {
        Self {
            payload,
            followup: Some(followup),
        }
    }
}

impl From<serde_json::Value> for MethodReply {
    fn from(payload: serde_json::Value) -> Self {
        Self {
            payload,
            followup: None,
        }
    }
}

pub type MethodResult = Result<MethodReply, ErrorShape>;

/// A boxed async method handler.
pub type HandlerFn =
    Box<dyn Fn(MethodContext) -> Pin<Box<dyn Future<Output = MethodResult> + Send>> + Send + Sync>;

/// What dispatch hands back to the connection: the response frame to send,
/// and any work to run strictly after it is enqueued.
pub struct Dispatched {
    pub response: ResponseFrame,
    pub followup: Option<Followup>,
}

impl Dispatched {
    fn respond(response: ResponseFrame) -> Self {
        Self {
            response,
            followup: None,
        }
    }
}

/// Methods with side effects; these require an idempotency key and go
/// through the dedupe cache.
const MUTATING_METHODS: &[&str] = &["send", "agent"];

fn idempotency_key(params: &serde_json::Value) -> Option<String> {
    params
        .get("idempotencyKey")
        .and_then(|v| v.as_str())
        .map(str::to_string)
}

// ── Method registry ──────────────────────────────────────────────────────────

pub struct MethodRegistry {
    handlers: HashMap<String, HandlerFn>,
}

impl Default for MethodRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MethodRegistry {
    pub fn new() -> Self {
        let mut reg = Self {
            handlers: HashMap::new(),
        };
        gateway::register(&mut reg);
        services::register(&mut reg);
        reg
    }

    pub fn register(&mut self, method: impl Into<String>, handler: HandlerFn) {
        self.handlers.insert(method.into(), handler);
    }

    /// Dispatch one validated request. Exactly one response frame comes back
    /// for every call; mutating methods are replayed from the dedupe cache
    /// when their idempotency key has already completed.
    pub async fn dispatch(&self, ctx: MethodContext) -> Dispatched {
        let method = ctx.method.clone();
        let request_id = ctx.request_id.clone();
        let conn_id = ctx.conn_id.clone();
        let state = Arc::clone(&ctx.state);

        if let Err(issues) = validate_method_params(&method, &ctx.params) {
            let message = format_issues(&issues);
            warn!(method, conn_id = %conn_id, message, "invalid method params");
            return Dispatched::respond(ResponseFrame::err(
                &request_id,
                ErrorShape::invalid_request(message),
            ));
        }

        let dedupe_key = if MUTATING_METHODS.contains(&method.as_str()) {
            idempotency_key(&ctx.params).map(|key| DedupeCache::key(&method, &key))
        } else {
            None
        };

        if let Some(key) = &dedupe_key
            && let Some(outcome) = state.dedupe.read().await.lookup(key)
        {
            debug!(method, key, request_id = %request_id, "replaying cached outcome");
            return Dispatched::respond(outcome.to_response(&request_id));
        }

        let Some(handler) = self.handlers.get(&method) else {
            warn!(method, conn_id = %conn_id, "unknown method");
            return Dispatched::respond(ResponseFrame::err(
                &request_id,
                ErrorShape::invalid_request(format!("unknown method: {method}")),
            ));
        };

        debug!(method, request_id = %request_id, conn_id = %conn_id, "dispatching method");
        match handler(ctx).await {
            Ok(reply) => {
                if let Some(key) = &dedupe_key {
                    state
                        .dedupe
                        .write()
                        .await
                        .store(key, CachedOutcome::success(reply.payload.clone()));
                }
                Dispatched {
                    response: ResponseFrame::ok(&request_id, reply.payload),
                    followup: reply.followup,
                }
            },
            Err(err) => {
                if err.code == clawdis_protocol::error_codes::UNAVAILABLE {
                    debug!(method, request_id = %request_id, code = %err.code, msg = %err.message, "method unavailable");
                } else {
                    warn!(method, request_id = %request_id, code = %err.code, msg = %err.message, "method error");
                }
                if let Some(key) = &dedupe_key {
                    state
                        .dedupe
                        .write()
                        .await
                        .store(key, CachedOutcome::failure(err.clone()));
                }
                Dispatched::respond(ResponseFrame::err(&request_id, err))
            },
        }
    }

    pub fn method_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use {async_trait::async_trait, serde_json::json};

    use {
        super::*,
        crate::{
            config::GatewayConfig,
            services::{DeliveryInput, DeliveryReceipt, DeliveryService, GatewayServices, ServiceResult},
        },
    };

    struct CountingDelivery {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl DeliveryService for CountingDelivery {
        async fn send(&self, input: DeliveryInput) -> ServiceResult<DeliveryReceipt> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(DeliveryReceipt {
                message_id: "msg-1".into(),
                to_jid: format!("jid:{}", input.to),
            })
        }
    }

    fn test_state(delivery: Arc<CountingDelivery>) -> Arc<GatewayState> {
        let services = GatewayServices {
            delivery,
            ..GatewayServices::noop()
        };
        let (state, _bus_rx) = GatewayState::new(GatewayConfig::default(), services);
        state
    }

    fn ctx(state: &Arc<GatewayState>, id: &str, method: &str, params: serde_json::Value) -> MethodContext {
        MethodContext {
            request_id: id.into(),
            method: method.into(),
            params,
            conn_id: "conn-test".into(),
            state: Arc::clone(state),
        }
    }

    #[tokio::test]
    async fn unknown_method_is_an_invalid_request() {
        let registry = MethodRegistry::new();
        let state = test_state(Arc::new(CountingDelivery {
            calls: AtomicUsize::new(0),
        }));
        let dispatched = registry
            .dispatch(ctx(&state, "r1", "frobnicate", json!(null)))
            .await;
        assert!(!dispatched.response.ok);
        let error = dispatched.response.error.unwrap();
        assert_eq!(error.code, "INVALID_REQUEST");
        assert_eq!(error.message, "unknown method: frobnicate");
    }

    #[tokio::test]
    async fn mutating_method_without_key_fails_validation() {
        let registry = MethodRegistry::new();
        let state = test_state(Arc::new(CountingDelivery {
            calls: AtomicUsize::new(0),
        }));
        let dispatched = registry
            .dispatch(ctx(
                &state,
                "r1",
                "send",
                json!({ "to": "+15550000000", "message": "hi" }),
            ))
            .await;
        let error = dispatched.response.error.unwrap();
        assert_eq!(error.code, "INVALID_REQUEST");
        assert!(error.message.contains("idempotencyKey"));
    }

    #[tokio::test]
    async fn duplicate_send_replays_without_reinvoking_the_port() {
        let registry = MethodRegistry::new();
        let delivery = Arc::new(CountingDelivery {
            calls: AtomicUsize::new(0),
        });
        let state = test_state(Arc::clone(&delivery));
        let params = json!({
            "to": "+15550000000",
            "message": "hi",
            "idempotencyKey": "K",
        });

        let first = registry
            .dispatch(ctx(&state, "a1", "send", params.clone()))
            .await;
        let second = registry.dispatch(ctx(&state, "b1", "send", params)).await;

        assert_eq!(delivery.calls.load(Ordering::SeqCst), 1);
        assert_eq!(first.response.payload, second.response.payload);
        assert_eq!(second.response.id, "b1");
        assert_eq!(
            first.response.payload.unwrap()["runId"],
            json!("K"),
        );
    }
}
