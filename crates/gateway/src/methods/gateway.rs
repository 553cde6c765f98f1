use std::sync::Arc;

use serde_json::json;

use clawdis_protocol::ErrorShape;

use {
    super::{MethodRegistry, MethodReply},
    crate::broadcast::broadcast_presence,
};

pub(super) fn register(reg: &mut MethodRegistry) {
    // health: opaque snapshot from the Health port.
    reg.register(
        "health",
        Box::new(|ctx| {
            Box::pin(async move {
                match ctx.state.services.health.snapshot().await {
                    Ok(value) => {
                        ctx.state.bump_health_version();
                        Ok(MethodReply::from(value))
                    },
                    Err(e) => Err(ErrorShape::unavailable(e)),
                }
            })
        }),
    );

    // status: opaque summary from the Status port.
    reg.register(
        "status",
        Box::new(|ctx| {
            Box::pin(async move {
                match ctx.state.services.status.summary().await {
                    Ok(value) => Ok(MethodReply::from(value)),
                    Err(e) => Err(ErrorShape::unavailable(e)),
                }
            })
        }),
    );

    // system-presence: impure read — prunes, evicts, refreshes self.
    reg.register(
        "system-presence",
        Box::new(|ctx| {
            Box::pin(async move {
                let list = ctx.state.presence.write().await.list();
                Ok(MethodReply::from(json!(list)))
            })
        }),
    );

    // system-event: push to the sink, record, then broadcast presence after
    // the response frame is on its way.
    reg.register(
        "system-event",
        Box::new(|ctx| {
            Box::pin(async move {
                let text = ctx
                    .params
                    .get("text")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();

                if let Err(e) = ctx.state.services.system_events.push(&text).await {
                    return Err(ErrorShape::unavailable(e));
                }
                ctx.state.presence.write().await.record_text(&text);

                let state = Arc::clone(&ctx.state);
                Ok(MethodReply::with_followup(
                    json!({ "ok": true }),
                    Box::pin(async move {
                        broadcast_presence(&state).await;
                    }),
                ))
            })
        }),
    );

    // set-heartbeats: acknowledge only. Does not gate the tick emitter.
    reg.register(
        "set-heartbeats",
        Box::new(|_ctx| Box::pin(async move { Ok(MethodReply::from(json!({ "ok": true }))) })),
    );
}
