use std::time::Duration;

use serde_json::json;

use clawdis_protocol::{ErrorShape, error_codes, events};

use {
    super::{MethodRegistry, MethodReply},
    crate::{
        broadcast::{BroadcastOpts, broadcast},
        services::{AgentRun, DeliveryInput},
    },
};

fn str_param(params: &serde_json::Value, key: &str) -> Option<String> {
    params.get(key).and_then(|v| v.as_str()).map(str::to_string)
}

pub(super) fn register(reg: &mut MethodRegistry) {
    // send: invoke the Delivery port once; dispatch caches the outcome.
    reg.register(
        "send",
        Box::new(|ctx| {
            Box::pin(async move {
                let idempotency_key = str_param(&ctx.params, "idempotencyKey").unwrap_or_default();
                let input = DeliveryInput {
                    to: str_param(&ctx.params, "to").unwrap_or_default(),
                    message: str_param(&ctx.params, "message").unwrap_or_default(),
                    media_url: str_param(&ctx.params, "mediaUrl"),
                    provider: str_param(&ctx.params, "provider"),
                };

                match ctx.state.services.delivery.send(input).await {
                    Ok(receipt) => Ok(MethodReply::from(json!({
                        "runId": idempotency_key,
                        "messageId": receipt.message_id,
                        "toJid": receipt.to_jid,
                    }))),
                    // Delivery signals its linked-account precondition with a
                    // "not linked" prefix.
                    Err(e) if e.starts_with("not linked") => {
                        Err(ErrorShape::new(error_codes::NOT_LINKED, e))
                    },
                    Err(e) => Err(ErrorShape::unavailable(e)),
                }
            })
        }),
    );

    // agent: ack-then-final. An `agent` event announces acceptance right
    // away; the response frame waits for the terminal outcome.
    reg.register(
        "agent",
        Box::new(|ctx| {
            Box::pin(async move {
                let run_id = str_param(&ctx.params, "sessionId")
                    .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

                broadcast(
                    &ctx.state,
                    events::AGENT,
                    json!({ "runId": run_id, "status": "accepted" }),
                    BroadcastOpts::default(),
                )
                .await;

                let run = AgentRun {
                    run_id: run_id.clone(),
                    message: str_param(&ctx.params, "message").unwrap_or_default(),
                    to: str_param(&ctx.params, "to"),
                    session_id: str_param(&ctx.params, "sessionId"),
                    thinking: str_param(&ctx.params, "thinking"),
                    deliver: ctx
                        .params
                        .get("deliver")
                        .and_then(|v| v.as_bool())
                        .unwrap_or(false),
                };
                let timeout_secs = ctx.params.get("timeout").and_then(|v| v.as_u64());

                let turn = ctx.state.services.agent.run(run, ctx.state.bus.clone());
                let outcome = match timeout_secs {
                    Some(secs) => {
                        match tokio::time::timeout(Duration::from_secs(secs), turn).await {
                            Ok(result) => result,
                            Err(_) => {
                                let summary = format!("timed out after {secs}s");
                                return Err(ErrorShape::agent_timeout(&summary).with_details(
                                    json!({
                                        "runId": run_id,
                                        "status": "error",
                                        "summary": summary,
                                    }),
                                ));
                            },
                        }
                    },
                    None => turn.await,
                };

                match outcome {
                    Ok(outcome) => Ok(MethodReply::from(json!({
                        "runId": run_id,
                        "status": outcome.status,
                        "summary": outcome.summary,
                    }))),
                    Err(e) => Err(ErrorShape::unavailable(&e).with_details(json!({
                        "runId": run_id,
                        "status": "error",
                        "summary": e,
                    }))),
                }
            })
        }),
    );
}
