//! Accumulating frame validators.
//!
//! The typed serde structs guard the send paths; these validators guard the
//! receive path. Each one walks a raw `serde_json::Value`, collects every
//! issue instead of stopping at the first, and [`format_issues`] renders the
//! list into a single deterministic string that is safe to place in a
//! `hello-error` reason or an `INVALID_REQUEST` message.
//!
//! Rules enforced: known members only, type checks, non-negative integers
//! for timestamps and sequence numbers, minimum length 1 for identifiers.

use serde_json::{Map, Value};

use crate::{error_codes, events};

/// One validation problem at a JSON path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Issue {
    pub path: String,
    pub message: String,
}

impl std::fmt::Display for Issue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

/// Render accumulated issues as one semicolon-joined string.
pub fn format_issues(issues: &[Issue]) -> String {
    issues
        .iter()
        .map(Issue::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

pub type ValidationResult = Result<(), Vec<Issue>>;

fn finish(issues: Vec<Issue>) -> ValidationResult {
    if issues.is_empty() { Ok(()) } else { Err(issues) }
}

// ── Member helpers ───────────────────────────────────────────────────────────

fn member_path(path: &str, key: &str) -> String {
    if path.is_empty() {
        key.to_string()
    } else {
        format!("{path}.{key}")
    }
}

fn push(issues: &mut Vec<Issue>, path: impl Into<String>, message: impl Into<String>) {
    issues.push(Issue {
        path: path.into(),
        message: message.into(),
    });
}

fn as_object<'a>(
    value: &'a Value,
    path: &str,
    issues: &mut Vec<Issue>,
) -> Option<&'a Map<String, Value>> {
    match value.as_object() {
        Some(obj) => Some(obj),
        None => {
            push(issues, path, "expected object");
            None
        },
    }
}

fn check_known_members(
    obj: &Map<String, Value>,
    allowed: &[&str],
    path: &str,
    issues: &mut Vec<Issue>,
) {
    for key in obj.keys() {
        if !allowed.contains(&key.as_str()) {
            push(issues, member_path(path, key), "unknown member");
        }
    }
}

fn string_member<'a>(
    obj: &'a Map<String, Value>,
    key: &str,
    path: &str,
    required: bool,
    issues: &mut Vec<Issue>,
) -> Option<&'a str> {
    match obj.get(key) {
        Some(Value::String(s)) => {
            if s.is_empty() {
                push(issues, member_path(path, key), "must not be empty");
                None
            } else {
                Some(s)
            }
        },
        Some(_) => {
            push(issues, member_path(path, key), "expected string");
            None
        },
        None => {
            if required {
                push(issues, member_path(path, key), "missing required member");
            }
            None
        },
    }
}

fn uint_member(
    obj: &Map<String, Value>,
    key: &str,
    path: &str,
    required: bool,
    issues: &mut Vec<Issue>,
) -> Option<u64> {
    match obj.get(key) {
        Some(value) => match value.as_u64() {
            Some(n) => Some(n),
            None => {
                push(issues, member_path(path, key), "expected non-negative integer");
                None
            },
        },
        None => {
            if required {
                push(issues, member_path(path, key), "missing required member");
            }
            None
        },
    }
}

fn bool_member(
    obj: &Map<String, Value>,
    key: &str,
    path: &str,
    required: bool,
    issues: &mut Vec<Issue>,
) -> Option<bool> {
    match obj.get(key) {
        Some(Value::Bool(b)) => Some(*b),
        Some(_) => {
            push(issues, member_path(path, key), "expected boolean");
            None
        },
        None => {
            if required {
                push(issues, member_path(path, key), "missing required member");
            }
            None
        },
    }
}

fn string_array_member(obj: &Map<String, Value>, key: &str, path: &str, issues: &mut Vec<Issue>) {
    let Some(value) = obj.get(key) else { return };
    let Some(items) = value.as_array() else {
        push(issues, member_path(path, key), "expected array");
        return;
    };
    for (i, item) in items.iter().enumerate() {
        if !item.is_string() {
            push(
                issues,
                format!("{}[{i}]", member_path(path, key)),
                "expected string",
            );
        }
    }
}

// ── Frame validators ─────────────────────────────────────────────────────────

/// Validate any frame by its `type` discriminator.
pub fn validate_frame(value: &Value) -> ValidationResult {
    let mut issues = Vec::new();
    let Some(obj) = as_object(value, "$", &mut issues) else {
        return finish(issues);
    };
    let Some(Value::String(frame_type)) = obj.get("type") else {
        push(&mut issues, "type", "missing or non-string discriminator");
        return finish(issues);
    };
    match frame_type.as_str() {
        "hello" => validate_hello(value),
        "hello-ok" => validate_hello_ok(value),
        "hello-error" => validate_hello_error(value),
        "req" => validate_request(value),
        "res" => validate_response(value),
        "event" => validate_event(value),
        other => {
            push(&mut issues, "type", format!("unknown frame type: {other}"));
            finish(issues)
        },
    }
}

pub fn validate_hello(value: &Value) -> ValidationResult {
    let mut issues = Vec::new();
    let Some(obj) = as_object(value, "$", &mut issues) else {
        return finish(issues);
    };
    check_known_members(
        obj,
        &["type", "minProtocol", "maxProtocol", "client", "caps", "auth"],
        "",
        &mut issues,
    );
    uint_member(obj, "minProtocol", "", true, &mut issues);
    uint_member(obj, "maxProtocol", "", true, &mut issues);
    string_array_member(obj, "caps", "", &mut issues);

    match obj.get("client") {
        Some(client) => {
            if let Some(client_obj) = as_object(client, "client", &mut issues) {
                check_known_members(
                    client_obj,
                    &["name", "version", "platform", "mode", "instanceId"],
                    "client",
                    &mut issues,
                );
                string_member(client_obj, "name", "client", true, &mut issues);
                string_member(client_obj, "version", "client", true, &mut issues);
                string_member(client_obj, "platform", "client", true, &mut issues);
                string_member(client_obj, "mode", "client", true, &mut issues);
                string_member(client_obj, "instanceId", "client", false, &mut issues);
            }
        },
        None => push(&mut issues, "client", "missing required member"),
    }

    if let Some(auth) = obj.get("auth")
        && let Some(auth_obj) = as_object(auth, "auth", &mut issues)
    {
        check_known_members(auth_obj, &["token"], "auth", &mut issues);
        string_member(auth_obj, "token", "auth", false, &mut issues);
    }

    finish(issues)
}

pub fn validate_hello_ok(value: &Value) -> ValidationResult {
    let mut issues = Vec::new();
    let Some(obj) = as_object(value, "$", &mut issues) else {
        return finish(issues);
    };
    check_known_members(
        obj,
        &["type", "protocol", "server", "features", "snapshot", "policy"],
        "",
        &mut issues,
    );
    uint_member(obj, "protocol", "", true, &mut issues);

    match obj.get("server") {
        Some(server) => {
            if let Some(server_obj) = as_object(server, "server", &mut issues) {
                check_known_members(
                    server_obj,
                    &["version", "commit", "host", "connId"],
                    "server",
                    &mut issues,
                );
                string_member(server_obj, "version", "server", true, &mut issues);
                string_member(server_obj, "connId", "server", true, &mut issues);
            }
        },
        None => push(&mut issues, "server", "missing required member"),
    }

    if let Some(features) = obj.get("features")
        && let Some(features_obj) = as_object(features, "features", &mut issues)
    {
        check_known_members(features_obj, &["methods", "events"], "features", &mut issues);
        string_array_member(features_obj, "methods", "features", &mut issues);
        string_array_member(features_obj, "events", "features", &mut issues);
    }

    match obj.get("snapshot") {
        Some(snapshot) => {
            if let Some(snapshot_obj) = as_object(snapshot, "snapshot", &mut issues) {
                check_known_members(
                    snapshot_obj,
                    &["presence", "health", "stateVersion", "uptimeMs"],
                    "snapshot",
                    &mut issues,
                );
                uint_member(snapshot_obj, "uptimeMs", "snapshot", true, &mut issues);
                if let Some(presence) = snapshot_obj.get("presence") {
                    match presence.as_array() {
                        Some(entries) => {
                            for (i, entry) in entries.iter().enumerate() {
                                validate_presence_entry(
                                    entry,
                                    &format!("snapshot.presence[{i}]"),
                                    &mut issues,
                                );
                            }
                        },
                        None => push(&mut issues, "snapshot.presence", "expected array"),
                    }
                }
                if let Some(sv) = snapshot_obj.get("stateVersion") {
                    validate_state_version(sv, "snapshot.stateVersion", &mut issues);
                }
            }
        },
        None => push(&mut issues, "snapshot", "missing required member"),
    }

    match obj.get("policy") {
        Some(policy) => {
            if let Some(policy_obj) = as_object(policy, "policy", &mut issues) {
                check_known_members(
                    policy_obj,
                    &["maxPayload", "maxBufferedBytes", "tickIntervalMs"],
                    "policy",
                    &mut issues,
                );
                uint_member(policy_obj, "maxPayload", "policy", true, &mut issues);
                uint_member(policy_obj, "maxBufferedBytes", "policy", true, &mut issues);
                uint_member(policy_obj, "tickIntervalMs", "policy", true, &mut issues);
            }
        },
        None => push(&mut issues, "policy", "missing required member"),
    }

    finish(issues)
}

pub fn validate_hello_error(value: &Value) -> ValidationResult {
    let mut issues = Vec::new();
    let Some(obj) = as_object(value, "$", &mut issues) else {
        return finish(issues);
    };
    check_known_members(obj, &["type", "reason", "expectedProtocol"], "", &mut issues);
    string_member(obj, "reason", "", true, &mut issues);
    uint_member(obj, "expectedProtocol", "", false, &mut issues);
    finish(issues)
}

pub fn validate_request(value: &Value) -> ValidationResult {
    let mut issues = Vec::new();
    let Some(obj) = as_object(value, "$", &mut issues) else {
        return finish(issues);
    };
    check_known_members(obj, &["type", "id", "method", "params"], "", &mut issues);
    string_member(obj, "id", "", true, &mut issues);
    string_member(obj, "method", "", true, &mut issues);
    if let Some(params) = obj.get("params")
        && !params.is_object()
        && !params.is_null()
    {
        push(&mut issues, "params", "expected object");
    }
    finish(issues)
}

pub fn validate_response(value: &Value) -> ValidationResult {
    let mut issues = Vec::new();
    let Some(obj) = as_object(value, "$", &mut issues) else {
        return finish(issues);
    };
    check_known_members(obj, &["type", "id", "ok", "payload", "error"], "", &mut issues);
    string_member(obj, "id", "", true, &mut issues);
    bool_member(obj, "ok", "", true, &mut issues);
    if let Some(error) = obj.get("error") {
        validate_error_shape(error, "error", &mut issues);
    }
    finish(issues)
}

pub fn validate_event(value: &Value) -> ValidationResult {
    let mut issues = Vec::new();
    let Some(obj) = as_object(value, "$", &mut issues) else {
        return finish(issues);
    };
    check_known_members(
        obj,
        &["type", "event", "payload", "seq", "stateVersion"],
        "",
        &mut issues,
    );
    if let Some(event) = string_member(obj, "event", "", true, &mut issues)
        && !events::ALL.contains(&event)
    {
        push(&mut issues, "event", format!("unknown event: {event}"));
    }
    uint_member(obj, "seq", "", false, &mut issues);
    if let Some(sv) = obj.get("stateVersion") {
        validate_state_version(sv, "stateVersion", &mut issues);
    }
    finish(issues)
}

fn validate_state_version(value: &Value, path: &str, issues: &mut Vec<Issue>) {
    let Some(obj) = as_object(value, path, issues) else {
        return;
    };
    check_known_members(obj, &["presence", "health"], path, issues);
    uint_member(obj, "presence", path, true, issues);
    uint_member(obj, "health", path, true, issues);
}

fn validate_error_shape(value: &Value, path: &str, issues: &mut Vec<Issue>) {
    let Some(obj) = as_object(value, path, issues) else {
        return;
    };
    check_known_members(
        obj,
        &["code", "message", "details", "retryable", "retryAfterMs"],
        path,
        issues,
    );
    if let Some(code) = string_member(obj, "code", path, true, issues)
        && !error_codes::ALL.contains(&code)
    {
        push(issues, member_path(path, "code"), format!("unknown code: {code}"));
    }
    string_member(obj, "message", path, true, issues);
    bool_member(obj, "retryable", path, false, issues);
    uint_member(obj, "retryAfterMs", path, false, issues);
}

fn validate_presence_entry(value: &Value, path: &str, issues: &mut Vec<Issue>) {
    let Some(obj) = as_object(value, path, issues) else {
        return;
    };
    check_known_members(
        obj,
        &[
            "host",
            "ip",
            "version",
            "mode",
            "lastInputSeconds",
            "reason",
            "tags",
            "text",
            "ts",
            "instanceId",
        ],
        path,
        issues,
    );
    uint_member(obj, "ts", path, true, issues);
    uint_member(obj, "lastInputSeconds", path, false, issues);
    string_array_member(obj, "tags", path, issues);
}

// ── Method parameter validators ──────────────────────────────────────────────

/// Validate the params of a request against the method's schema. Runs in
/// addition to the request envelope validator. Unknown methods pass — the
/// dispatcher reports those itself.
pub fn validate_method_params(method: &str, params: &Value) -> ValidationResult {
    let mut issues = Vec::new();

    let empty = Map::new();
    let obj = match params {
        Value::Null => &empty,
        Value::Object(obj) => obj,
        _ => {
            push(&mut issues, "params", "expected object");
            return finish(issues);
        },
    };

    match method {
        "health" | "status" | "system-presence" => {
            check_known_members(obj, &[], "params", &mut issues);
        },
        "system-event" => {
            check_known_members(obj, &["text"], "params", &mut issues);
            string_member(obj, "text", "params", true, &mut issues);
        },
        "set-heartbeats" => {
            check_known_members(obj, &["enabled"], "params", &mut issues);
            bool_member(obj, "enabled", "params", true, &mut issues);
        },
        "send" => {
            check_known_members(
                obj,
                &["to", "message", "mediaUrl", "provider", "idempotencyKey"],
                "params",
                &mut issues,
            );
            string_member(obj, "to", "params", true, &mut issues);
            string_member(obj, "message", "params", true, &mut issues);
            string_member(obj, "mediaUrl", "params", false, &mut issues);
            string_member(obj, "provider", "params", false, &mut issues);
            string_member(obj, "idempotencyKey", "params", true, &mut issues);
        },
        "agent" => {
            check_known_members(
                obj,
                &[
                    "message",
                    "to",
                    "sessionId",
                    "thinking",
                    "deliver",
                    "timeout",
                    "idempotencyKey",
                ],
                "params",
                &mut issues,
            );
            string_member(obj, "message", "params", true, &mut issues);
            string_member(obj, "to", "params", false, &mut issues);
            string_member(obj, "sessionId", "params", false, &mut issues);
            string_member(obj, "thinking", "params", false, &mut issues);
            bool_member(obj, "deliver", "params", false, &mut issues);
            uint_member(obj, "timeout", "params", false, &mut issues);
            string_member(obj, "idempotencyKey", "params", true, &mut issues);
        },
        _ => {},
    }

    finish(issues)
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn valid_hello_passes() {
        let hello = json!({
            "type": "hello",
            "minProtocol": 1,
            "maxProtocol": 1,
            "client": { "name": "t", "version": "1", "platform": "test", "mode": "test" },
            "caps": [],
        });
        assert!(validate_frame(&hello).is_ok());
    }

    #[test]
    fn hello_issues_accumulate() {
        let hello = json!({
            "type": "hello",
            "maxProtocol": -3,
            "client": { "name": "", "version": "1", "platform": "test", "mode": "test" },
            "bogus": true,
        });
        let issues = validate_frame(&hello).unwrap_err();
        let formatted = format_issues(&issues);
        // All four problems are reported, not just the first.
        assert!(formatted.contains("bogus: unknown member"));
        assert!(formatted.contains("minProtocol: missing required member"));
        assert!(formatted.contains("maxProtocol: expected non-negative integer"));
        assert!(formatted.contains("client.name: must not be empty"));
        assert_eq!(formatted.matches(';').count(), 3);
    }

    #[test]
    fn unknown_frame_type_is_rejected() {
        let issues = validate_frame(&json!({ "type": "ping" })).unwrap_err();
        assert_eq!(format_issues(&issues), "type: unknown frame type: ping");
    }

    #[test]
    fn request_requires_nonempty_id_and_method() {
        let issues = validate_frame(&json!({ "type": "req", "id": "", "method": "health" }))
            .unwrap_err();
        assert_eq!(format_issues(&issues), "id: must not be empty");
    }

    #[test]
    fn request_rejects_unknown_member() {
        let issues =
            validate_frame(&json!({ "type": "req", "id": "1", "method": "health", "extra": 1 }))
                .unwrap_err();
        assert_eq!(format_issues(&issues), "extra: unknown member");
    }

    #[test]
    fn event_name_must_be_in_closed_set() {
        let issues = validate_frame(&json!({ "type": "event", "event": "gossip" })).unwrap_err();
        assert_eq!(format_issues(&issues), "event: unknown event: gossip");
    }

    #[test]
    fn event_seq_must_be_non_negative() {
        let issues =
            validate_frame(&json!({ "type": "event", "event": "tick", "seq": -1 })).unwrap_err();
        assert_eq!(format_issues(&issues), "seq: expected non-negative integer");
    }

    #[test]
    fn send_params_require_idempotency_key() {
        let issues = validate_method_params(
            "send",
            &json!({ "to": "+15550000000", "message": "hi" }),
        )
        .unwrap_err();
        assert_eq!(
            format_issues(&issues),
            "params.idempotencyKey: missing required member"
        );
    }

    #[test]
    fn agent_params_validate_optional_fields() {
        assert!(
            validate_method_params(
                "agent",
                &json!({ "message": "hi", "idempotencyKey": "K", "timeout": 30, "deliver": false }),
            )
            .is_ok()
        );
        let issues = validate_method_params(
            "agent",
            &json!({ "message": "hi", "idempotencyKey": "K", "timeout": "soon" }),
        )
        .unwrap_err();
        assert_eq!(
            format_issues(&issues),
            "params.timeout: expected non-negative integer"
        );
    }

    #[test]
    fn system_event_requires_nonempty_text() {
        let issues = validate_method_params("system-event", &json!({ "text": "" })).unwrap_err();
        assert_eq!(format_issues(&issues), "params.text: must not be empty");
    }

    #[test]
    fn read_methods_reject_params() {
        assert!(validate_method_params("health", &Value::Null).is_ok());
        assert!(validate_method_params("health", &json!({})).is_ok());
        let issues = validate_method_params("health", &json!({ "verbose": true })).unwrap_err();
        assert_eq!(format_issues(&issues), "params.verbose: unknown member");
    }

    #[test]
    fn unknown_method_params_pass_through() {
        // The dispatcher reports unknown methods; the validator stays quiet.
        assert!(validate_method_params("frobnicate", &json!({ "x": 1 })).is_ok());
    }

    #[test]
    fn response_error_code_must_be_known() {
        let res = json!({
            "type": "res",
            "id": "a",
            "ok": false,
            "error": { "code": "TEAPOT", "message": "no" },
        });
        let issues = validate_frame(&res).unwrap_err();
        assert_eq!(format_issues(&issues), "error.code: unknown code: TEAPOT");
    }

    #[test]
    fn issue_order_is_deterministic() {
        let hello = json!({
            "type": "hello",
            "client": { "name": "t", "version": "1", "platform": "test", "mode": "test" },
        });
        let a = format_issues(&validate_frame(&hello).unwrap_err());
        let b = format_issues(&validate_frame(&hello).unwrap_err());
        assert_eq!(a, b);
        assert_eq!(
            a,
            "minProtocol: missing required member; maxProtocol: missing required member"
        );
    }
}
