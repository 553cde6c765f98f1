//! Draft-07 JSON Schema corpus for the frame protocol.
//!
//! Emitted out-of-band (`clawdis schema`) for foreign-language code
//! generators. The document carries a `discriminator` keyed on `type` and a
//! named definition for every frame and helper object. Build artifact only —
//! the runtime validates with [`crate::validate`] instead.

use serde_json::{Value, json};

fn string() -> Value {
    json!({ "type": "string" })
}

fn identifier() -> Value {
    json!({ "type": "string", "minLength": 1 })
}

fn uint() -> Value {
    json!({ "type": "integer", "minimum": 0 })
}

fn string_array() -> Value {
    json!({ "type": "array", "items": { "type": "string" } })
}

fn frame_ref(name: &str) -> Value {
    json!({ "$ref": format!("#/definitions/{name}") })
}

/// Build the complete schema document.
pub fn schema_document() -> Value {
    json!({
        "$schema": "http://json-schema.org/draft-07/schema#",
        "title": "ClawdisGatewayFrame",
        "discriminator": { "propertyName": "type" },
        "oneOf": [
            frame_ref("HelloFrame"),
            frame_ref("HelloOkFrame"),
            frame_ref("HelloErrorFrame"),
            frame_ref("RequestFrame"),
            frame_ref("ResponseFrame"),
            frame_ref("EventFrame"),
        ],
        "definitions": {
            "HelloFrame": {
                "type": "object",
                "additionalProperties": false,
                "required": ["type", "minProtocol", "maxProtocol", "client"],
                "properties": {
                    "type": { "const": "hello" },
                    "minProtocol": uint(),
                    "maxProtocol": uint(),
                    "client": frame_ref("ClientDescriptor"),
                    "caps": string_array(),
                    "auth": frame_ref("HelloAuth"),
                },
            },
            "HelloOkFrame": {
                "type": "object",
                "additionalProperties": false,
                "required": ["type", "protocol", "server", "features", "snapshot", "policy"],
                "properties": {
                    "type": { "const": "hello-ok" },
                    "protocol": uint(),
                    "server": frame_ref("ServerInfo"),
                    "features": frame_ref("Features"),
                    "snapshot": frame_ref("Snapshot"),
                    "policy": frame_ref("Policy"),
                },
            },
            "HelloErrorFrame": {
                "type": "object",
                "additionalProperties": false,
                "required": ["type", "reason"],
                "properties": {
                    "type": { "const": "hello-error" },
                    "reason": identifier(),
                    "expectedProtocol": uint(),
                },
            },
            "RequestFrame": {
                "type": "object",
                "additionalProperties": false,
                "required": ["type", "id", "method"],
                "properties": {
                    "type": { "const": "req" },
                    "id": identifier(),
                    "method": identifier(),
                    "params": { "type": "object" },
                },
            },
            "ResponseFrame": {
                "type": "object",
                "additionalProperties": false,
                "required": ["type", "id", "ok"],
                "properties": {
                    "type": { "const": "res" },
                    "id": identifier(),
                    "ok": { "type": "boolean" },
                    "payload": {},
                    "error": frame_ref("ErrorShape"),
                },
            },
            "EventFrame": {
                "type": "object",
                "additionalProperties": false,
                "required": ["type", "event"],
                "properties": {
                    "type": { "const": "event" },
                    "event": { "enum": crate::events::ALL },
                    "payload": {},
                    "seq": uint(),
                    "stateVersion": frame_ref("StateVersion"),
                },
            },
            "ClientDescriptor": {
                "type": "object",
                "additionalProperties": false,
                "required": ["name", "version", "platform", "mode"],
                "properties": {
                    "name": identifier(),
                    "version": identifier(),
                    "platform": identifier(),
                    "mode": identifier(),
                    "instanceId": identifier(),
                },
            },
            "HelloAuth": {
                "type": "object",
                "additionalProperties": false,
                "properties": {
                    "token": string(),
                },
            },
            "ServerInfo": {
                "type": "object",
                "additionalProperties": false,
                "required": ["version", "connId"],
                "properties": {
                    "version": identifier(),
                    "commit": string(),
                    "host": string(),
                    "connId": identifier(),
                },
            },
            "Features": {
                "type": "object",
                "additionalProperties": false,
                "required": ["methods", "events"],
                "properties": {
                    "methods": string_array(),
                    "events": string_array(),
                },
            },
            "Snapshot": {
                "type": "object",
                "additionalProperties": false,
                "required": ["presence", "health", "stateVersion", "uptimeMs"],
                "properties": {
                    "presence": { "type": "array", "items": frame_ref("PresenceEntry") },
                    "health": {},
                    "stateVersion": frame_ref("StateVersion"),
                    "uptimeMs": uint(),
                },
            },
            "StateVersion": {
                "type": "object",
                "additionalProperties": false,
                "required": ["presence", "health"],
                "properties": {
                    "presence": uint(),
                    "health": uint(),
                },
            },
            "PresenceEntry": {
                "type": "object",
                "additionalProperties": false,
                "required": ["ts"],
                "properties": {
                    "host": string(),
                    "ip": string(),
                    "version": string(),
                    "mode": string(),
                    "lastInputSeconds": uint(),
                    "reason": string(),
                    "tags": string_array(),
                    "text": string(),
                    "ts": uint(),
                    "instanceId": identifier(),
                },
            },
            "Policy": {
                "type": "object",
                "additionalProperties": false,
                "required": ["maxPayload", "maxBufferedBytes", "tickIntervalMs"],
                "properties": {
                    "maxPayload": uint(),
                    "maxBufferedBytes": uint(),
                    "tickIntervalMs": uint(),
                },
            },
            "ErrorShape": {
                "type": "object",
                "additionalProperties": false,
                "required": ["code", "message"],
                "properties": {
                    "code": { "enum": crate::error_codes::ALL },
                    "message": { "type": "string" },
                    "details": {},
                    "retryable": { "type": "boolean" },
                    "retryAfterMs": uint(),
                },
            },
        },
    })
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_discriminates_on_type() {
        let doc = schema_document();
        assert_eq!(doc["discriminator"]["propertyName"], "type");
        assert_eq!(doc["oneOf"].as_array().unwrap().len(), 6);
    }

    #[test]
    fn every_frame_has_a_definition() {
        let doc = schema_document();
        let defs = doc["definitions"].as_object().unwrap();
        for name in [
            "HelloFrame",
            "HelloOkFrame",
            "HelloErrorFrame",
            "RequestFrame",
            "ResponseFrame",
            "EventFrame",
        ] {
            let def = defs.get(name).unwrap_or_else(|| panic!("missing {name}"));
            assert_eq!(def["additionalProperties"], false, "{name} must be strict");
        }
    }

    #[test]
    fn event_names_match_the_closed_set() {
        let doc = schema_document();
        let names = doc["definitions"]["EventFrame"]["properties"]["event"]["enum"]
            .as_array()
            .unwrap();
        assert_eq!(names.len(), crate::events::ALL.len());
    }
}
