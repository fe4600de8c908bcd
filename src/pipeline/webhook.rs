//! Inbound webhook payloads.
//!
//! Two shapes are accepted: WAHA's `{event, payload}` envelope and the legacy
//! `{data: {messages: [...]}}` batch. Anything else is acknowledged and ignored.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

/// One chat message to process.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundEvent {
    /// Empty when the gateway did not supply one; such events skip deduplication.
    pub message_id: String,
    pub chat_id: String,
    pub body_text: String,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct WahaEnvelope {
    pub event: String,
    pub payload: WahaMessage,
}

#[derive(Debug, Deserialize)]
pub struct WahaMessage {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    from: String,
    #[serde(default)]
    body: Option<String>,
    #[serde(default, rename = "fromMe")]
    from_me: bool,
}

#[derive(Debug, Deserialize)]
pub struct LegacyEnvelope {
    pub data: LegacyData,
}

#[derive(Debug, Deserialize)]
pub struct LegacyData {
    #[serde(default)]
    messages: Vec<LegacyMessage>,
}

#[derive(Debug, Deserialize)]
struct LegacyMessage {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    from: String,
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    text: Option<LegacyText>,
}

#[derive(Debug, Deserialize)]
struct LegacyText {
    #[serde(default)]
    body: String,
}

#[derive(Debug)]
pub enum WebhookPayload {
    Message(WahaEnvelope),
    Legacy(LegacyEnvelope),
    Unrecognized,
}

fn id_string(id: Option<Value>) -> String {
    match id {
        Some(Value::String(s)) => s,
        Some(Value::Null) | None => String::new(),
        // WAHA engines that send a structured id carry the serialized form here
        Some(Value::Object(map)) => match map.get("_serialized") {
            Some(Value::String(s)) => s.clone(),
            _ => Value::Object(map).to_string(),
        },
        Some(other) => other.to_string(),
    }
}

impl WebhookPayload {
    /// Try shape A, then shape B, else `Unrecognized`.
    pub fn decode(value: &Value) -> Self {
        if let Ok(envelope) = WahaEnvelope::deserialize(value) {
            return WebhookPayload::Message(envelope);
        }
        if let Ok(envelope) = LegacyEnvelope::deserialize(value) {
            return WebhookPayload::Legacy(envelope);
        }
        WebhookPayload::Unrecognized
    }

    /// Extract processable events. Non-message events, our own messages and
    /// messages without a sender or text are dropped.
    pub fn into_events(self, received_at: DateTime<Utc>) -> Vec<InboundEvent> {
        let events = match self {
            WebhookPayload::Message(envelope) => {
                if envelope.event != "message" || envelope.payload.from_me {
                    return Vec::new();
                }
                let message = envelope.payload;
                vec![InboundEvent {
                    message_id: id_string(message.id),
                    chat_id: message.from,
                    body_text: message.body.unwrap_or_default(),
                    received_at,
                }]
            }
            WebhookPayload::Legacy(envelope) => envelope
                .data
                .messages
                .into_iter()
                .filter(|m| m.kind.as_deref().is_none_or(|k| k == "text"))
                .map(|m| InboundEvent {
                    message_id: id_string(m.id),
                    chat_id: m.from,
                    body_text: m.text.map(|t| t.body).unwrap_or_default(),
                    received_at,
                })
                .collect(),
            WebhookPayload::Unrecognized => Vec::new(),
        };

        events
            .into_iter()
            .filter(|e| !e.chat_id.is_empty() && !e.body_text.trim().is_empty())
            .collect()
    }
}
