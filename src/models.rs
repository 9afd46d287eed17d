//! Core data models for the response pipeline

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

//
// ================= Request =================
//

/// One inbound client message. Created per message, immutable, discarded
/// after its response is delivered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub request_id: Uuid,
    pub client_id: Uuid,
    pub raw_text: String,
    pub received_at: DateTime<Utc>,
}

impl Request {
    pub fn new(client_id: Uuid, raw_text: impl Into<String>) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            client_id,
            raw_text: raw_text.into(),
            received_at: Utc::now(),
        }
    }
}

//
// ================= Context =================
//

/// One provider's contribution to a single request's prompt. Owned by the
/// request that triggered it; shared across requests only through the cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextBundle {
    pub source_name: String,
    pub payload: serde_json::Value,
    pub fetched_at: DateTime<Utc>,
    #[serde(with = "duration_secs")]
    pub ttl: Duration,
}

impl ContextBundle {
    pub fn new(source_name: impl Into<String>, payload: serde_json::Value, ttl: Duration) -> Self {
        Self {
            source_name: source_name.into(),
            payload,
            fetched_at: Utc::now(),
            ttl,
        }
    }
}

/// Outcome of one provider slot in the context-gather step. The tagged
/// variants keep the controller free of runtime type inspection: a failed
/// or timed-out provider degrades to `Unavailable` instead of aborting
/// the request.
#[derive(Debug, Clone)]
pub enum ProviderOutcome {
    Fetched(ContextBundle),
    Unavailable,
    Failed(String),
}

impl ProviderOutcome {
    pub fn bundle(&self) -> Option<&ContextBundle> {
        match self {
            ProviderOutcome::Fetched(bundle) => Some(bundle),
            _ => None,
        }
    }
}

//
// ================= Retrieval =================
//

/// A retrieved snippet of text with a similarity score, used to ground a
/// generated response. Ordered by descending score, ties broken by
/// ascending `source_id`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetrievedPassage {
    pub text: String,
    pub score: f32,
    pub source_id: String,
}

//
// ================= Response =================
//

/// Terminal entity of a request: delivered once, then discarded. No
/// durable transcript is kept.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub request_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub structured_fields: Option<serde_json::Value>,
    pub text: String,
    pub generated_at: DateTime<Utc>,
}

impl Response {
    pub fn new(
        request_id: Uuid,
        text: impl Into<String>,
        structured_fields: Option<serde_json::Value>,
    ) -> Self {
        Self {
            request_id,
            structured_fields,
            text: text.into(),
            generated_at: Utc::now(),
        }
    }
}

//
// ================= Pipeline State =================
//

/// Per-request controller state machine. `Errored` is terminal and
/// reachable from any non-terminal state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum RequestState {
    Received,
    Classified,
    ContextGathered,
    Generating,
    Delivered,
    Errored,
}

//
// ================= Session =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChannelState {
    Connecting,
    Open,
    Closed,
}

//
// ================= Wire Messages =================
//

/// One outbound frame per delivered response, tagged so the client can
/// render each kind accordingly.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    Reply {
        request_id: Uuid,
        text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        structured_fields: Option<serde_json::Value>,
        timestamp: DateTime<Utc>,
    },
    SystemNotice {
        text: String,
        timestamp: DateTime<Utc>,
    },
    Error {
        request_id: Uuid,
        text: String,
        timestamp: DateTime<Utc>,
    },
}

impl OutboundMessage {
    pub fn reply(response: Response) -> Self {
        OutboundMessage::Reply {
            request_id: response.request_id,
            text: response.text,
            structured_fields: response.structured_fields,
            timestamp: response.generated_at,
        }
    }

    pub fn notice(text: impl Into<String>) -> Self {
        OutboundMessage::SystemNotice {
            text: text.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn failure(request_id: Uuid, text: impl Into<String>) -> Self {
        OutboundMessage::Error {
            request_id,
            text: text.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Inbound frame: at minimum a text payload; the client identifier rides
/// on the connection itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub text: String,
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RequestState::Received => "RECEIVED",
            RequestState::Classified => "CLASSIFIED",
            RequestState::ContextGathered => "CONTEXT_GATHERED",
            RequestState::Generating => "GENERATING",
            RequestState::Delivered => "DELIVERED",
            RequestState::Errored => "ERRORED",
        };
        write!(f, "{}", s)
    }
}

/// Serialize `Duration` TTLs as whole seconds on the wire.
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        value.as_secs().serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outbound_message_tagging() {
        let notice = OutboundMessage::notice("welcome");
        let json = serde_json::to_value(&notice).unwrap();
        assert_eq!(json["type"], "system_notice");

        let reply = OutboundMessage::reply(Response::new(Uuid::new_v4(), "hi", None));
        let json = serde_json::to_value(&reply).unwrap();
        assert_eq!(json["type"], "reply");
        assert!(json.get("structured_fields").is_none());
    }

    #[test]
    fn test_context_bundle_ttl_roundtrip() {
        let bundle = ContextBundle::new(
            "market_data",
            serde_json::json!({"symbol": "AAPL"}),
            Duration::from_secs(30),
        );
        let json = serde_json::to_string(&bundle).unwrap();
        let back: ContextBundle = serde_json::from_str(&json).unwrap();
        assert_eq!(back.ttl, Duration::from_secs(30));
        assert_eq!(back.source_name, "market_data");
    }
}
