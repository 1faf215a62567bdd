//! CloudEvents 1.0 envelope codec for [`ServerMessage`].
//!
//! Wire constants here are frozen: events published by older releases are
//! still in flight when a new release starts consuming.

use super::{ServerMessage, ServerMessagePayload};
use crate::opamp::instance_uid::InstanceUid;
use crate::server::record::ServerId;
use chrono::{DateTime, Utc};
use cloudevents::{AttributesReader, Data, Event, EventBuilder, EventBuilderV10};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Event type of a SendServerToAgent routing message.
pub const EVENT_TYPE_SEND_SERVER_TO_AGENT: &str = "io.opampcommander.server.sendtoagent.v1";

/// Misspelled variant of [`EVENT_TYPE_SEND_SERVER_TO_AGENT`] published by
/// early releases. Accepted on decode forever, never produced on encode.
/// This is a wire constant, not a domain spelling.
pub const EVENT_TYPE_SEND_SERVER_TO_AGENT_LEGACY: &str =
    "io.opampcommander.server.sendtosagent.v1";

pub const EVENT_SOURCE_PREFIX: &str = "opampcommander/server/";

const DATA_CONTENT_TYPE: &str = "application/json";

#[derive(Error, Debug)]
pub enum EnvelopeError {
    #[error("unknown event type: {0}")]
    UnknownEventType(String),

    #[error("payload decode failed: {0}")]
    PayloadDecode(String),

    #[error("event carries no subject")]
    MissingSubject,

    #[error("malformed envelope: {0}")]
    Malformed(String),
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendServerToAgentData {
    target_agent_instance_uids: Vec<InstanceUid>,
}

/// Wraps a message into a CloudEvents event. The event id is fresh per
/// publish; redeliveries by the broker keep the id they were published with.
pub fn encode(
    message: &ServerMessage,
    event_id: Uuid,
    time: DateTime<Utc>,
) -> Result<Event, EnvelopeError> {
    let (event_type, data) = match &message.payload {
        ServerMessagePayload::SendServerToAgent {
            target_agent_instance_uids,
        } => (
            EVENT_TYPE_SEND_SERVER_TO_AGENT,
            serde_json::to_value(SendServerToAgentData {
                target_agent_instance_uids: target_agent_instance_uids.clone(),
            })
            .map_err(|err| EnvelopeError::Malformed(err.to_string()))?,
        ),
    };

    EventBuilderV10::new()
        .id(event_id.to_string())
        .ty(event_type)
        .source(format!("{EVENT_SOURCE_PREFIX}{}", message.source))
        .subject(message.target.as_str())
        .time(time)
        .data(DATA_CONTENT_TYPE, data)
        .build()
        .map_err(|err| EnvelopeError::Malformed(err.to_string()))
}

pub fn encode_to_bytes(
    message: &ServerMessage,
    event_id: Uuid,
    time: DateTime<Utc>,
) -> Result<Vec<u8>, EnvelopeError> {
    let event = encode(message, event_id, time)?;
    serde_json::to_vec(&event).map_err(|err| EnvelopeError::Malformed(err.to_string()))
}

pub fn decode(event: &Event) -> Result<ServerMessage, EnvelopeError> {
    let event_type = event.ty();
    if event_type != EVENT_TYPE_SEND_SERVER_TO_AGENT
        && event_type != EVENT_TYPE_SEND_SERVER_TO_AGENT_LEGACY
    {
        return Err(EnvelopeError::UnknownEventType(event_type.to_string()));
    }

    let target = ServerId::from(event.subject().ok_or(EnvelopeError::MissingSubject)?);
    let source_uri = event.source().to_string();
    let source = ServerId::from(
        source_uri
            .strip_prefix(EVENT_SOURCE_PREFIX)
            .unwrap_or(source_uri.as_str()),
    );

    let data: SendServerToAgentData = match event.data() {
        Some(Data::Json(value)) => serde_json::from_value(value.clone())
            .map_err(|err| EnvelopeError::PayloadDecode(err.to_string()))?,
        Some(Data::Binary(bytes)) => serde_json::from_slice(bytes)
            .map_err(|err| EnvelopeError::PayloadDecode(err.to_string()))?,
        Some(Data::String(text)) => serde_json::from_str(text)
            .map_err(|err| EnvelopeError::PayloadDecode(err.to_string()))?,
        None => return Err(EnvelopeError::PayloadDecode("event carries no data".to_string())),
    };

    Ok(ServerMessage {
        source,
        target,
        payload: ServerMessagePayload::SendServerToAgent {
            target_agent_instance_uids: data.target_agent_instance_uids,
        },
    })
}

pub fn decode_bytes(payload: &[u8]) -> Result<ServerMessage, EnvelopeError> {
    let event: Event = serde_json::from_slice(payload)
        .map_err(|err| EnvelopeError::Malformed(err.to_string()))?;
    decode(&event)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn message() -> ServerMessage {
        ServerMessage {
            source: ServerId::from("s1"),
            target: ServerId::from("s2"),
            payload: ServerMessagePayload::SendServerToAgent {
                target_agent_instance_uids: vec![
                    InstanceUid::try_from("11111111-1111-1111-1111-111111111111").unwrap(),
                ],
            },
        }
    }

    #[test]
    fn test_roundtrip() {
        let msg = message();
        let bytes = encode_to_bytes(&msg, Uuid::new_v4(), Utc::now()).unwrap();
        assert_eq!(decode_bytes(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_envelope_attributes() {
        let event = encode(&message(), Uuid::new_v4(), Utc::now()).unwrap();
        assert_eq!(event.ty(), EVENT_TYPE_SEND_SERVER_TO_AGENT);
        assert_eq!(event.subject(), Some("s2"));
        assert_eq!(event.source().to_string(), "opampcommander/server/s1");
        assert_eq!(event.specversion().to_string(), "1.0");
    }

    #[test]
    fn test_payload_field_name_is_frozen() {
        let bytes = encode_to_bytes(&message(), Uuid::new_v4(), Utc::now()).unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert!(
            json["data"]["targetAgentInstanceUids"].is_array(),
            "payload key must stay camelCase: {json}"
        );
    }

    #[test]
    fn test_legacy_type_spelling_is_accepted() {
        let event = encode(&message(), Uuid::new_v4(), Utc::now()).unwrap();
        let mut json = serde_json::to_value(&event).unwrap();
        json["type"] = serde_json::Value::String(
            EVENT_TYPE_SEND_SERVER_TO_AGENT_LEGACY.to_string(),
        );
        let decoded = decode_bytes(&serde_json::to_vec(&json).unwrap()).unwrap();
        assert_eq!(decoded, message());
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        let event = encode(&message(), Uuid::new_v4(), Utc::now()).unwrap();
        let mut json = serde_json::to_value(&event).unwrap();
        json["type"] =
            serde_json::Value::String("io.opampcommander.server.unknown.v1".to_string());
        assert_matches!(
            decode_bytes(&serde_json::to_vec(&json).unwrap()),
            Err(EnvelopeError::UnknownEventType(ty)) if ty == "io.opampcommander.server.unknown.v1"
        );
    }

    #[test]
    fn test_missing_subject_is_rejected() {
        let event = encode(&message(), Uuid::new_v4(), Utc::now()).unwrap();
        let mut json = serde_json::to_value(&event).unwrap();
        json.as_object_mut().unwrap().remove("subject");
        assert_matches!(
            decode_bytes(&serde_json::to_vec(&json).unwrap()),
            Err(EnvelopeError::MissingSubject)
        );
    }

    #[test]
    fn test_garbage_payload_shape_is_rejected() {
        let event = encode(&message(), Uuid::new_v4(), Utc::now()).unwrap();
        let mut json = serde_json::to_value(&event).unwrap();
        json["data"] = serde_json::json!({"targetAgentInstanceUids": "not-a-list"});
        assert_matches!(
            decode_bytes(&serde_json::to_vec(&json).unwrap()),
            Err(EnvelopeError::PayloadDecode(_))
        );
    }
}
