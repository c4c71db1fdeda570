//! Live-query wire messages.
//!
//! Every frame is a JSON object tagged by `"op"`. Field names on the wire
//! are camelCase.

use crate::types::{EventType, RequestId};
use serde::{Deserialize, Serialize};

/// Client-to-server messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Handshake sent as soon as the transport is open.
    Connect(ConnectRequestBody),
    Subscribe(SubscribeRequest),
    Unsubscribe(UnsubscribeRequest),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectRequestBody {
    pub application_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub master_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeRequest {
    pub request_id: RequestId,
    pub query: QueryPayload,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryPayload {
    pub class_name: String,
    #[serde(rename = "where")]
    pub where_clause: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fields: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnsubscribeRequest {
    pub request_id: RequestId,
}

/// Server-to-client messages.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Handshake accepted.
    Connected(ConnectedBody),
    Subscribed(RequestRef),
    Unsubscribed(RequestRef),
    Error(ErrorBody),
    Create(EventFrame),
    Update(EventFrame),
    Delete(EventFrame),
    Enter(EventFrame),
    Leave(EventFrame),
    #[serde(other)]
    Unknown,
}

impl ServerMessage {
    /// Event kind and body, for the five change ops.
    pub fn as_event(&self) -> Option<(EventType, &EventFrame)> {
        match self {
            ServerMessage::Create(frame) => Some((EventType::Create, frame)),
            ServerMessage::Update(frame) => Some((EventType::Update, frame)),
            ServerMessage::Delete(frame) => Some((EventType::Delete, frame)),
            ServerMessage::Enter(frame) => Some((EventType::Enter, frame)),
            ServerMessage::Leave(frame) => Some((EventType::Leave, frame)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectedBody {
    #[serde(default)]
    pub client_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestRef {
    pub request_id: RequestId,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    #[serde(default)]
    pub code: Option<i64>,
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub reconnect: bool,
    /// Present when the error concerns one subscription.
    #[serde(default)]
    pub request_id: Option<RequestId>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventFrame {
    pub request_id: RequestId,
    #[serde(default)]
    pub object: serde_json::Value,
    #[serde(default)]
    pub original: Option<serde_json::Value>,
}

/// Decode one text frame, keeping the parsed JSON alongside the message.
pub fn decode(text: &str) -> crate::Result<(ServerMessage, serde_json::Value)> {
    let raw: serde_json::Value = serde_json::from_str(text)
        .map_err(|e| crate::LiveQueryError::Protocol(format!("malformed frame: {e}")))?;
    let message = ServerMessage::deserialize(&raw)
        .map_err(|e| crate::LiveQueryError::Protocol(format!("unexpected frame: {e}")))?;
    Ok((message, raw))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_subscribe_shape() {
        let message = ClientMessage::Subscribe(SubscribeRequest {
            request_id: RequestId(7),
            query: QueryPayload {
                class_name: "Song".into(),
                where_clause: json!({"artist": "Nina"}),
                fields: Some(vec!["title".into()]),
            },
            session_token: Some("r:abc".into()),
        });
        assert_eq!(
            serde_json::to_value(&message).unwrap(),
            json!({
                "op": "subscribe",
                "requestId": 7,
                "query": {"className": "Song", "where": {"artist": "Nina"}, "fields": ["title"]},
                "sessionToken": "r:abc"
            })
        );
    }

    #[test]
    fn test_optional_fields_omitted() {
        let message = ClientMessage::Connect(ConnectRequestBody {
            application_id: "app".into(),
            client_key: None,
            master_key: None,
            session_token: None,
        });
        assert_eq!(
            serde_json::to_value(&message).unwrap(),
            json!({"op": "connect", "applicationId": "app"})
        );

        let message = ClientMessage::Unsubscribe(UnsubscribeRequest { request_id: RequestId(3) });
        assert_eq!(
            serde_json::to_value(&message).unwrap(),
            json!({"op": "unsubscribe", "requestId": 3})
        );
    }

    #[test]
    fn test_decode_event_frames() {
        let (message, raw) = decode(
            r#"{"op":"update","requestId":4,"object":{"objectId":"x","n":2},"original":{"objectId":"x","n":1}}"#,
        )
        .unwrap();
        let (ty, frame) = message.as_event().unwrap();
        assert_eq!(ty, EventType::Update);
        assert_eq!(frame.request_id, RequestId(4));
        assert_eq!(frame.original.as_ref().unwrap()["n"], 1);
        assert_eq!(raw["op"], "update");

        let (message, _) = decode(r#"{"op":"delete","requestId":4,"object":{}}"#).unwrap();
        assert!(matches!(message.as_event(), Some((EventType::Delete, f)) if f.original.is_none()));
    }

    #[test]
    fn test_decode_control_frames() {
        let (message, _) = decode(r#"{"op":"connected","clientId":"c1"}"#).unwrap();
        assert_eq!(
            message,
            ServerMessage::Connected(ConnectedBody { client_id: Some("c1".into()) })
        );

        let (message, _) = decode(r#"{"op":"subscribed","requestId":9}"#).unwrap();
        assert_eq!(message, ServerMessage::Subscribed(RequestRef { request_id: RequestId(9) }));

        let (message, _) =
            decode(r#"{"op":"error","code":101,"error":"no","reconnect":false,"requestId":9}"#)
                .unwrap();
        match message {
            ServerMessage::Error(body) => {
                assert_eq!(body.code, Some(101));
                assert_eq!(body.request_id, Some(RequestId(9)));
            }
            other => panic!("expected error frame, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_unknown_and_malformed() {
        let (message, _) = decode(r#"{"op":"redirect","url":"wss://x"}"#).unwrap();
        assert_eq!(message, ServerMessage::Unknown);

        assert!(matches!(decode("not json"), Err(crate::LiveQueryError::Protocol(_))));
        assert!(matches!(
            decode(r#"{"op":"create"}"#),
            Err(crate::LiveQueryError::Protocol(_))
        ));
    }
}
