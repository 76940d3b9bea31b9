//! Wire protocol for the WebSocket transport.
//!
//! Every frame is a JSON object tagged by an `"event"` field. Inbound
//! payloads are validated into `ClientEvent` at the boundary; missing or
//! mistyped fields fail deserialization and are answered with an `error`
//! event to the offending connection only.

use serde::{Deserialize, Serialize};

use crate::ids::{ChatId, MessageId};

/// Optional binary attachment, carried base64-encoded.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub file_name: String,
    pub file_type: String,
    pub data: String,
}

/// Sentiment classification attached to a message after the fact.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Sentiment {
    pub label: String,
    pub confidence: f64,
}

impl Sentiment {
    pub fn neutral() -> Self {
        Self {
            label: "neutral".into(),
            confidence: 0.5,
        }
    }
}

/// Enrichment block filled in asynchronously once per message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Enrichment {
    pub sentiment: Sentiment,
    pub language: String,
}

/// A message as it appears on the wire (delivery and history).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    pub message_id: MessageId,
    pub chat_id: ChatId,
    pub sender: String,
    pub receiver: String,
    pub body: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attachment: Option<Attachment>,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enrichment: Option<Enrichment>,
}

/// Events a client may send.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ClientEvent {
    RegisterIdentity {
        email: String,
    },
    CreateOrGetSession {
        participant_a: String,
        participant_b: String,
    },
    JoinRoom {
        chat_id: ChatId,
    },
    SendMessage {
        chat_id: ChatId,
        sender: String,
        receiver: String,
        body: String,
        #[serde(default)]
        attachment: Option<Attachment>,
    },
    FetchHistory {
        chat_id: ChatId,
    },
    RequestSmartReplies {
        chat_id: ChatId,
    },
    RequestTranslation {
        text: String,
        target_language: String,
    },
    RequestSummary {
        chat_id: ChatId,
    },
    AddContact {
        user_email: String,
        contact_email: String,
    },
    RemoveContact {
        user_email: String,
        contact_email: String,
    },
}

/// Events the server emits.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ServerEvent {
    Connected {
        status: String,
    },
    IdentityRegistered {
        email: String,
    },
    SessionReady {
        chat_id: ChatId,
    },
    RoomJoined {
        chat_id: ChatId,
    },
    MessageDelivered {
        #[serde(flatten)]
        message: WireMessage,
    },
    MessageEnriched {
        message_id: MessageId,
        chat_id: ChatId,
        sentiment: Sentiment,
        language: String,
    },
    History {
        chat_id: ChatId,
        messages: Vec<WireMessage>,
    },
    SmartReplies {
        chat_id: ChatId,
        suggestions: Vec<String>,
    },
    Translated {
        original: String,
        translated: String,
        target_language: String,
    },
    Summary {
        chat_id: ChatId,
        text: String,
    },
    ContactAdded {
        user_email: String,
        contact_email: String,
    },
    ContactRemoved {
        user_email: String,
        contact_email: String,
    },
    Error {
        message: String,
    },
}

impl ServerEvent {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_event_parses_with_tag() {
        let json = r#"{"event":"join_room","chat_id":"c1"}"#;
        let event: ClientEvent = serde_json::from_str(json).unwrap();
        assert_eq!(
            event,
            ClientEvent::JoinRoom {
                chat_id: ChatId::from_raw("c1")
            }
        );
    }

    #[test]
    fn send_message_attachment_defaults_to_none() {
        let json = r#"{"event":"send_message","chat_id":"c1","sender":"a@x.com","receiver":"b@x.com","body":"hi"}"#;
        let event: ClientEvent = serde_json::from_str(json).unwrap();
        match event {
            ClientEvent::SendMessage { attachment, body, .. } => {
                assert!(attachment.is_none());
                assert_eq!(body, "hi");
            }
            other => panic!("expected SendMessage, got {other:?}"),
        }
    }

    #[test]
    fn send_message_with_attachment() {
        let json = r#"{"event":"send_message","chat_id":"c1","sender":"a@x.com","receiver":"b@x.com","body":"pic","attachment":{"file_name":"cat.png","file_type":"image/png","data":"aGVsbG8="}}"#;
        let event: ClientEvent = serde_json::from_str(json).unwrap();
        match event {
            ClientEvent::SendMessage { attachment, .. } => {
                let att = attachment.unwrap();
                assert_eq!(att.file_name, "cat.png");
            }
            other => panic!("expected SendMessage, got {other:?}"),
        }
    }

    #[test]
    fn missing_required_field_is_rejected() {
        let json = r#"{"event":"send_message","chat_id":"c1","sender":"a@x.com"}"#;
        let result: Result<ClientEvent, _> = serde_json::from_str(json);
        assert!(result.is_err());
    }

    #[test]
    fn unknown_event_is_rejected() {
        let json = r#"{"event":"launch_missiles","target":"moon"}"#;
        let result: Result<ClientEvent, _> = serde_json::from_str(json);
        assert!(result.is_err());
    }

    #[test]
    fn message_delivered_flattens_message_fields() {
        let event = ServerEvent::MessageDelivered {
            message: WireMessage {
                message_id: MessageId::from_raw("m1"),
                chat_id: ChatId::from_raw("c1"),
                sender: "a@x.com".into(),
                receiver: "b@x.com".into(),
                body: "hi".into(),
                attachment: None,
                timestamp: "2026-01-01T00:00:00Z".into(),
                enrichment: None,
            },
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "message_delivered");
        assert_eq!(json["message_id"], "m1");
        assert_eq!(json["body"], "hi");
        assert!(json.get("attachment").is_none());
        assert!(json.get("enrichment").is_none());
    }

    #[test]
    fn error_event_serializes() {
        let event = ServerEvent::error("bad things");
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"event\":\"error\""));
        assert!(json.contains("bad things"));
    }

    #[test]
    fn server_event_roundtrip() {
        let event = ServerEvent::SmartReplies {
            chat_id: ChatId::from_raw("c1"),
            suggestions: vec!["Okay.".into(), "Sure.".into()],
        };
        let json = serde_json::to_string(&event).unwrap();
        let parsed: ServerEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(event, parsed);
    }
}
