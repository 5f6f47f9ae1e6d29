//! NIP-01 / NIP-42 frames as seen by the proxy.
//!
//! Frames are validated once, at the socket boundary. Unknown tags are kept as
//! [`ClientMessage::Other`] / [`RelayMessage::Other`] so they can still be
//! forwarded; a known tag with the wrong shape is a [`MessageError`].

use cn_core::nostr::{self, RawEvent};
use serde_json::{json, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("message is not a json array")]
    NotArray,
    #[error("message has no type tag")]
    MissingTag,
    #[error("invalid {tag} message: {reason}")]
    Shape { tag: &'static str, reason: String },
}

impl MessageError {
    fn shape(tag: &'static str, reason: impl Into<String>) -> Self {
        MessageError::Shape {
            tag,
            reason: reason.into(),
        }
    }
}

/// Frames sent by the client.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    Auth(RawEvent),
    Event(RawEvent),
    Req {
        subscription_id: String,
        filters: Vec<Value>,
    },
    Close(String),
    Other(Vec<Value>),
}

/// Frames sent by the upstream relay, and everything the proxy itself sends to the client.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayMessage {
    Event {
        subscription_id: String,
        event: RawEvent,
    },
    Ok {
        event_id: String,
        accepted: bool,
        message: String,
    },
    Eose(String),
    Notice(String),
    Auth(String),
    Other(Vec<Value>),
}

fn split_frame(text: &str) -> Result<(String, Vec<Value>), MessageError> {
    let value: Value = serde_json::from_str(text)?;
    let Value::Array(items) = value else {
        return Err(MessageError::NotArray);
    };
    let tag = items
        .first()
        .and_then(|v| v.as_str())
        .ok_or(MessageError::MissingTag)?
        .to_string();
    Ok((tag, items))
}

fn string_at(items: &[Value], index: usize, tag: &'static str, what: &str) -> Result<String, MessageError> {
    items
        .get(index)
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| MessageError::shape(tag, format!("missing {what}")))
}

fn event_at(items: &[Value], index: usize, tag: &'static str) -> Result<RawEvent, MessageError> {
    let value = items
        .get(index)
        .ok_or_else(|| MessageError::shape(tag, "missing event"))?;
    // Some older clients send the AUTH event as a JSON encoded string.
    match value {
        Value::String(encoded) => serde_json::from_str::<Value>(encoded)
            .map_err(|err| MessageError::shape(tag, err.to_string()))
            .and_then(|inner| {
                nostr::parse_event(&inner).map_err(|err| MessageError::shape(tag, err.to_string()))
            }),
        other => nostr::parse_event(other).map_err(|err| MessageError::shape(tag, err.to_string())),
    }
}

impl ClientMessage {
    pub fn parse(text: &str) -> Result<Self, MessageError> {
        let (tag, items) = split_frame(text)?;
        match tag.as_str() {
            "AUTH" => Ok(ClientMessage::Auth(event_at(&items, 1, "AUTH")?)),
            "EVENT" => Ok(ClientMessage::Event(event_at(&items, 1, "EVENT")?)),
            "REQ" => {
                let subscription_id = string_at(&items, 1, "REQ", "subscription id")?;
                let filters = items.into_iter().skip(2).collect();
                Ok(ClientMessage::Req {
                    subscription_id,
                    filters,
                })
            }
            "CLOSE" => Ok(ClientMessage::Close(string_at(
                &items,
                1,
                "CLOSE",
                "subscription id",
            )?)),
            _ => Ok(ClientMessage::Other(items)),
        }
    }

    pub fn tag(&self) -> &str {
        match self {
            ClientMessage::Auth(_) => "AUTH",
            ClientMessage::Event(_) => "EVENT",
            ClientMessage::Req { .. } => "REQ",
            ClientMessage::Close(_) => "CLOSE",
            ClientMessage::Other(items) => items.first().and_then(|v| v.as_str()).unwrap_or(""),
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            ClientMessage::Auth(event) => json!(["AUTH", event]),
            ClientMessage::Event(event) => json!(["EVENT", event]),
            ClientMessage::Req {
                subscription_id,
                filters,
            } => {
                let mut items = vec![json!("REQ"), json!(subscription_id)];
                items.extend(filters.iter().cloned());
                Value::Array(items)
            }
            ClientMessage::Close(subscription_id) => json!(["CLOSE", subscription_id]),
            ClientMessage::Other(items) => Value::Array(items.clone()),
        }
    }

    pub fn to_json(&self) -> String {
        self.to_value().to_string()
    }
}

impl RelayMessage {
    pub fn parse(text: &str) -> Result<Self, MessageError> {
        let (tag, items) = split_frame(text)?;
        match tag.as_str() {
            "EVENT" => Ok(RelayMessage::Event {
                subscription_id: string_at(&items, 1, "EVENT", "subscription id")?,
                event: event_at(&items, 2, "EVENT")?,
            }),
            "OK" => {
                let event_id = string_at(&items, 1, "OK", "event id")?;
                let accepted = items
                    .get(2)
                    .and_then(|v| v.as_bool())
                    .ok_or_else(|| MessageError::shape("OK", "missing accepted flag"))?;
                let message = items
                    .get(3)
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                Ok(RelayMessage::Ok {
                    event_id,
                    accepted,
                    message,
                })
            }
            "EOSE" => Ok(RelayMessage::Eose(string_at(
                &items,
                1,
                "EOSE",
                "subscription id",
            )?)),
            "NOTICE" => Ok(RelayMessage::Notice(string_at(
                &items, 1, "NOTICE", "message",
            )?)),
            "AUTH" => Ok(RelayMessage::Auth(string_at(
                &items,
                1,
                "AUTH",
                "challenge",
            )?)),
            _ => Ok(RelayMessage::Other(items)),
        }
    }

    pub fn notice(message: impl Into<String>) -> Self {
        RelayMessage::Notice(message.into())
    }

    pub fn tag(&self) -> &str {
        match self {
            RelayMessage::Event { .. } => "EVENT",
            RelayMessage::Ok { .. } => "OK",
            RelayMessage::Eose(_) => "EOSE",
            RelayMessage::Notice(_) => "NOTICE",
            RelayMessage::Auth(_) => "AUTH",
            RelayMessage::Other(items) => items.first().and_then(|v| v.as_str()).unwrap_or(""),
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            RelayMessage::Event {
                subscription_id,
                event,
            } => json!(["EVENT", subscription_id, event]),
            RelayMessage::Ok {
                event_id,
                accepted,
                message,
            } => json!(["OK", event_id, accepted, message]),
            RelayMessage::Eose(subscription_id) => json!(["EOSE", subscription_id]),
            RelayMessage::Notice(message) => json!(["NOTICE", message]),
            RelayMessage::Auth(challenge) => json!(["AUTH", challenge]),
            RelayMessage::Other(items) => Value::Array(items.clone()),
        }
    }

    pub fn to_json(&self) -> String {
        self.to_value().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event_json(kind: u32) -> Value {
        json!({
            "id": "e1",
            "pubkey": "pk",
            "created_at": 1_700_000_000,
            "kind": kind,
            "tags": [["p", "someone"]],
            "content": "",
            "sig": "sig"
        })
    }

    #[test]
    fn parses_client_req_with_filters() {
        let text = json!(["REQ", "sub1", {"kinds": [4]}, {"authors": ["a"]}]).to_string();
        let message = ClientMessage::parse(&text).unwrap();
        assert_eq!(
            message,
            ClientMessage::Req {
                subscription_id: "sub1".into(),
                filters: vec![json!({"kinds": [4]}), json!({"authors": ["a"]})],
            }
        );
        assert_eq!(message.to_value(), serde_json::from_str::<Value>(&text).unwrap());
    }

    #[test]
    fn parses_client_auth_with_string_encoded_event() {
        let encoded = event_json(22242).to_string();
        let text = json!(["AUTH", encoded]).to_string();
        let ClientMessage::Auth(event) = ClientMessage::parse(&text).unwrap() else {
            panic!("expected AUTH");
        };
        assert_eq!(event.kind, 22242);
    }

    #[test]
    fn unknown_tags_are_kept_verbatim() {
        let text = json!(["COUNT", "q", {"kinds": [1]}]).to_string();
        let message = ClientMessage::parse(&text).unwrap();
        assert_eq!(message.tag(), "COUNT");
        assert_eq!(message.to_json(), text);

        let closed = RelayMessage::parse(r#"["CLOSED","sub1","auth-required: nope"]"#).unwrap();
        assert!(matches!(closed, RelayMessage::Other(_)));
        assert_eq!(closed.tag(), "CLOSED");
    }

    #[test]
    fn known_tag_with_wrong_shape_is_an_error() {
        assert!(matches!(
            ClientMessage::parse(r#"["CLOSE"]"#),
            Err(MessageError::Shape { tag: "CLOSE", .. })
        ));
        assert!(matches!(
            RelayMessage::parse(r#"["EVENT","sub1",{"kind":4}]"#),
            Err(MessageError::Shape { tag: "EVENT", .. })
        ));
        assert!(matches!(
            RelayMessage::parse(r#"["OK","id","yes"]"#),
            Err(MessageError::Shape { tag: "OK", .. })
        ));
    }

    #[test]
    fn malformed_frames_are_errors() {
        assert!(matches!(ClientMessage::parse("not json"), Err(MessageError::Json(_))));
        assert!(matches!(ClientMessage::parse(r#"{"a":1}"#), Err(MessageError::NotArray)));
        assert!(matches!(ClientMessage::parse("[1,2]"), Err(MessageError::MissingTag)));
        assert!(matches!(ClientMessage::parse("[]"), Err(MessageError::MissingTag)));
    }

    #[test]
    fn relay_event_and_ok_are_typed() {
        let text = json!(["EVENT", "sub1", event_json(4)]).to_string();
        let RelayMessage::Event { subscription_id, event } = RelayMessage::parse(&text).unwrap() else {
            panic!("expected EVENT");
        };
        assert_eq!(subscription_id, "sub1");
        assert!(event.is_encrypted_direct_message());

        let ok = RelayMessage::parse(r#"["OK","abc",false]"#).unwrap();
        assert_eq!(
            ok,
            RelayMessage::Ok {
                event_id: "abc".into(),
                accepted: false,
                message: String::new(),
            }
        );
        assert_eq!(ok.to_json(), r#"["OK","abc",false,""]"#);
    }

    #[test]
    fn auth_challenge_serializes_as_array() {
        assert_eq!(
            RelayMessage::Auth("abc-123".into()).to_json(),
            r#"["AUTH","abc-123"]"#
        );
        assert_eq!(
            RelayMessage::notice("restricted: auth failed").to_json(),
            r#"["NOTICE","restricted: auth failed"]"#
        );
    }
}
