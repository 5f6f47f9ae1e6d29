use anyhow::{anyhow, Result};
use ::nostr::prelude::{
    Event as NostrEvent, EventBuilder, JsonUtil, Keys, Kind, Tag, TagKind, Timestamp,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{SystemTime, UNIX_EPOCH};

pub const KIND_ENCRYPTED_DIRECT_MESSAGE: u32 = 4;
pub const KIND_CLIENT_AUTH: u32 = 22242;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawEvent {
    pub id: String,
    pub pubkey: String,
    pub created_at: i64,
    pub kind: u32,
    pub tags: Vec<Vec<String>>,
    pub content: String,
    pub sig: String,
}

impl RawEvent {
    pub fn tag_values(&self, name: &str) -> Vec<String> {
        self.tags
            .iter()
            .filter_map(|tag| {
                if tag.first().map(|v| v.as_str()) == Some(name) {
                    tag.get(1).cloned()
                } else {
                    None
                }
            })
            .collect()
    }

    pub fn first_tag_value(&self, name: &str) -> Option<String> {
        self.tags.iter().find_map(|tag| {
            if tag.first().map(|v| v.as_str()) == Some(name) {
                tag.get(1).cloned()
            } else {
                None
            }
        })
    }

    pub fn has_tag_value(&self, name: &str, value: &str) -> bool {
        self.tags.iter().any(|tag| {
            tag.first().map(|v| v.as_str()) == Some(name)
                && tag.get(1).map(|v| v.as_str()) == Some(value)
        })
    }

    pub fn is_encrypted_direct_message(&self) -> bool {
        self.kind == KIND_ENCRYPTED_DIRECT_MESSAGE
    }
}

pub fn parse_event(value: &Value) -> Result<RawEvent> {
    serde_json::from_value(value.clone()).map_err(|err| anyhow!("invalid event json: {err}"))
}

/// Checks the content hash id and the schnorr signature.
pub fn verify_event(raw: &RawEvent) -> Result<()> {
    let event = to_nostr_event(raw)?;
    event.verify().map_err(|err| anyhow!("event verify failed: {err}"))?;
    Ok(())
}

pub fn to_nostr_event(raw: &RawEvent) -> Result<NostrEvent> {
    let json = serde_json::to_string(raw)?;
    NostrEvent::from_json(json).map_err(|err| anyhow!("failed to parse nostr event: {err}"))
}

pub fn unix_seconds() -> Result<u64> {
    Ok(SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs())
}

pub fn build_signed_event(
    keys: &Keys,
    kind: u16,
    tags: Vec<Vec<String>>,
    content: String,
) -> Result<RawEvent> {
    sign(keys, builder(kind, tags, content))
}

pub fn build_signed_event_at(
    keys: &Keys,
    kind: u16,
    tags: Vec<Vec<String>>,
    content: String,
    created_at: i64,
) -> Result<RawEvent> {
    let builder = builder(kind, tags, content)
        .custom_created_at(Timestamp::from_secs(created_at.max(0) as u64));
    sign(keys, builder)
}

fn builder(kind: u16, tags: Vec<Vec<String>>, content: String) -> EventBuilder {
    let mut builder = EventBuilder::new(Kind::Custom(kind), content);
    for tag in tags {
        if tag.is_empty() {
            continue;
        }
        let kind = TagKind::from(tag[0].as_str());
        let values = if tag.len() > 1 { tag[1..].to_vec() } else { Vec::new() };
        builder = builder.tag(Tag::custom(kind, values));
    }
    builder
}

fn sign(keys: &Keys, builder: EventBuilder) -> Result<RawEvent> {
    let signed = builder.sign_with_keys(keys)?;
    let value = serde_json::to_value(&signed)?;
    parse_event(&value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dm_to(recipient: &str) -> (Keys, RawEvent) {
        let keys = Keys::generate();
        let event = build_signed_event(
            &keys,
            KIND_ENCRYPTED_DIRECT_MESSAGE as u16,
            vec![vec!["p".into(), recipient.into()]],
            "ciphertext?iv=abc".into(),
        )
        .expect("sign dm");
        (keys, event)
    }

    #[test]
    fn signed_event_verifies() {
        let (keys, event) = dm_to("npub-ish");
        assert_eq!(event.pubkey, keys.public_key().to_hex());
        assert!(event.is_encrypted_direct_message());
        verify_event(&event).expect("valid signature");
    }

    #[test]
    fn tampered_content_fails_verification() {
        let (_, mut event) = dm_to("someone");
        event.content.push('!');
        assert!(verify_event(&event).is_err());
    }

    #[test]
    fn tag_helpers_match_name_and_value() {
        let (_, event) = dm_to("recipient-hex");
        assert!(event.has_tag_value("p", "recipient-hex"));
        assert!(!event.has_tag_value("p", "other"));
        assert!(!event.has_tag_value("e", "recipient-hex"));
        assert_eq!(event.first_tag_value("p").as_deref(), Some("recipient-hex"));
        assert_eq!(event.tag_values("p"), vec!["recipient-hex".to_string()]);
    }

    #[test]
    fn custom_created_at_is_signed_in() {
        let keys = Keys::generate();
        let event = build_signed_event_at(&keys, 1, Vec::new(), "hi".into(), 1_700_000_000)
            .expect("sign");
        assert_eq!(event.created_at, 1_700_000_000);
        verify_event(&event).expect("valid signature");
    }

    #[test]
    fn parse_event_rejects_missing_fields() {
        let value = serde_json::json!({"id": "x", "kind": 1});
        assert!(parse_event(&value).is_err());
    }
}
