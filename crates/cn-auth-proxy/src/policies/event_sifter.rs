//! Client-direction screening of published events.
//!
//! Each client `EVENT` is handed to an ordered list of [`SiftRule`]s. The
//! first rule that does not accept decides: the event is dropped and the
//! client gets an `OK` reply explaining why.

use crate::events::SessionContext;
use crate::message::{ClientMessage, RelayMessage};
use crate::policy::{Policy, PolicyDecision};
use cn_core::nostr::RawEvent;
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceType {
    Ipv4,
    Ipv6,
    /// Anything that is not an IP address, e.g. a unix socket peer.
    Stream,
}

impl SourceType {
    pub fn detect(addr: &str) -> Self {
        match addr.trim().parse::<IpAddr>() {
            Ok(IpAddr::V4(_)) => SourceType::Ipv4,
            Ok(IpAddr::V6(_)) => SourceType::Ipv6,
            Err(_) => SourceType::Stream,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SiftInput<'a> {
    pub event: &'a RawEvent,
    pub received_at: f64,
    pub source_type: SourceType,
    pub source_info: &'a str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SiftOutcome {
    Accept,
    Reject(String),
    /// Pretend success to the client but never publish the event.
    ShadowReject,
}

pub trait SiftRule: Send + Sync {
    fn sift(&self, input: &SiftInput<'_>) -> SiftOutcome;
}

/// Rejects events whose kind is not in the list.
#[derive(Debug, Clone, Default)]
pub struct KindAllowList {
    kinds: HashSet<u32>,
}

impl KindAllowList {
    pub fn new(kinds: impl IntoIterator<Item = u32>) -> Self {
        Self {
            kinds: kinds.into_iter().collect(),
        }
    }
}

impl SiftRule for KindAllowList {
    fn sift(&self, input: &SiftInput<'_>) -> SiftOutcome {
        if self.kinds.contains(&input.event.kind) {
            SiftOutcome::Accept
        } else {
            SiftOutcome::Reject("blocked: kind not allowed".to_string())
        }
    }
}

#[derive(Clone, Default)]
pub struct EventSifter {
    rules: Vec<Arc<dyn SiftRule>>,
}

impl EventSifter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rule<R>(mut self, rule: R) -> Self
    where
        R: SiftRule + 'static,
    {
        self.rules.push(Arc::new(rule));
        self
    }

    fn sift(&self, input: &SiftInput<'_>) -> SiftOutcome {
        self.rules
            .iter()
            .map(|rule| rule.sift(input))
            .find(|outcome| *outcome != SiftOutcome::Accept)
            .unwrap_or(SiftOutcome::Accept)
    }
}

fn received_at() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs_f64())
        .unwrap_or_default()
}

impl Policy<ClientMessage> for EventSifter {
    fn name(&self) -> &'static str {
        "event_sifter"
    }

    fn evaluate(
        &self,
        message: &ClientMessage,
        ctx: &mut SessionContext<'_>,
    ) -> anyhow::Result<PolicyDecision<ClientMessage>> {
        let ClientMessage::Event(event) = message else {
            return Ok(PolicyDecision::Next);
        };
        let source_info = ctx.connection.ip_addr();
        let input = SiftInput {
            event,
            received_at: received_at(),
            source_type: SourceType::detect(source_info),
            source_info,
        };

        let reply = match self.sift(&input) {
            SiftOutcome::Accept => return Ok(PolicyDecision::Accept),
            SiftOutcome::Reject(reason) => RelayMessage::Ok {
                event_id: event.id.clone(),
                accepted: false,
                message: reason,
            },
            SiftOutcome::ShadowReject => RelayMessage::Ok {
                event_id: event.id.clone(),
                accepted: true,
                message: String::new(),
            },
        };
        tracing::debug!(
            connection_id = %ctx.connection.connection_id(),
            event_id = %event.id,
            kind = event.kind,
            "client event sifted out"
        );
        Ok(PolicyDecision::Reject(Some(reply)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionInfo;
    use crate::stash::Stash;

    struct Shadow;

    impl SiftRule for Shadow {
        fn sift(&self, _input: &SiftInput<'_>) -> SiftOutcome {
            SiftOutcome::ShadowReject
        }
    }

    struct SourceCheck(SourceType);

    impl SiftRule for SourceCheck {
        fn sift(&self, input: &SiftInput<'_>) -> SiftOutcome {
            if input.source_type == self.0 && input.received_at > 0.0 {
                SiftOutcome::Accept
            } else {
                SiftOutcome::Reject(format!("unexpected source {}", input.source_info))
            }
        }
    }

    fn publish(kind: u32) -> ClientMessage {
        ClientMessage::Event(RawEvent {
            id: "e1".into(),
            pubkey: "pk".into(),
            created_at: 1_700_000_000,
            kind,
            tags: Vec::new(),
            content: String::new(),
            sig: "sig".into(),
        })
    }

    fn evaluate(sifter: &EventSifter, ip: &str, message: &ClientMessage) -> PolicyDecision<ClientMessage> {
        let info = ConnectionInfo::with_id("c1", ip);
        let mut stash = Stash::new();
        let mut outbox = Vec::new();
        let mut ctx = SessionContext::new(&info, &mut stash, &mut outbox);
        sifter.evaluate(message, &mut ctx).expect("evaluate")
    }

    #[test]
    fn detects_source_type() {
        assert_eq!(SourceType::detect("192.0.2.1"), SourceType::Ipv4);
        assert_eq!(SourceType::detect("2001:db8::1"), SourceType::Ipv6);
        assert_eq!(SourceType::detect("unix:/tmp/sock"), SourceType::Stream);
    }

    #[test]
    fn kind_allow_list_rejects_with_ok_false() {
        let sifter = EventSifter::new().rule(KindAllowList::new([1, 7]));

        assert_eq!(evaluate(&sifter, "127.0.0.1", &publish(1)), PolicyDecision::Accept);
        assert_eq!(
            evaluate(&sifter, "127.0.0.1", &publish(4)),
            PolicyDecision::Reject(Some(RelayMessage::Ok {
                event_id: "e1".into(),
                accepted: false,
                message: "blocked: kind not allowed".into(),
            }))
        );
    }

    #[test]
    fn first_non_accepting_rule_decides() {
        let sifter = EventSifter::new()
            .rule(SourceCheck(SourceType::Ipv6))
            .rule(Shadow);

        assert_eq!(
            evaluate(&sifter, "::1", &publish(1)),
            PolicyDecision::Reject(Some(RelayMessage::Ok {
                event_id: "e1".into(),
                accepted: true,
                message: String::new(),
            }))
        );
        assert_eq!(
            evaluate(&sifter, "10.0.0.1", &publish(1)),
            PolicyDecision::Reject(Some(RelayMessage::Ok {
                event_id: "e1".into(),
                accepted: false,
                message: "unexpected source 10.0.0.1".into(),
            }))
        );
    }

    #[test]
    fn non_event_messages_pass_to_next_policy() {
        let sifter = EventSifter::new().rule(KindAllowList::new(Vec::<u32>::new()));
        let message = ClientMessage::Close("sub1".into());
        assert_eq!(evaluate(&sifter, "127.0.0.1", &message), PolicyDecision::Next);
    }
}
