use crate::events::SessionContext;
use crate::message::RelayMessage;
use crate::policy::{Policy, PolicyDecision};
use crate::stash::is_related_event;
use cn_core::metrics;

/// Server-direction filter for kind-4 deliveries.
///
/// Before AUTH every direct message is withheld, and stashed when its
/// subscription is still open. After AUTH only messages written by or addressed to the verified
/// pubkey get through.
#[derive(Debug, Clone, Copy)]
pub struct DirectMessageFilter {
    service_name: &'static str,
}

impl DirectMessageFilter {
    pub fn new(service_name: &'static str) -> Self {
        Self { service_name }
    }
}

impl Policy<RelayMessage> for DirectMessageFilter {
    fn name(&self) -> &'static str {
        "direct_message_filter"
    }

    fn evaluate(
        &self,
        message: &RelayMessage,
        ctx: &mut SessionContext<'_>,
    ) -> anyhow::Result<PolicyDecision<RelayMessage>> {
        let RelayMessage::Event {
            subscription_id,
            event,
        } = message
        else {
            return Ok(PolicyDecision::Next);
        };
        if !event.is_encrypted_direct_message() {
            return Ok(PolicyDecision::Next);
        }

        match ctx.connection.client_pubkey() {
            None => {
                if ctx.stash.push(subscription_id, event.clone()) {
                    metrics::add_stash_events(self.service_name, metrics::STASH_STASHED, 1);
                    tracing::debug!(
                        connection_id = %ctx.connection.connection_id(),
                        subscription_id = %subscription_id,
                        event_id = %event.id,
                        "direct message stashed until auth"
                    );
                } else {
                    metrics::add_stash_events(self.service_name, metrics::STASH_DISCARDED, 1);
                    tracing::debug!(
                        connection_id = %ctx.connection.connection_id(),
                        subscription_id = %subscription_id,
                        event_id = %event.id,
                        "direct message for a closed subscription dropped"
                    );
                }
                Ok(PolicyDecision::Reject(None))
            }
            Some(pubkey) if is_related_event(pubkey, event) => Ok(PolicyDecision::Accept),
            Some(_) => Ok(PolicyDecision::Reject(None)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionInfo;
    use crate::stash::Stash;
    use cn_core::nostr::RawEvent;

    fn delivery(kind: u32, author: &str, recipient: &str) -> RelayMessage {
        RelayMessage::Event {
            subscription_id: "sub1".into(),
            event: RawEvent {
                id: format!("{kind}-{author}-{recipient}"),
                pubkey: author.into(),
                created_at: 1_700_000_000,
                kind,
                tags: vec![vec!["p".into(), recipient.into()]],
                content: String::new(),
                sig: "sig".into(),
            },
        }
    }

    fn evaluate(info: &ConnectionInfo, stash: &mut Stash, message: &RelayMessage) -> PolicyDecision<RelayMessage> {
        let mut outbox = Vec::new();
        let mut ctx = SessionContext::new(info, stash, &mut outbox);
        let decision = DirectMessageFilter::new("cn-test")
            .evaluate(message, &mut ctx)
            .expect("evaluate");
        assert!(outbox.is_empty());
        decision
    }

    #[test]
    fn unauthorized_direct_messages_are_stashed_regardless_of_recipient() {
        let info = ConnectionInfo::with_id("c1", "127.0.0.1");
        let mut stash = Stash::new();
        stash.open("sub1");

        for recipient in ["me", "other"] {
            let decision = evaluate(&info, &mut stash, &delivery(4, "p1", recipient));
            assert_eq!(decision, PolicyDecision::Reject(None));
        }
        assert_eq!(stash.events("sub1").map(<[_]>::len), Some(2));
    }

    #[test]
    fn unauthorized_direct_messages_without_an_open_slot_are_withheld_and_dropped() {
        let info = ConnectionInfo::with_id("c1", "127.0.0.1");
        let mut stash = Stash::new();

        let decision = evaluate(&info, &mut stash, &delivery(4, "p1", "me"));
        assert_eq!(decision, PolicyDecision::Reject(None));
        assert!(stash.is_empty());
    }

    #[test]
    fn authorized_direct_messages_pass_only_when_related() {
        let mut info = ConnectionInfo::with_id("c1", "127.0.0.1");
        assert!(info.authorize("me"));
        let mut stash = Stash::new();

        assert_eq!(
            evaluate(&info, &mut stash, &delivery(4, "p1", "me")),
            PolicyDecision::Accept
        );
        assert_eq!(
            evaluate(&info, &mut stash, &delivery(4, "me", "p2")),
            PolicyDecision::Accept
        );
        assert_eq!(
            evaluate(&info, &mut stash, &delivery(4, "p1", "other")),
            PolicyDecision::Reject(None)
        );
        assert!(stash.is_empty());
    }

    #[test]
    fn other_messages_are_left_to_later_policies() {
        let info = ConnectionInfo::with_id("c1", "127.0.0.1");
        let mut stash = Stash::new();

        assert_eq!(
            evaluate(&info, &mut stash, &delivery(1, "p1", "other")),
            PolicyDecision::Next
        );
        assert_eq!(
            evaluate(&info, &mut stash, &RelayMessage::Eose("sub1".into())),
            PolicyDecision::Next
        );
        assert!(stash.is_empty());
    }
}
