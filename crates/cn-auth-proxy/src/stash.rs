//! Withholding of encrypted direct messages (kind 4) until the client has
//! authenticated, and their filtered replay afterwards.
//!
//! The stash is only written to while the session is unauthorized. After a
//! successful AUTH every slot is drained at once: related events are replayed
//! under their original subscription id, the rest are dropped for good.

use crate::events::{EventBus, EventKind, SessionEvent};
use crate::message::RelayMessage;
use cn_core::metrics;
use cn_core::nostr::RawEvent;
use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct Stash {
    slots: HashMap<String, Vec<RawEvent>>,
}

/// Result of draining the stash for a verified pubkey.
#[derive(Debug, Default, PartialEq)]
pub struct Replay {
    pub delivered: Vec<(String, RawEvent)>,
    pub discarded: usize,
}

impl Stash {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts an empty slot for a subscription. A REQ reusing an id replaces
    /// the old subscription, so whatever was buffered for it goes away.
    pub fn open(&mut self, subscription_id: &str) -> usize {
        self.slots
            .insert(subscription_id.to_string(), Vec::new())
            .map(|previous| previous.len())
            .unwrap_or(0)
    }

    /// Buffers an event under an open subscription. Returns false, keeping
    /// nothing, when the subscription was never opened or already abandoned.
    pub fn push(&mut self, subscription_id: &str, event: RawEvent) -> bool {
        match self.slots.get_mut(subscription_id) {
            Some(events) => {
                events.push(event);
                true
            }
            None => false,
        }
    }

    /// Removes one subscription's slot and returns how many events it held.
    pub fn abandon(&mut self, subscription_id: &str) -> Option<usize> {
        self.slots.remove(subscription_id).map(|events| events.len())
    }

    pub fn contains(&self, subscription_id: &str) -> bool {
        self.slots.contains_key(subscription_id)
    }

    pub fn events(&self, subscription_id: &str) -> Option<&[RawEvent]> {
        self.slots.get(subscription_id).map(Vec::as_slice)
    }

    pub fn subscription_count(&self) -> usize {
        self.slots.len()
    }

    pub fn event_count(&self) -> usize {
        self.slots.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Empties the stash unconditionally. Per subscription, arrival order is
    /// kept; the order across subscriptions is unspecified.
    pub fn drain_related(&mut self, pubkey: &str) -> Replay {
        let mut replay = Replay::default();
        for (subscription_id, events) in self.slots.drain() {
            for event in events {
                if is_related_event(pubkey, &event) {
                    replay.delivered.push((subscription_id.clone(), event));
                } else {
                    replay.discarded += 1;
                }
            }
        }
        replay
    }
}

/// True when the event was written by `pubkey` or addresses it with a `p` tag.
pub fn is_related_event(pubkey: &str, event: &RawEvent) -> bool {
    event.pubkey == pubkey || event.has_tag_value("p", pubkey)
}

/// Wires stash maintenance into a session's bus: REQ opens a slot and CLOSE
/// abandons it while unauthorized; AUTH success replays and clears everything.
pub fn register_listeners(bus: &mut EventBus, service_name: &'static str) {
    bus.on(EventKind::ClientRequest, |event, ctx| {
        if let SessionEvent::ClientRequest {
            subscription_id, ..
        } = event
        {
            if !ctx.connection.client_authorized() {
                let dropped = ctx.stash.open(subscription_id);
                if dropped > 0 {
                    tracing::debug!(
                        connection_id = %ctx.connection.connection_id(),
                        subscription_id = %subscription_id,
                        dropped,
                        "subscription replaced; stashed events dropped"
                    );
                }
            }
        }
        Ok(())
    });

    bus.on(EventKind::ClientClose, move |event, ctx| {
        if let SessionEvent::ClientClose { subscription_id } = event {
            if !ctx.connection.client_authorized() {
                if let Some(dropped) = ctx.stash.abandon(subscription_id) {
                    metrics::add_stash_events(service_name, metrics::STASH_DISCARDED, dropped);
                }
            }
        }
        Ok(())
    });

    bus.on(EventKind::AuthSuccess, move |event, ctx| {
        let SessionEvent::AuthSuccess { pubkey } = event else {
            return Ok(());
        };
        let replay = ctx.stash.drain_related(pubkey);
        tracing::info!(
            connection_id = %ctx.connection.connection_id(),
            replayed = replay.delivered.len(),
            discarded = replay.discarded,
            "stash flushed after auth"
        );
        metrics::add_stash_events(service_name, metrics::STASH_REPLAYED, replay.delivered.len());
        metrics::add_stash_events(service_name, metrics::STASH_DISCARDED, replay.discarded);
        for (subscription_id, event) in replay.delivered {
            ctx.send_to_client(RelayMessage::Event {
                subscription_id,
                event,
            });
        }
        Ok(())
    });
}
