//! Per-session listener registry.
//!
//! Every protocol or lifecycle event the session engine detects is emitted
//! here before policies run. Listeners get the typed payload plus a
//! [`SessionContext`], so they can react (maintain the stash, answer the
//! client) without the engine knowing about them.

use crate::auth::AuthFailure;
use crate::connection::ConnectionInfo;
use crate::message::RelayMessage;
use crate::stash::Stash;
use cn_core::nostr::RawEvent;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    AuthSuccess,
    AuthFailed,

    ClientConnect,
    ClientDisconnect,
    ClientError,
    ClientMsg,
    ClientAuth,
    ClientEvent,
    ClientRequest,
    ClientClose,

    ServerConnect,
    ServerDisconnect,
    ServerError,
    ServerMsg,
    ServerEvent,
    ServerOk,
    ServerEose,
    ServerNotice,
}

#[derive(Debug, Clone, Copy)]
pub enum SessionEvent<'a> {
    AuthSuccess {
        pubkey: &'a str,
    },
    AuthFailed {
        reason: &'a AuthFailure,
    },

    ClientConnect,
    ClientDisconnect,
    ClientError {
        error: &'a str,
    },
    ClientMsg {
        raw: &'a str,
    },
    ClientAuth {
        event: &'a RawEvent,
    },
    ClientEvent {
        event: &'a RawEvent,
    },
    ClientRequest {
        subscription_id: &'a str,
        filters: &'a [Value],
    },
    ClientClose {
        subscription_id: &'a str,
    },

    ServerConnect,
    ServerDisconnect,
    ServerError {
        error: &'a str,
    },
    ServerMsg {
        raw: &'a str,
    },
    ServerEvent {
        subscription_id: &'a str,
        event: &'a RawEvent,
    },
    ServerOk {
        event_id: &'a str,
        accepted: bool,
        message: &'a str,
    },
    ServerEose {
        subscription_id: &'a str,
    },
    ServerNotice {
        message: &'a str,
    },
}

impl SessionEvent<'_> {
    pub fn kind(&self) -> EventKind {
        match self {
            SessionEvent::AuthSuccess { .. } => EventKind::AuthSuccess,
            SessionEvent::AuthFailed { .. } => EventKind::AuthFailed,
            SessionEvent::ClientConnect => EventKind::ClientConnect,
            SessionEvent::ClientDisconnect => EventKind::ClientDisconnect,
            SessionEvent::ClientError { .. } => EventKind::ClientError,
            SessionEvent::ClientMsg { .. } => EventKind::ClientMsg,
            SessionEvent::ClientAuth { .. } => EventKind::ClientAuth,
            SessionEvent::ClientEvent { .. } => EventKind::ClientEvent,
            SessionEvent::ClientRequest { .. } => EventKind::ClientRequest,
            SessionEvent::ClientClose { .. } => EventKind::ClientClose,
            SessionEvent::ServerConnect => EventKind::ServerConnect,
            SessionEvent::ServerDisconnect => EventKind::ServerDisconnect,
            SessionEvent::ServerError { .. } => EventKind::ServerError,
            SessionEvent::ServerMsg { .. } => EventKind::ServerMsg,
            SessionEvent::ServerEvent { .. } => EventKind::ServerEvent,
            SessionEvent::ServerOk { .. } => EventKind::ServerOk,
            SessionEvent::ServerEose { .. } => EventKind::ServerEose,
            SessionEvent::ServerNotice { .. } => EventKind::ServerNotice,
        }
    }
}

/// Mutable view of one session handed to listeners and policies.
pub struct SessionContext<'s> {
    pub connection: &'s ConnectionInfo,
    pub stash: &'s mut Stash,
    outbox: &'s mut Vec<RelayMessage>,
}

impl<'s> SessionContext<'s> {
    pub fn new(
        connection: &'s ConnectionInfo,
        stash: &'s mut Stash,
        outbox: &'s mut Vec<RelayMessage>,
    ) -> Self {
        Self {
            connection,
            stash,
            outbox,
        }
    }

    /// Queued and written to the client socket, in order, once the current step finishes.
    pub fn send_to_client(&mut self, message: RelayMessage) {
        self.outbox.push(message);
    }
}

pub type Listener =
    Arc<dyn Fn(&SessionEvent<'_>, &mut SessionContext<'_>) -> anyhow::Result<()> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Clone, Default)]
pub struct EventBus {
    listeners: HashMap<EventKind, Vec<(ListenerId, Listener)>>,
    next_id: u64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on<F>(&mut self, kind: EventKind, listener: F) -> ListenerId
    where
        F: Fn(&SessionEvent<'_>, &mut SessionContext<'_>) -> anyhow::Result<()>
            + Send
            + Sync
            + 'static,
    {
        let id = ListenerId(self.next_id);
        self.next_id += 1;
        self.listeners
            .entry(kind)
            .or_default()
            .push((id, Arc::new(listener)));
        id
    }

    pub fn off(&mut self, kind: EventKind, id: ListenerId) -> bool {
        let Some(listeners) = self.listeners.get_mut(&kind) else {
            return false;
        };
        let before = listeners.len();
        listeners.retain(|(listener_id, _)| *listener_id != id);
        listeners.len() != before
    }

    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.listeners.get(&kind).map(Vec::len).unwrap_or(0)
    }

    /// Runs listeners in registration order. A failing listener is logged and
    /// does not stop the others.
    pub fn emit(&self, event: &SessionEvent<'_>, ctx: &mut SessionContext<'_>) {
        let kind = event.kind();
        let Some(listeners) = self.listeners.get(&kind) else {
            return;
        };
        for (id, listener) in listeners {
            if let Err(err) = listener(event, ctx) {
                tracing::warn!(
                    connection_id = %ctx.connection.connection_id(),
                    event = ?kind,
                    listener = id.0,
                    error = %err,
                    "session listener failed"
                );
            }
        }
    }
}
