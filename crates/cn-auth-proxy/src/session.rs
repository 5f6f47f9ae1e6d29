//! Per-connection protocol engine.
//!
//! A [`Session`] owns the [`ConnectionInfo`] and [`Stash`] of one client and
//! turns every socket event into a list of [`Outbound`] frames. It never does
//! I/O itself; the WebSocket bridge in `ws.rs` feeds it and writes the result,
//! one event at a time, which keeps all session state single-owner.

use crate::auth::{self, AuthOutcome, AuthVerifier};
use crate::config::ProxyConfig;
use crate::connection::ConnectionInfo;
use crate::events::{EventBus, SessionContext, SessionEvent};
use crate::message::{ClientMessage, MessageError, RelayMessage};
use crate::policies::{AcceptAll, DirectMessageFilter, EventSifter, KindAllowList};
use crate::policy::{Pipeline, Verdict};
use crate::stash::{self, Stash};
use anyhow::Result;
use cn_core::metrics;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    ToClient(RelayMessage),
    ToUpstream(ClientMessage),
}

/// Listener and pipeline template shared by every session. Cloned per
/// connection so sessions never share mutable state.
#[derive(Clone)]
pub struct SessionBlueprint {
    service_name: &'static str,
    bus: EventBus,
    client_pipeline: Pipeline<ClientMessage>,
    server_pipeline: Pipeline<RelayMessage>,
    auth: Arc<AuthVerifier>,
}

impl SessionBlueprint {
    /// Bare blueprint: no listeners, empty pipelines.
    pub fn new(service_name: &'static str, auth: AuthVerifier) -> Self {
        Self {
            service_name,
            bus: EventBus::new(),
            client_pipeline: Pipeline::new(),
            server_pipeline: Pipeline::new(),
            auth: Arc::new(auth),
        }
    }

    /// The gateway's wiring: challenge on connect, NOTICE on auth failure,
    /// stash upkeep and replay, optional kind sifting of client events and
    /// the direct message filter on deliveries.
    pub fn standard(service_name: &'static str, config: &ProxyConfig) -> Result<Self> {
        let verifier = AuthVerifier::new(&config.relay_public_url, config.auth_time_window_seconds)?;
        let mut blueprint = Self::new(service_name, verifier);
        auth::register_listeners(&mut blueprint.bus, config.send_auth_on_connect);
        stash::register_listeners(&mut blueprint.bus, service_name);

        let mut client_pipeline = Pipeline::new();
        if let Some(kinds) = &config.allowed_client_kinds {
            client_pipeline =
                client_pipeline.with(EventSifter::new().rule(KindAllowList::new(kinds.iter().copied())));
        }
        blueprint.client_pipeline = client_pipeline.with(AcceptAll);
        blueprint.server_pipeline = Pipeline::new()
            .with(DirectMessageFilter::new(service_name))
            .with(AcceptAll);
        Ok(blueprint)
    }

    pub fn bus_mut(&mut self) -> &mut EventBus {
        &mut self.bus
    }

    pub fn with_client_pipeline(mut self, pipeline: Pipeline<ClientMessage>) -> Self {
        self.client_pipeline = pipeline;
        self
    }

    pub fn with_server_pipeline(mut self, pipeline: Pipeline<RelayMessage>) -> Self {
        self.server_pipeline = pipeline;
        self
    }

    pub fn relay_url(&self) -> &str {
        self.auth.relay_url()
    }

    pub fn start(&self, info: ConnectionInfo) -> Session {
        Session {
            service_name: self.service_name,
            info,
            stash: Stash::new(),
            bus: self.bus.clone(),
            client_pipeline: self.client_pipeline.clone(),
            server_pipeline: self.server_pipeline.clone(),
            auth: Arc::clone(&self.auth),
        }
    }
}

pub struct Session {
    service_name: &'static str,
    info: ConnectionInfo,
    stash: Stash,
    bus: EventBus,
    client_pipeline: Pipeline<ClientMessage>,
    server_pipeline: Pipeline<RelayMessage>,
    auth: Arc<AuthVerifier>,
}

impl Session {
    pub fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    pub fn stash(&self) -> &Stash {
        &self.stash
    }

    pub fn client_connected(&mut self) -> Vec<Outbound> {
        let mut outbox = Vec::new();
        self.emit(SessionEvent::ClientConnect, &mut outbox);
        to_client(outbox)
    }

    /// Handles one text frame from the client. `now` is unix seconds and is
    /// only used to judge AUTH timestamps.
    pub fn client_text(&mut self, text: &str, now: i64) -> Vec<Outbound> {
        let mut outbox = Vec::new();
        self.emit(SessionEvent::ClientMsg { raw: text }, &mut outbox);

        let message = match ClientMessage::parse(text) {
            Ok(message) => message,
            Err(MessageError::Shape { tag: "AUTH", reason }) => {
                let outcome = self.auth.reject_malformed(&self.info, reason);
                self.settle_auth(outcome, &mut outbox);
                return to_client(outbox);
            }
            Err(err) => {
                tracing::debug!(
                    connection_id = %self.info.connection_id(),
                    error = %err,
                    "dropping malformed client frame"
                );
                metrics::inc_proxy_message(
                    self.service_name,
                    metrics::DIRECTION_CLIENT,
                    metrics::OUTCOME_MALFORMED,
                );
                return to_client(outbox);
            }
        };

        match &message {
            ClientMessage::Auth(event) => {
                self.emit(SessionEvent::ClientAuth { event }, &mut outbox);
                self.authenticate(event, now, &mut outbox);
                // AUTH terminates here.
                return to_client(outbox);
            }
            ClientMessage::Event(event) => {
                self.emit(SessionEvent::ClientEvent { event }, &mut outbox)
            }
            ClientMessage::Req {
                subscription_id,
                filters,
            } => self.emit(
                SessionEvent::ClientRequest {
                    subscription_id,
                    filters,
                },
                &mut outbox,
            ),
            ClientMessage::Close(subscription_id) => {
                self.emit(SessionEvent::ClientClose { subscription_id }, &mut outbox)
            }
            ClientMessage::Other(_) => {}
        }

        let verdict = {
            let mut ctx = SessionContext::new(&self.info, &mut self.stash, &mut outbox);
            self.client_pipeline.run(message, &mut ctx)
        };
        let mut out = to_client(outbox);
        match verdict {
            Verdict::Forward(message) => {
                metrics::inc_proxy_message(
                    self.service_name,
                    metrics::DIRECTION_CLIENT,
                    metrics::OUTCOME_FORWARDED,
                );
                out.push(Outbound::ToUpstream(message));
            }
            Verdict::Drop { reply } => {
                metrics::inc_proxy_message(
                    self.service_name,
                    metrics::DIRECTION_CLIENT,
                    metrics::OUTCOME_REJECTED,
                );
                out.extend(reply.map(Outbound::ToClient));
            }
        }
        out
    }

    pub fn client_disconnected(&mut self) {
        self.emit_silently(SessionEvent::ClientDisconnect);
    }

    pub fn client_error(&mut self, error: &str) {
        self.emit_silently(SessionEvent::ClientError { error });
    }

    pub fn upstream_connected(&mut self) -> Vec<Outbound> {
        let mut outbox = Vec::new();
        self.emit(SessionEvent::ServerConnect, &mut outbox);
        to_client(outbox)
    }

    pub fn upstream_text(&mut self, text: &str) -> Vec<Outbound> {
        let mut outbox = Vec::new();
        self.emit(SessionEvent::ServerMsg { raw: text }, &mut outbox);

        let message = match RelayMessage::parse(text) {
            Ok(message) => message,
            Err(err) => {
                tracing::debug!(
                    connection_id = %self.info.connection_id(),
                    error = %err,
                    "dropping malformed upstream frame"
                );
                metrics::inc_proxy_message(
                    self.service_name,
                    metrics::DIRECTION_SERVER,
                    metrics::OUTCOME_MALFORMED,
                );
                return to_client(outbox);
            }
        };

        match &message {
            RelayMessage::Event {
                subscription_id,
                event,
            } => self.emit(
                SessionEvent::ServerEvent {
                    subscription_id,
                    event,
                },
                &mut outbox,
            ),
            RelayMessage::Ok {
                event_id,
                accepted,
                message,
            } => self.emit(
                SessionEvent::ServerOk {
                    event_id,
                    accepted: *accepted,
                    message,
                },
                &mut outbox,
            ),
            RelayMessage::Eose(subscription_id) => {
                self.emit(SessionEvent::ServerEose { subscription_id }, &mut outbox)
            }
            RelayMessage::Notice(message) => {
                self.emit(SessionEvent::ServerNotice { message }, &mut outbox)
            }
            RelayMessage::Auth(_) | RelayMessage::Other(_) => {}
        }

        let verdict = {
            let mut ctx = SessionContext::new(&self.info, &mut self.stash, &mut outbox);
            self.server_pipeline.run(message, &mut ctx)
        };
        let mut out = to_client(outbox);
        match verdict {
            Verdict::Forward(message) => {
                metrics::inc_proxy_message(
                    self.service_name,
                    metrics::DIRECTION_SERVER,
                    metrics::OUTCOME_FORWARDED,
                );
                out.push(Outbound::ToClient(message));
            }
            Verdict::Drop { reply } => {
                metrics::inc_proxy_message(
                    self.service_name,
                    metrics::DIRECTION_SERVER,
                    metrics::OUTCOME_REJECTED,
                );
                out.extend(reply.map(Outbound::ToClient));
            }
        }
        out
    }

    pub fn upstream_disconnected(&mut self) {
        self.emit_silently(SessionEvent::ServerDisconnect);
    }

    pub fn upstream_error(&mut self, error: &str) {
        self.emit_silently(SessionEvent::ServerError { error });
    }

    fn authenticate(
        &mut self,
        event: &cn_core::nostr::RawEvent,
        now: i64,
        outbox: &mut Vec<RelayMessage>,
    ) {
        let outcome = self.auth.verify(event, &mut self.info, now);
        self.settle_auth(outcome, outbox);
    }

    fn settle_auth(&mut self, outcome: AuthOutcome, outbox: &mut Vec<RelayMessage>) {
        match outcome {
            AuthOutcome::Authorized(pubkey) => {
                tracing::info!(
                    connection_id = %self.info.connection_id(),
                    pubkey = %pubkey,
                    "client authenticated"
                );
                metrics::inc_auth_success(self.service_name);
                metrics::dec_ws_unauthenticated_connections(self.service_name);
                self.emit(SessionEvent::AuthSuccess { pubkey: &pubkey }, outbox);
            }
            AuthOutcome::AlreadyAuthorized => {
                tracing::debug!(
                    connection_id = %self.info.connection_id(),
                    "ignoring AUTH on an authorized session"
                );
            }
            AuthOutcome::Rejected(failure) => {
                metrics::inc_auth_failure(self.service_name);
                self.emit(SessionEvent::AuthFailed { reason: &failure }, outbox);
            }
        }
    }

    fn emit(&mut self, event: SessionEvent<'_>, outbox: &mut Vec<RelayMessage>) {
        let mut ctx = SessionContext::new(&self.info, &mut self.stash, outbox);
        self.bus.emit(&event, &mut ctx);
    }

    /// For events after which nothing can be written to the client.
    fn emit_silently(&mut self, event: SessionEvent<'_>) {
        let mut discarded = Vec::new();
        self.emit(event, &mut discarded);
    }
}

fn to_client(outbox: Vec<RelayMessage>) -> Vec<Outbound> {
    outbox.into_iter().map(Outbound::ToClient).collect()
}
