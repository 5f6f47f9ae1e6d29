//! NIP-42 verification and the one-way authorization transition.

use crate::connection::ConnectionInfo;
use crate::events::{EventBus, EventKind, SessionEvent};
use crate::message::RelayMessage;
use anyhow::{Context, Result};
use cn_core::nostr::{self, RawEvent, KIND_CLIENT_AUTH};
use reqwest::Url;
use std::sync::Arc;
use thiserror::Error;

pub const AUTH_FAILED_NOTICE: &str = "restricted: auth failed";

/// Why an AUTH event was refused. Only logged; the client always gets the
/// same generic NOTICE.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthFailure {
    #[error("malformed auth event: {0}")]
    Malformed(String),
    #[error("unexpected kind {0}")]
    WrongKind(u32),
    #[error("invalid event: {0}")]
    BadSignature(String),
    #[error("created_at {created_at} outside the allowed window around {now}")]
    StaleTimestamp { created_at: i64, now: i64 },
    #[error("challenge tag does not match")]
    ChallengeMismatch,
    #[error("relay tag does not match")]
    RelayMismatch,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    Authorized(String),
    /// A repeated AUTH after success. Ignored without re-verification.
    AlreadyAuthorized,
    Rejected(AuthFailure),
}

/// Id hash and signature check. Treated as a trusted boolean oracle.
pub trait EventVerifier: Send + Sync {
    fn verify(&self, event: &RawEvent) -> Result<()>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SignatureVerifier;

impl EventVerifier for SignatureVerifier {
    fn verify(&self, event: &RawEvent) -> Result<()> {
        nostr::verify_event(event)
    }
}

/// Normalizes a relay URL the way browsers do (`wss://Relay.example` becomes
/// `wss://relay.example/`), so the `relay` tag compares by meaning.
pub fn canonical_relay_url(raw: &str) -> Result<String> {
    let url = Url::parse(raw.trim()).with_context(|| format!("invalid relay url: {raw}"))?;
    Ok(url.to_string())
}

#[derive(Clone)]
pub struct AuthVerifier {
    relay_url: String,
    time_window: i64,
    verifier: Arc<dyn EventVerifier>,
}

impl AuthVerifier {
    pub fn new(relay_url: &str, time_window_seconds: u64) -> Result<Self> {
        Self::with_verifier(relay_url, time_window_seconds, Arc::new(SignatureVerifier))
    }

    pub fn with_verifier(
        relay_url: &str,
        time_window_seconds: u64,
        verifier: Arc<dyn EventVerifier>,
    ) -> Result<Self> {
        Ok(Self {
            relay_url: canonical_relay_url(relay_url)?,
            time_window: i64::try_from(time_window_seconds)
                .context("auth time window is too large")?,
            verifier,
        })
    }

    pub fn relay_url(&self) -> &str {
        &self.relay_url
    }

    /// Validates an AUTH event against `challenge` at time `now` without
    /// touching any session state.
    pub fn check(&self, event: &RawEvent, challenge: &str, now: i64) -> Result<(), AuthFailure> {
        if event.kind != KIND_CLIENT_AUTH {
            return Err(AuthFailure::WrongKind(event.kind));
        }
        self.verifier
            .verify(event)
            .map_err(|err| AuthFailure::BadSignature(err.to_string()))?;

        let created_at = event.created_at;
        let in_window = created_at > now.saturating_sub(self.time_window)
            && created_at < now.saturating_add(self.time_window);
        if !in_window {
            return Err(AuthFailure::StaleTimestamp { created_at, now });
        }

        let mut challenge_ok = false;
        let mut relay_ok = false;
        for tag in &event.tags {
            let [name, value] = tag.as_slice() else {
                continue;
            };
            match name.as_str() {
                "challenge" if value == challenge => challenge_ok = true,
                "relay" if self.relay_matches(value) => relay_ok = true,
                _ => {}
            }
        }
        if !challenge_ok {
            return Err(AuthFailure::ChallengeMismatch);
        }
        if !relay_ok {
            return Err(AuthFailure::RelayMismatch);
        }
        Ok(())
    }

    /// Runs [`AuthVerifier::check`] with the session's challenge and, on
    /// success, binds the event's pubkey to the session.
    pub fn verify(&self, event: &RawEvent, info: &mut ConnectionInfo, now: i64) -> AuthOutcome {
        if info.client_authorized() {
            return AuthOutcome::AlreadyAuthorized;
        }
        match self.check(event, info.connection_id(), now) {
            Ok(()) => {
                if info.authorize(&event.pubkey) {
                    AuthOutcome::Authorized(event.pubkey.clone())
                } else {
                    AuthOutcome::AlreadyAuthorized
                }
            }
            Err(failure) => AuthOutcome::Rejected(failure),
        }
    }

    /// Outcome for an AUTH frame whose event did not parse. Counts as a
    /// failed attempt unless the session is already authorized.
    pub fn reject_malformed(&self, info: &ConnectionInfo, reason: String) -> AuthOutcome {
        if info.client_authorized() {
            return AuthOutcome::AlreadyAuthorized;
        }
        AuthOutcome::Rejected(AuthFailure::Malformed(reason))
    }

    fn relay_matches(&self, value: &str) -> bool {
        canonical_relay_url(value)
            .map(|url| url == self.relay_url)
            .unwrap_or(false)
    }
}

/// Challenge on connect (optional) and the generic NOTICE on failure.
pub fn register_listeners(bus: &mut EventBus, send_auth_on_connect: bool) {
    if send_auth_on_connect {
        bus.on(EventKind::ClientConnect, |_, ctx| {
            let challenge = ctx.connection.connection_id().to_string();
            ctx.send_to_client(RelayMessage::Auth(challenge));
            Ok(())
        });
    }

    bus.on(EventKind::AuthFailed, |event, ctx| {
        if let SessionEvent::AuthFailed { reason } = event {
            tracing::info!(
                connection_id = %ctx.connection.connection_id(),
                reason = %reason,
                "auth rejected"
            );
        }
        ctx.send_to_client(RelayMessage::notice(AUTH_FAILED_NOTICE));
        Ok(())
    });
}
