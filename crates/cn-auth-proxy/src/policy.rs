//! Ordered interception chains, one per direction.

use crate::events::SessionContext;
use crate::message::RelayMessage;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
pub enum PolicyDecision<M> {
    /// Forward the message as received and stop.
    Accept,
    /// Forward a replacement message and stop.
    Rewrite(M),
    /// Drop the message and stop. The optional reply goes to the client.
    Reject(Option<RelayMessage>),
    /// No opinion; the next policy decides.
    Next,
}

/// A single step of a [`Pipeline`].
///
/// Policies see the session through [`SessionContext`]: connection info is
/// read-only, the stash is shared mutable state.
pub trait Policy<M>: Send + Sync {
    fn name(&self) -> &'static str;

    fn evaluate(
        &self,
        message: &M,
        ctx: &mut SessionContext<'_>,
    ) -> anyhow::Result<PolicyDecision<M>>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum Verdict<M> {
    Forward(M),
    Drop { reply: Option<RelayMessage> },
}

pub struct Pipeline<M> {
    policies: Vec<Arc<dyn Policy<M>>>,
}

impl<M> Clone for Pipeline<M> {
    fn clone(&self) -> Self {
        Self {
            policies: self.policies.clone(),
        }
    }
}

impl<M> Default for Pipeline<M> {
    fn default() -> Self {
        Self {
            policies: Vec::new(),
        }
    }
}

impl<M> Pipeline<M> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<P>(mut self, policy: P) -> Self
    where
        P: Policy<M> + 'static,
    {
        self.policies.push(Arc::new(policy));
        self
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.policies.iter().map(|policy| policy.name()).collect()
    }

    /// Evaluates policies strictly in order and stops at the first accept or
    /// reject. A policy error counts as `Next`. Undecided messages are forwarded.
    pub fn run(&self, message: M, ctx: &mut SessionContext<'_>) -> Verdict<M> {
        for policy in &self.policies {
            match policy.evaluate(&message, ctx) {
                Ok(PolicyDecision::Accept) => return Verdict::Forward(message),
                Ok(PolicyDecision::Rewrite(rewritten)) => return Verdict::Forward(rewritten),
                Ok(PolicyDecision::Reject(reply)) => return Verdict::Drop { reply },
                Ok(PolicyDecision::Next) => {}
                Err(err) => {
                    tracing::warn!(
                        connection_id = %ctx.connection.connection_id(),
                        policy = policy.name(),
                        error = %err,
                        "policy failed; treating as next"
                    );
                }
            }
        }
        Verdict::Forward(message)
    }
}
