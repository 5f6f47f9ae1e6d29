use crate::events::SessionContext;
use crate::policy::{Policy, PolicyDecision};

/// Terminal step: forwards whatever reached it.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl<M> Policy<M> for AcceptAll {
    fn name(&self) -> &'static str {
        "accept_all"
    }

    fn evaluate(
        &self,
        _message: &M,
        _ctx: &mut SessionContext<'_>,
    ) -> anyhow::Result<PolicyDecision<M>> {
        Ok(PolicyDecision::Accept)
    }
}
