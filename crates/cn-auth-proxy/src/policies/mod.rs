//! Policies shipped with the gateway.

mod accept;
mod direct_message;
mod event_sifter;

pub use accept::AcceptAll;
pub use direct_message::DirectMessageFilter;
pub use event_sifter::{EventSifter, KindAllowList, SiftInput, SiftOutcome, SiftRule, SourceType};
