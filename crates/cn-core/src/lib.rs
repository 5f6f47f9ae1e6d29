pub mod config;
pub mod http;
pub mod logging;
pub mod metrics;
pub mod nostr;
pub mod server;
