use anyhow::{Context, Result};
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::{ConnectInfo, State, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use cn_core::{http, metrics, server};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

pub mod auth;
pub mod config;
pub mod connection;
pub mod events;
pub mod message;
pub mod policies;
pub mod policy;
pub mod relay_info;
pub mod session;
pub mod stash;
mod ws;

pub use config::ProxyConfig;
pub use session::{Outbound, Session, SessionBlueprint};

pub const SERVICE_NAME: &str = "cn-auth-proxy";

const RELAY_INFO_TIMEOUT: Duration = Duration::from_secs(10);
const NOT_A_CLIENT: &str = "Please use a Nostr client to connect.";

#[derive(Clone)]
pub struct AppState {
    config: Arc<ProxyConfig>,
    blueprint: SessionBlueprint,
    http_client: reqwest::Client,
    relay_info_url: String,
}

#[derive(Serialize)]
struct HealthStatus {
    status: String,
}

pub fn load_config() -> Result<ProxyConfig> {
    ProxyConfig::from_env()
}

pub fn build_state(config: ProxyConfig) -> Result<AppState> {
    let blueprint = SessionBlueprint::standard(SERVICE_NAME, &config)?;
    let relay_info_url = config.upstream_http_url()?;
    let http_client = reqwest::Client::builder()
        .timeout(RELAY_INFO_TIMEOUT)
        .build()
        .context("failed to build http client")?;
    Ok(AppState {
        config: Arc::new(config),
        blueprint,
        http_client,
        relay_info_url,
    })
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_endpoint))
        .with_state(state)
}

pub async fn run(config: ProxyConfig) -> Result<()> {
    metrics::init(SERVICE_NAME);
    let addr = config.addr;
    tracing::info!(
        upstream = %config.upstream_url,
        relay_url = %config.relay_public_url,
        idle_timeout_secs = config.idle_timeout.as_secs(),
        "starting auth proxy"
    );
    let state = build_state(config)?;
    let router = http::apply_standard_layers(router(state), SERVICE_NAME);
    server::serve(addr, router).await
}

async fn root(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    if relay_info::wants_relay_info(&headers) {
        return relay_info::relay_info_response(&state.http_client, &state.relay_info_url).await;
    }
    match upgrade {
        Ok(upgrade) => {
            let client_ip = client_ip(&headers, peer);
            upgrade.on_upgrade(move |socket| ws::handle_socket(state, client_ip, socket))
        }
        Err(_) => (StatusCode::BAD_REQUEST, NOT_A_CLIENT).into_response(),
    }
}

/// First `X-Forwarded-For` entry, else the transport peer.
fn client_ip(headers: &HeaderMap, peer: SocketAddr) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| peer.ip().to_string())
}

async fn healthz() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthStatus {
            status: "ok".into(),
        }),
    )
}

async fn metrics_endpoint() -> impl IntoResponse {
    metrics::metrics_response(SERVICE_NAME)
}


#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn client_ip_prefers_first_forwarded_entry() {
        let peer: SocketAddr = "10.0.0.9:5000".parse().unwrap();
        let mut headers = HeaderMap::new();
        assert_eq!(client_ip(&headers, peer), "10.0.0.9");

        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static(" 203.0.113.7 , 10.0.0.1"),
        );
        assert_eq!(client_ip(&headers, peer), "203.0.113.7");
    }
}
