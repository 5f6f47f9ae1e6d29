use anyhow::{anyhow, Context, Result};
use clap::Args;
use cn_core::nostr::{self, KIND_CLIENT_AUTH};
use futures_util::{SinkExt, StreamExt};
use ::nostr::prelude::Keys;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{info, warn};

const SUBSCRIPTION_ID: &str = "probe";

#[derive(Args, Clone, Debug)]
pub struct ProbeArgs {
    /// Gateway WebSocket URL
    #[arg(long, default_value = "ws://localhost:3000")]
    pub url: String,

    /// Value for the AUTH `relay` tag (defaults to --url)
    #[arg(long)]
    pub relay_url: Option<String>,

    /// Kinds to subscribe to
    #[arg(long, value_delimiter = ',', default_value = "4")]
    pub kinds: Vec<u32>,

    /// Hex or bech32 secret key; a fresh one is generated when omitted
    #[arg(long, env = "PROBE_SECRET_KEY")]
    pub secret_key: Option<String>,

    /// Give up after this many seconds without a frame
    #[arg(long, default_value_t = 30)]
    pub wait_seconds: u64,
}

pub async fn run(args: ProbeArgs) -> Result<()> {
    let keys = match args.secret_key.as_deref() {
        Some(secret) => Keys::parse(secret).map_err(|err| anyhow!("invalid secret key: {err}"))?,
        None => Keys::generate(),
    };
    let pubkey = keys.public_key().to_hex();
    let relay_url = args.relay_url.clone().unwrap_or_else(|| args.url.clone());
    info!(url = %args.url, pubkey = %pubkey, "probe connecting");

    let (mut stream, _) = connect_async(args.url.as_str())
        .await
        .with_context(|| format!("failed to connect to {}", args.url))?;

    // Direct messages to us and from us.
    let request = json!([
        "REQ",
        SUBSCRIPTION_ID,
        {"kinds": args.kinds, "#p": [pubkey]},
        {"kinds": args.kinds, "authors": [pubkey]}
    ]);
    stream.send(Message::Text(request.to_string())).await?;

    let wait = Duration::from_secs(args.wait_seconds.max(1));
    loop {
        let frame = match timeout(wait, stream.next()).await {
            Err(_) => {
                info!(seconds = wait.as_secs(), "no frames; stopping");
                break;
            }
            Ok(None) | Ok(Some(Ok(Message::Close(_)))) => {
                info!("connection closed");
                break;
            }
            Ok(Some(Err(err))) => return Err(err.into()),
            Ok(Some(Ok(Message::Text(text)))) => text,
            Ok(Some(Ok(_))) => continue,
        };
        println!("{frame}");

        let Ok(Value::Array(items)) = serde_json::from_str::<Value>(&frame) else {
            warn!("unparseable frame");
            continue;
        };
        if items.first().and_then(Value::as_str) != Some("AUTH") {
            continue;
        }
        let Some(challenge) = items.get(1).and_then(Value::as_str) else {
            continue;
        };
        let event = nostr::build_signed_event(
            &keys,
            KIND_CLIENT_AUTH as u16,
            vec![
                vec!["challenge".to_string(), challenge.to_string()],
                vec!["relay".to_string(), relay_url.clone()],
            ],
            String::new(),
        )?;
        stream
            .send(Message::Text(json!(["AUTH", event]).to_string()))
            .await?;
        info!(challenge = %challenge, "answered auth challenge");
    }

    let _ = stream.close(None).await;
    Ok(())
}
