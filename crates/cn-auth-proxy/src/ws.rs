use anyhow::{bail, Result};
use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use cn_core::{metrics, nostr};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::borrow::Cow;
use std::collections::VecDeque;
use tokio::net::TcpStream;
use tokio::time::{sleep, Instant};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame as UpstreamCloseFrame;
use tokio_tungstenite::tungstenite::{Error as UpstreamError, Message as UpstreamMessage};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::connection::ConnectionInfo;
use crate::message::{ClientMessage, RelayMessage};
use crate::session::Outbound;
use crate::{AppState, SERVICE_NAME};

/// Client frames held while the upstream connect is still pending. Past this
/// the session is closed.
const MAX_PENDING_UPSTREAM_FRAMES: usize = 1024;

type UpstreamStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type ClientSink = SplitSink<WebSocket, Message>;
type UpstreamSink = SplitSink<UpstreamStream, UpstreamMessage>;

/// Where client frames go: queued until the upstream socket opens, then
/// written straight through.
struct UpstreamLeg {
    sink: Option<UpstreamSink>,
    pending: VecDeque<ClientMessage>,
}

impl UpstreamLeg {
    async fn send(&mut self, message: ClientMessage) -> Result<()> {
        match self.sink.as_mut() {
            Some(sink) => {
                sink.send(UpstreamMessage::Text(message.to_json())).await?;
            }
            None => {
                if self.pending.len() >= MAX_PENDING_UPSTREAM_FRAMES {
                    bail!("upstream not connected and {MAX_PENDING_UPSTREAM_FRAMES} frames already queued");
                }
                self.pending.push_back(message);
            }
        }
        Ok(())
    }

    /// Releases everything queued before the socket opened, in order.
    async fn open(&mut self, sink: UpstreamSink) -> Result<()> {
        let sink = self.sink.insert(sink);
        while let Some(message) = self.pending.pop_front() {
            sink.send(UpstreamMessage::Text(message.to_json())).await?;
        }
        Ok(())
    }

    async fn close(&mut self) {
        if let Some(mut sink) = self.sink.take() {
            let frame = UpstreamCloseFrame {
                code: CloseCode::Normal,
                reason: Cow::Borrowed(""),
            };
            let _ = sink.send(UpstreamMessage::Close(Some(frame))).await;
            let _ = sink.close().await;
        }
    }
}

pub(crate) async fn handle_socket(state: AppState, client_ip: String, socket: WebSocket) {
    metrics::inc_ws_connections(SERVICE_NAME);
    metrics::inc_ws_unauthenticated_connections(SERVICE_NAME);

    let mut session = state.blueprint.start(ConnectionInfo::new(client_ip.clone()));
    let connection_id = session.info().connection_id().to_string();
    tracing::info!(connection_id = %connection_id, client_ip = %client_ip, "client connected");

    let (mut client_tx, mut client_rx) = socket.split();
    let mut upstream = UpstreamLeg {
        sink: None,
        pending: VecDeque::new(),
    };
    let mut upstream_rx: Option<SplitStream<UpstreamStream>> = None;

    let forwarded_for = state.config.forward_client_ip.then(|| client_ip.clone());
    let connect = connect_upstream(state.config.upstream_url.clone(), forwarded_for);
    tokio::pin!(connect);
    let mut connecting = true;

    let idle_timeout = state.config.idle_timeout;
    let idle = sleep(idle_timeout);
    tokio::pin!(idle);

    let greeting = session.client_connected();
    let mut reason = match deliver(greeting, &mut client_tx, &mut upstream).await {
        Ok(()) => None,
        Err(_) => Some("client send failed"),
    };

    while reason.is_none() {
        tokio::select! {
            _ = &mut idle => {
                metrics::inc_idle_timeout(SERVICE_NAME);
                reason = Some("idle timeout");
            }
            result = &mut connect, if connecting => {
                connecting = false;
                match result {
                    Ok(stream) => {
                        idle.as_mut().reset(Instant::now() + idle_timeout);
                        tracing::debug!(connection_id = %connection_id, "upstream connected");
                        let (sink, stream) = stream.split();
                        upstream_rx = Some(stream);
                        let greeting = session.upstream_connected();
                        let sent = match upstream.open(sink).await {
                            Ok(()) => deliver(greeting, &mut client_tx, &mut upstream).await,
                            Err(err) => Err(err),
                        };
                        if sent.is_err() {
                            reason = Some("send failed");
                        }
                    }
                    Err(err) => {
                        tracing::warn!(
                            connection_id = %connection_id,
                            upstream = %state.config.upstream_url,
                            error = %err,
                            "upstream connect failed"
                        );
                        metrics::inc_upstream_connect_failure(SERVICE_NAME);
                        session.upstream_error(&err.to_string());
                        upstream.pending.clear();
                        reason = Some("upstream connect failed");
                    }
                }
            }
            msg = client_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        idle.as_mut().reset(Instant::now() + idle_timeout);
                        tracing::debug!(connection_id = %connection_id, frame = %text, "client frame");
                        let now = nostr::unix_seconds().unwrap_or(0) as i64;
                        let out = session.client_text(&text, now);
                        if let Err(err) = deliver(out, &mut client_tx, &mut upstream).await {
                            tracing::warn!(connection_id = %connection_id, error = %err, "client frame not delivered");
                            reason = Some("send failed");
                        }
                    }
                    Some(Ok(Message::Binary(_))) => {
                        let notice = RelayMessage::notice("unsupported: binary message");
                        if send_to_client(&mut client_tx, &notice).await.is_err() {
                            reason = Some("client send failed");
                        }
                    }
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) | None => {
                        session.client_disconnected();
                        reason = Some("client closed");
                    }
                    Some(Err(err)) => {
                        session.client_error(&err.to_string());
                        reason = Some("client error");
                    }
                }
            }
            msg = next_upstream(&mut upstream_rx) => {
                match msg {
                    Some(Ok(UpstreamMessage::Text(text))) => {
                        idle.as_mut().reset(Instant::now() + idle_timeout);
                        tracing::debug!(connection_id = %connection_id, frame = %text, "upstream frame");
                        let out = session.upstream_text(&text);
                        if deliver(out, &mut client_tx, &mut upstream).await.is_err() {
                            reason = Some("send failed");
                        }
                    }
                    Some(Ok(UpstreamMessage::Close(_))) | None => {
                        session.upstream_disconnected();
                        reason = Some("upstream closed");
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        session.upstream_error(&err.to_string());
                        reason = Some("upstream error");
                    }
                }
            }
        }
    }

    let frame = CloseFrame {
        code: close_code::NORMAL,
        reason: Cow::Borrowed(""),
    };
    let _ = client_tx.send(Message::Close(Some(frame))).await;
    let _ = client_tx.close().await;
    upstream.close().await;

    tracing::info!(
        connection_id = %connection_id,
        reason = reason.unwrap_or("closed"),
        authorized = session.info().client_authorized(),
        "session closed"
    );
    if !session.info().client_authorized() {
        metrics::dec_ws_unauthenticated_connections(SERVICE_NAME);
    }
    metrics::dec_ws_connections(SERVICE_NAME);
}

async fn connect_upstream(url: String, forwarded_for: Option<String>) -> Result<UpstreamStream> {
    let mut request = url.as_str().into_client_request()?;
    if let Some(ip) = forwarded_for {
        request
            .headers_mut()
            .insert("X-Forwarded-For", HeaderValue::from_str(&ip)?);
    }
    let (stream, _) = connect_async(request).await?;
    Ok(stream)
}

async fn next_upstream(
    stream: &mut Option<SplitStream<UpstreamStream>>,
) -> Option<Result<UpstreamMessage, UpstreamError>> {
    match stream {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

async fn deliver(out: Vec<Outbound>, client_tx: &mut ClientSink, upstream: &mut UpstreamLeg) -> Result<()> {
    for outbound in out {
        match outbound {
            Outbound::ToClient(message) => send_to_client(client_tx, &message).await?,
            Outbound::ToUpstream(message) => upstream.send(message).await?,
        }
    }
    Ok(())
}

async fn send_to_client(client_tx: &mut ClientSink, message: &RelayMessage) -> Result<()> {
    client_tx.send(Message::Text(message.to_json())).await?;
    Ok(())
}
