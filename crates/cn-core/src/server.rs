use anyhow::Result;
use axum::Router;
use std::future::Future;
use std::net::SocketAddr;
use tokio::net::TcpListener;

/// Binds `addr` and serves until ctrl-c.
pub async fn serve(addr: SocketAddr, router: Router) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    serve_listener(listener, router, ctrl_c()).await
}

/// Serves on an already bound listener until `shutdown` resolves. Peer
/// addresses are exposed through `ConnectInfo`, which the proxy needs for
/// client IPs. Upgraded sockets are detached and are not drained on shutdown.
pub async fn serve_listener<F>(listener: TcpListener, router: Router, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = listener.local_addr()?;
    tracing::info!(%addr, "listening");

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await?;

    tracing::info!(%addr, "stopped listening");
    Ok(())
}

async fn ctrl_c() {
    if tokio::signal::ctrl_c().await.is_ok() {
        tracing::info!("shutdown requested");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::get;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn serve_listener_returns_once_shutdown_resolves() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let router = Router::new().route("/", get(|| async { "ok" }));
        let (stop_tx, stop_rx) = oneshot::channel::<()>();

        let server = tokio::spawn(serve_listener(listener, router, async move {
            let _ = stop_rx.await;
        }));
        stop_tx.send(()).expect("server still running");

        let result = tokio::time::timeout(std::time::Duration::from_secs(5), server)
            .await
            .expect("server stopped in time")
            .expect("server task");
        assert!(result.is_ok());
    }
}
