use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::IntoResponse;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};
use std::future::Future;
use std::pin::Pin;
use std::sync::OnceLock;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tower::{Layer, Service};

pub const DIRECTION_CLIENT: &str = "client";
pub const DIRECTION_SERVER: &str = "server";

pub const OUTCOME_FORWARDED: &str = "forwarded";
pub const OUTCOME_REJECTED: &str = "rejected";
pub const OUTCOME_MALFORMED: &str = "malformed";

pub const STASH_STASHED: &str = "stashed";
pub const STASH_REPLAYED: &str = "replayed";
pub const STASH_DISCARDED: &str = "discarded";

struct Metrics {
    registry: Registry,
    cn_up: IntGaugeVec,
    http_requests_total: IntCounterVec,
    http_request_duration_seconds: HistogramVec,
    ws_connections: IntGaugeVec,
    ws_unauthenticated_connections: IntGaugeVec,
    auth_success_total: IntCounterVec,
    auth_failure_total: IntCounterVec,
    upstream_connect_failures_total: IntCounterVec,
    proxy_messages_total: IntCounterVec,
    stash_events_total: IntCounterVec,
    idle_timeouts_total: IntCounterVec,
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

fn counter(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> IntCounterVec {
    let metric = IntCounterVec::new(Opts::new(name, help), labels).expect("counter metric");
    registry
        .register(Box::new(metric.clone()))
        .expect("register counter metric");
    metric
}

fn gauge(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> IntGaugeVec {
    let metric = IntGaugeVec::new(Opts::new(name, help), labels).expect("gauge metric");
    registry
        .register(Box::new(metric.clone()))
        .expect("register gauge metric");
    metric
}

fn metrics() -> &'static Metrics {
    METRICS.get_or_init(|| {
        let registry = Registry::new();

        let http_request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "http_request_duration_seconds",
                "HTTP request duration in seconds",
            )
            .buckets(vec![
                0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
            ]),
            &["service", "route", "method", "status"],
        )
        .expect("http_request_duration_seconds metric");
        registry
            .register(Box::new(http_request_duration_seconds.clone()))
            .expect("register http_request_duration_seconds");

        Metrics {
            cn_up: gauge(&registry, "cn_up", "Service health", &["service"]),
            http_requests_total: counter(
                &registry,
                "http_requests_total",
                "HTTP request count",
                &["service", "route", "method", "status"],
            ),
            http_request_duration_seconds,
            ws_connections: gauge(
                &registry,
                "ws_connections",
                "Active proxied websocket sessions",
                &["service"],
            ),
            ws_unauthenticated_connections: gauge(
                &registry,
                "ws_unauthenticated_connections",
                "Active websocket sessions without successful AUTH",
                &["service"],
            ),
            auth_success_total: counter(
                &registry,
                "auth_success_total",
                "Total successful NIP-42 authentications",
                &["service"],
            ),
            auth_failure_total: counter(
                &registry,
                "auth_failure_total",
                "Total rejected NIP-42 auth events",
                &["service"],
            ),
            upstream_connect_failures_total: counter(
                &registry,
                "upstream_connect_failures_total",
                "Total failed connection attempts to the upstream relay",
                &["service"],
            ),
            proxy_messages_total: counter(
                &registry,
                "proxy_messages_total",
                "Total protocol messages seen by the proxy",
                &["service", "direction", "outcome"],
            ),
            stash_events_total: counter(
                &registry,
                "stash_events_total",
                "Total direct message events withheld before AUTH and their fate",
                &["service", "outcome"],
            ),
            idle_timeouts_total: counter(
                &registry,
                "idle_timeouts_total",
                "Total sessions closed by the idle timer",
                &["service"],
            ),
            registry,
        }
    })
}

pub fn init(service_name: &'static str) {
    metrics().cn_up.with_label_values(&[service_name]).set(1);
}

pub fn record_http_request(
    service_name: &'static str,
    method: &str,
    route: &str,
    status: u16,
    duration: Duration,
) {
    let status_str = status.to_string();
    let labels = &[service_name, route, method, status_str.as_str()];
    let metrics = metrics();
    metrics.http_requests_total.with_label_values(labels).inc();
    metrics
        .http_request_duration_seconds
        .with_label_values(labels)
        .observe(duration.as_secs_f64());
}

pub fn inc_ws_connections(service_name: &'static str) {
    metrics()
        .ws_connections
        .with_label_values(&[service_name])
        .inc();
}

pub fn dec_ws_connections(service_name: &'static str) {
    metrics()
        .ws_connections
        .with_label_values(&[service_name])
        .dec();
}

pub fn inc_ws_unauthenticated_connections(service_name: &'static str) {
    metrics()
        .ws_unauthenticated_connections
        .with_label_values(&[service_name])
        .inc();
}

pub fn dec_ws_unauthenticated_connections(service_name: &'static str) {
    metrics()
        .ws_unauthenticated_connections
        .with_label_values(&[service_name])
        .dec();
}

pub fn inc_auth_success(service_name: &'static str) {
    metrics()
        .auth_success_total
        .with_label_values(&[service_name])
        .inc();
}

pub fn inc_auth_failure(service_name: &'static str) {
    metrics()
        .auth_failure_total
        .with_label_values(&[service_name])
        .inc();
}

pub fn inc_upstream_connect_failure(service_name: &'static str) {
    metrics()
        .upstream_connect_failures_total
        .with_label_values(&[service_name])
        .inc();
}

pub fn inc_proxy_message(service_name: &'static str, direction: &'static str, outcome: &'static str) {
    metrics()
        .proxy_messages_total
        .with_label_values(&[service_name, direction, outcome])
        .inc();
}

pub fn add_stash_events(service_name: &'static str, outcome: &'static str, count: usize) {
    metrics()
        .stash_events_total
        .with_label_values(&[service_name, outcome])
        .inc_by(count as u64);
}

pub fn inc_idle_timeout(service_name: &'static str) {
    metrics()
        .idle_timeouts_total
        .with_label_values(&[service_name])
        .inc();
}

pub fn metrics_response(service_name: &'static str) -> impl IntoResponse {
    init(service_name);
    let metrics = metrics();
    let metric_families = metrics.registry.gather();
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            HeaderMap::new(),
            "failed to encode metrics".to_string(),
        );
    }

    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; version=0.0.4"),
    );
    (
        StatusCode::OK,
        headers,
        String::from_utf8_lossy(&buffer).to_string(),
    )
}

#[derive(Clone)]
pub struct MetricsLayer {
    service_name: &'static str,
}

impl MetricsLayer {
    pub fn new(service_name: &'static str) -> Self {
        Self { service_name }
    }
}

#[derive(Clone)]
pub struct MetricsService<S> {
    inner: S,
    service_name: &'static str,
}

impl<S> Layer<S> for MetricsLayer {
    type Service = MetricsService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        MetricsService {
            inner,
            service_name: self.service_name,
        }
    }
}

impl<S, ReqBody, ResBody> Service<axum::http::Request<ReqBody>> for MetricsService<S>
where
    S: Service<axum::http::Request<ReqBody>, Response = axum::response::Response<ResBody>>
        + Send
        + 'static,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
    ResBody: Send + 'static,
{
    type Response = axum::response::Response<ResBody>;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: axum::http::Request<ReqBody>) -> Self::Future {
        let service_name = self.service_name;
        let method = request.method().to_string();
        let route = request.uri().path().to_string();
        let start = Instant::now();
        let fut = self.inner.call(request);
        Box::pin(async move {
            let result = fut.await;
            let status = match &result {
                Ok(response) => response.status().as_u16(),
                Err(_) => 500,
            };
            record_http_request(service_name, &method, &route, status, start.elapsed());
            result
        })
    }
}
