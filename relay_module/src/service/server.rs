use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{ConnectInfo, DefaultBodyLimit, Request, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use send_notifications_module::sha256_hex;
use tokio::net::TcpListener;
use tokio::runtime::Handle;
use tower_http::cors::{AllowHeaders, AllowOrigin, CorsLayer};
use tracing::{info, warn};

use super::background::{start_rate_sweeper, BackgroundControl};
use super::config::ServiceConfig;
use super::inbound::InboundDocument;
use super::mailbox::{start_mailbox, InboxQueue, MailboxTiming};
use super::state::{AppState, RelayContext};
use super::submission::RequestMeta;
use super::BoxError;

const HEADER_LIMIT_BYTES: usize = 50;
const CORS_MAX_AGE: Duration = Duration::from_secs(1_728_000);
const X_REAL_IP: &str = "x-real-ip";
const X_FORWARDED_FOR: &str = "x-forwarded-for";
const RUNTIME_TEARDOWN: Duration = Duration::from_millis(500);

/// Runs the relay on its own multi-thread runtime. Blocking sends still
/// running after the drain grace are left behind when the runtime is torn
/// down, so the process exits instead of waiting on them.
pub fn run_service(
    config: ServiceConfig,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<(), BoxError> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let result = runtime.block_on(run_server(config, shutdown));
    shutdown_runtime(runtime);
    result
}

fn shutdown_runtime(runtime: tokio::runtime::Runtime) {
    runtime.shutdown_timeout(RUNTIME_TEARDOWN);
}

pub async fn run_server(
    config: ServiceConfig,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<(), BoxError> {
    let host: IpAddr = config
        .host
        .parse()
        .map_err(|_| format!("invalid host: {}", config.host))?;
    let addr = SocketAddr::new(host, config.port);
    let relay = RelayContext::from_config(&config, Handle::current())?;
    let listener = TcpListener::bind(addr).await?;
    info!("relay service listening on {}", addr);
    serve(listener, Arc::new(config), relay, shutdown).await
}

/// Serves the relay on an already bound listener until `shutdown`
/// resolves, then stops background work and drains in-flight fan-out.
pub async fn serve(
    listener: TcpListener,
    config: Arc<ServiceConfig>,
    relay: RelayContext,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<(), BoxError> {
    let inbox = Arc::new(InboxQueue::new());
    let mut control = BackgroundControl::new();
    start_rate_sweeper(&mut control, relay.limits().clone(), config.rate_sweep_interval);
    let timing = MailboxTiming {
        poll_interval: config.mailbox_poll_interval,
        idle_interval: config.mailbox_idle_interval,
        ..MailboxTiming::default()
    };
    start_mailbox(&mut control, relay.clone(), inbox.clone(), timing);

    let state = AppState {
        config: config.clone(),
        relay: relay.clone(),
        inbox,
    };
    let app = router(state);

    let serve_result = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await;
    info!("relay service stopping");
    control.stop_and_join();
    relay.drain(config.shutdown_grace).await;
    serve_result?;
    Ok(())
}

pub(super) fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::mirror_request())
        .allow_headers(AllowHeaders::mirror_request())
        .allow_methods([Method::POST, Method::GET, Method::OPTIONS])
        .allow_credentials(true)
        .max_age(CORS_MAX_AGE);

    let messages = Router::new()
        .route("/", post(submit_message))
        .route("/message", post(submit_message))
        .route("/message/", post(submit_message))
        .layer(cors)
        .layer(middleware::from_fn_with_state(state.clone(), origin_gate));

    Router::new()
        .route("/hello", get(hello))
        .route("/health", get(health))
        .route(
            "/inbound/email",
            post(inbound_email)
                .route_layer(middleware::from_fn_with_state(state.clone(), inbound_gate)),
        )
        .merge(messages)
        .layer(DefaultBodyLimit::max(state.config.body_max_bytes))
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn hello() -> impl IntoResponse {
    (StatusCode::OK, "Hello, world!")
}

async fn origin_gate(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let headers = request.headers();
    let origin = header_str(headers, "origin");
    let host = header_str(headers, "host");
    if !origin_allowed(&origin, &state.config.allowed_origins) || host.len() > HEADER_LIMIT_BYTES {
        warn!("refused request from origin {:?} host {:?}", origin, host);
        return StatusCode::FORBIDDEN.into_response();
    }
    next.run(request).await
}

async fn inbound_gate(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Response {
    let config = &state.config;
    if let Err(status) = inbound_allowed(
        request.headers(),
        peer.ip(),
        config.inbound_token.as_deref(),
        config.trust_proxy_headers,
    ) {
        warn!("refused inbound mail push from {}: {}", peer, status);
        return status.into_response();
    }
    next.run(request).await
}

fn inbound_allowed(
    headers: &HeaderMap,
    peer: IpAddr,
    token: Option<&str>,
    trust_proxy: bool,
) -> Result<(), StatusCode> {
    match token {
        Some(expected) => match bearer_token(headers) {
            Some(presented) if sha256_hex(presented) == sha256_hex(expected) => Ok(()),
            _ => Err(StatusCode::UNAUTHORIZED),
        },
        None if peer.is_loopback() && !trust_proxy => Ok(()),
        None => Err(StatusCode::FORBIDDEN),
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
}

fn origin_allowed(origin: &str, allowed: &[String]) -> bool {
    if origin.is_empty() || origin.len() > HEADER_LIMIT_BYTES {
        return false;
    }
    if !origin.starts_with("http://") && !origin.starts_with("https://") {
        return false;
    }
    allowed.is_empty()
        || allowed
            .iter()
            .any(|entry| entry == "*" || entry.eq_ignore_ascii_case(origin))
}

async fn submit_message(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let meta = RequestMeta {
        client_ip: client_ip(&headers, peer, state.config.trust_proxy_headers),
        host: header_str(&headers, "host"),
        origin: header_str(&headers, "origin"),
    };
    let result = state.relay.process_web_submission(&body, &meta);
    (StatusCode::OK, Json(result))
}

async fn inbound_email(
    State(state): State<AppState>,
    Json(document): Json<InboundDocument>,
) -> impl IntoResponse {
    state.inbox.push(document.into_parsed());
    (
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "queued": true })),
    )
}

fn header_str(headers: &HeaderMap, name: &str) -> String {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .unwrap_or_default()
}

fn client_ip(headers: &HeaderMap, peer: SocketAddr, trust_proxy: bool) -> String {
    if trust_proxy {
        let forwarded = header_str(headers, X_FORWARDED_FOR);
        if let Some(first) = forwarded
            .split(',')
            .map(str::trim)
            .find(|entry| !entry.is_empty())
        {
            return first.to_string();
        }
        let real = header_str(headers, X_REAL_IP);
        if !real.is_empty() {
            return real;
        }
    }
    peer.ip().to_string()
}
