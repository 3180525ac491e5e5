use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{ConnectInfo, DefaultBodyLimit, Request, State};
use axum::http::header::{CACHE_CONTROL, LOCATION};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Router};
use metrics::counter;
use tower_http::cors::{AllowHeaders, AllowOrigin, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

use crate::api::CaptureError;
use crate::event::RawEvent;
use crate::extractors::ClientIpExtractor;
use crate::limiter::RequestRateLimiter;
use crate::metrics_consts::RATE_LIMITER_DROPS;
use crate::saver::EventSaver;

#[derive(Clone)]
pub struct AppState {
    pub saver: Arc<dyn EventSaver>,
    pub extractor: ClientIpExtractor,
    pub limiter: Option<RequestRateLimiter>,
    pub root_redirect: String,
}

/// Client address resolved by the extraction middleware, stashed in
/// request extensions so handlers do not re-derive it.
#[derive(Clone, Copy)]
pub struct ClientIp(pub IpAddr);

pub fn router(
    state: AppState,
    body_max_size: usize,
    static_dir: &str,
    static_cache_max_age: u32,
) -> Router {
    // Permissive CORS: the tracker snippet posts from arbitrary origins.
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(AllowHeaders::mirror_request())
        .allow_origin(AllowOrigin::mirror_request());

    let cache_control = HeaderValue::from_str(&format!("public, max-age={static_cache_max_age}"))
        .expect("cache-control header value");
    let static_assets = tower::ServiceBuilder::new()
        .layer(SetResponseHeaderLayer::overriding(
            CACHE_CONTROL,
            cache_control,
        ))
        .service(ServeDir::new(static_dir));

    Router::new()
        .route(
            "/p",
            post(track_event).layer(DefaultBodyLimit::max(body_max_size)),
        )
        .route("/robots.txt", get(robots))
        .route("/", get(root))
        .fallback_service(static_assets)
        .layer(middleware::from_fn_with_state(state.clone(), client_gate))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Resolves the client IP once per request and applies the per-IP rate
/// limit before any handler runs.
async fn client_gate(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    mut req: Request,
    next: Next,
) -> Response {
    let ip = state.extractor.client_ip(peer.ip(), req.headers());

    if let Some(limiter) = &state.limiter {
        if !limiter.check(ip) {
            counter!(RATE_LIMITER_DROPS).increment(1);
            tracing::debug!(%ip, "rate limit exceeded");
            return CaptureError::RateLimited.into_response();
        }
    }

    req.extensions_mut().insert(ClientIp(ip));
    next.run(req).await
}

/// `POST /p` — decodes the tracker payload, captures the transient
/// request attributes, and hands off to ingress without waiting for it.
async fn track_event(
    State(state): State<AppState>,
    Extension(ClientIp(ip)): Extension<ClientIp>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, &'static str), CaptureError> {
    let mut raw: RawEvent = serde_json::from_slice(&body)?;
    raw.client_ip = ip.to_string();
    raw.user_agent = header_string(&headers, "user-agent");
    raw.lang = header_string(&headers, "accept-language");

    let saver = Arc::clone(&state.saver);
    tokio::spawn(async move { saver.save_event(raw).await });

    Ok((StatusCode::ACCEPTED, "ok"))
}

fn header_string(headers: &HeaderMap, name: &str) -> String {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

async fn robots() -> &'static str {
    "User-agent: *\nDisallow: /\n"
}

async fn root(State(state): State<AppState>) -> Response {
    if state.root_redirect.is_empty() {
        return (StatusCode::OK, "OK").into_response();
    }
    let location = HeaderValue::from_str(&state.root_redirect)
        .unwrap_or_else(|_| HeaderValue::from_static("/"));
    (StatusCode::FOUND, [(LOCATION, location)]).into_response()
}

/// The admin surface: health probes and the Prometheus scrape endpoint,
/// served from a separate listener so it is never exposed with the
/// public routes.
pub fn admin_router(prometheus: metrics_exporter_prometheus::PrometheusHandle) -> Router {
    Router::new()
        .route("/healthz", get(|| async { "OK" }))
        .route("/ready", get(|| async { "OK" }))
        .route("/metrics", get(move || std::future::ready(prometheus.render())))
}
