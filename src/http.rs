use crate::auth::{AuthError, CredentialVerifier, Principal, SessionGate, TokenSigner};
use crate::collectors::{MetricSample, Sampler};
use crate::config::{Config, ConfigError};
use crate::history::HistoryRing;
use crate::metrics::Metrics;
use crate::now_unix;
use crate::terminal::executor::{CommandExecutor, ExecutorSettings};
use crate::terminal::protocol::TerminalCommand;
use crate::{monitoring, terminal};
use axum::body::Body;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::http::header::{
    AUTHORIZATION, CONTENT_TYPE, STRICT_TRANSPORT_SECURITY, X_CONTENT_TYPE_OPTIONS,
    X_FRAME_OPTIONS,
};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy)]
pub struct PushIntervals {
    pub cpu: Duration,
    pub memory: Duration,
    pub disk: Duration,
}

#[derive(Clone)]
pub struct AppState {
    pub metrics: Arc<Metrics>,
    pub gate: Arc<SessionGate>,
    pub credentials: Arc<dyn CredentialVerifier>,
    pub sampler: Arc<Sampler>,
    pub metric_history: Arc<HistoryRing<MetricSample>>,
    pub executor: Arc<CommandExecutor>,
    pub push: PushIntervals,
    pub shutdown: watch::Receiver<bool>,
}

impl AppState {
    pub fn new(
        cfg: &Config,
        signer: TokenSigner,
        credentials: Arc<dyn CredentialVerifier>,
        metrics: Arc<Metrics>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self, ConfigError> {
        let mon = &cfg.monitoring;
        let sampler = Arc::new(Sampler::new(
            mon.proc_root.clone(),
            mon.cpu_window(),
            mon.disk_paths.clone(),
        ));
        let command_history: Arc<HistoryRing<TerminalCommand>> =
            Arc::new(HistoryRing::new(cfg.terminal.history_capacity));
        let executor = CommandExecutor::new(
            ExecutorSettings {
                host_mode: cfg.terminal.host_mode,
                helper_image: cfg.terminal.helper_image.clone(),
                container_runtime: cfg.terminal.container_runtime.clone(),
                timeout: cfg.terminal.command_timeout()?,
            },
            command_history,
            metrics.clone(),
        );

        Ok(Self {
            metrics,
            gate: Arc::new(SessionGate::new(signer)),
            credentials,
            sampler,
            metric_history: Arc::new(HistoryRing::new(mon.history_capacity)),
            executor: Arc::new(executor),
            push: PushIntervals {
                cpu: mon.cpu_push_interval(),
                memory: mon.memory_push_interval(),
                disk: mon.disk_push_interval(),
            },
            shutdown,
        })
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct TokenQuery {
    #[serde(default)]
    pub token: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
struct LoginResponse {
    user: UserView,
    token: String,
    expires_at: i64,
}

#[derive(Debug, Serialize)]
struct UserView {
    id: String,
    email: String,
}

impl From<Principal> for UserView {
    fn from(p: Principal) -> Self {
        Self {
            id: p.user_id,
            email: p.email,
        }
    }
}

pub fn build_router(state: AppState, cors_origin: &str) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_handler))
        .route("/auth/login", post(login_handler))
        .route("/auth/me", get(me_handler))
        .route("/monitoring/history", get(history_handler))
        .route("/monitoring/cpu", get(monitoring::cpu_stream))
        .route("/monitoring/memory", get(monitoring::memory_stream))
        .route("/monitoring/disk", get(monitoring::disk_stream))
        .route("/terminal", get(terminal::session::terminal_stream))
        .layer(cors_layer(cors_origin))
        .layer(SetResponseHeaderLayer::overriding(
            X_FRAME_OPTIONS,
            HeaderValue::from_static("DENY"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            STRICT_TRANSPORT_SECURITY,
            HeaderValue::from_static("max-age=63072000; includeSubDomains; preload"),
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn cors_layer(origin: &str) -> CorsLayer {
    let base = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([AUTHORIZATION, CONTENT_TYPE]);

    match origin.trim() {
        "" | "*" => base.allow_origin(Any),
        exact => match HeaderValue::from_str(exact) {
            Ok(value) => base.allow_origin(value).allow_credentials(true),
            Err(err) => {
                warn!(origin = exact, error = %err, "некорректный origin, CORS открыт для всех");
                base.allow_origin(Any)
            }
        },
    }
}

pub fn authorize_upgrade(
    state: &AppState,
    stream: &'static str,
    query: &TokenQuery,
    ws: Option<WebSocketUpgrade>,
) -> Result<(Principal, WebSocketUpgrade), Response> {
    let principal = state
        .gate
        .authorize(query.token.as_deref(), now_unix())
        .map_err(|err| {
            state.metrics.inc_stream_rejected(stream);
            debug!(stream, error = %err, "подключение отклонено");
            unauthorized(&err)
        })?;

    match ws {
        Some(ws) => Ok((principal, ws)),
        None => Err((
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "ожидался запрос на WebSocket"})),
        )
            .into_response()),
    }
}

fn unauthorized(err: &AuthError) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({"error": err.to_string()})),
    )
        .into_response()
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn metrics_handler(State(state): State<AppState>) -> Response {
    state.metrics.inc_scrape_count();
    match state.metrics.encode_metrics() {
        Ok(encoded) => {
            let mut response = Response::new(Body::from(encoded));
            response.headers_mut().insert(
                CONTENT_TYPE,
                HeaderValue::from_static("text/plain; version=0.0.4"),
            );
            response
        }
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("ошибка кодирования метрик: {err}"),
        )
            .into_response(),
    }
}

async fn login_handler(
    State(state): State<AppState>,
    Json(request): Json<LoginRequest>,
) -> Response {
    let principal = match state.credentials.verify(&request.email, &request.password) {
        Ok(p) => p,
        Err(err) => {
            warn!(email = %request.email, "неудачная попытка входа");
            return unauthorized(&err);
        }
    };

    match state.gate.signer().issue(&principal, now_unix()) {
        Ok(issued) => Json(LoginResponse {
            user: principal.into(),
            token: issued.token,
            expires_at: issued.expires_at,
        })
        .into_response(),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": err.to_string()})),
        )
            .into_response(),
    }
}

async fn me_handler(State(state): State<AppState>, headers: HeaderMap) -> Response {
    match state.gate.authorize(bearer_token(&headers), now_unix()) {
        Ok(principal) => Json(UserView::from(principal)).into_response(),
        Err(err) => unauthorized(&err),
    }
}

async fn history_handler(
    State(state): State<AppState>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
) -> Response {
    let token = bearer_token(&headers).or(query.token.as_deref());
    if let Err(err) = state.gate.authorize(token, now_unix()) {
        return unauthorized(&err);
    }
    Json(state.metric_history.snapshot().await).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{test_config, test_state, token_for};
    use axum::body::to_bytes;
    use axum::http::Request;
    use std::collections::BTreeMap;
    use tower::ServiceExt;

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn healthz_returns_ok_with_security_headers() {
        let (state, _shutdown) = test_state(&test_config());
        let app = build_router(state, "*");

        let response = app
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[X_FRAME_OPTIONS], "DENY");
        assert_eq!(response.headers()[X_CONTENT_TYPE_OPTIONS], "nosniff");
        assert!(response.headers().contains_key(STRICT_TRANSPORT_SECURITY));
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(bytes.as_ref(), b"ok");
    }

    #[tokio::test]
    async fn metrics_contains_uptime() {
        let (state, _shutdown) = test_state(&test_config());
        let app = build_router(state, "*");

        let response = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("opsd_uptime_seconds"));
        assert!(text.contains("opsd_scrape_count_total 1"));
    }

    #[tokio::test]
    async fn login_issues_token_accepted_by_me() {
        let (state, _shutdown) = test_state(&test_config());
        let app = build_router(state, "*");

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/auth/login")
                    .header(CONTENT_TYPE, "application/json")
                    .body(Body::from(
                        r#"{"email":"test@example.com","password":"password123"}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let login = body_json(response).await;
        assert_eq!(login["user"]["email"], "test@example.com");
        let token = login["token"].as_str().unwrap().to_string();

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/auth/me")
                    .header(AUTHORIZATION, format!("Bearer {token}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["id"], "1");
    }

    #[tokio::test]
    async fn login_with_wrong_password_is_unauthorized() {
        let (state, _shutdown) = test_state(&test_config());
        let app = build_router(state, "*");

        let response = app
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/auth/login")
                    .header(CONTENT_TYPE, "application/json")
                    .body(Body::from(r#"{"email":"test@example.com","password":"nope"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(body_json(response).await["error"].is_string());
    }

    #[tokio::test]
    async fn history_requires_session_and_returns_samples() {
        let (state, _shutdown) = test_state(&test_config());
        for id in 1..=3 {
            state
                .metric_history
                .append(MetricSample {
                    id,
                    timestamp: 1_700_000_000 + id as i64,
                    cpu: 1.0,
                    memory: 2.0,
                    disk: BTreeMap::new(),
                })
                .await;
        }
        let token = token_for(&state);
        let app = build_router(state, "*");

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/monitoring/history")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app
            .oneshot(
                Request::builder()
                    .uri(format!("/monitoring/history?token={token}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let ids: Vec<u64> = body_json(response)
            .await
            .as_array()
            .unwrap()
            .iter()
            .map(|s| s["id"].as_u64().unwrap())
            .collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn streaming_routes_reject_before_upgrade() {
        let (state, _shutdown) = test_state(&test_config());
        let metrics = state.metrics.clone();
        let app = build_router(state, "*");

        for uri in [
            "/monitoring/cpu",
            "/monitoring/memory?token=",
            "/monitoring/disk?token=invalid_token",
            "/terminal?token=a.b.c",
        ] {
            let response = app
                .clone()
                .oneshot(
                    Request::builder()
                        .uri(uri)
                        .header("connection", "upgrade")
                        .header("upgrade", "websocket")
                        .header("sec-websocket-version", "13")
                        .header("sec-websocket-key", "dGhlIHNhbXBsZSBub25jZQ==")
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED, "{uri}");
        }

        let text = String::from_utf8(metrics.encode_metrics().unwrap()).unwrap();
        assert!(text.contains("opsd_streams_rejected_total{stream=\"terminal\"} 1"));
    }

    #[tokio::test]
    async fn authorized_plain_request_gets_bad_request() {
        let (state, _shutdown) = test_state(&test_config());
        let token = token_for(&state);
        let app = build_router(state, "*");

        let response = app
            .oneshot(
                Request::builder()
                    .uri(format!("/monitoring/cpu?token={token}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn exact_cors_origin_is_echoed() {
        let (state, _shutdown) = test_state(&test_config());
        let app = build_router(state, "https://console.example.com");

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/healthz")
                    .header("origin", "https://console.example.com")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(
            response.headers()["access-control-allow-origin"],
            "https://console.example.com"
        );
        assert_eq!(response.headers()["access-control-allow-credentials"], "true");
    }
}
