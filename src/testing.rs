use crate::auth::{Principal, StaticCredentials, TokenSigner};
use crate::config::{Config, HostMode};
use crate::http::{build_router, AppState};
use crate::metrics::Metrics;
use crate::now_unix;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;

pub const TEST_SECRET: &str = "test_secret";

pub fn test_config() -> Config {
    let mut cfg = Config::default();
    cfg.monitoring.cpu_window_ms = 10;
    cfg.monitoring.cpu_push_interval_ms = 50;
    cfg.monitoring.memory_push_interval_ms = 50;
    cfg.monitoring.disk_push_interval_ms = 50;
    cfg.monitoring.disk_paths = vec!["/".to_string()];
    cfg.terminal.host_mode = HostMode::Direct;
    cfg.terminal.command_timeout = "30s".to_string();
    cfg
}

pub fn test_state(cfg: &Config) -> (AppState, watch::Sender<bool>) {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let signer = TokenSigner::new(TEST_SECRET, cfg.auth.token_ttl().unwrap()).unwrap();
    let credentials =
        StaticCredentials::default().with_password("1", "test@example.com", "password123");
    let state = AppState::new(
        cfg,
        signer,
        Arc::new(credentials),
        Metrics::new().unwrap(),
        shutdown_rx,
    )
    .unwrap();
    (state, shutdown_tx)
}

pub fn token_for(state: &AppState) -> String {
    let principal = Principal {
        user_id: "1".to_string(),
        email: "test@example.com".to_string(),
    };
    state
        .gate
        .signer()
        .issue(&principal, now_unix())
        .unwrap()
        .token
}

pub async fn spawn_server(state: AppState) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = build_router(state, "*");
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

pub fn ws_url(addr: SocketAddr, path: &str, token: &str) -> String {
    format!("ws://{addr}{path}?token={token}")
}
