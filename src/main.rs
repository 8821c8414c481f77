mod auth;
mod collectors;
mod config;
mod history;
mod http;
mod metrics;
mod monitoring;
mod stream;
mod terminal;
#[cfg(test)]
mod testing;

use auth::{StaticCredentials, StaticUser, TokenSigner};
use axum::serve;
use clap::Parser;
use collectors::recorder::MetricRecorder;
use config::Config;
use http::AppState;
use metrics::Metrics;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "opsd")]
#[command(version)]
struct Cli {
    #[arg(long)]
    config: Option<String>,
    #[arg(long)]
    print_default_config: bool,
    #[arg(long)]
    listen: Option<String>,
}

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse();
    if cli.print_default_config {
        println!("{}", Config::example_yaml());
        return;
    }

    let mut cfg = match &cli.config {
        Some(path) => match Config::load_from_file(path) {
            Ok(cfg) => cfg,
            Err(err) => {
                error!(error = %err, "не удалось загрузить конфигурацию");
                std::process::exit(1);
            }
        },
        None => Config::default(),
    };
    if let Some(listen) = cli.listen {
        cfg.listen = listen;
    }
    if let Err(err) = cfg.validate() {
        error!(error = %err, "конфигурация некорректна");
        std::process::exit(1);
    }

    let secret = match resolve_env(&cfg.auth.secret_env) {
        Some(secret) => secret,
        None => {
            error!(env = %cfg.auth.secret_env, "секрет подписи токенов не задан");
            std::process::exit(1);
        }
    };
    let cors_origin = resolve_env(&cfg.cors.origin_env).unwrap_or_else(|| "*".to_string());

    let signer = match cfg
        .auth
        .token_ttl()
        .map_err(|err| err.to_string())
        .and_then(|ttl| TokenSigner::new(secret, ttl).map_err(|err| err.to_string()))
    {
        Ok(signer) => signer,
        Err(err) => {
            error!(error = %err, "не удалось подготовить подпись токенов");
            std::process::exit(1);
        }
    };

    if cfg.auth.users.is_empty() {
        warn!("в auth.users нет пользователей, вход невозможен");
    }
    let credentials = StaticCredentials::new(
        cfg.auth
            .users
            .iter()
            .map(|u| StaticUser {
                id: u.id.clone(),
                email: u.email.clone(),
                password_hash: u.password_hash.clone(),
            })
            .collect(),
    );

    let metrics = match Metrics::new() {
        Ok(m) => m,
        Err(err) => {
            error!(error = %err, "не удалось инициализировать метрики");
            std::process::exit(1);
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let state = match AppState::new(
        &cfg,
        signer,
        Arc::new(credentials),
        metrics.clone(),
        shutdown_rx.clone(),
    ) {
        Ok(state) => state,
        Err(err) => {
            error!(error = %err, "не удалось собрать состояние сервиса");
            std::process::exit(1);
        }
    };

    info!(
        listen = %cfg.listen,
        sample_interval_secs = cfg.monitoring.sample_interval_secs,
        disk_paths = ?state.sampler.disk_paths(),
        metric_history = state.metric_history.capacity(),
        host_mode = ?cfg.terminal.host_mode,
        cors_origin = %cors_origin,
        "запуск opsd"
    );

    let recorder_task = {
        let recorder = Arc::new(MetricRecorder::new(
            state.sampler.clone(),
            state.metric_history.clone(),
            metrics.clone(),
        ));
        let interval = cfg.monitoring.sample_interval();
        let shutdown = shutdown_rx.clone();
        tokio::spawn(recorder.run(interval, shutdown))
    };

    let http_task = {
        let listen = cfg.listen.clone();
        let mut shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            let app = http::build_router(state, &cors_origin);
            let addr: SocketAddr = match listen.parse() {
                Ok(addr) => addr,
                Err(err) => {
                    error!(error = %err, listen = %listen, "некорректный адрес listen");
                    return;
                }
            };

            let listener = match TcpListener::bind(addr).await {
                Ok(l) => l,
                Err(err) => {
                    error!(error = %err, "не удалось запустить HTTP-сервер");
                    return;
                }
            };

            let server = serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.changed().await;
            });

            if let Err(err) = server.await {
                error!(error = %err, "ошибка HTTP-сервера");
            }
        })
    };

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "не удалось дождаться Ctrl+C");
    }
    info!("получен Ctrl+C, выполняется остановка");

    let _ = shutdown_tx.send(true);

    let _ = recorder_task.await;
    let _ = http_task.await;
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

pub(crate) fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn resolve_env(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
