use crate::auth::Principal;
use crate::http::{authorize_upgrade, AppState, TokenQuery};
use crate::stream::{drain_until_closed, run_push_loop, stopped, Outbound, PushExit};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use futures::stream::SplitSink;
use futures::StreamExt;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

type SocketSink = SplitSink<WebSocket, Message>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricStream {
    Cpu,
    Memory,
    Disk,
}

impl MetricStream {
    pub fn name(self) -> &'static str {
        match self {
            Self::Cpu => "cpu",
            Self::Memory => "memory",
            Self::Disk => "disk",
        }
    }

    fn period(self, state: &AppState) -> Duration {
        match self {
            Self::Cpu => state.push.cpu,
            Self::Memory => state.push.memory,
            Self::Disk => state.push.disk,
        }
    }
}

pub async fn cpu_stream(
    State(state): State<AppState>,
    Query(query): Query<TokenQuery>,
    ws: Option<WebSocketUpgrade>,
) -> Response {
    open_stream(state, MetricStream::Cpu, query, ws)
}

pub async fn memory_stream(
    State(state): State<AppState>,
    Query(query): Query<TokenQuery>,
    ws: Option<WebSocketUpgrade>,
) -> Response {
    open_stream(state, MetricStream::Memory, query, ws)
}

pub async fn disk_stream(
    State(state): State<AppState>,
    Query(query): Query<TokenQuery>,
    ws: Option<WebSocketUpgrade>,
) -> Response {
    open_stream(state, MetricStream::Disk, query, ws)
}

fn open_stream(
    state: AppState,
    kind: MetricStream,
    query: TokenQuery,
    ws: Option<WebSocketUpgrade>,
) -> Response {
    match authorize_upgrade(&state, kind.name(), &query, ws) {
        Ok((principal, ws)) => {
            ws.on_upgrade(move |socket| run_metric_stream(state, kind, socket, principal))
        }
        Err(response) => response,
    }
}

async fn run_metric_stream(
    state: AppState,
    kind: MetricStream,
    socket: WebSocket,
    principal: Principal,
) {
    let stream = kind.name();
    let (sink, mut inbound) = socket.split();
    let outbound = Outbound::new(sink);
    let (stop_tx, stop_rx) = watch::channel(false);

    state.metrics.stream_opened(stream);
    info!(stream, email = %principal.email, "поток метрик открыт");

    let mut pusher = tokio::spawn(push_samples(state.clone(), kind, outbound.clone(), stop_rx));
    let mut shutdown = state.shutdown.clone();

    let finished = tokio::select! {
        _ = drain_until_closed(&mut inbound) => None,
        exit = &mut pusher => Some(exit),
        _ = stopped(&mut shutdown) => None,
    };
    let _ = stop_tx.send(true);
    let exit = match finished {
        Some(exit) => exit,
        None => pusher.await,
    };
    match exit {
        Ok(exit) => debug!(stream, ?exit, "отправка значений остановлена"),
        Err(err) => warn!(stream, error = %err, "задача отправки завершилась аварийно"),
    }

    outbound.close().await;
    state.metrics.stream_closed(stream);
    info!(stream, email = %principal.email, "поток метрик закрыт");
}

async fn push_samples(
    state: AppState,
    kind: MetricStream,
    outbound: Outbound<SocketSink>,
    stop: watch::Receiver<bool>,
) -> PushExit {
    let period = kind.period(&state);
    let metrics = state.metrics.clone();
    let sampler = state.sampler.clone();

    match kind {
        MetricStream::Cpu => {
            let sample = move || {
                let sampler = sampler.clone();
                async move { sampler.sample_cpu().await }
            };
            run_push_loop(kind.name(), period, outbound, sample, stop, metrics).await
        }
        MetricStream::Memory => {
            let sample = move || {
                let sampler = sampler.clone();
                async move { sampler.sample_memory().await }
            };
            run_push_loop(kind.name(), period, outbound, sample, stop, metrics).await
        }
        MetricStream::Disk => {
            let sample = move || {
                let sampler = sampler.clone();
                async move { sampler.sample_disk().await }
            };
            run_push_loop(kind.name(), period, outbound, sample, stop, metrics).await
        }
    }
}
