use super::protocol::{ClientMessage, ServerMessage, TerminalCommand};
use crate::auth::Principal;
use crate::http::{authorize_upgrade, AppState, TokenQuery};
use crate::stream::{stopped, Outbound};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use futures::{Stream, StreamExt};
use std::fmt::Display;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

const STREAM: &str = "terminal";
const INBOUND_QUEUE: usize = 32;

pub async fn terminal_stream(
    State(state): State<AppState>,
    Query(query): Query<TokenQuery>,
    ws: Option<WebSocketUpgrade>,
) -> Response {
    match authorize_upgrade(&state, STREAM, &query, ws) {
        Ok((principal, ws)) => ws.on_upgrade(move |socket| run_session(state, socket, principal)),
        Err(response) => response,
    }
}

async fn run_session(state: AppState, socket: WebSocket, principal: Principal) {
    let (sink, mut inbound) = socket.split();
    let outbound = Outbound::new(sink);
    state.metrics.stream_opened(STREAM);
    info!(email = %principal.email, "терминальная сессия открыта");

    let history = state.executor.history().snapshot().await;
    if let Err(err) = outbound.send_json(&ServerMessage::History { history }).await {
        warn!(error = %err, "история не отправлена, сессия закрыта");
        state.metrics.stream_closed(STREAM);
        return;
    }

    let (requests_tx, mut requests_rx) = mpsc::channel(INBOUND_QUEUE);
    // отмена текущей команды: разрыв соединения или остановка сервиса
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let mut reader_shutdown = state.shutdown.clone();
    let reader = tokio::spawn(async move {
        tokio::select! {
            _ = read_inbound(&mut inbound, requests_tx) => {}
            _ = stopped(&mut reader_shutdown) => debug!("остановка сервиса, команда прерывается"),
        }
        let _ = cancel_tx.send(true);
    });

    let mut shutdown = state.shutdown.clone();
    loop {
        let request = tokio::select! {
            request = requests_rx.recv() => match request {
                Some(request) => request,
                None => break,
            },
            _ = stopped(&mut shutdown) => break,
        };
        if *cancel_rx.borrow() {
            break;
        }

        let reply = state
            .executor
            .execute(request, &outbound, cancel_rx.clone())
            .await;
        let kind = reply.kind();
        if let Err(err) = outbound.send_json(&reply).await {
            warn!(kind, error = %err, "итог команды не доставлен, сессия закрыта");
            break;
        }
    }

    reader.abort();
    outbound.close().await;
    state.metrics.stream_closed(STREAM);
    info!(email = %principal.email, "терминальная сессия закрыта");
}

async fn read_inbound<St, E>(inbound: &mut St, requests: mpsc::Sender<TerminalCommand>)
where
    St: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    while let Some(frame) = inbound.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => return,
            Ok(Message::Binary(_)) => {
                debug!("бинарный кадр пропущен");
                continue;
            }
            Ok(_) => continue,
            Err(err) => {
                debug!(error = %err, "чтение терминальной сессии прервано");
                return;
            }
        };

        let Some(request) = parse_request(&text) else {
            continue;
        };
        match requests.try_send(request) {
            Ok(()) => {}
            Err(TrySendError::Full(request)) => {
                warn!(command_id = %request.id, "очередь команд переполнена, запрос отброшен");
            }
            Err(TrySendError::Closed(_)) => return,
        }
    }
}

fn parse_request(text: &str) -> Option<TerminalCommand> {
    match serde_json::from_str::<ClientMessage>(text) {
        Ok(ClientMessage::Execute {
            command: Some(command),
        }) => Some(command),
        Ok(ClientMessage::Execute { command: None }) => {
            debug!("execute без команды пропущен");
            None
        }
        Ok(ClientMessage::Unknown) => {
            debug!("неизвестный тип сообщения пропущен");
            None
        }
        Err(err) => {
            debug!(error = %err, "сообщение не разобрано");
            None
        }
    }
}
