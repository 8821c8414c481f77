use crate::collectors::SampleError;
use crate::metrics::Metrics;
use axum::extract::ws::Message;
use futures::{Sink, SinkExt, Stream, StreamExt};
use serde::Serialize;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("ошибка транспорта: {0}")]
    Transport(String),
    #[error("ошибка сериализации кадра: {0}")]
    Encode(#[from] serde_json::Error),
}

// Все писатели соединения идут через один замок, кадры не перемежаются.
pub struct Outbound<S> {
    sink: Arc<Mutex<S>>,
}

impl<S> Clone for Outbound<S> {
    fn clone(&self) -> Self {
        Self {
            sink: self.sink.clone(),
        }
    }
}

impl<S> Outbound<S>
where
    S: Sink<Message> + Unpin + Send,
    S::Error: Display,
{
    pub fn new(sink: S) -> Self {
        Self {
            sink: Arc::new(Mutex::new(sink)),
        }
    }

    pub async fn send_json<T: Serialize + ?Sized>(&self, value: &T) -> Result<(), StreamError> {
        let text = serde_json::to_string(value)?;
        let mut sink = self.sink.lock().await;
        sink.send(Message::Text(text))
            .await
            .map_err(|err| StreamError::Transport(err.to_string()))
    }

    pub async fn close(&self) {
        let mut sink = self.sink.lock().await;
        if let Err(err) = sink.close().await {
            debug!(error = %err, "закрытие соединения завершилось ошибкой");
        }
    }
}

pub async fn stopped(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

pub async fn drain_until_closed<St, E>(inbound: &mut St)
where
    St: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    while let Some(frame) = inbound.next().await {
        match frame {
            Ok(Message::Close(_)) => return,
            Ok(_) => {}
            Err(err) => {
                debug!(error = %err, "чтение из соединения прервано");
                return;
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushExit {
    Cancelled,
    TransportClosed,
}

pub async fn run_push_loop<S, F, Fut, T>(
    stream: &'static str,
    period: Duration,
    outbound: Outbound<S>,
    mut sample: F,
    mut stop: watch::Receiver<bool>,
    metrics: Arc<Metrics>,
) -> PushExit
where
    S: Sink<Message> + Unpin + Send,
    S::Error: Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, SampleError>>,
    T: Serialize,
{
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = stopped(&mut stop) => return PushExit::Cancelled,
            _ = ticker.tick() => {
                match sample().await {
                    Ok(value) => {
                        if let Err(err) = outbound.send_json(&value).await {
                            warn!(stream, error = %err, "не удалось отправить значение, поток остановлен");
                            return PushExit::TransportClosed;
                        }
                    }
                    Err(err) => {
                        metrics.inc_sample_error(err.source_name());
                        warn!(stream, error = %err, "значение не получено, такт пропущен");
                    }
                }
            }
        }
    }
}
