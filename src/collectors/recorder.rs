use super::{MetricSample, SampleError, Sampler};
use crate::history::HistoryRing;
use crate::metrics::Metrics;
use crate::now_unix;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

pub struct MetricRecorder {
    sampler: Arc<Sampler>,
    history: Arc<HistoryRing<MetricSample>>,
    metrics: Arc<Metrics>,
    next_id: AtomicU64,
}

impl MetricRecorder {
    pub fn new(
        sampler: Arc<Sampler>,
        history: Arc<HistoryRing<MetricSample>>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            sampler,
            history,
            metrics,
            next_id: AtomicU64::new(1),
        }
    }

    pub async fn record_once(&self) -> Result<MetricSample, SampleError> {
        let cpu = match self.sampler.sample_cpu().await {
            Ok(v) => v,
            Err(err) => {
                self.metrics.inc_sample_error(err.source_name());
                return Err(err);
            }
        };

        let memory = match self.sampler.sample_memory().await {
            Ok(v) => v,
            Err(err) => {
                self.metrics.inc_sample_error(err.source_name());
                warn!(error = %err, "память не прочитана, записываем 0");
                0.0
            }
        };

        let (disk, disk_errors) = self.sampler.sample_disk_partial().await;
        for err in &disk_errors {
            self.metrics.inc_sample_error(err.source_name());
            debug!(error = %err, "диск пропущен в записи истории");
        }

        let sample = MetricSample {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            timestamp: now_unix(),
            cpu,
            memory,
            disk,
        };
        let len = self.history.append(sample.clone()).await;
        self.metrics.update_from_sample(&sample, len);
        Ok(sample)
    }

    pub async fn run(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("получен сигнал остановки записи метрик");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(err) = self.record_once().await {
                        warn!(error = %err, "такт записи метрик пропущен");
                    }
                }
            }
        }
    }
}
