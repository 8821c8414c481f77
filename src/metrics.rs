use crate::collectors::MetricSample;
use crate::now_unix;
use prometheus::core::Collector;
use prometheus::{
    opts, Counter, CounterVec, Encoder, Gauge, GaugeVec, IntGauge, IntGaugeVec, Registry,
    TextEncoder,
};
use std::sync::Arc;

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    started_at_unix: i64,
    pub opsd_cpu_usage_percent: Gauge,
    pub opsd_memory_usage_percent: Gauge,
    pub opsd_disk_usage_percent: GaugeVec,
    pub opsd_metric_history_len: IntGauge,
    pub opsd_command_history_len: IntGauge,
    pub opsd_last_sample_id: IntGauge,
    pub opsd_last_sample_timestamp_seconds: IntGauge,
    pub opsd_sample_errors_total: CounterVec,
    pub opsd_streams_active: IntGaugeVec,
    pub opsd_streams_rejected_total: CounterVec,
    pub opsd_commands_total: CounterVec,
    pub opsd_scrape_count_total: Counter,
    pub opsd_uptime_seconds: Gauge,
}

impl Metrics {
    pub fn new() -> Result<Arc<Self>, prometheus::Error> {
        let registry = Registry::new();

        let opsd_cpu_usage_percent = Gauge::with_opts(opts!(
            "opsd_cpu_usage_percent",
            "CPU utilization of the last recorded sample in percent (0..100)"
        ))?;
        let opsd_memory_usage_percent = Gauge::with_opts(opts!(
            "opsd_memory_usage_percent",
            "Memory utilization of the last recorded sample in percent (0..100)"
        ))?;
        let opsd_disk_usage_percent = GaugeVec::new(
            opts!(
                "opsd_disk_usage_percent",
                "Disk utilization of the last recorded sample by mount"
            ),
            &["mount"],
        )?;
        let opsd_metric_history_len = IntGauge::with_opts(opts!(
            "opsd_metric_history_len",
            "Samples currently held in the metric history window"
        ))?;
        let opsd_command_history_len = IntGauge::with_opts(opts!(
            "opsd_command_history_len",
            "Records currently held in the command history window"
        ))?;
        let opsd_last_sample_id = IntGauge::with_opts(opts!(
            "opsd_last_sample_id",
            "Identity of the last recorded metric sample"
        ))?;
        let opsd_last_sample_timestamp_seconds = IntGauge::with_opts(opts!(
            "opsd_last_sample_timestamp_seconds",
            "Unix time of the last recorded metric sample"
        ))?;
        let opsd_sample_errors_total = CounterVec::new(
            opts!(
                "opsd_sample_errors_total",
                "Sampling failures by metric source"
            ),
            &["source"],
        )?;
        let opsd_streams_active = IntGaugeVec::new(
            opts!("opsd_streams_active", "Open streaming connections by stream"),
            &["stream"],
        )?;
        let opsd_streams_rejected_total = CounterVec::new(
            opts!(
                "opsd_streams_rejected_total",
                "Streaming connections refused by the session gate"
            ),
            &["stream"],
        )?;
        let opsd_commands_total = CounterVec::new(
            opts!(
                "opsd_commands_total",
                "Finished terminal commands by target and outcome"
            ),
            &["target", "outcome"],
        )?;
        let opsd_scrape_count_total = Counter::with_opts(opts!(
            "opsd_scrape_count_total",
            "Number of /metrics scrapes"
        ))?;
        let opsd_uptime_seconds =
            Gauge::with_opts(opts!("opsd_uptime_seconds", "Service uptime in seconds"))?;

        register(&registry, &opsd_cpu_usage_percent)?;
        register(&registry, &opsd_memory_usage_percent)?;
        register(&registry, &opsd_disk_usage_percent)?;
        register(&registry, &opsd_metric_history_len)?;
        register(&registry, &opsd_command_history_len)?;
        register(&registry, &opsd_last_sample_id)?;
        register(&registry, &opsd_last_sample_timestamp_seconds)?;
        register(&registry, &opsd_sample_errors_total)?;
        register(&registry, &opsd_streams_active)?;
        register(&registry, &opsd_streams_rejected_total)?;
        register(&registry, &opsd_commands_total)?;
        register(&registry, &opsd_scrape_count_total)?;
        register(&registry, &opsd_uptime_seconds)?;

        Ok(Arc::new(Self {
            registry,
            started_at_unix: now_unix(),
            opsd_cpu_usage_percent,
            opsd_memory_usage_percent,
            opsd_disk_usage_percent,
            opsd_metric_history_len,
            opsd_command_history_len,
            opsd_last_sample_id,
            opsd_last_sample_timestamp_seconds,
            opsd_sample_errors_total,
            opsd_streams_active,
            opsd_streams_rejected_total,
            opsd_commands_total,
            opsd_scrape_count_total,
            opsd_uptime_seconds,
        }))
    }

    pub fn update_from_sample(&self, sample: &MetricSample, history_len: usize) {
        self.opsd_cpu_usage_percent.set(sample.cpu);
        self.opsd_memory_usage_percent.set(sample.memory);
        for (mount, pct) in &sample.disk {
            self.opsd_disk_usage_percent
                .with_label_values(&[mount.as_str()])
                .set(*pct);
        }
        self.opsd_metric_history_len.set(history_len as i64);
        self.opsd_last_sample_id.set(sample.id as i64);
        self.opsd_last_sample_timestamp_seconds.set(sample.timestamp);
    }

    pub fn set_command_history_len(&self, len: usize) {
        self.opsd_command_history_len.set(len as i64);
    }

    pub fn inc_sample_error(&self, source: &str) {
        self.opsd_sample_errors_total
            .with_label_values(&[source])
            .inc();
    }

    pub fn stream_opened(&self, stream: &str) {
        self.opsd_streams_active.with_label_values(&[stream]).inc();
    }

    pub fn stream_closed(&self, stream: &str) {
        self.opsd_streams_active.with_label_values(&[stream]).dec();
    }

    pub fn inc_stream_rejected(&self, stream: &str) {
        self.opsd_streams_rejected_total
            .with_label_values(&[stream])
            .inc();
    }

    pub fn inc_command(&self, target: &str, outcome: &str) {
        self.opsd_commands_total
            .with_label_values(&[target, outcome])
            .inc();
    }

    pub fn inc_scrape_count(&self) {
        self.opsd_scrape_count_total.inc();
    }

    pub fn encode_metrics(&self) -> Result<Vec<u8>, prometheus::Error> {
        let uptime = now_unix().saturating_sub(self.started_at_unix) as f64;
        self.opsd_uptime_seconds.set(uptime);

        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        let mf = self.registry.gather();
        encoder.encode(&mf, &mut buf)?;
        Ok(buf)
    }
}

fn register<T: Collector + Clone + 'static>(
    registry: &Registry,
    collector: &T,
) -> Result<(), prometheus::Error> {
    registry.register(Box::new(collector.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn encodes_sample_and_counters() {
        let metrics = Metrics::new().expect("инициализация метрик");
        let mut disk = BTreeMap::new();
        disk.insert("/".to_string(), 42.0);
        metrics.update_from_sample(
            &MetricSample {
                id: 7,
                timestamp: 1_700_000_000,
                cpu: 12.5,
                memory: 50.0,
                disk,
            },
            3,
        );
        metrics.inc_command("host", "complete");
        metrics.inc_sample_error("cpu");

        let text = String::from_utf8(metrics.encode_metrics().unwrap()).unwrap();
        assert!(text.contains("opsd_cpu_usage_percent 12.5"));
        assert!(text.contains("opsd_disk_usage_percent{mount=\"/\"} 42"));
        assert!(text.contains("opsd_last_sample_id 7"));
        assert!(text.contains("opsd_commands_total{outcome=\"complete\",target=\"host\"} 1"));
        assert!(text.contains("opsd_uptime_seconds"));
    }
}
