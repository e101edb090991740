//! Metrics and monitoring using Prometheus.
//!
//! Every metric is labelled by subscription. The set covers:
//!
//! - **Counters**: messages received and expired, control RPCs sent, ack failures by
//!   outcome, stream reconnects
//! - **Histograms**: ack latency
//! - **Gauges**: outstanding messages and bytes held by flow control

use once_cell::sync::Lazy;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry,
    TextEncoder,
};
use std::sync::Arc;
use tracing::error;

/// Global metrics registry
static METRICS_REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

/// Global metrics instance
pub static METRICS: Lazy<Arc<Metrics>> = Lazy::new(|| {
    let metrics = Metrics::new();
    if let Err(e) = metrics.register(&METRICS_REGISTRY) {
        error!("Failed to register metrics: {}", e);
    }
    Arc::new(metrics)
});

/// Metrics collector for subscribers
pub struct Metrics {
    /// Messages received from streams (counter)
    pub messages_received_total: IntCounterVec,
    /// Messages dropped locally after their lease ran out (counter)
    pub messages_expired_total: IntCounterVec,
    /// Ack ids sent in control RPCs, by kind (counter)
    pub ack_ids_sent_total: IntCounterVec,
    /// Ack ids whose RPC failed for good, by outcome (counter)
    pub ack_failures_total: IntCounterVec,
    /// Stream reconnects after a retryable error (counter)
    pub stream_reconnects_total: IntCounterVec,

    /// Time from receipt to ack in seconds (histogram)
    pub ack_latency_seconds: HistogramVec,

    /// Messages held by flow control (gauge)
    pub outstanding_messages: IntGaugeVec,
    /// Bytes held by flow control (gauge)
    pub outstanding_bytes: IntGaugeVec,
}

impl Metrics {
    /// Create a new Metrics instance
    pub fn new() -> Self {
        let messages_received_total = IntCounterVec::new(
            Opts::new(
                "pullsub_messages_received_total",
                "Total messages received from streaming pull",
            ),
            &["subscription"],
        )
        .expect("Failed to create messages_received_total metric");

        let messages_expired_total = IntCounterVec::new(
            Opts::new(
                "pullsub_messages_expired_total",
                "Total messages dropped after their lease expired",
            ),
            &["subscription"],
        )
        .expect("Failed to create messages_expired_total metric");

        let ack_ids_sent_total = IntCounterVec::new(
            Opts::new(
                "pullsub_ack_ids_sent_total",
                "Total ack ids sent in acknowledge and modify deadline requests",
            ),
            &["subscription", "kind"],
        )
        .expect("Failed to create ack_ids_sent_total metric");

        let ack_failures_total = IntCounterVec::new(
            Opts::new(
                "pullsub_ack_failures_total",
                "Total ack ids that failed permanently",
            ),
            &["subscription", "outcome"],
        )
        .expect("Failed to create ack_failures_total metric");

        let stream_reconnects_total = IntCounterVec::new(
            Opts::new(
                "pullsub_stream_reconnects_total",
                "Total streaming pull reconnects",
            ),
            &["subscription"],
        )
        .expect("Failed to create stream_reconnects_total metric");

        let ack_latency_seconds = HistogramVec::new(
            HistogramOpts::new("pullsub_ack_latency_seconds", "Receipt to ack latency in seconds")
                .buckets(vec![1.0, 2.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 600.0]),
            &["subscription"],
        )
        .expect("Failed to create ack_latency_seconds metric");

        let outstanding_messages = IntGaugeVec::new(
            Opts::new(
                "pullsub_outstanding_messages",
                "Messages delivered to the user and not yet acked or nacked",
            ),
            &["subscription"],
        )
        .expect("Failed to create outstanding_messages metric");

        let outstanding_bytes = IntGaugeVec::new(
            Opts::new(
                "pullsub_outstanding_bytes",
                "Bytes delivered to the user and not yet acked or nacked",
            ),
            &["subscription"],
        )
        .expect("Failed to create outstanding_bytes metric");

        Self {
            messages_received_total,
            messages_expired_total,
            ack_ids_sent_total,
            ack_failures_total,
            stream_reconnects_total,
            ack_latency_seconds,
            outstanding_messages,
            outstanding_bytes,
        }
    }

    /// Register all metrics with the registry
    fn register(&self, registry: &Registry) -> Result<(), prometheus::Error> {
        registry.register(Box::new(self.messages_received_total.clone()))?;
        registry.register(Box::new(self.messages_expired_total.clone()))?;
        registry.register(Box::new(self.ack_ids_sent_total.clone()))?;
        registry.register(Box::new(self.ack_failures_total.clone()))?;
        registry.register(Box::new(self.stream_reconnects_total.clone()))?;
        registry.register(Box::new(self.ack_latency_seconds.clone()))?;
        registry.register(Box::new(self.outstanding_messages.clone()))?;
        registry.register(Box::new(self.outstanding_bytes.clone()))?;
        Ok(())
    }

    /// Gather metrics in Prometheus text format
    pub fn gather(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = METRICS_REGISTRY.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer).unwrap_or_default())
    }

    /// Publish flow controller occupancy for a subscription
    pub fn set_outstanding(&self, subscription: &str, messages: u64, bytes: u64) {
        self.outstanding_messages
            .with_label_values(&[subscription])
            .set(messages as i64);
        self.outstanding_bytes
            .with_label_values(&[subscription])
            .set(bytes as i64);
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Get the global metrics instance
pub fn get_metrics() -> Arc<Metrics> {
    METRICS.clone()
}

/// Render every registered metric in the text exposition format
pub fn gather_metrics() -> String {
    match get_metrics().gather() {
        Ok(output) => output,
        Err(e) => {
            error!("Failed to gather metrics: {}", e);
            String::new()
        }
    }
}
