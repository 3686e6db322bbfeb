//! Metrics collection for the API service.
//!
//! All collectors live on a service-owned [`Registry`] so several service
//! instances (and tests) can coexist in one process.

use prometheus::{
    Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};
use std::sync::Arc;
use wa_gateway_core::IngestionReport;

/// Outcome label values for webhook deliveries
pub mod outcome {
    pub const ACCEPTED: &str = "accepted";
    pub const UNAUTHORIZED: &str = "unauthorized";
    pub const BAD_REQUEST: &str = "bad_request";
    pub const STORAGE_FAILURE: &str = "storage_failure";

    pub const QUEUED: &str = "queued";
    pub const SENT: &str = "sent";
    pub const FAILED: &str = "failed";
    pub const NOT_RECORDED: &str = "not_recorded";
}

/// Service metrics for observability
#[derive(Debug)]
pub struct ServiceMetrics {
    registry: Registry,

    // HTTP request metrics
    pub http_requests_total: IntCounterVec,
    pub http_request_duration: Histogram,

    // Webhook ingestion metrics
    pub webhook_deliveries_total: IntCounterVec,
    pub webhook_events_applied_total: IntCounterVec,
    pub webhook_events_rejected_total: IntCounter,
    pub webhook_event_failures_total: IntCounterVec,

    // Outbound metrics
    pub outbound_messages_total: IntCounterVec,

    // Security metrics
    pub authentication_failures_total: IntCounter,
}

impl ServiceMetrics {
    pub fn new() -> Result<Arc<Self>, prometheus::Error> {
        let registry = Registry::new_custom(Some("wa_gateway".to_string()), None)?;

        let http_requests_total = IntCounterVec::new(
            Opts::new("http_requests_total", "Total number of HTTP requests"),
            &["method", "path", "status"],
        )?;
        let http_request_duration = Histogram::with_opts(
            HistogramOpts::new(
                "http_request_duration_seconds",
                "HTTP request processing time",
            )
            .buckets(vec![0.001, 0.01, 0.1, 0.5, 1.0, 5.0]),
        )?;
        let webhook_deliveries_total = IntCounterVec::new(
            Opts::new("webhook_deliveries_total", "Webhook deliveries by outcome"),
            &["outcome"],
        )?;
        let webhook_events_applied_total = IntCounterVec::new(
            Opts::new(
                "webhook_events_applied_total",
                "Webhook events applied to the store",
            ),
            &["kind"],
        )?;
        let webhook_events_rejected_total = IntCounter::new(
            "webhook_events_rejected_total",
            "Webhook events dropped during normalization",
        )?;
        let webhook_event_failures_total = IntCounterVec::new(
            Opts::new(
                "webhook_event_failures_total",
                "Webhook events that could not be applied",
            ),
            &["category"],
        )?;
        let outbound_messages_total = IntCounterVec::new(
            Opts::new("outbound_messages_total", "Outbound messages by outcome"),
            &["outcome"],
        )?;
        let authentication_failures_total = IntCounter::new(
            "authentication_failures_total",
            "Rejected API keys",
        )?;

        registry.register(Box::new(http_requests_total.clone()))?;
        registry.register(Box::new(http_request_duration.clone()))?;
        registry.register(Box::new(webhook_deliveries_total.clone()))?;
        registry.register(Box::new(webhook_events_applied_total.clone()))?;
        registry.register(Box::new(webhook_events_rejected_total.clone()))?;
        registry.register(Box::new(webhook_event_failures_total.clone()))?;
        registry.register(Box::new(outbound_messages_total.clone()))?;
        registry.register(Box::new(authentication_failures_total.clone()))?;

        Ok(Arc::new(Self {
            registry,
            http_requests_total,
            http_request_duration,
            webhook_deliveries_total,
            webhook_events_applied_total,
            webhook_events_rejected_total,
            webhook_event_failures_total,
            outbound_messages_total,
            authentication_failures_total,
        }))
    }

    pub fn record_http_request(
        &self,
        method: &str,
        path: &str,
        status: u16,
        duration: std::time::Duration,
    ) {
        let status = status.to_string();
        self.http_requests_total
            .with_label_values(&[method, path, status.as_str()])
            .inc();
        self.http_request_duration.observe(duration.as_secs_f64());
    }

    /// Record one webhook delivery and the events it carried
    pub fn record_webhook(&self, outcome: &str, report: Option<&IngestionReport>) {
        self.webhook_deliveries_total
            .with_label_values(&[outcome])
            .inc();

        let Some(report) = report else {
            return;
        };

        self.webhook_events_applied_total
            .with_label_values(&["message_created"])
            .inc_by(report.messages_created as u64);
        self.webhook_events_applied_total
            .with_label_values(&["message_duplicate"])
            .inc_by(report.messages_duplicate as u64);
        self.webhook_events_applied_total
            .with_label_values(&["status"])
            .inc_by(report.statuses_applied as u64);
        self.webhook_events_rejected_total
            .inc_by(report.rejected.len() as u64);

        for failure in &report.failures {
            let category = format!("{:?}", failure.error.error_category()).to_lowercase();
            self.webhook_event_failures_total
                .with_label_values(&[category.as_str()])
                .inc();
        }
    }

    pub fn record_outbound(&self, outcome: &str) {
        self.outbound_messages_total
            .with_label_values(&[outcome])
            .inc();
    }

    /// Render every collector in the Prometheus text format
    pub fn render(&self) -> Result<String, prometheus::Error> {
        TextEncoder::new().encode_to_string(&self.registry.gather())
    }
}

#[cfg(test)]
#[path = "metrics_tests.rs"]
mod tests;
