use anyhow::{Context, Result};
use opentelemetry::{
    global,
    metrics::{Counter, Histogram, Meter},
    KeyValue,
};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{metrics::SdkMeterProvider, Resource};
use std::time::Duration;
use tracing::info;

/// Bridge metrics exported over OTLP.
pub struct BridgeMetrics {
    pub state_transitions: Counter<u64>,
    pub reconnects_scheduled: Counter<u64>,
    pub bootstrap_failures: Counter<u64>,
    pub calls_rejected: Counter<u64>,
    pub messages_sent: Counter<u64>,
    pub send_latency: Histogram<f64>,
}

impl BridgeMetrics {
    pub fn new(meter: &Meter) -> Self {
        let state_transitions = meter
            .u64_counter("wabridge.session.transitions")
            .with_description("Client session state transitions")
            .build();

        let reconnects_scheduled = meter
            .u64_counter("wabridge.session.reconnects_scheduled")
            .with_description("Rebootstraps scheduled after a disconnect")
            .build();

        let bootstrap_failures = meter
            .u64_counter("wabridge.session.bootstrap_failures")
            .with_description("Session bootstrap attempts that failed")
            .build();

        let calls_rejected = meter
            .u64_counter("wabridge.calls.rejected")
            .with_description("Incoming calls handled by auto-reject")
            .build();

        let messages_sent = meter
            .u64_counter("wabridge.messages.sent")
            .with_description("Outbound messages by outcome")
            .build();

        let send_latency = meter
            .f64_histogram("wabridge.messages.send_latency_ms")
            .with_description("Outbound message dispatch latency in milliseconds")
            .build();

        Self {
            state_transitions,
            reconnects_scheduled,
            bootstrap_failures,
            calls_rejected,
            messages_sent,
            send_latency,
        }
    }

    pub fn record_transition(&self, from: &str, to: &str) {
        self.state_transitions.add(
            1,
            &[
                KeyValue::new("from", from.to_string()),
                KeyValue::new("to", to.to_string()),
            ],
        );
    }

    pub fn record_reconnect_scheduled(&self, attempt: u32) {
        self.reconnects_scheduled
            .add(1, &[KeyValue::new("attempt", i64::from(attempt))]);
    }

    pub fn record_bootstrap_failure(&self, stage: &'static str) {
        self.bootstrap_failures
            .add(1, &[KeyValue::new("stage", stage)]);
    }

    pub fn record_call_rejected(&self, outcome: &'static str) {
        self.calls_rejected
            .add(1, &[KeyValue::new("outcome", outcome)]);
    }

    pub fn record_message(&self, outcome: &'static str, duration_ms: Option<f64>) {
        self.messages_sent
            .add(1, &[KeyValue::new("outcome", outcome)]);
        if let Some(duration_ms) = duration_ms {
            self.send_latency
                .record(duration_ms, &[KeyValue::new("outcome", outcome)]);
        }
    }
}

/// Initialize OTLP metrics export
pub fn init_metrics(endpoint: &str, service_name: &str) -> Result<(SdkMeterProvider, BridgeMetrics)> {
    info!(%endpoint, "initializing OTLP telemetry");

    let export_config = opentelemetry_otlp::ExportConfig {
        endpoint: Some(endpoint.to_string()),
        timeout: Duration::from_secs(10),
        ..Default::default()
    };

    let exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_http()
        .with_export_config(export_config)
        .build()
        .context("building OTLP metric exporter")?;

    let reader = opentelemetry_sdk::metrics::PeriodicReader::builder(
        exporter,
        opentelemetry_sdk::runtime::Tokio,
    )
    .with_interval(Duration::from_secs(30))
    .build();

    let resource = Resource::new(vec![
        KeyValue::new("service.name", service_name.to_string()),
        KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
    ]);

    let provider = SdkMeterProvider::builder()
        .with_reader(reader)
        .with_resource(resource)
        .build();

    global::set_meter_provider(provider.clone());

    let meter = global::meter("wabridged");
    let metrics = BridgeMetrics::new(&meter);

    Ok((provider, metrics))
}

pub fn shutdown_metrics(provider: SdkMeterProvider) -> Result<()> {
    info!("shutting down telemetry");
    provider
        .shutdown()
        .context("shutting down meter provider")?;
    Ok(())
}
