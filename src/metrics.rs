use std::{sync::Arc, time::Duration};

use prometheus::{
    opts, Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Registry,
    TextEncoder,
};

use crate::frame::Usage;

#[derive(Clone)]
pub struct AppMetrics {
    registry: Registry,
    request_total: IntCounterVec,
    request_duration_seconds: HistogramVec,
    active_relays: IntGauge,
    relay_errors_total: IntCounterVec,
    frames_total: IntCounterVec,
    malformed_frames_total: IntCounter,
    client_aborts_total: IntCounter,
    tokens_total: IntCounterVec,
}

/// Keeps the active-relay gauge raised for as long as a relay task owns it.
pub struct ActiveRelayGuard {
    metrics: Arc<AppMetrics>,
}

impl AppMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let request_total = IntCounterVec::new(
            opts!(
                "relay_http_requests_total",
                "Total HTTP requests processed by the relay"
            ),
            &["stage", "status"],
        )
        .expect("valid request_total metric");

        let request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "relay_http_response_head_seconds",
                "Time until the response head was produced, in seconds",
            ),
            &["stage"],
        )
        .expect("valid request_duration_seconds metric");

        let active_relays = IntGauge::new("relay_active_streams", "Relays currently streaming")
            .expect("valid active_relays metric");

        let relay_errors_total = IntCounterVec::new(
            opts!(
                "relay_errors_total",
                "Relay failures by taxonomy kind and phase"
            ),
            &["kind", "phase"],
        )
        .expect("valid relay_errors_total metric");

        let frames_total = IntCounterVec::new(
            opts!("relay_frames_total", "Frames delivered to clients by type"),
            &["type"],
        )
        .expect("valid frames_total metric");

        let malformed_frames_total = IntCounter::new(
            "relay_malformed_upstream_frames_total",
            "Upstream lines skipped because they could not be decoded",
        )
        .expect("valid malformed_frames_total metric");

        let client_aborts_total = IntCounter::new(
            "relay_client_aborts_total",
            "Streams closed by the client before a terminal frame",
        )
        .expect("valid client_aborts_total metric");

        let tokens_total = IntCounterVec::new(
            opts!("relay_tokens_total", "Token accounting aggregated by type"),
            &["kind"],
        )
        .expect("valid tokens_total metric");

        registry
            .register(Box::new(request_total.clone()))
            .expect("register request_total");
        registry
            .register(Box::new(request_duration_seconds.clone()))
            .expect("register request_duration_seconds");
        registry
            .register(Box::new(active_relays.clone()))
            .expect("register active_relays");
        registry
            .register(Box::new(relay_errors_total.clone()))
            .expect("register relay_errors_total");
        registry
            .register(Box::new(frames_total.clone()))
            .expect("register frames_total");
        registry
            .register(Box::new(malformed_frames_total.clone()))
            .expect("register malformed_frames_total");
        registry
            .register(Box::new(client_aborts_total.clone()))
            .expect("register client_aborts_total");
        registry
            .register(Box::new(tokens_total.clone()))
            .expect("register tokens_total");

        Self {
            registry,
            request_total,
            request_duration_seconds,
            active_relays,
            relay_errors_total,
            frames_total,
            malformed_frames_total,
            client_aborts_total,
            tokens_total,
        }
    }

    pub fn active_relay_guard(self: &Arc<Self>) -> ActiveRelayGuard {
        self.active_relays.inc();
        ActiveRelayGuard {
            metrics: self.clone(),
        }
    }

    pub fn observe_request(&self, stage: &str, status: u16, duration: Duration) {
        let status_label = status.to_string();
        self.request_total
            .with_label_values(&[stage, &status_label])
            .inc();
        self.request_duration_seconds
            .with_label_values(&[stage])
            .observe(duration.as_secs_f64());
    }

    pub fn observe_relay_error(&self, kind: &str, phase: &str) {
        self.relay_errors_total
            .with_label_values(&[kind, phase])
            .inc();
    }

    pub fn observe_frame(&self, kind: &str) {
        self.frames_total.with_label_values(&[kind]).inc();
    }

    pub fn observe_malformed_frame(&self) {
        self.malformed_frames_total.inc();
    }

    pub fn observe_client_abort(&self) {
        self.client_aborts_total.inc();
    }

    pub fn observe_usage(&self, usage: &Usage) {
        self.tokens_total
            .with_label_values(&["input"])
            .inc_by(usage.input_tokens);
        self.tokens_total
            .with_label_values(&["output"])
            .inc_by(usage.output_tokens);
        self.tokens_total
            .with_label_values(&["total"])
            .inc_by(usage.total_tokens);
        if let Some(cache_read) = usage.cache_read_tokens {
            self.tokens_total
                .with_label_values(&["cache_read"])
                .inc_by(cache_read);
        }
        if let Some(cache_write) = usage.cache_write_tokens {
            self.tokens_total
                .with_label_values(&["cache_write"])
                .inc_by(cache_write);
        }
    }

    pub fn render(&self) -> Result<String, String> {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        encoder
            .encode(&families, &mut buffer)
            .map_err(|error| error.to_string())?;
        String::from_utf8(buffer).map_err(|error| error.to_string())
    }
}

impl Default for AppMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ActiveRelayGuard {
    fn drop(&mut self) {
        self.metrics.active_relays.dec();
    }
}
