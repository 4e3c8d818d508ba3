use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

/// Stream and cache metrics for one flag store.
pub struct Metrics {
    registry: Registry,
    pub stream_events: IntCounterVec,
    pub stream_reconnects: IntCounter,
    pub decode_errors: IntCounterVec,
    pub flags_total: IntGauge,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let stream_events = IntCounterVec::new(
            Opts::new("flagsync_stream_events_total", "Stream events received by event name"),
            &["event"],
        )
        .expect("failed to create stream_events metric");

        let stream_reconnects = IntCounter::new(
            "flagsync_stream_reconnects_total",
            "Stream reconnect attempts",
        )
        .expect("failed to create stream_reconnects metric");

        let decode_errors = IntCounterVec::new(
            Opts::new("flagsync_decode_errors_total", "Stream payloads that failed to decode"),
            &["event"],
        )
        .expect("failed to create decode_errors metric");

        let flags_total = IntGauge::new("flagsync_flags_total", "Live flags in the local cache")
            .expect("failed to create flags_total metric");

        registry
            .register(Box::new(stream_events.clone()))
            .expect("failed to register stream_events");
        registry
            .register(Box::new(stream_reconnects.clone()))
            .expect("failed to register stream_reconnects");
        registry
            .register(Box::new(decode_errors.clone()))
            .expect("failed to register decode_errors");
        registry
            .register(Box::new(flags_total.clone()))
            .expect("failed to register flags_total");

        Self {
            registry,
            stream_events,
            stream_reconnects,
            decode_errors,
            flags_total,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Prometheus text exposition of every metric.
    pub fn render(&self) -> String {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if encoder.encode(&self.registry.gather(), &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
