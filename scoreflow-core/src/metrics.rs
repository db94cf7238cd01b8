use once_cell::sync::Lazy;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder,
};

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

pub static EVENTS_PROCESSED: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new("scoreflow_events_total", "Game events processed per stage"),
        &["stage"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).unwrap();
    c
});

pub static DROPPED_RECORDS: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new(
            "scoreflow_dropped_records_total",
            "Records dropped without affecting any sum",
        ),
        &["reason"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).unwrap();
    c
});

pub static EMISSIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new("scoreflow_emissions_total", "Window panes emitted"),
        &["path", "timing"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).unwrap();
    c
});

pub static SPAMMER_EVENTS: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new(
        "scoreflow_spammer_events_total",
        "Events excluded from team sums because their user was classified spammy",
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).unwrap();
    c
});

pub static DEFERRED_EVENTS: Lazy<IntGauge> = Lazy::new(|| {
    let g = IntGauge::new(
        "scoreflow_deferred_events",
        "Events waiting for the side input of their window",
    )
    .unwrap();
    REGISTRY.register(Box::new(g.clone())).unwrap();
    g
});

pub static STATE_SIZE: Lazy<IntGaugeVec> = Lazy::new(|| {
    let g = IntGaugeVec::new(
        Opts::new("scoreflow_window_state_size", "Live (key, window) states per path"),
        &["path"],
    )
    .unwrap();
    REGISTRY.register(Box::new(g.clone())).unwrap();
    g
});

pub static EXPIRED_WINDOWS: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new(
            "scoreflow_expired_windows_total",
            "Windows garbage collected after their lateness horizon",
        ),
        &["path"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).unwrap();
    c
});

pub static SIDE_INPUT_VERSIONS: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new(
        "scoreflow_side_input_snapshots_total",
        "Side input snapshots published",
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).unwrap();
    c
});

pub static WATERMARK_MS: Lazy<IntGauge> = Lazy::new(|| {
    let g = IntGauge::new("scoreflow_watermark_ms", "Current watermark as epoch millis").unwrap();
    REGISTRY.register(Box::new(g.clone())).unwrap();
    g
});

pub static LAG_WATERMARK_MS: Lazy<IntGauge> = Lazy::new(|| {
    let g = IntGauge::new(
        "scoreflow_watermark_lag_ms",
        "Lag between now and current watermark in ms",
    )
    .unwrap();
    REGISTRY.register(Box::new(g.clone())).unwrap();
    g
});

pub static BYTES_WRITTEN: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new("scoreflow_bytes_written_total", "Total bytes written by sink"),
        &["sink"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).unwrap();
    c
});

pub static QUEUE_DEPTH: Lazy<IntGauge> = Lazy::new(|| {
    let g = IntGauge::new(
        "scoreflow_queue_depth",
        "Current in-flight queue depth between source and operator",
    )
    .unwrap();
    REGISTRY.register(Box::new(g.clone())).unwrap();
    g
});

pub static OP_PROC_LATENCY_MS: Lazy<Histogram> = Lazy::new(|| {
    let h = Histogram::with_opts(
        HistogramOpts::new(
            "scoreflow_operator_process_latency_ms",
            "Operator on_element processing latency (ms)",
        )
        .buckets(vec![0.1, 0.5, 1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0]),
    )
    .unwrap();
    REGISTRY.register(Box::new(h.clone())).unwrap();
    h
});

pub static SINK_PROC_LATENCY_MS: Lazy<Histogram> = Lazy::new(|| {
    let h = Histogram::with_opts(
        HistogramOpts::new(
            "scoreflow_sink_process_latency_ms",
            "Sink on_emission processing latency (ms)",
        )
        .buckets(vec![0.1, 0.5, 1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0]),
    )
    .unwrap();
    REGISTRY.register(Box::new(h.clone())).unwrap();
    h
});

pub fn record_watermark(wm: chrono::DateTime<chrono::Utc>) {
    let wm_ms = wm.timestamp_millis();
    WATERMARK_MS.set(wm_ms);
    LAG_WATERMARK_MS.set(chrono::Utc::now().timestamp_millis().saturating_sub(wm_ms));
}

pub fn render_prometheus() -> String {
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    encoder.encode(&REGISTRY.gather(), &mut buffer).ok();
    String::from_utf8(buffer).unwrap_or_default()
}
