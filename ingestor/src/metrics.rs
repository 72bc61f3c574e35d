use lazy_static::lazy_static;
use prometheus::{Counter, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref MESSAGES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_messages_total",
        "Total messages received from MQTT"
    ))
    .unwrap();
    pub static ref READINGS_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_readings_total",
        "Total readings accepted by the pipeline"
    ))
    .unwrap();
    pub static ref REJECTED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_rejected_total",
        "Total messages dropped by the decoder"
    ))
    .unwrap();
    pub static ref DB_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_db_failures_total",
        "Total database write failures"
    ))
    .unwrap();
    pub static ref EVENTS_PUBLISHED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_events_published_total",
        "Total update events published to the fan-out hub"
    ))
    .unwrap();
    pub static ref OBSERVERS_DROPPED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_observers_dropped_total",
        "Total observers dropped after a failed delivery"
    ))
    .unwrap();
    pub static ref OBSERVERS_CONNECTED: Gauge = Gauge::with_opts(Opts::new(
        "ingestor_observers_connected",
        "Currently connected WebSocket observers"
    ))
    .unwrap();
    pub static ref CHANNEL_FULL_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_channel_full_total",
        "Total number of times the pipeline channel was full (backpressure events)"
    ))
    .unwrap();
    pub static ref INGEST_LATENCY_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "ingestor_ingest_latency_seconds",
            "Time taken for one full ingest pass (decode to fan-out)"
        )
        .buckets(vec![
            0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0
        ])
    )
    .unwrap();
}

pub fn init_metrics() {
    REGISTRY.register(Box::new(MESSAGES_TOTAL.clone())).unwrap();
    REGISTRY.register(Box::new(READINGS_TOTAL.clone())).unwrap();
    REGISTRY.register(Box::new(REJECTED_TOTAL.clone())).unwrap();
    REGISTRY
        .register(Box::new(DB_FAILURES_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(EVENTS_PUBLISHED_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(OBSERVERS_DROPPED_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(OBSERVERS_CONNECTED.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(CHANNEL_FULL_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(INGEST_LATENCY_SECONDS.clone()))
        .unwrap();
}

pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap();
    String::from_utf8(buffer).unwrap()
}
