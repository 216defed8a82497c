use lazy_static::lazy_static;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref MESSAGES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "dispatcher_messages_total",
        "Total report messages received from MQTT"
    ))
    .unwrap();
    pub static ref DECODE_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "dispatcher_decode_failures_total",
        "Total report messages skipped because they could not be decoded"
    ))
    .unwrap();
    pub static ref COMMANDS_PUBLISHED_TOTAL: CounterVec = CounterVec::new(
        Opts::new(
            "dispatcher_commands_published_total",
            "Total commands handed to the MQTT client"
        ),
        &["cmd"]
    )
    .unwrap();
    pub static ref PUBLISH_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "dispatcher_publish_failures_total",
        "Total commands the MQTT client refused to queue"
    ))
    .unwrap();
    pub static ref ACKS_RESOLVED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "dispatcher_acks_resolved_total",
        "Total acknowledgments matched to an outstanding command"
    ))
    .unwrap();
    pub static ref OUTSTANDING_COMMANDS: Gauge = Gauge::with_opts(Opts::new(
        "dispatcher_outstanding_commands",
        "Commands issued and not yet acknowledged"
    ))
    .unwrap();
    pub static ref ROUND_TRIP_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "dispatcher_round_trip_seconds",
            "Time from issuing a switch command to receiving its acknowledgment"
        )
        .buckets(vec![
            0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0
        ])
    )
    .unwrap();
}

pub fn init_metrics() {
    REGISTRY.register(Box::new(MESSAGES_TOTAL.clone())).unwrap();
    REGISTRY
        .register(Box::new(DECODE_FAILURES_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(COMMANDS_PUBLISHED_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(PUBLISH_FAILURES_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(ACKS_RESOLVED_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(OUTSTANDING_COMMANDS.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(ROUND_TRIP_SECONDS.clone()))
        .unwrap();
}

pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap();
    String::from_utf8(buffer).unwrap()
}
