use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

pub static BUS_AVAILABLE: Lazy<IntGauge> = Lazy::new(|| {
    let g = IntGauge::new("relay_bus_available", "Bus subscription state: 1=up, 0=down").unwrap();
    REGISTRY.register(Box::new(g.clone())).ok();
    g
});

pub static ACTIVE_CONNECTIONS: Lazy<IntGauge> = Lazy::new(|| {
    let g = IntGauge::new("relay_active_connections", "Live dashboard connections").unwrap();
    REGISTRY.register(Box::new(g.clone())).ok();
    g
});

pub static CONNECTIONS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new("relay_connections_total", "Connections accepted").unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static MESSAGES_DELIVERED: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new(
        "relay_messages_delivered_total",
        "Frames queued to dashboard connections",
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static DELIVERY_ERRORS: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new(
        "relay_delivery_errors_total",
        "Frames that could not be queued to a connection",
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static EVICTIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new("relay_evictions_total", "Connections evicted by the relay"),
        &["reason"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static BUS_RECONNECTS: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new(
        "relay_bus_reconnects_total",
        "Reconnect attempts made by the bus listener",
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static BUS_MESSAGES: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new("relay_bus_messages_total", "Bus messages forwarded to clients"),
        &["route"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static TASK_REQUESTS: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new("relay_task_requests_total", "Analysis requests by outcome"),
        &["outcome"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub fn export_prometheus() -> String {
    let metric_families = REGISTRY.gather();
    let mut buf = Vec::new();
    TextEncoder::new().encode(&metric_families, &mut buf).ok();
    String::from_utf8(buf).unwrap_or_default()
}
