//! Prometheus metrics for the media engine
//!
//! All metrics are registered against a single global registry and exposed
//! via the /metrics endpoint for Prometheus scraping. Connection lifecycle
//! counters are labeled by tenant, user, and room so the application layer
//! can attribute watch-time per merchant broadcast.

use prometheus::{
    register_int_counter_vec_with_registry, register_int_gauge_with_registry, Encoder,
    IntCounterVec, IntGauge, Registry, TextEncoder,
};

/// Global metrics registry
pub static REGISTRY: std::sync::LazyLock<Registry> = std::sync::LazyLock::new(|| {
    let registry = Registry::new();

    // Default process metrics (CPU, memory, fds) for the scraper
    #[cfg(target_os = "linux")]
    {
        let process = prometheus::process_collector::ProcessCollector::for_self();
        registry
            .register(Box::new(process))
            .expect("Failed to register process collector");
    }

    registry
});

/// Signaling connections opened, labeled by tenant, user, and room
pub static SIGNAL_CONNECTIONS: std::sync::LazyLock<IntCounterVec> =
    std::sync::LazyLock::new(|| {
        register_int_counter_vec_with_registry!(
            "signal_connections_total",
            "Total number of signaling connections opened",
            &["tenant", "user", "room"],
            REGISTRY.clone()
        )
        .expect("Failed to register SIGNAL_CONNECTIONS")
    });

/// Signaling disconnections, labeled by tenant, user, and room
pub static SIGNAL_DISCONNECTIONS: std::sync::LazyLock<IntCounterVec> =
    std::sync::LazyLock::new(|| {
        register_int_counter_vec_with_registry!(
            "signal_disconnections_total",
            "Total number of signaling connections closed",
            &["tenant", "user", "room"],
            REGISTRY.clone()
        )
        .expect("Failed to register SIGNAL_DISCONNECTIONS")
    });

/// Number of live rooms (routers)
pub static ROOMS_ACTIVE: std::sync::LazyLock<IntGauge> = std::sync::LazyLock::new(|| {
    register_int_gauge_with_registry!(
        "rooms_active",
        "Current number of live rooms",
        REGISTRY.clone()
    )
    .expect("Failed to register ROOMS_ACTIVE")
});

/// Number of connected participants across all rooms
pub static PARTICIPANTS_ACTIVE: std::sync::LazyLock<IntGauge> = std::sync::LazyLock::new(|| {
    register_int_gauge_with_registry!(
        "participants_active",
        "Current number of connected participants",
        REGISTRY.clone()
    )
    .expect("Failed to register PARTICIPANTS_ACTIVE")
});

/// Number of live producers (inbound broadcast tracks)
pub static PRODUCERS_ACTIVE: std::sync::LazyLock<IntGauge> = std::sync::LazyLock::new(|| {
    register_int_gauge_with_registry!(
        "producers_active",
        "Current number of live producers",
        REGISTRY.clone()
    )
    .expect("Failed to register PRODUCERS_ACTIVE")
});

/// Number of live consumers (outbound forwarded tracks)
pub static CONSUMERS_ACTIVE: std::sync::LazyLock<IntGauge> = std::sync::LazyLock::new(|| {
    register_int_gauge_with_registry!(
        "consumers_active",
        "Current number of live consumers",
        REGISTRY.clone()
    )
    .expect("Failed to register CONSUMERS_ACTIVE")
});

/// Record a signaling connection for the given identity labels.
pub fn record_connection(tenant: &str, user: &str, room: &str) {
    SIGNAL_CONNECTIONS
        .with_label_values(&[tenant, user, room])
        .inc();
}

/// Record a signaling disconnection for the given identity labels.
pub fn record_disconnection(tenant: &str, user: &str, room: &str) {
    SIGNAL_DISCONNECTIONS
        .with_label_values(&[tenant, user, room])
        .inc();
}

/// Expose metrics in Prometheus text format
pub fn gather_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    String::from_utf8(buffer).map_err(|_| prometheus::Error::Msg("Invalid UTF-8".to_string()))
}
