use prometheus::{
    register_int_counter_vec_with_registry, register_int_counter_with_registry,
    register_int_gauge_with_registry, IntCounter, IntCounterVec, IntGauge, Registry,
};
use std::sync::Arc;

pub struct SignalingMetrics {
    pub active_connections: IntGauge,
    pub online_devices: IntGauge,
    pub control_requests: IntCounterVec,
    pub messages_relayed: IntCounter,
    pub messages_dropped: IntCounterVec,
    pub auth_failures: IntCounter,
    pub rate_limit_hits: IntCounter,
    pub registry: Arc<Registry>,
}

impl SignalingMetrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Arc::new(Registry::new());

        let active_connections = register_int_gauge_with_registry!(
            "tivi_signaling_active_connections",
            "Number of authenticated websocket connections",
            registry
        )?;

        let online_devices = register_int_gauge_with_registry!(
            "tivi_signaling_online_devices",
            "Number of registered devices",
            registry
        )?;

        let control_requests = register_int_counter_vec_with_registry!(
            "tivi_signaling_control_requests_total",
            "Control handshake actions by outcome",
            &["action", "outcome"],
            registry
        )?;

        let messages_relayed = register_int_counter_with_registry!(
            "tivi_signaling_messages_relayed_total",
            "Negotiation messages delivered",
            registry
        )?;

        let messages_dropped = register_int_counter_vec_with_registry!(
            "tivi_signaling_messages_dropped_total",
            "Negotiation messages dropped by reason",
            &["reason"],
            registry
        )?;

        let auth_failures = register_int_counter_with_registry!(
            "tivi_signaling_auth_failures_total",
            "Rejected connection attempts",
            registry
        )?;

        let rate_limit_hits = register_int_counter_with_registry!(
            "tivi_signaling_rate_limit_hits_total",
            "Total number of rate limit hits",
            registry
        )?;

        Ok(Self {
            active_connections,
            online_devices,
            control_requests,
            messages_relayed,
            messages_dropped,
            auth_failures,
            rate_limit_hits,
            registry,
        })
    }

    pub fn record_control(&self, action: &str, outcome: &str) {
        self.control_requests.with_label_values(&[action, outcome]).inc();
    }

    pub fn export_prometheus(&self) -> anyhow::Result<String> {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}
