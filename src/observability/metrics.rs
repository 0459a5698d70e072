use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub fanout_deliveries_total: IntCounterVec,
    pub decode_failures_total: IntCounterVec,
    pub assignments_total: IntCounterVec,
    pub assignment_latency_seconds: HistogramVec,
    pub active_connections: IntGauge,
    pub pending_orders: IntGauge,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let fanout_deliveries_total = IntCounterVec::new(
            Opts::new(
                "fanout_deliveries_total",
                "Payloads handed to live connections by route",
            ),
            &["route"],
        )
        .expect("valid fanout_deliveries_total metric");

        let decode_failures_total = IntCounterVec::new(
            Opts::new(
                "decode_failures_total",
                "Bus payloads dropped because they failed to decode",
            ),
            &["channel"],
        )
        .expect("valid decode_failures_total metric");

        let assignments_total = IntCounterVec::new(
            Opts::new("assignments_total", "Total assignment attempts by outcome"),
            &["outcome"],
        )
        .expect("valid assignments_total metric");

        let assignment_latency_seconds = HistogramVec::new(
            HistogramOpts::new(
                "assignment_latency_seconds",
                "Latency of assignment transactions in seconds",
            ),
            &["outcome"],
        )
        .expect("valid assignment_latency_seconds metric");

        let active_connections =
            IntGauge::new("active_connections", "Currently registered socket connections")
                .expect("valid active_connections metric");

        let pending_orders = IntGauge::new("pending_orders", "Orders waiting for a driver")
            .expect("valid pending_orders metric");

        registry
            .register(Box::new(fanout_deliveries_total.clone()))
            .expect("register fanout_deliveries_total");
        registry
            .register(Box::new(decode_failures_total.clone()))
            .expect("register decode_failures_total");
        registry
            .register(Box::new(assignments_total.clone()))
            .expect("register assignments_total");
        registry
            .register(Box::new(assignment_latency_seconds.clone()))
            .expect("register assignment_latency_seconds");
        registry
            .register(Box::new(active_connections.clone()))
            .expect("register active_connections");
        registry
            .register(Box::new(pending_orders.clone()))
            .expect("register pending_orders");

        Self {
            registry,
            fanout_deliveries_total,
            decode_failures_total,
            assignments_total,
            assignment_latency_seconds,
            active_connections,
            pending_orders,
        }
    }

    pub fn encode(&self) -> Result<String, String> {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();

        TextEncoder::new()
            .encode(&metric_families, &mut buffer)
            .map_err(|err| format!("failed to encode metrics: {err}"))?;

        String::from_utf8(buffer).map_err(|err| format!("metrics are not valid utf8: {err}"))
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
