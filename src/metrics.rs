use prometheus::{Encoder, Histogram, IntCounter, IntGauge, Registry, TextEncoder};
use std::time::Duration;

pub struct Metrics {
    registry: Registry,

    // Supervisor metrics
    pub launches_total: IntCounter,
    pub launch_failures_total: IntCounter,
    pub relaunches_total: IntCounter,
    pub launch_duration: Histogram,

    // Health check metrics
    pub health_checks_total: IntCounter,
    pub health_checks_failed: IntCounter,

    // Broker metrics
    pub served_resources: IntGauge,
    pub dial_failures: IntCounter,

    // Bootstrap metrics
    pub bootstrap_failures: IntCounter,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let launches_total = IntCounter::new(
            "plugin_host_launches_total",
            "Total number of successful plugin launches",
        )
        .expect("metric creation failed");
        let launch_failures_total = IntCounter::new(
            "plugin_host_launch_failures_total",
            "Total number of failed plugin launch attempts",
        )
        .expect("metric creation failed");
        let relaunches_total = IntCounter::new(
            "plugin_host_relaunches_total",
            "Total number of relaunches after a plugin became unhealthy",
        )
        .expect("metric creation failed");
        let launch_duration = Histogram::with_opts(prometheus::HistogramOpts::new(
            "plugin_host_launch_duration_seconds",
            "Plugin launch duration in seconds",
        ))
        .expect("metric creation failed");

        let health_checks_total = IntCounter::new(
            "plugin_host_health_checks_total",
            "Total number of plugin health checks",
        )
        .expect("metric creation failed");
        let health_checks_failed = IntCounter::new(
            "plugin_host_health_checks_failed",
            "Total number of failed plugin health checks",
        )
        .expect("metric creation failed");

        let served_resources = IntGauge::new(
            "plugin_host_served_resources",
            "Number of services currently served through brokers",
        )
        .expect("metric creation failed");
        let dial_failures = IntCounter::new(
            "plugin_host_dial_failures_total",
            "Total number of failed broker dials",
        )
        .expect("metric creation failed");

        let bootstrap_failures = IntCounter::new(
            "plugin_host_bootstrap_failures_total",
            "Total number of failed dependency bundle bootstraps",
        )
        .expect("metric creation failed");

        registry.register(Box::new(launches_total.clone())).unwrap();
        registry
            .register(Box::new(launch_failures_total.clone()))
            .unwrap();
        registry.register(Box::new(relaunches_total.clone())).unwrap();
        registry.register(Box::new(launch_duration.clone())).unwrap();
        registry
            .register(Box::new(health_checks_total.clone()))
            .unwrap();
        registry
            .register(Box::new(health_checks_failed.clone()))
            .unwrap();
        registry.register(Box::new(served_resources.clone())).unwrap();
        registry.register(Box::new(dial_failures.clone())).unwrap();
        registry
            .register(Box::new(bootstrap_failures.clone()))
            .unwrap();

        Self {
            registry,
            launches_total,
            launch_failures_total,
            relaunches_total,
            launch_duration,
            health_checks_total,
            health_checks_failed,
            served_resources,
            dial_failures,
            bootstrap_failures,
        }
    }

    pub fn record_health_check(&self, success: bool) {
        self.health_checks_total.inc();
        if !success {
            self.health_checks_failed.inc();
        }
    }

    pub fn record_launch(&self, duration: Duration, success: bool) {
        self.launch_duration.observe(duration.as_secs_f64());
        if success {
            self.launches_total.inc();
        } else {
            self.launch_failures_total.inc();
        }
    }

    pub fn gather_metrics(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    /// Text exposition format of every metric.
    pub fn render(&self) -> String {
        let mut buffer = Vec::new();
        if let Err(e) = TextEncoder::new().encode(&self.gather_metrics(), &mut buffer) {
            tracing::warn!("Failed to encode metrics: {}", e);
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}
