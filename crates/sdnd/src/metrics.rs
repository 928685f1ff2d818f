//! Prometheus metrics for the daemon.

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::sync::Arc;

/// Outcome label for a processed command.
pub const OUTCOME_OK: &str = "ok";
pub const OUTCOME_ERROR: &str = "error";

#[derive(Clone)]
pub struct MetricsCollector {
    // Counters
    pub commands_total: IntCounterVec,
    pub tunnel_failures_total: IntCounter,

    // Gauges
    pub connections: IntGauge,
    pub tunnels: IntGauge,

    // Histograms
    pub command_latency_seconds: Histogram,

    // Registry for export
    pub registry: Arc<Registry>,
}

impl MetricsCollector {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let commands_total = IntCounterVec::new(
            Opts::new(
                "sdnd_commands_total",
                "Commands processed by the command core, by kind and outcome",
            ),
            &["kind", "outcome"],
        )?;
        registry.register(Box::new(commands_total.clone()))?;

        let tunnel_failures_total = IntCounter::new(
            "sdnd_tunnel_failures_total",
            "Tunnel provisioning or removal failures",
        )?;
        registry.register(Box::new(tunnel_failures_total.clone()))?;

        let connections = IntGauge::new("sdnd_connections", "Live container connections")?;
        registry.register(Box::new(connections.clone()))?;

        let tunnels = IntGauge::new("sdnd_tunnels", "Tunnel ports provisioned to peers")?;
        registry.register(Box::new(tunnels.clone()))?;

        let command_latency_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "sdnd_command_latency_seconds",
                "Command processing latency in seconds",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        )?;
        registry.register(Box::new(command_latency_seconds.clone()))?;

        Ok(Self {
            commands_total,
            tunnel_failures_total,
            connections,
            tunnels,
            command_latency_seconds,
            registry: Arc::new(registry),
        })
    }

    /// Counts one processed command.
    pub fn record_command(&self, kind: &str, ok: bool) {
        let outcome = if ok { OUTCOME_OK } else { OUTCOME_ERROR };
        self.commands_total.with_label_values(&[kind, outcome]).inc();
    }

    pub fn commands(&self, kind: &str, outcome: &str) -> u64 {
        self.commands_total.with_label_values(&[kind, outcome]).get()
    }

    pub fn record_tunnel_failure(&self) {
        self.tunnel_failures_total.inc();
    }

    pub fn set_connections(&self, count: usize) {
        self.connections.set(count as i64);
    }

    /// Renders the registry in the Prometheus text format.
    pub fn encode(&self) -> Result<(Vec<u8>, String), prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok((buffer, encoder.format_type().to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = MetricsCollector::new().unwrap();
        assert_eq!(metrics.tunnel_failures_total.get(), 0);
        assert_eq!(metrics.connections.get(), 0);
    }

    #[test]
    fn test_record_command() {
        let metrics = MetricsCollector::new().unwrap();
        metrics.record_command("connect", true);
        metrics.record_command("connect", true);
        metrics.record_command("connect", false);

        assert_eq!(metrics.commands("connect", OUTCOME_OK), 2);
        assert_eq!(metrics.commands("connect", OUTCOME_ERROR), 1);
        assert_eq!(metrics.commands("disconnect", OUTCOME_OK), 0);
    }

    #[test]
    fn test_encode_text_format() {
        let metrics = MetricsCollector::new().unwrap();
        metrics.record_tunnel_failure();
        metrics.set_connections(3);

        let (body, content_type) = metrics.encode().unwrap();
        let text = String::from_utf8(body).unwrap();
        assert!(content_type.starts_with("text/plain"));
        assert!(text.contains("sdnd_tunnel_failures_total 1"));
        assert!(text.contains("sdnd_connections 3"));
    }
}
