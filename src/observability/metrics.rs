//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Define tunnel metrics (connections, bytes, dial failures, probes)
//! - Expose a Prometheus-compatible scrape endpoint when enabled
//!
//! # Metrics
//! - `tunnel_connections_total` (counter): dispatched connections by rule type, outcome
//! - `tunnel_active_connections` (gauge): currently registered connections
//! - `tunnel_bytes_total` (counter): bytes by direction
//! - `tunnel_dial_failures_total` (counter): failed outbound connects by proxy
//! - `tunnel_probe_delay_ms` (histogram): successful probe delays by proxy
//! - `tunnel_probe_failures_total` (counter): failed probes by proxy
//! - `tunnel_provider_updates_total` (counter): provider refreshes by provider, result
//! - `tunnel_config_reloads_total` (counter): config applications by result

use std::net::SocketAddr;

use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus recorder and its HTTP listener.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_connection(rule_type: &str, outcome: &'static str) {
    ::metrics::counter!(
        "tunnel_connections_total",
        "rule" => rule_type.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}

pub fn record_active_connections(count: usize) {
    ::metrics::gauge!("tunnel_active_connections").set(count as f64);
}

pub fn record_bytes(upload: u64, download: u64) {
    if upload > 0 {
        ::metrics::counter!("tunnel_bytes_total", "direction" => "up").increment(upload);
    }
    if download > 0 {
        ::metrics::counter!("tunnel_bytes_total", "direction" => "down").increment(download);
    }
}

pub fn record_dial_failure(proxy: &str) {
    ::metrics::counter!("tunnel_dial_failures_total", "proxy" => proxy.to_string()).increment(1);
}

/// `delay` is `None` for a failed probe.
pub fn record_probe(proxy: &str, delay: Option<u32>) {
    match delay {
        Some(ms) => {
            ::metrics::histogram!("tunnel_probe_delay_ms", "proxy" => proxy.to_string()).record(f64::from(ms))
        }
        None => ::metrics::counter!("tunnel_probe_failures_total", "proxy" => proxy.to_string()).increment(1),
    }
}

pub fn record_provider_update(provider: &str, result: &'static str) {
    ::metrics::counter!(
        "tunnel_provider_updates_total",
        "provider" => provider.to_string(),
        "result" => result
    )
    .increment(1);
}

pub fn record_config_reload(result: &'static str) {
    ::metrics::counter!("tunnel_config_reloads_total", "result" => result).increment(1);
}
