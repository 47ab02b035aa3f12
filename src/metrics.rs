use std::net::SocketAddr;

/// Install the Prometheus exporter if an address is configured.
///
/// Idempotent; a second install attempt is logged and ignored so tests and
/// the combined `run` mode can call this freely.
pub fn init_metrics() {
    let addr_str = match std::env::var("METRICS_ADDR") {
        Ok(v) => v,
        Err(_) => return,
    };
    let addr: SocketAddr = match addr_str.parse() {
        Ok(a) => a,
        Err(e) => {
            tracing::warn!("Invalid METRICS_ADDR '{}': {}", addr_str, e);
            return;
        }
    };
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new().with_http_listener(addr);
    match builder.install() {
        Ok(()) => {
            tracing::info!("Prometheus exporter listening on http://{}/metrics", addr);
        }
        Err(e) => {
            tracing::warn!("Prometheus exporter install failed (possibly already installed): {}", e);
        }
    }
}

/// Ingest endpoint counters.
pub mod ingest {
    pub fn envelope_accepted(items: u64) {
        ::metrics::counter!("ingest_envelopes_accepted_total").increment(1);
        ::metrics::counter!("ingest_items_accepted_total").increment(items);
    }

    pub fn envelope_rejected() {
        ::metrics::counter!("ingest_envelopes_rejected_total").increment(1);
    }

    pub fn items_rejected(items: u64) {
        ::metrics::counter!("ingest_items_rejected_total").increment(items);
    }
}

/// Broker producer/consumer counters.
pub mod broker {
    pub fn enqueued() {
        ::metrics::counter!("broker_records_enqueued_total").increment(1);
    }

    pub fn enqueue_failed() {
        ::metrics::counter!("broker_enqueue_failures_total").increment(1);
    }

    pub fn acked() {
        ::metrics::counter!("broker_records_acked_total").increment(1);
    }

    pub fn redelivery_pending() {
        ::metrics::counter!("broker_records_left_pending_total").increment(1);
    }
}

/// Reconciler outcome counters.
pub mod reconcile {
    use crate::reconciler::BatchStats;

    pub fn batch_processed(stats: &BatchStats) {
        ::metrics::counter!("reconcile_devices_created_total").increment(stats.devices.created);
        ::metrics::counter!("reconcile_devices_updated_total").increment(stats.devices.updated);
        ::metrics::counter!("reconcile_protocols_created_total").increment(stats.protocols.created);
        ::metrics::counter!("reconcile_protocols_updated_total").increment(stats.protocols.updated);
        ::metrics::counter!("reconcile_item_errors_total").increment(stats.errors.len() as u64);
    }
}
