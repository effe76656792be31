//! Metrics for the replica services.
//!
//! # Exported Metrics
//!
//! ## Counters
//! - `replica.messages{subject, disposition}` - Settled deliveries
//! - `replica.dead_letters{subject, class}` - Messages abandoned
//! - `replica.published{subject}` - Notifications committed with their change
//! - `replica.redeliveries{subject}` - Naks re-appended by the broker adapter

use metrics::describe_counter;
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};
use std::net::{Ipv4Addr, SocketAddr};

/// Install the exporter when `port` is set, then register the descriptions
/// with it.
///
/// # Errors
///
/// Returns [`BuildError`] if the exporter cannot be installed.
pub fn init(port: Option<u16>) -> Result<(), BuildError> {
    if let Some(port) = port {
        install_exporter(port)?;
    }
    register_metrics();
    Ok(())
}

/// Register the metric descriptions with the installed recorder.
///
/// Descriptions sent before a recorder is installed are lost, so call this
/// after [`install_exporter`].
pub fn register_metrics() {
    describe_counter!(
        "replica.messages",
        "Deliveries settled, by subject and disposition (ack, nak, term)"
    );
    describe_counter!(
        "replica.dead_letters",
        "Messages that will never be applied, by subject and failure class"
    );
    describe_counter!(
        "replica.published",
        "Notifications published inside the transaction of their change"
    );
    describe_counter!(
        "replica.redeliveries",
        "Negative acknowledgments re-appended for delayed redelivery"
    );

    tracing::info!("Metrics registered");
}

/// Serve Prometheus metrics on `0.0.0.0:port`.
///
/// # Errors
///
/// Returns [`BuildError`] if the recorder or the HTTP listener cannot be
/// installed.
pub fn install_exporter(port: u16) -> Result<(), BuildError> {
    let address = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    PrometheusBuilder::new().with_http_listener(address).install()?;
    tracing::info!(%address, "Prometheus exporter listening");
    Ok(())
}
