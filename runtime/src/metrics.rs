//! Prometheus metrics for the projector.
//!
//! The worker records through the `metrics` facade; without an installed
//! recorder every call is a no-op. [`MetricsServer`] installs the Prometheus
//! recorder and serves the scrape endpoint.
//!
//! | Metric | Kind | Labels |
//! |---|---|---|
//! | `projector_messages_total` | counter | `outcome` |
//! | `projector_dead_letters_total` | counter | `reason` |
//! | `projector_stream_read_errors_total` | counter | |
//! | `projector_message_duration_seconds` | histogram | |
//!
//! # Example
//!
//! ```rust,no_run
//! use distribution_projector_runtime::metrics::MetricsServer;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//!
//! // Metrics available at http://localhost:9090/metrics
//! # Ok(())
//! # }
//! ```

use crate::worker::{DeadLetterReason, MessageOutcome};
use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

/// Messages processed, by outcome.
pub const MESSAGES_TOTAL: &str = "projector_messages_total";
/// Messages dead-lettered, by reason.
pub const DEAD_LETTERS_TOTAL: &str = "projector_dead_letters_total";
/// Failed stream reads (each retry counts).
pub const STREAM_READ_ERRORS_TOTAL: &str = "projector_stream_read_errors_total";
/// Time spent on one message, from decode to acknowledge.
pub const MESSAGE_DURATION_SECONDS: &str = "projector_message_duration_seconds";

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
}

/// Prometheus metrics server.
///
/// Exposes metrics on an HTTP endpoint for Prometheus scraping.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl fmt::Debug for MetricsServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricsServer")
            .field("addr", &self.addr)
            .field("started", &self.handle.is_some())
            .finish_non_exhaustive()
    }
}

impl MetricsServer {
    /// Create a new metrics server bound to `addr` once started.
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Install the recorder and serve `/metrics` on a background task.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError::Build`] if the exporter cannot be built or the
    /// listener cannot bind.
    ///
    /// # Note
    ///
    /// If a recorder is already installed (e.g., in tests), the server logs a
    /// warning and keeps recording through the existing one; [`render`](Self::render)
    /// then returns `None`.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        let (recorder, exporter) = PrometheusBuilder::new()
            .with_http_listener(self.addr)
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[
                    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
                ],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?
            .build()
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        let handle = recorder.handle();
        if metrics::set_global_recorder(recorder).is_err() {
            tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
            return Ok(());
        }

        register_metrics();
        tokio::spawn(async move {
            if exporter.await.is_err() {
                tracing::error!("Metrics exporter stopped");
            }
        });

        self.handle = Some(handle);
        tracing::info!(
            addr = %self.addr,
            "Metrics server started - available at http://{}/metrics",
            self.addr
        );
        Ok(())
    }

    /// Get the metrics handle for rendering.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus format.
    ///
    /// Returns `None` if this server did not install the recorder.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

fn register_metrics() {
    describe_counter!(MESSAGES_TOTAL, "Stream messages processed, by outcome");
    describe_counter!(
        DEAD_LETTERS_TOTAL,
        "Messages written to the dead-letter stream, by reason"
    );
    describe_counter!(
        STREAM_READ_ERRORS_TOTAL,
        "Failed reads from the event stream"
    );
    describe_histogram!(
        MESSAGE_DURATION_SECONDS,
        "Time taken to process one stream message"
    );
}

/// Worker metrics recorder.
pub struct ProjectorMetrics;

impl ProjectorMetrics {
    /// Record a processed message.
    pub fn record_message(outcome: &MessageOutcome, duration: Duration) {
        counter!(MESSAGES_TOTAL, "outcome" => outcome.label()).increment(1);
        if let MessageOutcome::DeadLettered { reason } = outcome {
            Self::record_dead_letter(*reason);
        }
        histogram!(MESSAGE_DURATION_SECONDS).record(duration.as_secs_f64());
    }

    /// Record a dead-letter write.
    pub fn record_dead_letter(reason: DeadLetterReason) {
        counter!(DEAD_LETTERS_TOTAL, "reason" => reason.tag()).increment(1);
    }

    /// Record a failed stream read.
    pub fn record_read_error() {
        counter!(STREAM_READ_ERRORS_TOTAL).increment(1);
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn test_metrics_server_creation() {
        let server = MetricsServer::new("127.0.0.1:0".parse().unwrap());
        assert!(server.handle().is_none());
        assert!(server.render().is_none());
    }

    #[test]
    fn test_metrics_server_debug_shows_address() {
        let server = MetricsServer::new("127.0.0.1:9464".parse().unwrap());
        let debug = format!("{server:?}");
        assert!(debug.contains("127.0.0.1:9464"));
        assert!(debug.contains("started: false"));
    }

    #[tokio::test]
    async fn test_metrics_server_renders_projector_metrics() {
        let mut server = MetricsServer::new("127.0.0.1:0".parse().unwrap());
        server.start().unwrap();

        ProjectorMetrics::record_message(
            &MessageOutcome::DeadLettered {
                reason: DeadLetterReason::Projection,
            },
            Duration::from_millis(12),
        );
        ProjectorMetrics::record_read_error();

        // Another test in this binary may have installed the recorder first.
        if let Some(rendered) = server.render() {
            assert!(rendered.contains("projector_messages_total{outcome=\"dead_lettered\"} 1"));
            assert!(rendered.contains("projector_dead_letters_total{reason=\"projection\"} 1"));
            assert!(rendered.contains("projector_stream_read_errors_total 1"));
            assert!(rendered.contains("projector_message_duration_seconds_bucket"));
        }
    }
}
