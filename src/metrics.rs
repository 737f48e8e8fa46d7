//! Prometheus metrics for the importer
//!
//! Metric names live in [`MetricName`] so call sites never spell them by hand.
//! Recording is a no-op until [`init_metrics`] installs the recorder.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use tracing::{info, warn};

static HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricName {
    // Sympla source
    PagesFetched,
    RecordsFetched,
    FetchFailures,

    // Import pipeline
    EventsImported,
    EventsSkipped,
    BatchesFinished,
    BatchDuration,
}

impl MetricName {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricName::PagesFetched => "sympla_pages_fetched_total",
            MetricName::RecordsFetched => "sympla_records_fetched_total",
            MetricName::FetchFailures => "sympla_fetch_failures_total",
            MetricName::EventsImported => "sympla_events_imported_total",
            MetricName::EventsSkipped => "sympla_events_skipped_total",
            MetricName::BatchesFinished => "sympla_batches_total",
            MetricName::BatchDuration => "sympla_batch_duration_seconds",
        }
    }

    pub fn all_metrics() -> impl Iterator<Item = MetricName> {
        use MetricName::*;
        [
            PagesFetched,
            RecordsFetched,
            FetchFailures,
            EventsImported,
            EventsSkipped,
            BatchesFinished,
            BatchDuration,
        ]
        .into_iter()
    }
}

/// Install the global Prometheus recorder. Idempotent.
pub fn init_metrics() -> Option<PrometheusHandle> {
    if let Some(handle) = HANDLE.get() {
        return Some(handle.clone());
    }
    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => {
            info!("Prometheus recorder installed");
            Some(HANDLE.get_or_init(|| handle).clone())
        }
        Err(e) => {
            warn!("Failed to install Prometheus recorder: {}", e);
            None
        }
    }
}

/// Render the current metrics in Prometheus text format
pub fn render() -> Option<String> {
    HANDLE.get().map(|h| h.render())
}

pub mod sympla {
    use super::MetricName;

    pub fn page_fetched(records: usize) {
        ::metrics::counter!(MetricName::PagesFetched.as_str()).increment(1);
        ::metrics::counter!(MetricName::RecordsFetched.as_str()).increment(records as u64);
    }

    pub fn fetch_failed(kind: &'static str) {
        ::metrics::counter!(MetricName::FetchFailures.as_str(), "kind" => kind).increment(1);
    }
}

pub mod import {
    use super::MetricName;
    use crate::types::BatchStatus;

    pub fn event_imported() {
        ::metrics::counter!(MetricName::EventsImported.as_str()).increment(1);
    }

    pub fn event_skipped(field: &'static str) {
        ::metrics::counter!(MetricName::EventsSkipped.as_str(), "field" => field).increment(1);
    }

    pub fn batch_finished(status: BatchStatus, duration_secs: f64) {
        ::metrics::counter!(MetricName::BatchesFinished.as_str(), "status" => status.as_str())
            .increment(1);
        ::metrics::histogram!(MetricName::BatchDuration.as_str()).record(duration_secs);
    }
}
