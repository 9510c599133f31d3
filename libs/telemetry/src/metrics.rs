use ::metrics::Label;

use crate::context::TelemetryLabels;

pub const UPDATES_TOTAL: &str = "relaybot_updates_total";
pub const UPDATE_PROCESSING_SECONDS: &str = "relaybot_update_processing_seconds";
pub const HANDLER_ERRORS_TOTAL: &str = "relaybot_handler_errors_total";
pub const WEBHOOK_REJECTIONS_TOTAL: &str = "relaybot_webhook_rejections_total";
pub const INFLIGHT_REQUESTS: &str = "relaybot_inflight_requests";
pub const BACKGROUND_JOBS: &str = "relaybot_background_jobs";
pub const WEBHOOK_RECONCILES_TOTAL: &str = "relaybot_webhook_reconciles_total";

fn labels(labels: &TelemetryLabels) -> Vec<Label> {
    labels
        .tags()
        .into_iter()
        .map(|(key, value)| Label::new(key, value))
        .collect()
}

pub fn record_counter(name: &'static str, value: u64, tags: &TelemetryLabels) {
    ::metrics::counter!(name, labels(tags)).increment(value);
}

pub fn record_histogram(name: &'static str, value: f64, tags: &TelemetryLabels) {
    ::metrics::histogram!(name, labels(tags)).record(value);
}

pub fn record_gauge(name: &'static str, value: f64, tags: &TelemetryLabels) {
    ::metrics::gauge!(name, labels(tags)).set(value);
}
