//! Logging and metrics helpers shared by relaybot services.
//!
//! Logs go through `tracing`; metric calls go through the `metrics` facade
//! and are no-ops until the binary installs a recorder.

mod config;
mod context;
pub mod metrics;
mod tracing_init;

pub use config::TelemetryConfig;
pub use context::TelemetryLabels;
pub use self::metrics::{record_counter, record_gauge, record_histogram};
pub use tracing_init::init_telemetry;

