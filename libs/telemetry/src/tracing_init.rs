use std::sync::OnceLock;

use anyhow::Result;
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::Layer, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::TelemetryConfig;

static INIT: OnceLock<()> = OnceLock::new();

/// Installs the global subscriber: `RUST_LOG` filter (default `info`) plus a
/// JSON or plain fmt layer. Later calls are no-ops.
pub fn init_telemetry(cfg: TelemetryConfig) -> Result<()> {
    if INIT.get().is_some() {
        return Ok(());
    }

    let fmt_layer = if cfg.json_logs {
        tracing_subscriber::fmt::layer()
            .json()
            .flatten_event(true)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer().boxed()
    };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    // another subscriber may already be installed, e.g. by a test harness
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
        .ok();

    INIT.set(()).ok();
    info!(
        service = %cfg.service_name,
        version = %cfg.service_version,
        environment = %cfg.environment,
        "telemetry initialised"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_init_is_harmless() {
        let cfg = TelemetryConfig {
            service_name: "test".into(),
            service_version: "0".into(),
            environment: "test".into(),
            json_logs: false,
        };
        init_telemetry(cfg.clone()).unwrap();
        init_telemetry(cfg).unwrap();
    }
}
