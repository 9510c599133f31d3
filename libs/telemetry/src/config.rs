use std::env;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryConfig {
    pub service_name: String,
    pub service_version: String,
    pub environment: String,
    pub json_logs: bool,
}

impl TelemetryConfig {
    /// Reads `SERVICE_NAME`, `SERVICE_VERSION`, `DEPLOYMENT_ENV` and
    /// `LOG_FORMAT`. Logs are JSON unless `LOG_FORMAT` is `text`, `pretty`
    /// or `plain`.
    pub fn from_env(default_service_name: &str, default_service_version: &str) -> Self {
        let service_name =
            env::var("SERVICE_NAME").unwrap_or_else(|_| default_service_name.to_string());
        let service_version =
            env::var("SERVICE_VERSION").unwrap_or_else(|_| default_service_version.to_string());
        let environment = env::var("DEPLOYMENT_ENV").unwrap_or_else(|_| "dev".into());
        let json_logs = env::var("LOG_FORMAT")
            .map(|v| !is_text_format(&v))
            .unwrap_or(true);

        Self {
            service_name,
            service_version,
            environment,
            json_logs,
        }
    }
}

fn is_text_format(value: &str) -> bool {
    matches!(value.to_lowercase().as_str(), "text" | "pretty" | "plain")
}
