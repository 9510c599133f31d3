//! HTTP front door: one axum router serving every registered bot.
//!
//! ```text
//! POST /webhook/{subroute}/   Telegram updates for one bot
//! GET  /healthz               200 while running, 503 once draining
//! ```
//!
//! Webhook requests pass a shutdown gate first. Once the coordinator starts
//! draining they are answered 503 so Telegram retries them later; requests
//! already inside keep the coordinator from stopping until they finish.

use std::{sync::Arc, time::SystemTime};

use anyhow::Context;
use async_trait::async_trait;
use axum::{
    body::Bytes,
    extract::{Path, Request, State},
    http::{HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use dashmap::{DashMap, mapref::entry::Entry};
use relaybot_core::{DispatchReport, MetricsSink, Update, UpdateMetrics};
use relaybot_shutdown::{
    BackgroundJobSupervisor, ShutdownCoordinator, ShutdownRegistry, ShutdownState,
    listen_for_signals,
};
use relaybot_telemetry::{
    TelemetryLabels,
    metrics::{
        BACKGROUND_JOBS, HANDLER_ERRORS_TOTAL, INFLIGHT_REQUESTS, UPDATE_PROCESSING_SECONDS,
        UPDATES_TOTAL, WEBHOOK_RECONCILES_TOTAL, WEBHOOK_REJECTIONS_TOTAL,
    },
    record_counter, record_gauge, record_histogram,
};
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use crate::{runner::BotRunner, telegram_api::TelegramApi};

pub const WEBHOOK_ROUTE: &str = "/webhook/{subroute}/";
pub const SECRET_HEADER: &str = "x-telegram-bot-api-secret-token";

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("a bot is already served at /webhook/{subroute}/")]
    DuplicateBot { subroute: String },
    #[error("no bot is served at /webhook/{subroute}/")]
    UnknownBot { subroute: String },
    #[error("webhook setup failed for {bot}: {reason}")]
    Registration { bot: String, reason: String },
    #[error("webhook removal failed for {bot}: {reason}")]
    Removal { bot: String, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileResult {
    Applied,
    Noop,
}

impl ReconcileResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReconcileResult::Applied => "applied",
            ReconcileResult::Noop => "noop",
        }
    }
}

/// App-wide sink used when none is configured: logs each record at debug.
#[derive(Debug, Default)]
pub struct LogMetricsSink;

#[async_trait]
impl MetricsSink for LogMetricsSink {
    async fn handle(&self, metrics: &UpdateMetrics) -> anyhow::Result<()> {
        debug!(?metrics, "update metrics");
        Ok(())
    }
}

#[derive(Clone)]
pub struct WebhookApp {
    base_url: Arc<str>,
    api: Arc<dyn TelegramApi>,
    runners: Arc<DashMap<String, Arc<BotRunner>>>,
    coordinator: ShutdownCoordinator,
    jobs: BackgroundJobSupervisor,
    metrics_sink: Arc<dyn MetricsSink>,
}

impl WebhookApp {
    /// `base_url` is the public origin Telegram can reach this server on.
    pub fn new(base_url: impl AsRef<str>, api: Arc<dyn TelegramApi>) -> Self {
        Self {
            base_url: Arc::from(base_url.as_ref().trim_end_matches('/')),
            api,
            runners: Arc::new(DashMap::new()),
            coordinator: ShutdownCoordinator::new(ShutdownRegistry::new()),
            jobs: BackgroundJobSupervisor::default(),
            metrics_sink: Arc::new(LogMetricsSink),
        }
    }

    pub fn with_coordinator(mut self, coordinator: ShutdownCoordinator) -> Self {
        self.coordinator = coordinator;
        self
    }

    pub fn with_jobs(mut self, jobs: BackgroundJobSupervisor) -> Self {
        self.jobs = jobs;
        self
    }

    pub fn with_metrics_sink(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.metrics_sink = sink;
        self
    }

    pub fn coordinator(&self) -> &ShutdownCoordinator {
        &self.coordinator
    }

    pub fn jobs(&self) -> &BackgroundJobSupervisor {
        &self.jobs
    }

    /// Subroutes of the bots currently served, sorted.
    pub fn subroutes(&self) -> Vec<String> {
        let mut subroutes: Vec<String> = self.runners.iter().map(|e| e.key().clone()).collect();
        subroutes.sort();
        subroutes
    }

    pub fn webhook_url(&self, subroute: &str) -> String {
        format!(
            "{}{}",
            self.base_url,
            WEBHOOK_ROUTE.replace("{subroute}", subroute)
        )
    }

    pub fn router(&self) -> axum::Router {
        axum::Router::new()
            .route(WEBHOOK_ROUTE, post(handle_update))
            .route_layer(middleware::from_fn_with_state(self.clone(), shutdown_gate))
            .route("/healthz", get(healthz))
            .with_state(self.clone())
    }

    /// Points the bot's Telegram webhook at this server, starts its
    /// background jobs and begins routing its updates. A failed setup drops
    /// only this bot. Returns the bot's subroute.
    pub async fn add_bot_runner(&self, mut runner: BotRunner) -> Result<String, WebhookError> {
        let subroute = runner.webhook_subroute();
        if self.runners.contains_key(&subroute) {
            info!(bot = %runner.name, "bot already served, ignoring");
            return Err(WebhookError::DuplicateBot { subroute });
        }

        let url = self.webhook_url(&subroute);
        match self.reconcile_webhook(&runner, &url).await {
            Ok(result) => {
                info!(bot = %runner.name, ?result, %url, "webhook ready");
                record_reconcile(&runner.name, result.as_str());
            }
            Err(err) => {
                let reason = format!("{err:#}");
                error!(bot = %runner.name, error = %reason, "webhook setup failed, dropping bot");
                record_reconcile(&runner.name, "error");
                return Err(WebhookError::Registration {
                    bot: runner.name,
                    reason,
                });
            }
        }

        let jobs = runner.take_background_jobs();
        let runner = Arc::new(runner);
        match self.runners.entry(subroute.clone()) {
            Entry::Occupied(_) => {
                info!(bot = %runner.name, "bot added concurrently, ignoring");
                return Err(WebhookError::DuplicateBot { subroute });
            }
            Entry::Vacant(slot) => {
                slot.insert(runner.clone());
            }
        }

        let total = jobs.len();
        for (idx, job) in jobs.into_iter().enumerate() {
            let name = format!("{}-{}", runner.name, idx + 1);
            self.jobs.spawn_in(subroute.clone(), name, job);
            info!(bot = %runner.name, job = idx + 1, total, "background job started");
        }
        self.record_job_gauge();
        Ok(subroute)
    }

    /// Deletes the bot's Telegram webhook, cancels its background jobs and
    /// stops routing its updates. The bot stays served if the webhook can't
    /// be deleted.
    pub async fn remove_bot_runner(&self, subroute: &str) -> Result<(), WebhookError> {
        let runner = self
            .runners
            .get(subroute)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| WebhookError::UnknownBot {
                subroute: subroute.to_string(),
            })?;

        if let Err(err) = self.api.delete_webhook(&runner.token, false).await {
            let reason = format!("{err:#}");
            error!(bot = %runner.name, error = %reason, "webhook removal failed");
            return Err(WebhookError::Removal {
                bot: runner.name.clone(),
                reason,
            });
        }
        info!(bot = %runner.name, "webhook removed");

        self.jobs.cancel_group(subroute).await;
        self.runners.remove(subroute);
        self.record_job_gauge();
        Ok(())
    }

    /// Serves until the coordinator stops, then cancels every background
    /// job. SIGINT and SIGTERM start draining.
    pub async fn run(self, listener: TcpListener) -> anyhow::Result<()> {
        let addr = listener.local_addr().context("read listener address")?;
        info!(%addr, bots = self.runners.len(), "webhook server listening");

        let monitor = tokio::spawn({
            let coordinator = self.coordinator.clone();
            async move { coordinator.monitor().await }
        });
        let signals = tokio::spawn(listen_for_signals(self.coordinator.clone()));
        let stopped = {
            let coordinator = self.coordinator.clone();
            async move { coordinator.stopped().await }
        };

        let served = axum::serve(listener, self.router())
            .with_graceful_shutdown(stopped)
            .await;

        debug!("cleanup started");
        monitor.abort();
        signals.abort();
        self.jobs.shutdown().await;
        self.record_job_gauge();
        debug!("cleanup completed");
        served.context("webhook server failed")
    }

    fn runner(&self, subroute: &str) -> Option<Arc<BotRunner>> {
        self.runners.get(subroute).map(|entry| entry.value().clone())
    }

    async fn reconcile_webhook(
        &self,
        runner: &BotRunner,
        want_url: &str,
    ) -> anyhow::Result<ReconcileResult> {
        let info = self
            .api
            .get_webhook_info(&runner.token)
            .await
            .context("get webhook info")?;
        if urls_match(&info.url, want_url) && !runner.secret_is_new {
            return Ok(ReconcileResult::Noop);
        }
        self.api
            .set_webhook(
                &runner.token,
                want_url,
                &runner.secret,
                &runner.allowed_updates,
                false,
            )
            .await
            .with_context(|| format!("set webhook to {want_url}"))?;
        Ok(ReconcileResult::Applied)
    }

    async fn dispatch(&self, runner: &BotRunner, update: Update, received_at: SystemTime) {
        let mut metrics = UpdateMetrics::new(runner.name.clone(), received_at);
        let report = runner.router.process_update(update.clone()).await;
        metrics.record(&update, &report);
        record_update(&runner.name, &report);

        if let Err(err) = self.metrics_sink.handle(&metrics).await {
            warn!(bot = %runner.name, error = %err, "app-wide metrics sink failed");
        }
        if let Some(sink) = &runner.metrics_sink {
            if let Err(err) = sink.handle(&metrics).await {
                warn!(bot = %runner.name, error = %err, "bot metrics sink failed");
            }
        }
    }

    fn record_job_gauge(&self) {
        record_gauge(BACKGROUND_JOBS, self.jobs.len() as f64, &TelemetryLabels::new("all"));
    }
}

pub fn urls_match(current: &str, desired: &str) -> bool {
    !current.trim().is_empty() && current.trim_end_matches('/') == desired.trim_end_matches('/')
}

async fn shutdown_gate(State(app): State<WebhookApp>, request: Request, next: Next) -> Response {
    let guard = match app.coordinator.try_enter() {
        Ok(guard) => guard,
        Err(rejection) => {
            debug!(path = %request.uri().path(), "request rejected while draining");
            record_rejection("all", "draining");
            return (StatusCode::SERVICE_UNAVAILABLE, rejection.to_string()).into_response();
        }
    };
    let labels = TelemetryLabels::new("all");
    record_gauge(INFLIGHT_REQUESTS, app.coordinator.in_flight() as f64, &labels);
    let response = next.run(request).await;
    drop(guard);
    record_gauge(INFLIGHT_REQUESTS, app.coordinator.in_flight() as f64, &labels);
    response
}

async fn handle_update(
    State(app): State<WebhookApp>,
    Path(subroute): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let received_at = SystemTime::now();
    // path parameters arrive percent-decoded; subroutes are stored encoded
    let subroute = urlencoding::encode(&subroute);
    let Some(runner) = app.runner(&subroute) else {
        debug!(%subroute, "update for unknown bot");
        record_rejection("unknown", "unknown_bot");
        return StatusCode::NOT_FOUND.into_response();
    };

    let provided = headers.get(SECRET_HEADER).and_then(|v| v.to_str().ok());
    if !runner.secret_matches(provided) {
        warn!(bot = %runner.name, "telegram secret token mismatch");
        record_rejection(&runner.name, "bad_secret");
        return StatusCode::FORBIDDEN.into_response();
    }

    let update = match Update::from_slice(&body) {
        Ok(update) => update,
        Err(err) => {
            // acknowledged anyway; Telegram would redeliver the same body forever
            warn!(bot = %runner.name, error = %err, "undecodable update dropped");
            record_rejection(&runner.name, "bad_body");
            return StatusCode::OK.into_response();
        }
    };

    app.dispatch(&runner, update, received_at).await;
    StatusCode::OK.into_response()
}

async fn healthz(State(app): State<WebhookApp>) -> Response {
    let state = app.coordinator.state();
    let status = if state == ShutdownState::Running {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, state.to_string()).into_response()
}

fn record_update(bot: &str, report: &DispatchReport) {
    let handler = if report.consumed_by_next_step {
        "next_step"
    } else {
        report.handled_by.first().map(String::as_str).unwrap_or("none")
    };
    let labels = TelemetryLabels::new(bot)
        .with_update_type(report.category.map(|c| c.as_str()).unwrap_or("unsupported"))
        .with_handler(handler);
    record_counter(UPDATES_TOTAL, 1, &labels);
    if let Some(elapsed) = report.processing_duration {
        record_histogram(UPDATE_PROCESSING_SECONDS, elapsed.as_secs_f64(), &labels);
    }
    if !report.errors.is_empty() {
        record_counter(HANDLER_ERRORS_TOTAL, report.errors.len() as u64, &labels);
    }
}

fn record_rejection(bot: &str, reason: &str) {
    let labels = TelemetryLabels::new(bot).with_extra("reason", reason);
    record_counter(WEBHOOK_REJECTIONS_TOTAL, 1, &labels);
}

fn record_reconcile(bot: &str, result: &str) {
    let labels = TelemetryLabels::new(bot).with_extra("result", result);
    record_counter(WEBHOOK_RECONCILES_TOTAL, 1, &labels);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urls_match_ignores_trailing_slashes() {
        assert!(urls_match("https://a/webhook/x/", "https://a/webhook/x"));
        assert!(!urls_match("https://a/webhook/y/", "https://a/webhook/x/"));
        assert!(!urls_match("", ""));
    }
}
