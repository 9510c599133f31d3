//! Echo bot served over a Telegram webhook.
//!
//! `/start` asks for a name and remembers it in the conversation state; any
//! other text is echoed back. Configuration comes from the environment, see
//! [`WebhookConfig::from_env`].

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use anyhow::{Context, Result};
use relaybot_core::{
    ContentCategory, FilterError, FilterSpec, Handler, HandlerContext, HandlerRegistry, Router,
};
use relaybot_session::store_from_env;
use relaybot_shutdown::{
    BackgroundJobSupervisor, PreventShutdown, ShutdownCoordinator, ShutdownRegistry,
};
use relaybot_telemetry::{TelemetryConfig, init_telemetry};
use relaybot_webhook::{BotRunner, HttpTelegramApi, TelegramApi, WebhookApp, WebhookConfig};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::info;

const AWAITING_NAME: &str = "awaiting_name";
const NAMED: &str = "named";

#[tokio::main]
async fn main() -> Result<()> {
    let telemetry = TelemetryConfig::from_env("relaybot-webhook", env!("CARGO_PKG_VERSION"));
    init_telemetry(telemetry)?;

    let cfg = WebhookConfig::from_env()?;
    let api = Arc::new(HttpTelegramApi::new(
        reqwest::Client::new(),
        cfg.telegram_api_base.clone(),
    ));
    let store = store_from_env()
        .await
        .context("open conversation state store")?;

    let echoed = Arc::new(AtomicU64::new(0));
    let token: Arc<str> = Arc::from(cfg.bot_token.as_str());
    let router = Router::new(echo_handlers(api.clone(), token, echoed.clone())?)
        .with_state_store(store);

    let coordinator = ShutdownCoordinator::with_settings(
        ShutdownRegistry::new(),
        cfg.shutdown_poll,
        cfg.shutdown_timeout,
    );
    let report = PreventShutdown::new(coordinator.registry(), "reporting echo count");

    let mut runner = BotRunner::new(&cfg.bot_name, &cfg.bot_token, router)
        .with_allowed_updates(["message", "callback_query"])
        .with_background_job(report_echoes(report, echoed));
    if let Some(secret) = cfg.secret.clone() {
        runner = runner.with_secret(secret);
    }

    let app = WebhookApp::new(&cfg.base_url, api)
        .with_coordinator(coordinator)
        .with_jobs(BackgroundJobSupervisor::new(cfg.job_cancel_timeout));
    app.add_bot_runner(runner).await?;

    let listener = TcpListener::bind(cfg.bind)
        .await
        .with_context(|| format!("bind {}", cfg.bind))?;
    app.run(listener).await
}

fn echo_handlers(
    api: Arc<dyn TelegramApi>,
    token: Arc<str>,
    echoed: Arc<AtomicU64>,
) -> Result<HandlerRegistry, FilterError> {
    let mut registry = HandlerRegistry::new();

    registry.register(
        ContentCategory::Message,
        Handler::new({
            let api = api.clone();
            let token = token.clone();
            move |ctx: HandlerContext| {
                let api = api.clone();
                let token = token.clone();
                async move {
                    let Some(chat_id) = ctx.chat_id() else {
                        return anyhow::Ok(());
                    };
                    if let Some(state) = &ctx.state {
                        state.set(AWAITING_NAME).await?;
                    }
                    api.send_message(&token, chat_id, "Hi! What should I call you?")
                        .await?;
                    Ok(())
                }
            }
        })
        .name("start")
        .filter(FilterSpec::commands(["start"])),
    )?;

    registry.register(
        ContentCategory::Message,
        Handler::new({
            let api = api.clone();
            let token = token.clone();
            move |ctx: HandlerContext| {
                let api = api.clone();
                let token = token.clone();
                async move {
                    let (Some(chat_id), Some(name), Some(state)) =
                        (ctx.chat_id(), ctx.text(), ctx.state.as_ref())
                    else {
                        return anyhow::Ok(());
                    };
                    state.set(NAMED).await?;
                    state.set_data("name", json!(name)).await?;
                    api.send_message(&token, chat_id, &format!("Nice to meet you, {name}."))
                        .await?;
                    Ok(())
                }
            }
        })
        .name("remember_name")
        .filter(FilterSpec::state(AWAITING_NAME)),
    )?;

    registry.register(
        ContentCategory::Message,
        Handler::new(move |ctx: HandlerContext| {
            let api = api.clone();
            let token = token.clone();
            let echoed = echoed.clone();
            async move {
                let (Some(chat_id), Some(text)) = (ctx.chat_id(), ctx.text()) else {
                    return anyhow::Ok(());
                };
                api.send_message(&token, chat_id, text).await?;
                echoed.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
        })
        .name("echo"),
    )?;

    Ok(registry)
}

async fn report_echoes(report: PreventShutdown, echoed: Arc<AtomicU64>) -> Result<()> {
    let mut ticker = tokio::time::interval(Duration::from_secs(60));
    loop {
        ticker.tick().await;
        report
            .run(async {
                let count = echoed.swap(0, Ordering::Relaxed);
                info!(count, "messages echoed in the last minute");
            })
            .await;
    }
}
