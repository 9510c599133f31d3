//! Webhook front end for relaybot.
//!
//! A [`WebhookApp`] serves any number of [`BotRunner`]s behind one axum
//! router, registers their Telegram webhooks, and drains in-flight updates
//! before the process exits.

pub mod app;
pub mod config;
pub mod runner;
pub mod telegram_api;

pub use app::{
    LogMetricsSink, ReconcileResult, SECRET_HEADER, WEBHOOK_ROUTE, WebhookApp, WebhookError,
};
pub use config::WebhookConfig;
pub use runner::BotRunner;
pub use telegram_api::{HttpTelegramApi, TelegramApi, WebhookInfo};
