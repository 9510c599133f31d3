//! Environment configuration for the webhook binary.

use std::{env, net::SocketAddr, str::FromStr, time::Duration};

use anyhow::{Context, Result};
use rand::{Rng, rng};

#[derive(Debug, Clone)]
pub struct WebhookConfig {
    pub bind: SocketAddr,
    /// Public origin Telegram posts to, without the `/webhook/...` path.
    pub base_url: String,
    pub bot_token: String,
    pub bot_name: String,
    /// `None` lets the runner generate one, which forces webhook
    /// registration on every start.
    pub secret: Option<String>,
    pub shutdown_poll: Duration,
    pub shutdown_timeout: Option<Duration>,
    pub job_cancel_timeout: Duration,
    pub telegram_api_base: Option<String>,
}

impl WebhookConfig {
    pub fn from_env() -> Result<Self> {
        let bind = env::var("BIND").unwrap_or_else(|_| "0.0.0.0:8080".into());
        let bind = bind
            .parse::<SocketAddr>()
            .with_context(|| format!("invalid BIND address {bind:?}"))?;
        let base_url = required("WEBHOOK_BASE_URL")?
            .trim_end_matches('/')
            .to_string();
        let bot_token = required("BOT_TOKEN")?;
        let bot_name = env::var("BOT_NAME").unwrap_or_else(|_| "relaybot".into());
        let secret = env::var("WEBHOOK_SECRET")
            .ok()
            .filter(|value| !value.is_empty());

        Ok(Self {
            bind,
            base_url,
            bot_token,
            bot_name,
            secret,
            shutdown_poll: Duration::from_millis(parsed("SHUTDOWN_POLL_MS")?.unwrap_or(1000)),
            shutdown_timeout: parsed("SHUTDOWN_TIMEOUT_SECS")?.map(Duration::from_secs),
            job_cancel_timeout: Duration::from_secs(
                parsed("JOB_CANCEL_TIMEOUT_SECS")?.unwrap_or(10),
            ),
            telegram_api_base: env::var("TELEGRAM_API_BASE").ok(),
        })
    }
}

fn required(key: &str) -> Result<String> {
    env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .with_context(|| format!("{key} must be set"))
}

fn parsed<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .with_context(|| format!("invalid {key} value {raw:?}")),
        Err(_) => Ok(None),
    }
}

/// 32 characters from the alphabet Telegram accepts for secret tokens.
pub fn generate_secret() -> String {
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-_";
    let mut rng = rng();
    (0..32)
        .map(|_| {
            let idx = rng.random_range(0..ALPHABET.len());
            ALPHABET[idx] as char
        })
        .collect()
}
