use std::{
    fmt,
    future::Future,
    sync::{Arc, Mutex, PoisonError},
};

use futures::future::BoxFuture;
use relaybot_core::{MetricsSink, Router};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::config::generate_secret;

pub(crate) type BackgroundJob = BoxFuture<'static, anyhow::Result<()>>;

/// One bot served by a [`WebhookApp`](crate::WebhookApp): its credentials,
/// its router, and the jobs that live as long as the bot does.
pub struct BotRunner {
    pub(crate) name: String,
    pub(crate) token: String,
    pub(crate) secret: String,
    /// Telegram cannot know a secret generated in this process.
    pub(crate) secret_is_new: bool,
    pub(crate) router: Router,
    pub(crate) allowed_updates: Vec<String>,
    // taken once, when the runner is added to an app
    background_jobs: Mutex<Vec<BackgroundJob>>,
    pub(crate) metrics_sink: Option<Arc<dyn MetricsSink>>,
}

impl BotRunner {
    /// Creates a runner with a freshly generated webhook secret.
    pub fn new(name: impl Into<String>, token: impl Into<String>, router: Router) -> Self {
        Self {
            name: name.into(),
            token: token.into(),
            secret: generate_secret(),
            secret_is_new: true,
            router,
            allowed_updates: Vec::new(),
            background_jobs: Mutex::new(Vec::new()),
            metrics_sink: None,
        }
    }

    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = secret.into();
        self.secret_is_new = false;
        self
    }

    /// Update types requested from Telegram. Empty keeps Telegram's default.
    pub fn with_allowed_updates<I, S>(mut self, updates: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_updates = updates.into_iter().map(Into::into).collect();
        self
    }

    /// Adds a job started when the bot is added to an app and cancelled when
    /// it is removed or the app shuts down.
    pub fn with_background_job<F>(mut self, job: F) -> Self
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.background_jobs
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Box::pin(job));
        self
    }

    /// Receives this bot's update metrics in addition to the app-wide sink.
    pub fn with_metrics_sink(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.metrics_sink = Some(sink);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    /// Path segment under `/webhook/`: the name with whitespace runs turned
    /// into `-`, url-encoded, followed by the hex SHA-256 of the token. The
    /// token itself never appears in it.
    pub fn webhook_subroute(&self) -> String {
        let name = self.name.split_whitespace().collect::<Vec<_>>().join("-");
        let token_hash = hex::encode(Sha256::digest(self.token.as_bytes()));
        format!("{}-{}", urlencoding::encode(&name), token_hash)
    }

    pub(crate) fn take_background_jobs(&mut self) -> Vec<BackgroundJob> {
        std::mem::take(
            self.background_jobs
                .get_mut()
                .unwrap_or_else(PoisonError::into_inner),
        )
    }

    pub(crate) fn secret_matches(&self, provided: Option<&str>) -> bool {
        match provided {
            Some(provided) => self.secret.as_bytes().ct_eq(provided.as_bytes()).into(),
            None => false,
        }
    }
}

impl fmt::Debug for BotRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BotRunner")
            .field("name", &self.name)
            .field("subroute", &self.webhook_subroute())
            .field(
                "background_jobs",
                &self
                    .background_jobs
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .len(),
            )
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relaybot_core::HandlerRegistry;

    fn runner(name: &str, token: &str) -> BotRunner {
        BotRunner::new(name, token, Router::new(HandlerRegistry::new()))
    }

    #[test]
    fn subroute_collapses_whitespace_and_encodes_the_name() {
        let token = "4839574812:AAFD39kkdpWt3ywyRZergyOLMaJhac60qc";
        let hash = hex::encode(Sha256::digest(token.as_bytes()));
        for (name, prefix) in [
            ("hello-world", "hello-world"),
            ("hello world", "hello-world"),
            (" Very Bad  Name For   a Bot!!!   ", "Very-Bad-Name-For-a-Bot%21%21%21"),
        ] {
            let subroute = runner(name, token).webhook_subroute();
            assert_eq!(subroute, format!("{prefix}-{hash}"));
            assert!(!subroute.contains(token));
        }
    }

    #[test]
    fn different_tokens_give_different_subroutes() {
        assert_ne!(
            runner("echo", "1:a").webhook_subroute(),
            runner("echo", "1:b").webhook_subroute()
        );
    }

    #[test]
    fn secret_must_match_exactly() {
        let runner = runner("echo", "1:a").with_secret("s3cret");
        assert!(runner.secret_matches(Some("s3cret")));
        assert!(!runner.secret_matches(Some("s3cre")));
        assert!(!runner.secret_matches(Some("s3cret!")));
        assert!(!runner.secret_matches(None));
    }

    #[test]
    fn debug_output_hides_credentials() {
        let runner = runner("echo", "1:private").with_secret("s3cret");
        let rendered = format!("{runner:?}");
        assert!(!rendered.contains("1:private"));
        assert!(!rendered.contains("s3cret"));
    }
}
