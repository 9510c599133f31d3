use std::{fmt, future::Future, sync::Arc};

use futures::future::BoxFuture;
use relaybot_session::ConversationState;
use serde_json::{Map, Value};

use crate::{
    filters::FilterSpec,
    next_step::NextStepRegistry,
    update::{Message, Update},
};

/// What a handler tells the dispatcher after it ran.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HandlerResult {
    /// Let later matching handlers run for the same update.
    pub continue_to_other_handlers: bool,
    /// Extra fields copied into the update's metrics record.
    pub metrics: Option<Map<String, Value>>,
}

impl HandlerResult {
    pub fn stop() -> Self {
        Self::default()
    }

    pub fn continue_dispatch() -> Self {
        Self {
            continue_to_other_handlers: true,
            metrics: None,
        }
    }

    pub fn with_metric(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metrics
            .get_or_insert_with(Map::new)
            .insert(key.into(), value.into());
        self
    }
}

impl From<()> for HandlerResult {
    fn from(_: ()) -> Self {
        HandlerResult::stop()
    }
}

/// Arguments handed to a handler body.
#[derive(Clone)]
pub struct HandlerContext {
    pub update: Arc<Update>,
    /// Conversation state for the update's (chat, user), when a store is
    /// configured and the update has both.
    pub state: Option<ConversationState>,
    pub next_steps: NextStepRegistry,
}

impl HandlerContext {
    pub fn message(&self) -> Option<&Message> {
        self.update.message()
    }

    pub fn chat_id(&self) -> Option<i64> {
        self.update.chat().map(|chat| chat.id)
    }

    pub fn text(&self) -> Option<&str> {
        self.update.text()
    }
}

pub type HandlerFn =
    Arc<dyn Fn(HandlerContext) -> BoxFuture<'static, anyhow::Result<HandlerResult>> + Send + Sync>;

/// Wraps an async closure into a [`HandlerFn`].
pub fn handler_fn<F, Fut, R>(callback: F) -> HandlerFn
where
    F: Fn(HandlerContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
    R: Into<HandlerResult>,
{
    Arc::new(move |ctx| {
        let fut = callback(ctx);
        Box::pin(async move { fut.await.map(Into::into) })
    })
}

/// A handler body with the filters that gate it.
///
/// ```ignore
/// let handler = Handler::new(|ctx: HandlerContext| async move { Ok(()) })
///     .name("start")
///     .filter(FilterSpec::commands(["start"]));
/// ```
#[derive(Clone)]
pub struct Handler {
    pub(crate) name: String,
    pub(crate) priority: Option<i32>,
    pub(crate) filters: Vec<FilterSpec>,
    pub(crate) callback: HandlerFn,
}

impl Handler {
    pub fn new<F, Fut, R>(callback: F) -> Self
    where
        F: Fn(HandlerContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
        R: Into<HandlerResult>,
    {
        Self {
            name: std::any::type_name::<F>().to_string(),
            priority: None,
            filters: Vec::new(),
            callback: handler_fn(callback),
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Higher runs first; unset counts as 0.
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Adds a filter. Filters are checked in the order they were added.
    pub fn filter(mut self, filter: FilterSpec) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn handler_name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handler")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("filters", &self.filters)
            .finish()
    }
}
