use std::{
    any::Any,
    collections::HashMap,
    panic::AssertUnwindSafe,
    sync::Arc,
    time::{Duration, Instant},
};

use futures::FutureExt;
use relaybot_session::{ConversationKey, ConversationState, SharedStateStore};
use serde_json::{Map, Value};
use tracing::{debug, error, warn};

use crate::{
    filters::{CustomFilter, FilterContext, FilterError, FilterTable, ResolvedFilter},
    handler::{Handler, HandlerContext, HandlerFn, HandlerResult},
    next_step::NextStepRegistry,
    update::{ContentCategory, Update},
};

/// A handler whose filters were resolved at registration.
pub struct RegisteredHandler {
    name: String,
    priority: Option<i32>,
    filters: Vec<ResolvedFilter>,
    callback: HandlerFn,
}

impl RegisteredHandler {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn priority(&self) -> Option<i32> {
        self.priority
    }

    async fn matches(&self, ctx: &FilterContext<'_>) -> Result<bool, (String, FilterError)> {
        for filter in &self.filters {
            match filter.check(ctx).await {
                Ok(true) => {}
                Ok(false) => return Ok(false),
                Err(err) => return Err((filter.name().to_string(), err)),
            }
        }
        Ok(true)
    }
}

/// Where a dispatch failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureStage {
    Filter,
    Handler,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchFailure {
    pub handler: String,
    pub stage: FailureStage,
    /// Error kind, e.g. `FilterError`, `HandlerError`, `HandlerPanic`.
    pub type_name: String,
    pub message: String,
}

/// Outcome of routing one update.
#[derive(Debug, Clone, Default)]
pub struct DispatchReport {
    pub update_id: i64,
    pub category: Option<ContentCategory>,
    /// Handlers whose bodies ran, in order.
    pub handled_by: Vec<String>,
    /// Filter evaluation time for each handler tested.
    pub test_durations: Vec<Duration>,
    /// Total time spent in handler bodies.
    pub processing_duration: Option<Duration>,
    pub handler_metrics: Map<String, Value>,
    pub errors: Vec<DispatchFailure>,
    /// The update went to pending next-step entries instead of handlers.
    pub consumed_by_next_step: bool,
}

impl DispatchReport {
    pub(crate) fn for_update(update: &Update) -> Self {
        Self {
            update_id: update.update_id,
            category: update.category(),
            ..Self::default()
        }
    }

    pub fn is_handled(&self) -> bool {
        !self.handled_by.is_empty()
    }

    pub(crate) fn add_processing(&mut self, elapsed: Duration) {
        let total = self.processing_duration.unwrap_or_default() + elapsed;
        self.processing_duration = Some(total);
    }

    /// Runs a handler body and folds its outcome into the report. Returns
    /// whether dispatch should move on to later handlers.
    pub(crate) async fn run_callback(
        &mut self,
        name: &str,
        callback: &HandlerFn,
        ctx: HandlerContext,
    ) -> bool {
        let started = Instant::now();
        let outcome = AssertUnwindSafe(async { callback(ctx).await })
            .catch_unwind()
            .await;
        self.add_processing(started.elapsed());
        self.handled_by.push(name.to_string());

        match outcome {
            Ok(Ok(result)) => self.absorb(result),
            Ok(Err(err)) => {
                error!(update_id = self.update_id, handler = name, error = %err, "handler failed");
                self.errors.push(DispatchFailure {
                    handler: name.to_string(),
                    stage: FailureStage::Handler,
                    type_name: "HandlerError".into(),
                    message: format!("{err:#}"),
                });
                true
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(update_id = self.update_id, handler = name, panic = %message, "handler panicked");
                self.errors.push(DispatchFailure {
                    handler: name.to_string(),
                    stage: FailureStage::Handler,
                    type_name: "HandlerPanic".into(),
                    message,
                });
                true
            }
        }
    }

    fn absorb(&mut self, result: HandlerResult) -> bool {
        if let Some(metrics) = result.metrics {
            self.handler_metrics.extend(metrics);
        }
        result.continue_to_other_handlers
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Per-update inputs the registry needs besides the update.
#[derive(Clone, Default)]
pub struct DispatchEnv {
    pub store: Option<SharedStateStore>,
    pub state_key: Option<ConversationKey>,
    pub next_steps: NextStepRegistry,
}

/// Ordered handler lists, one per content category.
///
/// Registration happens during setup through `&mut self`; dispatch only
/// needs `&self`, so a built registry is shared behind an `Arc`.
#[derive(Default)]
pub struct HandlerRegistry {
    filters: FilterTable,
    handlers: HashMap<ContentCategory, Vec<RegisteredHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes a custom filter available to handlers registered afterwards.
    pub fn add_custom_filter(&mut self, filter: Arc<dyn CustomFilter>) {
        self.filters.insert(filter);
    }

    /// Resolves the handler's filters and inserts it into the category list.
    ///
    /// The list stays sorted by descending priority (unset = 0). The sort is
    /// stable, so equal priorities keep registration order.
    pub fn register(&mut self, category: ContentCategory, handler: Handler) -> Result<(), FilterError> {
        let Handler {
            name,
            priority,
            filters,
            callback,
        } = handler;
        let filters = filters
            .into_iter()
            .map(|spec| spec.resolve(&self.filters))
            .collect::<Result<Vec<_>, _>>()?;
        debug!(%category, handler = %name, ?priority, "handler registered");

        let list = self.handlers.entry(category).or_default();
        list.push(RegisteredHandler {
            name,
            priority,
            filters,
            callback,
        });
        list.sort_by_key(|h| std::cmp::Reverse(h.priority.unwrap_or(0)));
        Ok(())
    }

    pub fn handlers(&self, category: ContentCategory) -> &[RegisteredHandler] {
        self.handlers
            .get(&category)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Runs the first handler whose filters all pass, and any later matches
    /// while handlers ask to continue.
    ///
    /// Filter errors skip that handler. Handler errors and panics are
    /// recorded and dispatch moves on to the next handler. An update nobody
    /// matches is dropped.
    pub async fn dispatch(&self, update: Arc<Update>, env: &DispatchEnv) -> DispatchReport {
        let mut report = DispatchReport::for_update(&update);
        let Some(category) = report.category else {
            debug!(update_id = update.update_id, "unsupported update dropped");
            return report;
        };

        let filter_ctx = FilterContext {
            update: &update,
            store: env.store.as_ref(),
            state_key: env.state_key.as_ref(),
        };

        for handler in self.handlers(category) {
            let started = Instant::now();
            let matched = handler.matches(&filter_ctx).await;
            report.test_durations.push(started.elapsed());

            match matched {
                Ok(true) => {}
                Ok(false) => continue,
                Err((filter, err)) => {
                    warn!(
                        update_id = update.update_id,
                        handler = %handler.name,
                        filter = %filter,
                        error = %err,
                        "filter failed, handler skipped"
                    );
                    report.errors.push(DispatchFailure {
                        handler: handler.name.clone(),
                        stage: FailureStage::Filter,
                        type_name: "FilterError".into(),
                        message: err.to_string(),
                    });
                    continue;
                }
            }

            let ctx = HandlerContext {
                update: Arc::clone(&update),
                state: state_for(env),
                next_steps: env.next_steps.clone(),
            };
            if !report.run_callback(&handler.name, &handler.callback, ctx).await {
                break;
            }
        }

        if !report.is_handled() {
            debug!(update_id = update.update_id, %category, "no handler matched");
        }
        report
    }
}

pub(crate) fn state_for(env: &DispatchEnv) -> Option<ConversationState> {
    match (&env.store, &env.state_key) {
        (Some(store), Some(key)) => Some(ConversationState::new(store.clone(), key.clone())),
        _ => None,
    }
}
