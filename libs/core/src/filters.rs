//! Handler filters.
//!
//! A [`FilterSpec`] is what callers write when registering a handler. It is
//! resolved once, at registration, into a [`ResolvedFilter`]: regexes are
//! compiled, command lists are validated, and `Custom` names are looked up in
//! the [`FilterTable`]. Per-update evaluation never touches the table.

use std::{collections::HashMap, fmt, future::Future, sync::Arc};

use async_trait::async_trait;
use futures::future::BoxFuture;
use regex::{Regex, RegexBuilder};
use relaybot_session::{ConversationKey, SharedStateStore, StateError};
use thiserror::Error;

use crate::{
    callback_data::CallbackDataFilter,
    update::{ChatType, ContentType, Message, Update, UpdateKind},
};

#[derive(Debug, Error)]
pub enum FilterError {
    #[error("no filter registered under {0:?}")]
    UnknownFilter(String),
    #[error("invalid value for filter {filter}: {reason}")]
    InvalidValue { filter: String, reason: String },
    #[error("state filter needs a state store")]
    MissingStateStore,
    #[error("state lookup failed: {0}")]
    State(#[from] StateError),
    #[error("filter predicate failed: {0}")]
    Predicate(#[from] anyhow::Error),
}

impl FilterError {
    fn invalid(filter: &str, reason: impl Into<String>) -> Self {
        FilterError::InvalidValue {
            filter: filter.to_string(),
            reason: reason.into(),
        }
    }
}

/// Synchronous predicate over an update.
pub type PredicateFn = Arc<dyn Fn(&Update) -> bool + Send + Sync>;
/// Asynchronous predicate over an update. Errors count as filter errors.
pub type AsyncPredicateFn =
    Arc<dyn Fn(Arc<Update>) -> BoxFuture<'static, anyhow::Result<bool>> + Send + Sync>;

/// Which conversation states a handler accepts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateFilter {
    /// `"*"`: any state, including none. Never reads the store.
    Any,
    OneOf(Vec<String>),
}

impl StateFilter {
    pub fn one_of<I, S>(states: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let states: Vec<String> = states.into_iter().map(Into::into).collect();
        if states.iter().any(|state| state == "*") {
            StateFilter::Any
        } else {
            StateFilter::OneOf(states)
        }
    }
}

impl From<&str> for StateFilter {
    fn from(state: &str) -> Self {
        StateFilter::one_of([state])
    }
}

/// Text comparison options. A match on any configured option passes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TextMatch {
    pub equals: Option<String>,
    pub contains: Vec<String>,
    pub starts_with: Vec<String>,
    pub ends_with: Vec<String>,
    pub ignore_case: bool,
}

impl TextMatch {
    pub fn equals(text: impl Into<String>) -> Self {
        Self {
            equals: Some(text.into()),
            ..Self::default()
        }
    }

    pub fn contains<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            contains: parts.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn starts_with<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            starts_with: parts.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn ends_with<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            ends_with: parts.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn ignore_case(mut self) -> Self {
        self.ignore_case = true;
        self
    }

    fn is_empty(&self) -> bool {
        self.equals.is_none()
            && self.contains.is_empty()
            && self.starts_with.is_empty()
            && self.ends_with.is_empty()
    }

    fn fold(&self, value: &str) -> String {
        if self.ignore_case {
            value.to_lowercase()
        } else {
            value.to_string()
        }
    }

    pub fn matches(&self, text: &str) -> bool {
        let text = self.fold(text);
        if let Some(equals) = &self.equals {
            if self.fold(equals) == text {
                return true;
            }
        }
        self.contains.iter().any(|part| text.contains(&self.fold(part)))
            || self
                .starts_with
                .iter()
                .any(|part| text.starts_with(&self.fold(part)))
            || self
                .ends_with
                .iter()
                .any(|part| text.ends_with(&self.fold(part)))
    }
}

/// Value handed to a [`CustomFilter`].
#[derive(Debug, Clone, PartialEq)]
pub enum FilterValue {
    Bool(bool),
    Int(i64),
    Text(String),
    Ints(Vec<i64>),
    Texts(Vec<String>),
}

/// A named filter evaluated against an update and the value the handler
/// registered it with.
#[async_trait]
pub trait CustomFilter: Send + Sync {
    fn key(&self) -> &str;

    /// Rejects values this filter can't evaluate. Runs at registration.
    fn validate(&self, _value: &FilterValue) -> Result<(), String> {
        Ok(())
    }

    async fn check(&self, update: &Update, value: &FilterValue) -> anyhow::Result<bool>;
}

/// Name → evaluator table used to resolve [`FilterSpec::Custom`].
#[derive(Clone, Default)]
pub struct FilterTable {
    filters: HashMap<String, Arc<dyn CustomFilter>>,
}

impl FilterTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces the filter under its key.
    pub fn insert(&mut self, filter: Arc<dyn CustomFilter>) {
        self.filters.insert(filter.key().to_string(), filter);
    }

    pub fn get(&self, key: &str) -> Option<Arc<dyn CustomFilter>> {
        self.filters.get(key).cloned()
    }
}

impl fmt::Debug for FilterTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilterTable")
            .field("keys", &self.filters.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Filter declarations accepted by handler registration.
#[derive(Clone)]
pub enum FilterSpec {
    /// Text message whose command (`/cmd@bot args` → `cmd`) is listed.
    Commands(Vec<String>),
    /// Case-insensitive regex search over message text.
    Regexp(String),
    ContentTypes(Vec<ContentType>),
    ChatTypes(Vec<ChatType>),
    Text(TextMatch),
    TextContains(Vec<String>),
    TextStartsWith(Vec<String>),
    ChatId(Vec<i64>),
    IsForwarded(bool),
    IsReply(bool),
    IsDigit(bool),
    LanguageCode(Vec<String>),
    CallbackData(CallbackDataFilter),
    State(StateFilter),
    Func(PredicateFn),
    AsyncFunc(AsyncPredicateFn),
    Custom { name: String, value: FilterValue },
}

impl FilterSpec {
    pub fn commands<I, S>(commands: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        FilterSpec::Commands(commands.into_iter().map(Into::into).collect())
    }

    pub fn state(filter: impl Into<StateFilter>) -> Self {
        FilterSpec::State(filter.into())
    }

    pub fn func<F>(predicate: F) -> Self
    where
        F: Fn(&Update) -> bool + Send + Sync + 'static,
    {
        FilterSpec::Func(Arc::new(predicate))
    }

    pub fn async_func<F, Fut>(predicate: F) -> Self
    where
        F: Fn(Arc<Update>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<bool>> + Send + 'static,
    {
        FilterSpec::AsyncFunc(Arc::new(move |update| Box::pin(predicate(update))))
    }

    pub fn custom(name: impl Into<String>, value: FilterValue) -> Self {
        FilterSpec::Custom {
            name: name.into(),
            value,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            FilterSpec::Commands(_) => "commands",
            FilterSpec::Regexp(_) => "regexp",
            FilterSpec::ContentTypes(_) => "content_types",
            FilterSpec::ChatTypes(_) => "chat_types",
            FilterSpec::Text(_) => "text",
            FilterSpec::TextContains(_) => "text_contains",
            FilterSpec::TextStartsWith(_) => "text_startswith",
            FilterSpec::ChatId(_) => "chat_id",
            FilterSpec::IsForwarded(_) => "is_forwarded",
            FilterSpec::IsReply(_) => "is_reply",
            FilterSpec::IsDigit(_) => "is_digit",
            FilterSpec::LanguageCode(_) => "language_code",
            FilterSpec::CallbackData(_) => "callback_data",
            FilterSpec::State(_) => "state",
            FilterSpec::Func(_) => "func",
            FilterSpec::AsyncFunc(_) => "async_func",
            FilterSpec::Custom { name, .. } => name,
        }
    }

    /// Validates the value and binds custom filters from `table`.
    pub fn resolve(self, table: &FilterTable) -> Result<ResolvedFilter, FilterError> {
        let name = self.name().to_string();
        let kind = match self {
            FilterSpec::Commands(commands) => {
                if commands.is_empty() {
                    return Err(FilterError::invalid(&name, "command list is empty"));
                }
                let commands: Vec<String> = commands
                    .into_iter()
                    .map(|command| command.trim_start_matches('/').to_string())
                    .collect();
                if commands.iter().any(|command| command.is_empty()) {
                    return Err(FilterError::invalid(&name, "empty command"));
                }
                Check::Commands(commands)
            }
            FilterSpec::Regexp(pattern) => {
                let regex = RegexBuilder::new(&pattern)
                    .case_insensitive(true)
                    .build()
                    .map_err(|err| FilterError::invalid(&name, err.to_string()))?;
                Check::Regexp(regex)
            }
            FilterSpec::ContentTypes(types) => Check::ContentTypes(types),
            FilterSpec::ChatTypes(types) => Check::ChatTypes(types),
            FilterSpec::Text(text) => {
                if text.is_empty() {
                    return Err(FilterError::invalid(&name, "no text condition set"));
                }
                Check::Text(text)
            }
            FilterSpec::TextContains(parts) => Check::Text(TextMatch::contains(parts)),
            FilterSpec::TextStartsWith(parts) => Check::Text(TextMatch::starts_with(parts)),
            FilterSpec::ChatId(ids) => Check::ChatId(ids),
            FilterSpec::IsForwarded(expected) => Check::IsForwarded(expected),
            FilterSpec::IsReply(expected) => Check::IsReply(expected),
            FilterSpec::IsDigit(expected) => Check::IsDigit(expected),
            FilterSpec::LanguageCode(codes) => Check::LanguageCode(codes),
            FilterSpec::CallbackData(filter) => Check::CallbackData(filter),
            FilterSpec::State(filter) => Check::State(filter),
            FilterSpec::Func(predicate) => Check::Func(predicate),
            FilterSpec::AsyncFunc(predicate) => Check::AsyncFunc(predicate),
            FilterSpec::Custom { name, value } => {
                let filter = table
                    .get(&name)
                    .ok_or_else(|| FilterError::UnknownFilter(name.clone()))?;
                filter
                    .validate(&value)
                    .map_err(|reason| FilterError::invalid(&name, reason))?;
                Check::Custom { filter, value }
            }
        };
        Ok(ResolvedFilter { name, kind })
    }
}

impl fmt::Debug for FilterSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FilterSpec({})", self.name())
    }
}

/// Everything a filter may consult besides the update itself.
pub struct FilterContext<'a> {
    pub update: &'a Arc<Update>,
    pub store: Option<&'a SharedStateStore>,
    pub state_key: Option<&'a ConversationKey>,
}

/// A filter ready for per-update evaluation.
pub struct ResolvedFilter {
    name: String,
    kind: Check,
}

enum Check {
    Commands(Vec<String>),
    Regexp(Regex),
    ContentTypes(Vec<ContentType>),
    ChatTypes(Vec<ChatType>),
    Text(TextMatch),
    ChatId(Vec<i64>),
    IsForwarded(bool),
    IsReply(bool),
    IsDigit(bool),
    LanguageCode(Vec<String>),
    CallbackData(CallbackDataFilter),
    State(StateFilter),
    Func(PredicateFn),
    AsyncFunc(AsyncPredicateFn),
    Custom {
        filter: Arc<dyn CustomFilter>,
        value: FilterValue,
    },
}

impl ResolvedFilter {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn check(&self, ctx: &FilterContext<'_>) -> Result<bool, FilterError> {
        let update = ctx.update.as_ref();
        let passed = match &self.kind {
            Check::Commands(commands) => text_message(update)
                .and_then(extract_command)
                .is_some_and(|command| commands.iter().any(|c| c == command)),
            Check::Regexp(regex) => text_message(update).is_some_and(|text| regex.is_match(text)),
            Check::ContentTypes(types) => update
                .message()
                .is_some_and(|message| types.contains(&message.content_type())),
            Check::ChatTypes(types) => update.chat().is_some_and(|chat| types.contains(&chat.kind)),
            Check::Text(text) => update.text().is_some_and(|value| text.matches(value)),
            Check::ChatId(ids) => update.chat().is_some_and(|chat| ids.contains(&chat.id)),
            Check::IsForwarded(expected) => {
                target_message(update).is_some_and(|m| m.is_forwarded() == *expected)
            }
            Check::IsReply(expected) => {
                target_message(update).is_some_and(|m| m.is_reply() == *expected)
            }
            Check::IsDigit(expected) => text_message(update).is_some_and(|text| {
                let digits = !text.is_empty() && text.chars().all(|c| c.is_numeric());
                digits == *expected
            }),
            Check::LanguageCode(codes) => update
                .user()
                .and_then(|user| user.language_code.as_deref())
                .is_some_and(|code| codes.iter().any(|c| c == code)),
            Check::CallbackData(filter) => update
                .callback_query()
                .and_then(|query| query.data.as_deref())
                .is_some_and(|data| filter.check(data)),
            Check::State(StateFilter::Any) => true,
            Check::State(StateFilter::OneOf(states)) => {
                let Some(key) = ctx.state_key else {
                    return Ok(false);
                };
                let store = ctx.store.ok_or(FilterError::MissingStateStore)?;
                store
                    .get_state(key)
                    .await?
                    .is_some_and(|current| states.contains(&current))
            }
            Check::Func(predicate) => predicate(update),
            Check::AsyncFunc(predicate) => predicate(Arc::clone(ctx.update)).await?,
            Check::Custom { filter, value } => filter.check(update, value).await?,
        };
        Ok(passed)
    }
}

impl fmt::Debug for ResolvedFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ResolvedFilter").field(&self.name).finish()
    }
}

/// Message the filter inspects: the update's own, or the one a callback
/// button was attached to.
fn target_message(update: &Update) -> Option<&Message> {
    match &update.kind {
        UpdateKind::CallbackQuery(query) => query.message.as_ref(),
        _ => update.message(),
    }
}

fn text_message(update: &Update) -> Option<&str> {
    update.message().and_then(|message| message.text.as_deref())
}

/// `/start@MyBot payload` → `start`. `None` when the text isn't a command.
pub fn extract_command(text: &str) -> Option<&str> {
    let head = text.strip_prefix('/')?.split_whitespace().next()?;
    head.split('@').next().filter(|command| !command.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use relaybot_session::shared_memory_store;
    use serde_json::json;

    fn message(extra: serde_json::Value) -> Arc<Update> {
        let mut body = json!({
            "message_id": 1,
            "date": 0,
            "chat": {"id": 10, "type": "private"},
            "from": {"id": 20, "is_bot": false, "first_name": "Ada", "language_code": "en"}
        });
        if let (Some(map), Some(more)) = (body.as_object_mut(), extra.as_object()) {
            map.extend(more.clone());
        }
        Arc::new(Update::from_value(json!({"update_id": 1, "message": body})).unwrap())
    }

    async fn passes(spec: FilterSpec, update: &Arc<Update>) -> bool {
        let filter = spec.resolve(&FilterTable::new()).unwrap();
        let ctx = FilterContext {
            update,
            store: None,
            state_key: None,
        };
        filter.check(&ctx).await.unwrap()
    }

    #[test]
    fn extracts_commands() {
        assert_eq!(extract_command("/help@Bot args"), Some("help"));
        assert_eq!(extract_command("/start"), Some("start"));
        assert_eq!(extract_command("hello"), None);
        assert_eq!(extract_command("/"), None);
    }

    #[tokio::test]
    async fn commands_match_text_messages_only() {
        let update = message(json!({"text": "/help@RelayBot now"}));
        assert!(passes(FilterSpec::commands(["start", "help"]), &update).await);
        assert!(!passes(FilterSpec::commands(["start"]), &update).await);

        let captioned = message(json!({"caption": "/help", "photo": []}));
        assert!(!passes(FilterSpec::commands(["help"]), &captioned).await);
    }

    #[test]
    fn empty_command_list_is_rejected() {
        let err = FilterSpec::Commands(Vec::new())
            .resolve(&FilterTable::new())
            .unwrap_err();
        assert!(matches!(err, FilterError::InvalidValue { .. }));
    }

    #[tokio::test]
    async fn regexp_is_case_insensitive() {
        let update = message(json!({"text": "Order PIZZA now"}));
        assert!(passes(FilterSpec::Regexp("pizza".into()), &update).await);
        assert!(!passes(FilterSpec::Regexp("^pizza".into()), &update).await);
        assert!(FilterSpec::Regexp("(".into()).resolve(&FilterTable::new()).is_err());
    }

    #[tokio::test]
    async fn content_and_chat_types() {
        let photo = message(json!({"photo": [{"file_id": "x"}]}));
        assert!(passes(FilterSpec::ContentTypes(vec![ContentType::Photo]), &photo).await);
        assert!(!passes(FilterSpec::ContentTypes(vec![ContentType::Text]), &photo).await);
        assert!(passes(FilterSpec::ChatTypes(vec![ChatType::Private]), &photo).await);
        assert!(!passes(FilterSpec::ChatTypes(vec![ChatType::Group]), &photo).await);
    }

    #[tokio::test]
    async fn text_options_are_alternatives() {
        let update = message(json!({"text": "Hello World"}));
        let text = TextMatch {
            equals: Some("nope".into()),
            ends_with: vec!["world".into()],
            ..TextMatch::default()
        };
        assert!(!passes(FilterSpec::Text(text.clone()), &update).await);
        assert!(passes(FilterSpec::Text(text.ignore_case()), &update).await);
        assert!(passes(FilterSpec::TextContains(vec!["lo W".into()]), &update).await);
        assert!(passes(FilterSpec::TextStartsWith(vec!["Hell".into()]), &update).await);
        assert!(FilterSpec::Text(TextMatch::default()).resolve(&FilterTable::new()).is_err());
    }

    #[tokio::test]
    async fn message_flags() {
        let reply = message(json!({
            "text": "42",
            "reply_to_message": {"message_id": 0, "date": 0, "chat": {"id": 10, "type": "private"}}
        }));
        assert!(passes(FilterSpec::IsReply(true), &reply).await);
        assert!(passes(FilterSpec::IsForwarded(false), &reply).await);
        assert!(passes(FilterSpec::IsDigit(true), &reply).await);
        assert!(passes(FilterSpec::ChatId(vec![10, 11]), &reply).await);
        assert!(passes(FilterSpec::LanguageCode(vec!["en".into()]), &reply).await);
        assert!(!passes(FilterSpec::LanguageCode(vec!["de".into()]), &reply).await);
    }

    struct MinLength;

    #[async_trait]
    impl CustomFilter for MinLength {
        fn key(&self) -> &str {
            "min_length"
        }

        fn validate(&self, value: &FilterValue) -> Result<(), String> {
            match value {
                FilterValue::Int(n) if *n >= 0 => Ok(()),
                _ => Err("expected a non-negative integer".into()),
            }
        }

        async fn check(&self, update: &Update, value: &FilterValue) -> anyhow::Result<bool> {
            let FilterValue::Int(min) = value else {
                anyhow::bail!("unexpected value {value:?}");
            };
            Ok(update.text().is_some_and(|t| t.chars().count() as i64 >= *min))
        }
    }

    #[tokio::test]
    async fn custom_filters_resolve_against_table() {
        let mut table = FilterTable::new();
        table.insert(Arc::new(MinLength));

        let err = FilterSpec::custom("max_length", FilterValue::Int(3))
            .resolve(&table)
            .unwrap_err();
        assert!(matches!(err, FilterError::UnknownFilter(name) if name == "max_length"));
        assert!(
            FilterSpec::custom("min_length", FilterValue::Text("x".into()))
                .resolve(&table)
                .is_err()
        );

        let filter = FilterSpec::custom("min_length", FilterValue::Int(3))
            .resolve(&table)
            .unwrap();
        let update = message(json!({"text": "abcd"}));
        let ctx = FilterContext {
            update: &update,
            store: None,
            state_key: None,
        };
        assert!(filter.check(&ctx).await.unwrap());
    }

    #[tokio::test]
    async fn state_filter_reads_store_only_when_needed() {
        let update = message(json!({"text": "hi"}));
        let store = shared_memory_store();
        let key = ConversationKey::new(10, 20);

        let any = FilterSpec::state("*").resolve(&FilterTable::new()).unwrap();
        let ctx = FilterContext {
            update: &update,
            store: None,
            state_key: Some(&key),
        };
        assert!(any.check(&ctx).await.unwrap());

        let waiting = FilterSpec::state(StateFilter::one_of(["name", "age"]))
            .resolve(&FilterTable::new())
            .unwrap();
        assert!(matches!(
            waiting.check(&ctx).await,
            Err(FilterError::MissingStateStore)
        ));

        let ctx = FilterContext {
            update: &update,
            store: Some(&store),
            state_key: Some(&key),
        };
        assert!(!waiting.check(&ctx).await.unwrap());
        store.set_state(&key, "age").await.unwrap();
        assert!(waiting.check(&ctx).await.unwrap());
    }

    #[tokio::test]
    async fn async_predicate_errors_surface() {
        let update = message(json!({"text": "hi"}));
        let failing = FilterSpec::async_func(|_| async { Err::<bool, _>(anyhow::anyhow!("backend down")) })
            .resolve(&FilterTable::new())
            .unwrap();
        let ctx = FilterContext {
            update: &update,
            store: None,
            state_key: None,
        };
        assert!(matches!(
            failing.check(&ctx).await,
            Err(FilterError::Predicate(_))
        ));
    }
}
