//! Conversation state storage for multi-step handler flows.
//!
//! A conversation is one `(chat, user)` pair, optionally narrowed by bot id,
//! business connection, and forum topic. Each conversation owns at most one
//! [`ConversationRecord`]: a state tag plus a JSON data map.

mod context;
mod file_store;
mod memory;
#[cfg(feature = "redis-store")]
mod redis_store;

use std::{collections::BTreeMap, env, fmt, path::PathBuf, sync::Arc};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
#[cfg(not(feature = "redis-store"))]
use tracing::warn;

pub use context::{ConversationState, interactive_data};
pub use file_store::{DEFAULT_STATE_FILE, FileStateStore};
pub use memory::MemoryStateStore;
#[cfg(feature = "redis-store")]
pub use redis_store::RedisStateStore;

/// Separator between the components of a serialized [`ConversationKey`].
pub const KEY_SEPARATOR: char = ':';
/// Prefix used when a key is built without an explicit one.
pub const DEFAULT_KEY_PREFIX: &str = "state";

/// Auxiliary data attached to a conversation.
pub type StateData = BTreeMap<String, Value>;

/// Shared state store handle used across handlers and filters.
pub type SharedStateStore = Arc<dyn StateStore>;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("no conversation state for {key}; set a state before writing data")]
    NotFound { key: String },
    #[error("key component {component:?} contains the key separator ':'")]
    InvalidKeyComponent { component: String },
    #[error("unsupported state file version {0}")]
    UnsupportedVersion(u32),
    #[error("state file i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("state serialization failed: {0}")]
    Serde(#[from] serde_json::Error),
    #[cfg(feature = "redis-store")]
    #[error("redis state backend failed: {0}")]
    Redis(#[from] redis::RedisError),
}

impl StateError {
    pub(crate) fn not_found(key: &ConversationKey) -> Self {
        StateError::NotFound {
            key: key.to_string(),
        }
    }
}

/// Identity of one conversation.
///
/// Serialized as `prefix[:b<bot>][:c<connection>][:t<thread>]:chat:user`.
/// Optional parts are omitted rather than padded, and carry a one-letter tag
/// so that keys with different optional parts never collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationKey {
    prefix: String,
    bot_id: Option<i64>,
    business_connection_id: Option<String>,
    thread_id: Option<i64>,
    chat_id: i64,
    user_id: i64,
}

impl ConversationKey {
    pub fn new(chat_id: i64, user_id: i64) -> Self {
        Self {
            prefix: DEFAULT_KEY_PREFIX.to_string(),
            bot_id: None,
            business_connection_id: None,
            thread_id: None,
            chat_id,
            user_id,
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Result<Self, StateError> {
        self.prefix = checked_component(prefix.into())?;
        Ok(self)
    }

    pub fn with_bot_id(mut self, bot_id: Option<i64>) -> Self {
        self.bot_id = bot_id;
        self
    }

    pub fn with_business_connection(
        mut self,
        connection_id: Option<String>,
    ) -> Result<Self, StateError> {
        self.business_connection_id = connection_id.map(checked_component).transpose()?;
        Ok(self)
    }

    pub fn with_thread_id(mut self, thread_id: Option<i64>) -> Self {
        self.thread_id = thread_id;
        self
    }

    pub fn chat_id(&self) -> i64 {
        self.chat_id
    }

    pub fn user_id(&self) -> i64 {
        self.user_id
    }

    pub fn thread_id(&self) -> Option<i64> {
        self.thread_id
    }
}

fn checked_component(value: String) -> Result<String, StateError> {
    if value.contains(KEY_SEPARATOR) {
        return Err(StateError::InvalidKeyComponent { component: value });
    }
    Ok(value)
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.prefix)?;
        if let Some(bot_id) = self.bot_id {
            write!(f, "{KEY_SEPARATOR}b{bot_id}")?;
        }
        if let Some(connection) = &self.business_connection_id {
            write!(f, "{KEY_SEPARATOR}c{connection}")?;
        }
        if let Some(thread_id) = self.thread_id {
            write!(f, "{KEY_SEPARATOR}t{thread_id}")?;
        }
        write!(
            f,
            "{KEY_SEPARATOR}{}{KEY_SEPARATOR}{}",
            self.chat_id, self.user_id
        )
    }
}

/// Persisted state of one conversation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConversationRecord {
    pub state: Option<String>,
    #[serde(default)]
    pub data: StateData,
}

impl ConversationRecord {
    pub fn with_state(state: &str) -> Self {
        Self {
            state: Some(state.to_string()),
            data: StateData::new(),
        }
    }
}

#[async_trait]
pub trait StateStore: Send + Sync {
    /// Current state tag, `None` when the conversation has no record.
    async fn get_state(&self, key: &ConversationKey) -> Result<Option<String>, StateError>;

    /// Creates the record when absent, otherwise replaces only the state tag.
    async fn set_state(&self, key: &ConversationKey, state: &str) -> Result<(), StateError>;

    /// Removes the whole record. Returns whether one existed.
    async fn delete_state(&self, key: &ConversationKey) -> Result<bool, StateError>;

    async fn get_data(&self, key: &ConversationKey) -> Result<Option<StateData>, StateError>;

    /// Writes one data field. Fails with [`StateError::NotFound`] when the
    /// conversation has no record yet.
    async fn set_data(
        &self,
        key: &ConversationKey,
        field: &str,
        value: Value,
    ) -> Result<(), StateError>;

    /// Clears the data map and keeps the state. Returns whether a record existed.
    async fn reset_data(&self, key: &ConversationKey) -> Result<bool, StateError>;

    /// Replaces the whole data map of an existing record.
    async fn save_data(&self, key: &ConversationKey, data: StateData) -> Result<(), StateError>;

    /// Runs `mutate` on the data map of an existing record and stores the
    /// result, with no other write to the record in between. Returns `false`
    /// without calling `mutate` when there is no record.
    async fn update_data(
        &self,
        key: &ConversationKey,
        mutate: &mut (dyn for<'s> FnMut(&'s mut StateData) + Send),
    ) -> Result<bool, StateError>;
}

/// Returns an in-memory state store wrapped in an [`Arc`].
pub fn shared_memory_store() -> SharedStateStore {
    Arc::new(MemoryStateStore::new())
}

/// Builds a state store from environment variables.
///
/// `STATE_REDIS_URL` selects the Redis backend (requires the `redis-store`
/// feature), `STATE_FILE` selects the file backend, and the in-memory store is
/// used otherwise.
pub async fn store_from_env() -> Result<SharedStateStore, StateError> {
    if let Ok(url) = env::var("STATE_REDIS_URL") {
        let namespace = env::var("STATE_NAMESPACE").unwrap_or_else(|_| "relaybot".into());
        return build_redis_store(&url, &namespace).await;
    }
    if let Ok(path) = env::var("STATE_FILE") {
        let store = FileStateStore::open(PathBuf::from(path)).await?;
        return Ok(Arc::new(store));
    }
    Ok(shared_memory_store())
}

#[cfg(feature = "redis-store")]
async fn build_redis_store(url: &str, namespace: &str) -> Result<SharedStateStore, StateError> {
    let store = RedisStateStore::connect(url, namespace).await?;
    Ok(Arc::new(store))
}

#[cfg(not(feature = "redis-store"))]
async fn build_redis_store(_url: &str, _namespace: &str) -> Result<SharedStateStore, StateError> {
    warn!("redis-store feature disabled; using in-memory state store");
    Ok(shared_memory_store())
}
