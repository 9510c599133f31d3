use async_trait::async_trait;
use redis::AsyncCommands;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::{ConversationKey, ConversationRecord, StateData, StateError, StateStore};

fn namespaced(namespace: &str, key: &ConversationKey) -> String {
    format!("{namespace}:{key}")
}

/// Redis-backed store.
///
/// Every read-modify-write, scoped [`StateStore::update_data`] included, runs
/// while holding one process-local lock around the connection, and the write
/// half goes through a `MULTI`/`EXEC` pipeline.
/// The lock covers all keys, so unrelated conversations serialize behind each
/// other.
pub struct RedisStateStore {
    namespace: String,
    connection: Mutex<redis::aio::ConnectionManager>,
}

impl RedisStateStore {
    pub async fn connect(url: &str, namespace: impl Into<String>) -> Result<Self, StateError> {
        let client = redis::Client::open(url)?;
        let manager = redis::aio::ConnectionManager::new(client).await?;
        Ok(Self {
            namespace: namespace.into(),
            connection: Mutex::new(manager),
        })
    }

    fn record_key(&self, key: &ConversationKey) -> String {
        namespaced(&self.namespace, key)
    }

    async fn read(
        conn: &mut redis::aio::ConnectionManager,
        record_key: &str,
    ) -> Result<Option<ConversationRecord>, StateError> {
        let payload: Option<String> = conn.get(record_key).await?;
        Ok(match payload {
            Some(raw) => Some(serde_json::from_str(&raw)?),
            None => None,
        })
    }

    async fn write(
        conn: &mut redis::aio::ConnectionManager,
        record_key: &str,
        record: &ConversationRecord,
    ) -> Result<(), StateError> {
        let payload = serde_json::to_string(record)?;
        redis::pipe()
            .atomic()
            .cmd("SET")
            .arg(record_key)
            .arg(payload)
            .ignore()
            .query_async::<()>(conn)
            .await?;
        Ok(())
    }

    /// Applies `mutate` to an existing record under the store lock.
    async fn update_existing<F>(&self, key: &ConversationKey, mutate: F) -> Result<bool, StateError>
    where
        F: FnOnce(&mut ConversationRecord) + Send,
    {
        let record_key = self.record_key(key);
        let mut conn = self.connection.lock().await;
        let Some(mut record) = Self::read(&mut conn, &record_key).await? else {
            return Ok(false);
        };
        mutate(&mut record);
        Self::write(&mut conn, &record_key, &record).await?;
        Ok(true)
    }
}

#[async_trait]
impl StateStore for RedisStateStore {
    async fn get_state(&self, key: &ConversationKey) -> Result<Option<String>, StateError> {
        let mut conn = self.connection.lock().await;
        let record = Self::read(&mut conn, &self.record_key(key)).await?;
        Ok(record.and_then(|record| record.state))
    }

    async fn set_state(&self, key: &ConversationKey, state: &str) -> Result<(), StateError> {
        let record_key = self.record_key(key);
        let mut conn = self.connection.lock().await;
        let record = match Self::read(&mut conn, &record_key).await? {
            Some(mut existing) => {
                existing.state = Some(state.to_string());
                existing
            }
            None => ConversationRecord::with_state(state),
        };
        Self::write(&mut conn, &record_key, &record).await
    }

    async fn delete_state(&self, key: &ConversationKey) -> Result<bool, StateError> {
        let mut conn = self.connection.lock().await;
        let (removed,): (u64,) = redis::pipe()
            .atomic()
            .cmd("DEL")
            .arg(self.record_key(key))
            .query_async(&mut *conn)
            .await?;
        Ok(removed > 0)
    }

    async fn get_data(&self, key: &ConversationKey) -> Result<Option<StateData>, StateError> {
        let mut conn = self.connection.lock().await;
        let record = Self::read(&mut conn, &self.record_key(key)).await?;
        Ok(record.map(|record| record.data))
    }

    async fn set_data(
        &self,
        key: &ConversationKey,
        field: &str,
        value: Value,
    ) -> Result<(), StateError> {
        let field = field.to_string();
        let updated = self
            .update_existing(key, move |record| {
                record.data.insert(field, value);
            })
            .await?;
        if updated {
            Ok(())
        } else {
            Err(StateError::not_found(key))
        }
    }

    async fn reset_data(&self, key: &ConversationKey) -> Result<bool, StateError> {
        self.update_existing(key, |record| record.data.clear()).await
    }

    async fn save_data(&self, key: &ConversationKey, data: StateData) -> Result<(), StateError> {
        let updated = self
            .update_existing(key, move |record| record.data = data)
            .await?;
        if updated {
            Ok(())
        } else {
            Err(StateError::not_found(key))
        }
    }

    async fn update_data(
        &self,
        key: &ConversationKey,
        mutate: &mut (dyn for<'s> FnMut(&'s mut StateData) + Send),
    ) -> Result<bool, StateError> {
        self.update_existing(key, |record| mutate(&mut record.data)).await
    }
}
