use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;

use crate::{ConversationKey, ConversationRecord, StateData, StateError, StateStore};

/// Process-local store keyed by the serialized [`ConversationKey`].
#[derive(Default)]
pub struct MemoryStateStore {
    records: DashMap<String, ConversationRecord>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn get_state(&self, key: &ConversationKey) -> Result<Option<String>, StateError> {
        Ok(self
            .records
            .get(&key.to_string())
            .and_then(|entry| entry.value().state.clone()))
    }

    async fn set_state(&self, key: &ConversationKey, state: &str) -> Result<(), StateError> {
        self.records
            .entry(key.to_string())
            .and_modify(|record| record.state = Some(state.to_string()))
            .or_insert_with(|| ConversationRecord::with_state(state));
        Ok(())
    }

    async fn delete_state(&self, key: &ConversationKey) -> Result<bool, StateError> {
        Ok(self.records.remove(&key.to_string()).is_some())
    }

    async fn get_data(&self, key: &ConversationKey) -> Result<Option<StateData>, StateError> {
        Ok(self
            .records
            .get(&key.to_string())
            .map(|entry| entry.value().data.clone()))
    }

    async fn set_data(
        &self,
        key: &ConversationKey,
        field: &str,
        value: Value,
    ) -> Result<(), StateError> {
        let mut record = self
            .records
            .get_mut(&key.to_string())
            .ok_or_else(|| StateError::not_found(key))?;
        record.data.insert(field.to_string(), value);
        Ok(())
    }

    async fn reset_data(&self, key: &ConversationKey) -> Result<bool, StateError> {
        match self.records.get_mut(&key.to_string()) {
            Some(mut record) => {
                record.data.clear();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn save_data(&self, key: &ConversationKey, data: StateData) -> Result<(), StateError> {
        let mut record = self
            .records
            .get_mut(&key.to_string())
            .ok_or_else(|| StateError::not_found(key))?;
        record.data = data;
        Ok(())
    }

    async fn update_data(
        &self,
        key: &ConversationKey,
        mutate: &mut (dyn for<'s> FnMut(&'s mut StateData) + Send),
    ) -> Result<bool, StateError> {
        let Some(mut record) = self.records.get_mut(&key.to_string()) else {
            return Ok(false);
        };
        mutate(&mut record.data);
        Ok(true)
    }
}
