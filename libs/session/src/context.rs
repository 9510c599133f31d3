use std::panic::{AssertUnwindSafe, catch_unwind, resume_unwind};

use serde_json::Value;
use tracing::error;

use crate::{ConversationKey, SharedStateStore, StateData, StateError, StateStore};

/// Scoped read-modify-write of a conversation's data map.
///
/// Runs through [`StateStore::update_data`], so no other write to the record
/// lands between the read and the write-back. Whatever `mutate` left in the
/// map is stored whether it returned `Ok`, returned `Err`, or panicked; a
/// panic resumes after the write, even when the write itself failed. The
/// conversation must already have a record.
pub async fn interactive_data<T, E, F>(
    store: &dyn StateStore,
    key: &ConversationKey,
    mutate: F,
) -> Result<T, E>
where
    F: FnOnce(&mut StateData) -> Result<T, E> + Send,
    T: Send,
    E: From<StateError> + Send,
{
    let mut mutate = Some(mutate);
    let mut outcome = None;
    let flushed = store
        .update_data(key, &mut |data: &mut StateData| {
            if let Some(mutate) = mutate.take() {
                outcome = Some(catch_unwind(AssertUnwindSafe(|| mutate(data))));
            }
        })
        .await;

    match outcome {
        Some(Err(panic)) => {
            if let Err(err) = &flushed {
                error!(key = %key, error = %err, "state data not stored after the scope panicked");
            }
            resume_unwind(panic)
        }
        Some(Ok(result)) => {
            flushed?;
            result
        }
        None => {
            flushed?;
            Err(StateError::not_found(key).into())
        }
    }
}

/// A state store bound to one conversation, handed to handler bodies.
#[derive(Clone)]
pub struct ConversationState {
    store: SharedStateStore,
    key: ConversationKey,
}

impl ConversationState {
    pub fn new(store: SharedStateStore, key: ConversationKey) -> Self {
        Self { store, key }
    }

    pub fn key(&self) -> &ConversationKey {
        &self.key
    }

    pub async fn get(&self) -> Result<Option<String>, StateError> {
        self.store.get_state(&self.key).await
    }

    pub async fn set(&self, state: &str) -> Result<(), StateError> {
        self.store.set_state(&self.key, state).await
    }

    pub async fn delete(&self) -> Result<bool, StateError> {
        self.store.delete_state(&self.key).await
    }

    pub async fn data(&self) -> Result<Option<StateData>, StateError> {
        self.store.get_data(&self.key).await
    }

    pub async fn set_data(&self, field: &str, value: Value) -> Result<(), StateError> {
        self.store.set_data(&self.key, field, value).await
    }

    pub async fn reset_data(&self) -> Result<bool, StateError> {
        self.store.reset_data(&self.key).await
    }

    pub async fn with_data<T, E, F>(&self, mutate: F) -> Result<T, E>
    where
        F: FnOnce(&mut StateData) -> Result<T, E> + Send,
        T: Send,
        E: From<StateError> + Send,
    {
        interactive_data(self.store.as_ref(), &self.key, mutate).await
    }
}
