use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::debug;

use crate::{ConversationKey, ConversationRecord, StateData, StateError, StateStore};

pub const DEFAULT_STATE_FILE: &str = ".state-save/states.json";
const FILE_FORMAT_VERSION: u32 = 1;

type Records = BTreeMap<String, ConversationRecord>;

#[derive(Debug, Serialize, Deserialize)]
struct StateFile {
    version: u32,
    #[serde(default)]
    records: Records,
}

/// File-backed store for small single-process bots.
///
/// The whole mapping lives in memory and the file is rewritten after every
/// mutation. Several processes writing the same file will overwrite each
/// other.
pub struct FileStateStore {
    path: PathBuf,
    records: Mutex<Records>,
}

impl FileStateStore {
    /// Loads the mapping from `path` if the file exists. Nothing is created on
    /// disk until the first mutation.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StateError> {
        let path = path.into();
        let records = match tokio::fs::read(&path).await {
            Ok(raw) if raw.is_empty() => Records::new(),
            Ok(raw) => {
                let file: StateFile = serde_json::from_slice(&raw)?;
                if file.version != FILE_FORMAT_VERSION {
                    return Err(StateError::UnsupportedVersion(file.version));
                }
                file.records
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Records::new(),
            Err(err) => return Err(err.into()),
        };
        debug!(path = %path.display(), records = records.len(), "state file loaded");
        Ok(Self {
            path,
            records: Mutex::new(records),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, records: &Records) -> Result<(), StateError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let payload = serde_json::to_vec_pretty(&StateFileRef {
            version: FILE_FORMAT_VERSION,
            records,
        })?;
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        tokio::fs::write(&tmp, payload).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[derive(Serialize)]
struct StateFileRef<'a> {
    version: u32,
    records: &'a Records,
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn get_state(&self, key: &ConversationKey) -> Result<Option<String>, StateError> {
        let records = self.records.lock().await;
        Ok(records
            .get(&key.to_string())
            .and_then(|record| record.state.clone()))
    }

    async fn set_state(&self, key: &ConversationKey, state: &str) -> Result<(), StateError> {
        let mut records = self.records.lock().await;
        records
            .entry(key.to_string())
            .and_modify(|record| record.state = Some(state.to_string()))
            .or_insert_with(|| ConversationRecord::with_state(state));
        self.persist(&records).await
    }

    async fn delete_state(&self, key: &ConversationKey) -> Result<bool, StateError> {
        let mut records = self.records.lock().await;
        if records.remove(&key.to_string()).is_none() {
            return Ok(false);
        }
        self.persist(&records).await?;
        Ok(true)
    }

    async fn get_data(&self, key: &ConversationKey) -> Result<Option<StateData>, StateError> {
        let records = self.records.lock().await;
        Ok(records.get(&key.to_string()).map(|record| record.data.clone()))
    }

    async fn set_data(
        &self,
        key: &ConversationKey,
        field: &str,
        value: Value,
    ) -> Result<(), StateError> {
        let mut records = self.records.lock().await;
        let record = records
            .get_mut(&key.to_string())
            .ok_or_else(|| StateError::not_found(key))?;
        record.data.insert(field.to_string(), value);
        self.persist(&records).await
    }

    async fn reset_data(&self, key: &ConversationKey) -> Result<bool, StateError> {
        let mut records = self.records.lock().await;
        let Some(record) = records.get_mut(&key.to_string()) else {
            return Ok(false);
        };
        record.data.clear();
        self.persist(&records).await?;
        Ok(true)
    }

    async fn save_data(&self, key: &ConversationKey, data: StateData) -> Result<(), StateError> {
        let mut records = self.records.lock().await;
        let record = records
            .get_mut(&key.to_string())
            .ok_or_else(|| StateError::not_found(key))?;
        record.data = data;
        self.persist(&records).await
    }

    async fn update_data(
        &self,
        key: &ConversationKey,
        mutate: &mut (dyn for<'s> FnMut(&'s mut StateData) + Send),
    ) -> Result<bool, StateError> {
        let mut records = self.records.lock().await;
        let Some(record) = records.get_mut(&key.to_string()) else {
            return Ok(false);
        };
        mutate(&mut record.data);
        self.persist(&records).await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn directory_is_created_lazily() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("states.json");
        let store = FileStateStore::open(&path).await.unwrap();
        assert!(!path.parent().unwrap().exists());

        let key = ConversationKey::new(1, 2);
        assert_eq!(store.get_state(&key).await.unwrap(), None);
        assert!(!path.exists());

        store.set_state(&key, "A").await.unwrap();
        assert!(path.exists());
    }

    #[tokio::test]
    async fn records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("states.json");
        let key = ConversationKey::new(1, 2);
        {
            let store = FileStateStore::open(&path).await.unwrap();
            store.set_state(&key, "A").await.unwrap();
            store.set_data(&key, "name", json!("John")).await.unwrap();
        }
        let reopened = FileStateStore::open(&path).await.unwrap();
        assert_eq!(reopened.get_state(&key).await.unwrap().as_deref(), Some("A"));
        let data = reopened.get_data(&key).await.unwrap().unwrap();
        assert_eq!(data.get("name"), Some(&json!("John")));
    }

    #[tokio::test]
    async fn file_is_versioned_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("states.json");
        let store = FileStateStore::open(&path).await.unwrap();
        store
            .set_state(&ConversationKey::new(3, 4), "step")
            .await
            .unwrap();
        let raw: Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(raw["version"], json!(1));
        assert_eq!(raw["records"]["state:3:4"]["state"], json!("step"));
    }

    #[tokio::test]
    async fn unknown_version_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("states.json");
        std::fs::write(&path, r#"{"version":9,"records":{}}"#).unwrap();
        let err = FileStateStore::open(&path).await.err().unwrap();
        assert!(matches!(err, StateError::UnsupportedVersion(9)));
    }

    #[tokio::test]
    async fn delete_is_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("states.json");
        let key = ConversationKey::new(1, 2);
        let store = FileStateStore::open(&path).await.unwrap();
        store.set_state(&key, "A").await.unwrap();
        assert!(store.delete_state(&key).await.unwrap());
        assert!(!store.delete_state(&key).await.unwrap());

        let reopened = FileStateStore::open(&path).await.unwrap();
        assert_eq!(reopened.get_state(&key).await.unwrap(), None);
        assert!(matches!(
            reopened.set_data(&key, "k", json!(1)).await,
            Err(StateError::NotFound { .. })
        ));
    }
}
