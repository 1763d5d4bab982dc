use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

/// One stored prediction. Field order matches the persisted document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub username: String,
    pub image: String,
    pub result: String,
    pub score: f64,
    pub time: String,
    pub outline_image: String,
    pub filled_image: String,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store i/o failed for {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("store document {} is not valid JSON: {source}", path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Append-only prediction history.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn append(&self, record: HistoryRecord) -> Result<(), StoreError>;

    /// Records whose username matches exactly, in append order.
    async fn for_user(&self, username: &str) -> Result<Vec<HistoryRecord>, StoreError>;
}

/// History kept as a single pretty-printed JSON array on disk.
///
/// Every access reads the whole document; every append rewrites it. The
/// mutex serializes read-modify-write cycles within the process.
pub struct JsonHistoryStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonHistoryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    async fn load(&self) -> Result<Vec<HistoryRecord>, StoreError> {
        read_json_or_default(&self.path).await
    }
}

#[async_trait]
impl HistoryStore for JsonHistoryStore {
    async fn append(&self, record: HistoryRecord) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        let mut history = self.load().await?;
        history.push(record);
        write_json_atomic(&self.path, &history).await?;
        debug!(entries = history.len(), "history saved");
        Ok(())
    }

    async fn for_user(&self, username: &str) -> Result<Vec<HistoryRecord>, StoreError> {
        let _guard = self.lock.lock().await;
        let history = self.load().await?;
        Ok(history
            .into_iter()
            .filter(|record| record.username == username)
            .collect())
    }
}

/// Reads a JSON document, treating a missing file as `T::default()`.
pub(crate) async fn read_json_or_default<T>(path: &Path) -> Result<T, StoreError>
where
    T: DeserializeOwned + Default,
{
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(T::default()),
        Err(source) => {
            return Err(StoreError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    serde_json::from_slice(&bytes).map_err(|source| StoreError::Json {
        path: path.to_path_buf(),
        source,
    })
}

/// Writes `value` with 4-space indentation to a sibling temp file, then renames it over `path`.
pub(crate) async fn write_json_atomic<T: Serialize>(
    path: &Path,
    value: &T,
) -> Result<(), StoreError> {
    let io_err = |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    };

    let mut buffer = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut serializer = serde_json::Serializer::with_formatter(&mut buffer, formatter);
    value
        .serialize(&mut serializer)
        .map_err(|source| StoreError::Json {
            path: path.to_path_buf(),
            source,
        })?;

    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
    }
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp_path = PathBuf::from(tmp_name);
    tokio::fs::write(&tmp_path, &buffer).await.map_err(io_err)?;
    tokio::fs::rename(&tmp_path, path).await.map_err(io_err)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn record(username: &str, image: &str) -> HistoryRecord {
        HistoryRecord {
            username: username.to_string(),
            image: format!("http://localhost/uploads/{image}"),
            result: "normal".to_string(),
            score: 0.12,
            time: "2024-05-01 10:00:00".to_string(),
            outline_image: format!("http://localhost/results/outline_{image}"),
            filled_image: format!("http://localhost/results/filled_{image}"),
        }
    }

    #[tokio::test]
    async fn missing_file_is_empty_history() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonHistoryStore::new(dir.path().join("history.json"));
        assert!(store.for_user("alice").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn filters_by_exact_username_in_append_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonHistoryStore::new(dir.path().join("history.json"));

        store.append(record("alice", "a.png")).await.unwrap();
        store.append(record("bob", "b.png")).await.unwrap();
        store.append(record("Alice", "c.png")).await.unwrap();
        store.append(record("alice", "d.png")).await.unwrap();

        let alice = store.for_user("alice").await.unwrap();
        assert_eq!(alice, vec![record("alice", "a.png"), record("alice", "d.png")]);
        assert_eq!(store.for_user("Alice").await.unwrap().len(), 1);
        assert!(store.for_user("carol").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn document_is_pretty_printed_array() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.json");
        let store = JsonHistoryStore::new(&path);
        store.append(record("alice", "a.png")).await.unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.starts_with("[\n    {\n        \"username\": \"alice\""));
        let parsed: Vec<HistoryRecord> = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed, vec![record("alice", "a.png")]);
        assert!(!dir.path().join("history.json.tmp").exists());
    }

    #[tokio::test]
    async fn corrupt_document_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.json");
        std::fs::write(&path, "{ not json").unwrap();

        let store = JsonHistoryStore::new(&path);
        let err = store.for_user("alice").await.unwrap_err();
        assert!(matches!(err, StoreError::Json { .. }));
        assert!(store.append(record("alice", "a.png")).await.is_err());
    }

    #[tokio::test]
    async fn concurrent_appends_are_not_lost() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(JsonHistoryStore::new(dir.path().join("history.json")));

        let tasks: Vec<_> = (0..16)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move {
                    store.append(record("alice", &format!("{i}.png"))).await
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(store.for_user("alice").await.unwrap().len(), 16);
    }
}
