use async_trait::async_trait;
use futures::TryStreamExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt::Display;
use thiserror::Error;
use tokio::sync::{broadcast, RwLock};
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(String),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

fn backend(err: impl Display) -> StoreError {
    StoreError::Backend(err.to_string())
}

/// A change pushed by the store. `value` is `None` for deletions.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub path: String,
    pub value: Option<Value>,
}

/// The shared state store the engine runs against: snapshot reads, push
/// subscriptions, and multi-key batched updates over logical `/`-separated
/// paths. Admission reads tolerate slightly stale data; implementations are
/// eventually consistent.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, path: &str) -> Result<Option<Value>, StoreError>;

    async fn set(&self, path: &str, value: Value) -> Result<(), StoreError>;

    /// Apply several writes as one batch. Backends apply it as atomically as
    /// they can; callers must not assume more than a narrowed inconsistency
    /// window.
    async fn update(&self, changes: BTreeMap<String, Value>) -> Result<(), StoreError>;

    /// Snapshot of every entry at or under `prefix`.
    async fn list(&self, prefix: &str) -> Result<Vec<(String, Value)>, StoreError>;

    /// Push feed of changes at or under `prefix`.
    async fn subscribe(&self, prefix: &str) -> Result<broadcast::Receiver<ChangeEvent>, StoreError>;
}

pub async fn get_typed<T: DeserializeOwned>(
    store: &dyn KvStore,
    path: &str,
) -> Result<Option<T>, StoreError> {
    match store.get(path).await? {
        Some(value) => Ok(Some(serde_json::from_value(value)?)),
        None => Ok(None),
    }
}

pub fn to_value<T: Serialize>(value: &T) -> Result<Value, StoreError> {
    Ok(serde_json::to_value(value)?)
}

fn under_prefix(path: &str, prefix: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    path == prefix || path.starts_with(&format!("{}/", prefix))
}

/// In-process store used by the `memory` backend and the test suite. Batched
/// updates are atomic under one write lock.
pub struct MemoryStore {
    data: RwLock<BTreeMap<String, Value>>,
    changes: broadcast::Sender<ChangeEvent>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(256);
        Self {
            data: RwLock::new(BTreeMap::new()),
            changes,
        }
    }

    fn emit(&self, path: &str, value: Option<Value>) {
        // No receivers is fine; nobody has subscribed yet.
        let _ = self.changes.send(ChangeEvent {
            path: path.to_string(),
            value,
        });
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, path: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.data.read().await.get(path).cloned())
    }

    async fn set(&self, path: &str, value: Value) -> Result<(), StoreError> {
        self.data
            .write()
            .await
            .insert(path.to_string(), value.clone());
        self.emit(path, Some(value));
        Ok(())
    }

    async fn update(&self, changes: BTreeMap<String, Value>) -> Result<(), StoreError> {
        {
            let mut data = self.data.write().await;
            for (path, value) in &changes {
                data.insert(path.clone(), value.clone());
            }
        }
        for (path, value) in changes {
            self.emit(&path, Some(value));
        }
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<(String, Value)>, StoreError> {
        let data = self.data.read().await;
        Ok(data
            .iter()
            .filter(|(path, _)| under_prefix(path, prefix))
            .map(|(path, value)| (path.clone(), value.clone()))
            .collect())
    }

    async fn subscribe(&self, prefix: &str) -> Result<broadcast::Receiver<ChangeEvent>, StoreError> {
        let mut upstream = self.changes.subscribe();
        let (tx, rx) = broadcast::channel(64);
        let prefix = prefix.to_string();
        tokio::spawn(async move {
            loop {
                match upstream.recv().await {
                    Ok(event) => {
                        if under_prefix(&event.path, &prefix) && tx.send(event).is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Ok(rx)
    }
}

/// Store backed by a NATS JetStream key-value bucket. Logical `/` paths map
/// onto the bucket's `.`-separated key hierarchy so prefix watches work.
pub struct NatsKvStore {
    kv: async_nats::jetstream::kv::Store,
}

impl NatsKvStore {
    pub async fn connect(nats_url: &str, bucket: &str) -> Result<Self, StoreError> {
        let client = async_nats::connect(nats_url).await.map_err(backend)?;
        let jetstream = async_nats::jetstream::new(client);

        let kv = match jetstream.get_key_value(bucket).await {
            Ok(kv) => kv,
            Err(_) => jetstream
                .create_key_value(async_nats::jetstream::kv::Config {
                    bucket: bucket.to_string(),
                    ..Default::default()
                })
                .await
                .map_err(backend)?,
        };

        info!("Connected to NATS KV bucket: {}", bucket);
        Ok(Self { kv })
    }

    fn key_of(path: &str) -> String {
        path.replace('/', ".")
    }

    fn path_of(key: &str) -> String {
        key.replace('.', "/")
    }
}

#[async_trait]
impl KvStore for NatsKvStore {
    async fn get(&self, path: &str) -> Result<Option<Value>, StoreError> {
        let bytes = self.kv.get(Self::key_of(path)).await.map_err(backend)?;
        match bytes {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn set(&self, path: &str, value: Value) -> Result<(), StoreError> {
        let payload = serde_json::to_vec(&value)?;
        self.kv
            .put(Self::key_of(path), bytes::Bytes::from(payload))
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn update(&self, changes: BTreeMap<String, Value>) -> Result<(), StoreError> {
        // JetStream KV has no multi-key transaction; writes land one by one
        // and a crash mid-batch leaves a partial update for the next reader
        // to heal.
        for (path, value) in changes {
            self.set(&path, value).await?;
        }
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<(String, Value)>, StoreError> {
        let mut keys = self.kv.keys().await.map_err(backend)?;
        let mut matching = Vec::new();
        while let Some(key) = keys.try_next().await.map_err(backend)? {
            let path = Self::path_of(&key);
            if under_prefix(&path, prefix) {
                matching.push(path);
            }
        }

        let mut entries = Vec::with_capacity(matching.len());
        for path in matching {
            if let Some(value) = self.get(&path).await? {
                entries.push((path, value));
            }
        }
        Ok(entries)
    }

    async fn subscribe(&self, prefix: &str) -> Result<broadcast::Receiver<ChangeEvent>, StoreError> {
        let filter = format!("{}.>", Self::key_of(prefix.trim_end_matches('/')));
        let mut watch = self.kv.watch(&filter).await.map_err(backend)?;
        let (tx, rx) = broadcast::channel(64);
        tokio::spawn(async move {
            loop {
                match watch.try_next().await {
                    Ok(Some(entry)) => {
                        let path = Self::path_of(&entry.key);
                        let value = match entry.operation {
                            async_nats::jetstream::kv::Operation::Put => {
                                match serde_json::from_slice(&entry.value) {
                                    Ok(value) => Some(value),
                                    Err(err) => {
                                        warn!("Ignoring malformed KV entry at {}: {}", path, err);
                                        continue;
                                    }
                                }
                            }
                            _ => None,
                        };
                        if tx.send(ChangeEvent { path, value }).is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        warn!("KV watch error: {}", err);
                        break;
                    }
                }
            }
        });
        Ok(rx)
    }
}
