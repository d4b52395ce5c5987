//! Durable state: the versioned persisted document plus payload bytes
//! stored separately by item id.

use crate::account::CachedAccount;
use crate::models::{Fingerprint, HistoryEntry, HistoryOutcome, ItemState, PersistedItem, Settings};
use crate::queue::DedupRecord;
use async_trait::async_trait;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

pub const SCHEMA_VERSION: u64 = 2;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct PersistedQueue {
    #[serde(default)]
    pub items: Vec<PersistedItem>,
    #[serde(default)]
    pub dedup_index: HashMap<Fingerprint, DedupRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct PersistedAccounts {
    #[serde(default)]
    pub by_tab: HashMap<String, CachedAccount>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PersistedState {
    pub version: u64,
    #[serde(default)]
    pub queue: PersistedQueue,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
    #[serde(default)]
    pub account: PersistedAccounts,
    #[serde(default)]
    pub settings: Settings,
}

impl Default for PersistedState {
    fn default() -> Self {
        Self {
            version: SCHEMA_VERSION,
            queue: PersistedQueue::default(),
            history: Vec::new(),
            account: PersistedAccounts::default(),
            settings: Settings::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("invalid persisted state: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("unsupported persisted schema version {0:?}")]
    UnsupportedVersion(Option<u64>),
}

#[async_trait]
pub trait StateStore: Send + Sync {
    async fn read_state(&self) -> Result<Option<Value>, StoreError>;
    async fn write_state(&self, state: &Value) -> Result<(), StoreError>;
    async fn read_payload(&self, item_id: Uuid) -> Result<Option<Vec<u8>>, StoreError>;
    async fn write_payload(&self, item_id: Uuid, payload: &[u8]) -> Result<(), StoreError>;
    async fn remove_payload(&self, item_id: Uuid) -> Result<(), StoreError>;
    fn describe(&self) -> String;
}

/// Reads and upgrades the persisted document. `Ok(None)` means nothing has
/// been stored yet.
pub async fn load_state(store: &dyn StateStore) -> Result<Option<PersistedState>, StoreError> {
    match store.read_state().await? {
        Some(raw) => upgrade(raw).map(Some),
        None => Ok(None),
    }
}

pub async fn save_state(store: &dyn StateStore, state: &PersistedState) -> Result<(), StoreError> {
    let value = serde_json::to_value(state)?;
    store.write_state(&value).await
}

/// Explicit upgrade step. Unknown or missing versions are refused rather
/// than coerced.
pub fn upgrade(raw: Value) -> Result<PersistedState, StoreError> {
    let version = raw.get("version").and_then(Value::as_u64);
    match version {
        Some(SCHEMA_VERSION) => Ok(serde_json::from_value(raw)?),
        Some(1) => {
            let upgraded = upgrade_v1(raw)?;
            info!(
                target = "ingest.store",
                from = 1,
                to = SCHEMA_VERSION,
                items = upgraded.queue.items.len(),
                "persisted_state_upgraded"
            );
            Ok(upgraded)
        }
        other => Err(StoreError::UnsupportedVersion(other)),
    }
}

/// Version 1 kept settings as a free-form map and had no dedup index or
/// account cache.
fn upgrade_v1(raw: Value) -> Result<PersistedState, StoreError> {
    let items: Vec<PersistedItem> = raw
        .pointer("/queue/items")
        .cloned()
        .map(serde_json::from_value)
        .transpose()?
        .unwrap_or_default();

    let history: Vec<HistoryEntry> = raw
        .get("history")
        .and_then(Value::as_array)
        .map(|entries| {
            entries
                .iter()
                .filter_map(|entry| match serde_json::from_value(entry.clone()) {
                    Ok(parsed) => Some(parsed),
                    Err(err) => {
                        warn!(target = "ingest.store", error = %err, "legacy_history_entry_dropped");
                        None
                    }
                })
                .collect()
        })
        .unwrap_or_default();

    let mut dedup_index = HashMap::new();
    for entry in history
        .iter()
        .filter(|entry| entry.outcome == HistoryOutcome::Succeeded)
    {
        dedup_index.insert(
            entry.fingerprint.clone(),
            DedupRecord {
                item_id: entry.item_id,
                state: ItemState::Succeeded,
                last_terminal_at: entry.recorded_at,
            },
        );
    }

    let legacy = raw.get("settings").cloned().unwrap_or(Value::Null);
    let defaults = Settings::default();
    let settings = Settings {
        debug_mode: legacy_flag(&legacy, &["debug_mode", "debugMode"]).unwrap_or(defaults.debug_mode),
        auto_process: legacy_flag(&legacy, &["auto_process", "autoProcess"])
            .unwrap_or(defaults.auto_process),
        notifications: legacy_flag(&legacy, &["notifications", "showNotifications"])
            .unwrap_or(defaults.notifications),
    };

    Ok(PersistedState {
        version: SCHEMA_VERSION,
        queue: PersistedQueue { items, dedup_index },
        history,
        account: PersistedAccounts::default(),
        settings,
    })
}

fn legacy_flag(settings: &Value, keys: &[&str]) -> Option<bool> {
    keys.iter()
        .filter_map(|key| settings.get(*key))
        .find_map(|value| match value {
            Value::Bool(flag) => Some(*flag),
            Value::String(text) => match text.trim().to_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Some(true),
                "0" | "false" | "no" | "off" => Some(false),
                _ => None,
            },
            Value::Number(number) => number.as_i64().map(|n| n != 0),
            _ => None,
        })
}

/// `state.json` plus `payloads/<item_id>.csv` under one directory.
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub async fn open(root: impl AsRef<Path>) -> Result<Self, StoreError> {
        let root = root.as_ref().to_path_buf();
        tokio::fs::create_dir_all(root.join("payloads")).await?;
        Ok(Self { root })
    }

    fn state_path(&self) -> PathBuf {
        self.root.join("state.json")
    }

    fn payload_path(&self, item_id: Uuid) -> PathBuf {
        self.root.join("payloads").join(format!("{item_id}.csv"))
    }
}

#[async_trait]
impl StateStore for FileStore {
    async fn read_state(&self) -> Result<Option<Value>, StoreError> {
        match tokio::fs::read(self.state_path()).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn write_state(&self, state: &Value) -> Result<(), StoreError> {
        let body = serde_json::to_vec_pretty(state)?;
        let tmp = self.root.join("state.json.tmp");
        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, self.state_path()).await?;
        Ok(())
    }

    async fn read_payload(&self, item_id: Uuid) -> Result<Option<Vec<u8>>, StoreError> {
        match tokio::fs::read(self.payload_path(item_id)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn write_payload(&self, item_id: Uuid, payload: &[u8]) -> Result<(), StoreError> {
        tokio::fs::write(self.payload_path(item_id), payload).await?;
        Ok(())
    }

    async fn remove_payload(&self, item_id: Uuid) -> Result<(), StoreError> {
        match tokio::fs::remove_file(self.payload_path(item_id)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn describe(&self) -> String {
        format!("file:{}", self.root.display())
    }
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<Option<Value>>,
    payloads: Mutex<HashMap<Uuid, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn payload_count(&self) -> usize {
        self.payloads.lock().await.len()
    }

    pub async fn drop_payload(&self, item_id: Uuid) {
        self.payloads.lock().await.remove(&item_id);
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn read_state(&self) -> Result<Option<Value>, StoreError> {
        Ok(self.state.lock().await.clone())
    }

    async fn write_state(&self, state: &Value) -> Result<(), StoreError> {
        *self.state.lock().await = Some(state.clone());
        Ok(())
    }

    async fn read_payload(&self, item_id: Uuid) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.payloads.lock().await.get(&item_id).cloned())
    }

    async fn write_payload(&self, item_id: Uuid, payload: &[u8]) -> Result<(), StoreError> {
        self.payloads.lock().await.insert(item_id, payload.to_vec());
        Ok(())
    }

    async fn remove_payload(&self, item_id: Uuid) -> Result<(), StoreError> {
        self.payloads.lock().await.remove(&item_id);
        Ok(())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

pub struct RedisStore {
    client: redis::Client,
    prefix: String,
}

impl RedisStore {
    pub fn open(url: &str) -> Result<Self, StoreError> {
        Ok(Self {
            client: redis::Client::open(url)?,
            prefix: "ebay-ingest".to_string(),
        })
    }

    fn state_key(&self) -> String {
        format!("{}:state", self.prefix)
    }

    fn payload_key(&self, item_id: Uuid) -> String {
        format!("{}:payload:{item_id}", self.prefix)
    }
}

#[async_trait]
impl StateStore for RedisStore {
    async fn read_state(&self) -> Result<Option<Value>, StoreError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let raw: Option<String> = conn.get(self.state_key()).await?;
        raw.map(|body| serde_json::from_str(&body))
            .transpose()
            .map_err(StoreError::from)
    }

    async fn write_state(&self, state: &Value) -> Result<(), StoreError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let body = serde_json::to_string(state)?;
        let _: () = conn.set(self.state_key(), body).await?;
        Ok(())
    }

    async fn read_payload(&self, item_id: Uuid) -> Result<Option<Vec<u8>>, StoreError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        Ok(conn.get(self.payload_key(item_id)).await?)
    }

    async fn write_payload(&self, item_id: Uuid, payload: &[u8]) -> Result<(), StoreError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let _: () = conn.set(self.payload_key(item_id), payload).await?;
        Ok(())
    }

    async fn remove_payload(&self, item_id: Uuid) -> Result<(), StoreError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let _: () = conn.del(self.payload_key(item_id)).await?;
        Ok(())
    }

    fn describe(&self) -> String {
        format!("redis:{}", self.prefix)
    }
}
