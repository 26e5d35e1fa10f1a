//! Credential storage and caching
//!
//! The engine needs two persisted values to open a connection: the local
//! user id and an auth token. Reads go through a [`CredentialCache`] that
//! memoizes each value for a short TTL so that repeated connects and score
//! attribution do not hit storage every time.

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::DuelError;
use crate::net::UserId;

/// Storage key for the local user id
pub const USER_ID_KEY: &str = "userId";

/// Storage keys for the auth token, in lookup order
pub const TOKEN_KEYS: [&str; 2] = ["authToken", "token"];

/// How long a cached user id stays fresh
pub const USER_ID_TTL: Duration = Duration::from_secs(5 * 60);

/// How long a cached auth token stays fresh
pub const TOKEN_TTL: Duration = Duration::from_secs(10 * 60);

/// Persisted key-value storage for credentials
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Read the value stored under `key`
    async fn get(&self, key: &str) -> Result<Option<String>, DuelError>;
}

/// Credential store backed by a JSON file
///
/// The file holds a flat object of string keys to string values. A missing
/// file reads as empty.
#[derive(Debug, Clone)]
pub struct FileCredentialStore {
    path: PathBuf,
}

impl FileCredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Store `value` under `key`
    pub async fn set(&self, key: &str, value: &str) -> Result<(), DuelError> {
        let mut values = self.read_all().await?;
        values.insert(key.to_string(), value.to_string());
        self.write_all(&values).await
    }

    /// Remove `key`, returning whether it was present
    pub async fn remove(&self, key: &str) -> Result<bool, DuelError> {
        let mut values = self.read_all().await?;
        let existed = values.remove(key).is_some();
        if existed {
            self.write_all(&values).await?;
        }
        Ok(existed)
    }

    async fn read_all(&self) -> Result<BTreeMap<String, String>, DuelError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) if content.trim().is_empty() => Ok(BTreeMap::new()),
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(source) => Err(DuelError::Storage {
                path: self.path.clone(),
                source,
            }),
        }
    }

    async fn write_all(&self, values: &BTreeMap<String, String>) -> Result<(), DuelError> {
        let storage_err = |source| DuelError::Storage {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(storage_err)?;
        }
        let json = serde_json::to_string_pretty(values)?;
        tokio::fs::write(&self.path, json).await.map_err(storage_err)
    }
}

#[async_trait]
impl CredentialStore for FileCredentialStore {
    async fn get(&self, key: &str) -> Result<Option<String>, DuelError> {
        Ok(self.read_all().await?.remove(key))
    }
}

/// In-memory credential store
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert
    pub fn with(self, key: &str, value: &str) -> Self {
        self.set(key, value);
        self
    }

    pub fn set(&self, key: &str, value: &str) {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), value.to_string());
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn get(&self, key: &str) -> Result<Option<String>, DuelError> {
        Ok(self
            .values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned())
    }
}

/// A memoized value with its freshness window
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedValue<T> {
    pub value: T,
    pub timestamp: Instant,
    pub ttl: Duration,
}

impl<T> CachedValue<T> {
    pub fn new(value: T, ttl: Duration) -> Self {
        Self {
            value,
            timestamp: Instant::now(),
            ttl,
        }
    }

    /// Whether the value may still be served at `now`
    pub fn is_fresh(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.timestamp) < self.ttl
    }
}

/// Short-TTL cache in front of a [`CredentialStore`]
///
/// Owned by one engine and shared with its connect attempts. Each entry is
/// replaced as a whole, so concurrent readers never observe a torn value.
/// Absent values are not cached.
pub struct CredentialCache {
    store: Arc<dyn CredentialStore>,
    user_id: RwLock<Option<CachedValue<UserId>>>,
    auth_token: RwLock<Option<CachedValue<String>>>,
}

impl CredentialCache {
    pub fn new(store: Arc<dyn CredentialStore>) -> Self {
        Self {
            store,
            user_id: RwLock::new(None),
            auth_token: RwLock::new(None),
        }
    }

    /// The local user id, or `None` when storage has none or cannot be read
    pub async fn user_id(&self) -> Option<UserId> {
        if let Some(cached) = fresh(&self.user_id) {
            return Some(cached);
        }

        let raw = self.read(USER_ID_KEY).await?;
        let Ok(user_id) = raw.trim().parse::<UserId>() else {
            warn!("Stored user id {:?} is not numeric", raw);
            return None;
        };

        store(&self.user_id, CachedValue::new(user_id, USER_ID_TTL));
        Some(user_id)
    }

    /// The auth token, checking each legacy key in turn
    pub async fn auth_token(&self) -> Option<String> {
        if let Some(cached) = fresh(&self.auth_token) {
            return Some(cached);
        }

        for key in TOKEN_KEYS {
            if let Some(token) = self.read(key).await.filter(|t| !t.is_empty()) {
                store(&self.auth_token, CachedValue::new(token.clone(), TOKEN_TTL));
                return Some(token);
            }
        }
        None
    }

    /// Drop both cached entries so the next read goes to storage
    pub fn invalidate(&self) {
        *self.user_id.write().unwrap_or_else(PoisonError::into_inner) = None;
        *self.auth_token.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    async fn read(&self, key: &str) -> Option<String> {
        match self.store.get(key).await {
            Ok(value) => value,
            Err(e) => {
                warn!("Failed to read credential '{}': {}", key, e);
                None
            }
        }
    }
}

fn fresh<T: Clone>(slot: &RwLock<Option<CachedValue<T>>>) -> Option<T> {
    let guard = slot.read().unwrap_or_else(PoisonError::into_inner);
    guard
        .as_ref()
        .filter(|cached| cached.is_fresh(Instant::now()))
        .map(|cached| cached.value.clone())
}

fn store<T>(slot: &RwLock<Option<CachedValue<T>>>, value: CachedValue<T>) {
    debug!("Caching credential for {:?}", value.ttl);
    *slot.write().unwrap_or_else(PoisonError::into_inner) = Some(value);
}
