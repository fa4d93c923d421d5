use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use super::models::{CryptoKey, KeyMetadata, KeyState, StoredKey};
use crate::audit::{self, AuditEventType, AuditSink};
use crate::crypto::{self, CryptoError, CryptoPrimitives, KEY_LEN};
use crate::store::{Expiring, SecretStore};

const KEY_ID_BYTES: usize = 16;

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("key `{0}` not found")]
    KeyNotFound(String),
    #[error("master key must be {expected} bytes, got {actual}")]
    InvalidMasterKey { expected: usize, actual: usize },
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

#[derive(Clone, Debug)]
pub struct KeyManagerConfig {
    /// Period of the scheduled rotation task.
    pub rotation_interval: StdDuration,
    /// Lifetime of every key from creation; expired keys are purged.
    pub retention: Duration,
    /// Period of the purge sweep, independent of rotation.
    pub purge_interval: StdDuration,
}

impl Default for KeyManagerConfig {
    fn default() -> Self {
        Self {
            rotation_interval: StdDuration::from_secs(24 * 60 * 60),
            retention: Duration::days(7),
            purge_interval: StdDuration::from_secs(60 * 60),
        }
    }
}

/// key: key-manager
/// Owns the key table. Exactly one key id is current; rotation demotes the
/// previous key without deleting it so older tokens still decrypt until
/// the key's retention runs out.
pub struct KeyManager {
    crypto: Arc<CryptoPrimitives>,
    master_key: Zeroizing<Vec<u8>>,
    store: Arc<dyn SecretStore<StoredKey>>,
    current: RwLock<Option<String>>,
    rotation: Mutex<()>,
    config: KeyManagerConfig,
    audit: Option<Arc<dyn AuditSink>>,
}

impl KeyManager {
    pub fn new(
        crypto: Arc<CryptoPrimitives>,
        master_key: &[u8],
        store: Arc<dyn SecretStore<StoredKey>>,
        config: KeyManagerConfig,
    ) -> Result<Self, KeyError> {
        if master_key.len() != KEY_LEN {
            return Err(KeyError::InvalidMasterKey {
                expected: KEY_LEN,
                actual: master_key.len(),
            });
        }
        Ok(Self {
            crypto,
            master_key: Zeroizing::new(master_key.to_vec()),
            store,
            current: RwLock::new(None),
            rotation: Mutex::new(()),
            config,
            audit: None,
        })
    }

    pub fn with_audit(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(sink);
        self
    }

    pub fn config(&self) -> &KeyManagerConfig {
        &self.config
    }

    /// Makes sure a current key exists. Returns its id.
    pub async fn init(&self) -> Result<String, KeyError> {
        let key = self.get_current().await?;
        info!(key_id = %key.id, "key manager ready");
        Ok(key.id)
    }

    pub async fn current_key_id(&self) -> Option<String> {
        self.current.read().await.clone()
    }

    pub async fn rotate(&self) -> Result<String, KeyError> {
        self.rotate_at(Utc::now()).await
    }

    pub async fn rotate_at(&self, now: DateTime<Utc>) -> Result<String, KeyError> {
        let (key, previous) = {
            let _guard = self.rotation.lock().await;
            self.rotate_locked(now).await?
        };
        self.after_rotation(&key, previous, now).await;
        Ok(key.id)
    }

    pub async fn get_current(&self) -> Result<CryptoKey, KeyError> {
        self.get_current_at(Utc::now()).await
    }

    /// Never hands out an expired key: a missing or stale current key is
    /// replaced before returning.
    pub async fn get_current_at(&self, now: DateTime<Utc>) -> Result<CryptoKey, KeyError> {
        if let Some(key) = self.current_if_valid(now).await? {
            return Ok(key);
        }

        let (key, previous) = {
            let _guard = self.rotation.lock().await;
            // another caller may have rotated while we waited
            if let Some(key) = self.current_if_valid(now).await? {
                return Ok(key);
            }
            let stale = self.current_key_id().await;
            warn!(previous = ?stale, "current key missing or expired; rotating");
            self.rotate_locked(now).await?
        };
        self.after_rotation(&key, previous, now).await;
        Ok(key)
    }

    pub async fn get_by_id(&self, key_id: &str) -> Result<CryptoKey, KeyError> {
        self.get_by_id_at(key_id, Utc::now()).await
    }

    /// Keys past retention count as purged even before the sweep removes them.
    pub async fn get_by_id_at(
        &self,
        key_id: &str,
        now: DateTime<Utc>,
    ) -> Result<CryptoKey, KeyError> {
        let stored = self
            .store
            .get(key_id)
            .await
            .ok_or_else(|| KeyError::KeyNotFound(key_id.to_string()))?;
        if stored.is_expired_at(now) {
            return Err(KeyError::KeyNotFound(key_id.to_string()));
        }
        self.unwrap_key(&stored)
    }

    pub async fn purge_expired(&self) -> usize {
        self.purge_expired_at(Utc::now()).await
    }

    pub async fn purge_expired_at(&self, now: DateTime<Utc>) -> usize {
        let expired = self.store.scan_expired(now).await;
        let mut purged = 0;
        for key_id in expired {
            if self.store.delete(&key_id).await.is_none() {
                continue;
            }
            purged += 1;
            info!(%key_id, "expired key purged");
            audit::report(
                self.audit.as_ref(),
                AuditEventType::KeyPurged,
                json!({ "key_id": key_id }),
                None,
            )
            .await;
        }
        if purged > 0 {
            debug!(purged, "key purge sweep finished");
        }
        purged
    }

    /// Newest first.
    pub async fn metadata(&self) -> Vec<KeyMetadata> {
        self.metadata_at(Utc::now()).await
    }

    pub async fn metadata_at(&self, now: DateTime<Utc>) -> Vec<KeyMetadata> {
        let current = self.current_key_id().await;
        let mut entries = Vec::new();
        for key_id in self.store.keys().await {
            let Some(stored) = self.store.get(&key_id).await else {
                continue;
            };
            let is_current = current.as_deref() == Some(stored.id.as_str());
            let active = is_current && !stored.is_expired_at(now);
            entries.push(KeyMetadata {
                id: stored.id,
                state: if active {
                    KeyState::Active
                } else {
                    KeyState::Expired
                },
                is_current,
                created_at: stored.created_at,
                expires_at: stored.expires_at,
            });
        }
        entries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        entries
    }

    async fn current_if_valid(&self, now: DateTime<Utc>) -> Result<Option<CryptoKey>, KeyError> {
        let Some(key_id) = self.current_key_id().await else {
            return Ok(None);
        };
        match self.store.get(&key_id).await {
            Some(stored) if !stored.is_expired_at(now) => self.unwrap_key(&stored).map(Some),
            _ => Ok(None),
        }
    }

    /// Caller must hold the rotation guard. Only the final pointer swap takes
    /// the write lock.
    async fn rotate_locked(
        &self,
        now: DateTime<Utc>,
    ) -> Result<(CryptoKey, Option<String>), KeyError> {
        let material = Zeroizing::new(crypto::random_bytes(KEY_LEN));
        let wrapped = self.crypto.encrypt(&material, &self.master_key)?;
        let expires_at = now + self.config.retention;

        let mut key_id = crypto::random_token("", KEY_ID_BYTES);
        let stored = loop {
            let candidate = StoredKey {
                id: key_id.clone(),
                wrapped: wrapped.clone(),
                created_at: now,
                expires_at,
            };
            if self.store.put_new(key_id.clone(), candidate.clone()).await {
                break candidate;
            }
            warn!(%key_id, "key id collision; regenerating");
            key_id = crypto::random_token("", KEY_ID_BYTES);
        };

        let previous = self.current.write().await.replace(stored.id.clone());
        Ok((
            CryptoKey::new(stored.id, material, stored.created_at, stored.expires_at),
            previous,
        ))
    }

    async fn after_rotation(&self, key: &CryptoKey, previous: Option<String>, now: DateTime<Utc>) {
        info!(key_id = %key.id, previous_key_id = ?previous, expires_at = %key.expires_at, "key rotated");
        audit::report(
            self.audit.as_ref(),
            AuditEventType::KeyRotation,
            json!({
                "key_id": key.id,
                "previous_key_id": previous,
                "expires_at": key.expires_at,
            }),
            None,
        )
        .await;
        self.purge_expired_at(now).await;
    }

    fn unwrap_key(&self, stored: &StoredKey) -> Result<CryptoKey, KeyError> {
        let material = self.crypto.decrypt(&stored.wrapped, &self.master_key)?;
        Ok(CryptoKey::new(
            stored.id.clone(),
            material,
            stored.created_at,
            stored.expires_at,
        ))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::audit::AuditError;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use serde_json::Value;

    #[derive(Default)]
    pub(crate) struct RecordingSink {
        pub events: std::sync::Mutex<Vec<(String, Value)>>,
    }

    impl RecordingSink {
        pub fn event_types(&self) -> Vec<String> {
            self.events
                .lock()
                .unwrap()
                .iter()
                .map(|(event, _)| event.clone())
                .collect()
        }
    }

    #[async_trait]
    impl AuditSink for RecordingSink {
        async fn record(
            &self,
            event_type: AuditEventType,
            metadata: Value,
            _subject_id: Option<&str>,
        ) -> Result<String, AuditError> {
            let mut events = self.events.lock().unwrap();
            events.push((event_type.as_str().to_string(), metadata));
            Ok(format!("entry-{}", events.len()))
        }
    }

    pub(crate) fn manager() -> KeyManager {
        KeyManager::new(
            Arc::new(CryptoPrimitives::new()),
            &[7u8; KEY_LEN],
            Arc::new(MemoryStore::<StoredKey>::new()),
            KeyManagerConfig::default(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn rotation_keeps_previous_key_resolvable() {
        let keys = manager();
        let first = keys.rotate().await.unwrap();
        let first_key = keys.get_by_id(&first).await.unwrap();
        let second = keys.rotate().await.unwrap();

        assert_ne!(first, second);
        assert_eq!(keys.current_key_id().await.as_deref(), Some(second.as_str()));
        assert_eq!(
            keys.get_by_id(&first).await.unwrap().material(),
            first_key.material()
        );

        let metadata = keys.metadata().await;
        assert_eq!(metadata.len(), 2);
        let states: Vec<_> = metadata
            .iter()
            .map(|entry| (entry.id.clone(), entry.state))
            .collect();
        assert!(states.contains(&(second.clone(), KeyState::Active)));
        assert!(states.contains(&(first.clone(), KeyState::Expired)));
    }

    #[tokio::test]
    async fn stored_form_never_contains_raw_material() {
        let store = Arc::new(MemoryStore::<StoredKey>::new());
        let keys = KeyManager::new(
            Arc::new(CryptoPrimitives::new()),
            &[1u8; KEY_LEN],
            store.clone(),
            KeyManagerConfig::default(),
        )
        .unwrap();
        let key = keys.get_current().await.unwrap();
        let stored: StoredKey = store.get(&key.id).await.unwrap();

        assert_eq!(key.material().len(), KEY_LEN);
        assert_ne!(stored.wrapped.ciphertext, key.material());
        let as_json = serde_json::to_string(&stored).unwrap();
        assert!(!as_json.contains(&hex::encode(key.material())));
        assert!(format!("{key:?}").contains("<redacted>"));
    }

    #[tokio::test]
    async fn get_current_replaces_an_expired_key() {
        let keys = manager();
        let now = Utc::now();
        let first = keys.rotate_at(now).await.unwrap();

        let later = now + Duration::days(8);
        let current = keys.get_current_at(later).await.unwrap();
        assert_ne!(current.id, first);
        assert!(!current.is_expired_at(later));
        assert!(matches!(
            keys.get_by_id_at(&first, later).await,
            Err(KeyError::KeyNotFound(_))
        ));
    }

    #[tokio::test]
    async fn purge_removes_keys_past_retention_only() {
        let keys = manager();
        let now = Utc::now();
        let old = keys.rotate_at(now - Duration::days(8)).await.unwrap();
        let fresh = keys.rotate_at(now).await.unwrap();

        // rotation at `now` already swept the old key
        assert!(matches!(
            keys.get_by_id_at(&old, now).await,
            Err(KeyError::KeyNotFound(_))
        ));
        assert_eq!(keys.purge_expired_at(now).await, 0);
        assert!(keys.get_by_id_at(&fresh, now).await.is_ok());
        assert_eq!(keys.metadata_at(now).await.len(), 1);
    }

    #[tokio::test]
    async fn periodic_purge_runs_without_rotation() {
        let keys = manager();
        let now = Utc::now();
        let first = keys.rotate_at(now).await.unwrap();
        keys.rotate_at(now + Duration::days(1)).await.unwrap();

        assert_eq!(keys.purge_expired_at(now + Duration::days(7)).await, 1);
        assert!(matches!(
            keys.get_by_id(&first).await,
            Err(KeyError::KeyNotFound(_))
        ));
    }

    #[tokio::test]
    async fn concurrent_callers_share_a_single_rotation() {
        let keys = Arc::new(manager());
        let mut handles = Vec::new();
        for _ in 0..16 {
            let keys = keys.clone();
            handles.push(tokio::spawn(async move { keys.get_current().await.unwrap().id }));
        }
        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap());
        }
        ids.dedup();
        assert_eq!(ids.len(), 1);
        assert_eq!(keys.metadata().await.len(), 1);
    }

    #[tokio::test]
    async fn unknown_ids_are_not_found() {
        let keys = manager();
        keys.init().await.unwrap();
        assert!(matches!(
            keys.get_by_id("deadbeef").await,
            Err(KeyError::KeyNotFound(id)) if id == "deadbeef"
        ));
    }

    #[test]
    fn master_key_length_is_enforced() {
        let result = KeyManager::new(
            Arc::new(CryptoPrimitives::new()),
            &[0u8; 16],
            Arc::new(MemoryStore::<StoredKey>::new()),
            KeyManagerConfig::default(),
        );
        assert!(matches!(
            result,
            Err(KeyError::InvalidMasterKey {
                expected: 32,
                actual: 16
            })
        ));
    }

    #[tokio::test]
    async fn rotations_and_purges_are_audited() {
        let sink = Arc::new(RecordingSink::default());
        let keys = manager().with_audit(sink.clone());
        let now = Utc::now();
        keys.rotate_at(now - Duration::days(8)).await.unwrap();
        keys.rotate_at(now).await.unwrap();

        assert_eq!(
            sink.event_types(),
            vec!["API_KEY_ROTATION", "API_KEY_ROTATION", "KEY_PURGED"]
        );
    }
}
