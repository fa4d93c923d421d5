use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

/// Records that carry their own expiry so stores can sweep them.
pub trait Expiring {
    fn expires_at(&self) -> DateTime<Utc>;

    fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at() <= now
    }
}

/// key: secret-store
/// Minimal storage seam for key and vault records. The in-memory store is the
/// default; a distributed cache or database can implement the same contract.
#[async_trait]
pub trait SecretStore<V>: Send + Sync
where
    V: Clone + Send + Sync + 'static,
{
    async fn get(&self, key: &str) -> Option<V>;

    /// Inserts `value` only if `key` is vacant. Returns `false` on collision.
    async fn put_new(&self, key: String, value: V) -> bool;

    async fn put(&self, key: String, value: V);

    async fn delete(&self, key: &str) -> Option<V>;

    /// Keys whose records are expired at `now`.
    async fn scan_expired(&self, now: DateTime<Utc>) -> Vec<String>;

    async fn keys(&self) -> Vec<String>;

    async fn len(&self) -> usize;
}

pub struct MemoryStore<V> {
    entries: DashMap<String, V>,
}

impl<V> Default for MemoryStore<V> {
    fn default() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }
}

impl<V> MemoryStore<V> {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl<V> SecretStore<V> for MemoryStore<V>
where
    V: Expiring + Clone + Send + Sync + 'static,
{
    async fn get(&self, key: &str) -> Option<V> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    async fn put_new(&self, key: String, value: V) -> bool {
        use dashmap::mapref::entry::Entry;
        match self.entries.entry(key) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(value);
                true
            }
        }
    }

    async fn put(&self, key: String, value: V) {
        self.entries.insert(key, value);
    }

    async fn delete(&self, key: &str) -> Option<V> {
        self.entries.remove(key).map(|(_, value)| value)
    }

    async fn scan_expired(&self, now: DateTime<Utc>) -> Vec<String> {
        self.entries
            .iter()
            .filter(|entry| entry.value().is_expired_at(now))
            .map(|entry| entry.key().clone())
            .collect()
    }

    async fn keys(&self) -> Vec<String> {
        self.entries.iter().map(|entry| entry.key().clone()).collect()
    }

    async fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[derive(Clone, Debug, PartialEq)]
    struct Lease {
        expires_at: DateTime<Utc>,
    }

    impl Expiring for Lease {
        fn expires_at(&self) -> DateTime<Utc> {
            self.expires_at
        }
    }

    #[tokio::test]
    async fn put_new_refuses_to_overwrite() {
        let store = MemoryStore::new();
        let lease = Lease {
            expires_at: Utc::now(),
        };
        assert!(store.put_new("a".into(), lease.clone()).await);
        assert!(!store.put_new("a".into(), lease).await);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn scan_expired_only_returns_stale_records() {
        let now = Utc::now();
        let store = MemoryStore::new();
        store
            .put(
                "stale".into(),
                Lease {
                    expires_at: now - Duration::seconds(1),
                },
            )
            .await;
        store
            .put(
                "fresh".into(),
                Lease {
                    expires_at: now + Duration::hours(1),
                },
            )
            .await;

        assert_eq!(store.scan_expired(now).await, vec!["stale".to_string()]);
        assert!(store.delete("stale").await.is_some());
        assert!(store.get("stale").await.is_none());
        assert!(store.get("fresh").await.is_some());
    }
}
