use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::crypto::EncryptedPackage;
use crate::store::Expiring;

/// key: crypto-key
/// Unwrapped key material. Lives only in memory for the duration of a call;
/// the store holds the wrapped form.
#[derive(Clone)]
pub struct CryptoKey {
    pub id: String,
    material: Zeroizing<Vec<u8>>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl CryptoKey {
    pub(crate) fn new(
        id: String,
        material: Zeroizing<Vec<u8>>,
        created_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            material,
            created_at,
            expires_at,
        }
    }

    pub fn material(&self) -> &[u8] {
        &self.material
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

impl std::fmt::Debug for CryptoKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoKey")
            .field("id", &self.id)
            .field("material", &"<redacted>")
            .field("created_at", &self.created_at)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// key: stored-key
/// At-rest record: material encrypted under the master key.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoredKey {
    pub id: String,
    pub wrapped: EncryptedPackage,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Expiring for StoredKey {
    fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }
}

/// Purged keys have no record, so they have no state either.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum KeyState {
    Active,
    Expired,
}

impl KeyState {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyState::Active => "active",
            KeyState::Expired => "expired",
        }
    }
}

/// key: key-metadata
/// Operator view of a key. Never carries material.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeyMetadata {
    pub id: String,
    pub state: KeyState,
    pub is_current: bool,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}
