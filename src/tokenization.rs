//! Reversible tokenization of sensitive values.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::audit::{self, AuditEventType, AuditSink};
use crate::crypto::{self, CryptoError, CryptoPrimitives, EncryptedPackage};
use crate::keys::{KeyError, KeyManager};
use crate::store::{Expiring, SecretStore};

pub const TOKEN_PREFIX: &str = "tok_";
const TOKEN_BYTES: usize = 32;
const INDEX_SALT_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("token not found")]
    TokenNotFound,
    #[error("token expired")]
    TokenExpired,
    #[error("token integrity check failed")]
    AuthenticationFailure,
    #[error("key `{key_id}` for this token is no longer available")]
    KeyUnavailable { key_id: String },
    #[error("token ttl must be positive")]
    InvalidTtl,
    #[error(transparent)]
    Key(#[from] KeyError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error("token value serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// key: token-vault-entry
/// `key_id` pins the entry to the key that encrypted it, so the entry keeps
/// decrypting after rotation until that key is purged.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TokenVaultEntry {
    pub token: String,
    pub key_id: String,
    pub package: EncryptedPackage,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Expiring for TokenVaultEntry {
    fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }
}

#[derive(Clone, Debug)]
pub struct TokenVaultConfig {
    pub default_ttl: Duration,
    pub sweep_interval: StdDuration,
    /// How long past its expiry a token stays correlatable through `tokens_for`.
    pub index_retention: Duration,
}

impl Default for TokenVaultConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::days(30),
            sweep_interval: StdDuration::from_secs(60 * 60),
            index_retention: Duration::days(90),
        }
    }
}

#[derive(Clone, Debug)]
struct IndexedToken {
    token: String,
    expires_at: DateTime<Utc>,
}

/// key: token-vault
pub struct TokenVault {
    keys: Arc<KeyManager>,
    crypto: Arc<CryptoPrimitives>,
    store: Arc<dyn SecretStore<TokenVaultEntry>>,
    /// value fingerprint -> tokens issued for it, kept until `index_retention`
    /// past their expiry
    reverse_index: DashMap<String, Vec<IndexedToken>>,
    index_salt: Zeroizing<Vec<u8>>,
    config: TokenVaultConfig,
    audit: Option<Arc<dyn AuditSink>>,
}

impl TokenVault {
    pub fn new(
        keys: Arc<KeyManager>,
        crypto: Arc<CryptoPrimitives>,
        store: Arc<dyn SecretStore<TokenVaultEntry>>,
        config: TokenVaultConfig,
    ) -> Self {
        Self {
            keys,
            crypto,
            store,
            reverse_index: DashMap::new(),
            index_salt: Zeroizing::new(crypto::random_bytes(INDEX_SALT_LEN)),
            config,
            audit: None,
        }
    }

    pub fn with_audit(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(sink);
        self
    }

    pub fn config(&self) -> &TokenVaultConfig {
        &self.config
    }

    pub async fn tokenize<T>(&self, value: &T, ttl: Option<Duration>) -> Result<String, TokenError>
    where
        T: Serialize + ?Sized,
    {
        self.tokenize_at(value, ttl, Utc::now()).await
    }

    pub async fn tokenize_at<T>(
        &self,
        value: &T,
        ttl: Option<Duration>,
        now: DateTime<Utc>,
    ) -> Result<String, TokenError>
    where
        T: Serialize + ?Sized,
    {
        let ttl = ttl.unwrap_or(self.config.default_ttl);
        if ttl <= Duration::zero() {
            return Err(TokenError::InvalidTtl);
        }
        let plaintext = Zeroizing::new(serde_json::to_vec(value)?);
        let key = self.keys.get_current_at(now).await?;
        let package = self.crypto.encrypt(&plaintext, key.material())?;
        let fingerprint = self.fingerprint(&plaintext);
        let expires_at = now + ttl;

        let token = loop {
            let token = crypto::random_token(TOKEN_PREFIX, TOKEN_BYTES);
            let entry = TokenVaultEntry {
                token: token.clone(),
                key_id: key.id.clone(),
                package: package.clone(),
                created_at: now,
                expires_at,
            };
            if self.store.put_new(token.clone(), entry).await {
                break token;
            }
            warn!("token collision; regenerating");
        };

        self.reverse_index
            .entry(fingerprint.clone())
            .or_default()
            .push(IndexedToken {
                token: token.clone(),
                expires_at,
            });

        debug!(key_id = %key.id, %expires_at, "value tokenized");
        audit::report(
            self.audit.as_ref(),
            AuditEventType::TokenIssued,
            json!({
                "key_id": key.id,
                "fingerprint": fingerprint,
                "expires_at": expires_at,
            }),
            None,
        )
        .await;
        Ok(token)
    }

    pub async fn detokenize<T: DeserializeOwned>(&self, token: &str) -> Result<T, TokenError> {
        self.detokenize_at(token, Utc::now()).await
    }

    /// Expired entries are evicted on access, so a later lookup reports
    /// `TokenNotFound` rather than `TokenExpired`.
    pub async fn detokenize_at<T: DeserializeOwned>(
        &self,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<T, TokenError> {
        let entry = self
            .store
            .get(token)
            .await
            .ok_or(TokenError::TokenNotFound)?;
        if entry.is_expired_at(now) {
            self.store.delete(token).await;
            debug!(key_id = %entry.key_id, "expired token evicted on access");
            return Err(TokenError::TokenExpired);
        }

        let key = match self.keys.get_by_id_at(&entry.key_id, now).await {
            Ok(key) => key,
            Err(KeyError::KeyNotFound(key_id)) => {
                warn!(%key_id, "token key purged; entry unrecoverable");
                return Err(TokenError::KeyUnavailable { key_id });
            }
            Err(err) => return Err(err.into()),
        };

        let plaintext = match self.crypto.decrypt(&entry.package, key.material()) {
            Ok(plaintext) => plaintext,
            Err(CryptoError::AuthenticationFailure) => {
                warn!(key_id = %entry.key_id, "vault entry failed authentication");
                audit::report(
                    self.audit.as_ref(),
                    AuditEventType::DataBreachAttempt,
                    json!({
                        "reason": "vault entry failed authentication",
                        "key_id": entry.key_id,
                        "created_at": entry.created_at,
                    }),
                    None,
                )
                .await;
                return Err(TokenError::AuthenticationFailure);
            }
            Err(err) => return Err(err.into()),
        };

        let value = serde_json::from_slice(&plaintext)?;
        audit::report(
            self.audit.as_ref(),
            AuditEventType::TokenRedeemed,
            json!({ "key_id": entry.key_id }),
            None,
        )
        .await;
        Ok(value)
    }

    /// Returns `true` if the token existed.
    pub async fn revoke(&self, token: &str) -> bool {
        let Some(entry) = self.store.delete(token).await else {
            return false;
        };
        info!(key_id = %entry.key_id, "token revoked");
        audit::report(
            self.audit.as_ref(),
            AuditEventType::TokenRevoked,
            json!({ "key_id": entry.key_id }),
            None,
        )
        .await;
        true
    }

    /// Tokens issued for `value`, live, expired or revoked, until they age out
    /// of the index. For audit correlation.
    pub fn tokens_for<T>(&self, value: &T) -> Result<Vec<String>, TokenError>
    where
        T: Serialize + ?Sized,
    {
        let plaintext = Zeroizing::new(serde_json::to_vec(value)?);
        let fingerprint = self.fingerprint(&plaintext);
        Ok(self
            .reverse_index
            .get(&fingerprint)
            .map(|tokens| tokens.iter().map(|indexed| indexed.token.clone()).collect())
            .unwrap_or_default())
    }

    pub async fn sweep_expired(&self) -> usize {
        self.sweep_expired_at(Utc::now()).await
    }

    pub async fn sweep_expired_at(&self, now: DateTime<Utc>) -> usize {
        let mut evicted = 0;
        for token in self.store.scan_expired(now).await {
            if self.store.delete(&token).await.is_some() {
                evicted += 1;
            }
        }
        let forgotten = self.prune_index(now);
        if evicted > 0 || forgotten > 0 {
            info!(evicted, forgotten, "expired tokens swept");
        }
        evicted
    }

    /// Drops index entries older than `index_retention` past expiry.
    fn prune_index(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now - self.config.index_retention;
        let mut forgotten = 0;
        self.reverse_index.retain(|_, tokens| {
            let before = tokens.len();
            tokens.retain(|indexed| indexed.expires_at > cutoff);
            forgotten += before - tokens.len();
            !tokens.is_empty()
        });
        forgotten
    }

    pub async fn len(&self) -> usize {
        self.store.len().await
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn fingerprint(&self, plaintext: &[u8]) -> String {
        self.crypto.hash(plaintext, Some(self.index_salt.as_slice())).digest
    }
}
