//! Host-facing composition of the protection components.

use std::path::Path;
use std::sync::Arc;

use chrono::Duration;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::info;

use crate::audit::{AlertSink, AuditEventType, AuditLog, AuditSink, TracingAlertSink};
use crate::config::HostConfig;
use crate::crypto::CryptoPrimitives;
use crate::error::AppResult;
use crate::keys::{KeyManager, KeyMetadata, StoredKey};
use crate::rate_limit::{Admission, RateLimitOptions, RateLimiter};
use crate::store::MemoryStore;
use crate::tasks::BackgroundTasks;
use crate::tokenization::{TokenVault, TokenVaultEntry};
use crate::validator::{RequestValidator, ValidationReport};

/// key: protection-layer
/// Owns one instance of every component plus their maintenance tasks.
/// Built once by the host; `shutdown` stops the tasks and drains the audit log.
pub struct ProtectionLayer {
    crypto: Arc<CryptoPrimitives>,
    audit: Arc<AuditLog>,
    keys: Arc<KeyManager>,
    vault: Arc<TokenVault>,
    limiter: Arc<RateLimiter>,
    validator: RequestValidator,
    tasks: BackgroundTasks,
}

impl ProtectionLayer {
    pub async fn init(config: HostConfig) -> AppResult<Self> {
        Self::init_with_alerts(config, Arc::new(TracingAlertSink)).await
    }

    pub async fn init_with_alerts(
        config: HostConfig,
        alerts: Arc<dyn AlertSink>,
    ) -> AppResult<Self> {
        let crypto = Arc::new(CryptoPrimitives::new());
        let audit = Arc::new(AuditLog::open(config.audit.clone(), crypto.clone(), alerts).await?);
        let sink: Arc<dyn AuditSink> = audit.clone();

        let keys = Arc::new(
            KeyManager::new(
                crypto.clone(),
                &config.secrets.master_key,
                Arc::new(MemoryStore::<StoredKey>::new()),
                config.keys.clone(),
            )?
            .with_audit(sink.clone()),
        );
        keys.init().await?;

        let vault = Arc::new(
            TokenVault::new(
                keys.clone(),
                crypto.clone(),
                Arc::new(MemoryStore::<TokenVaultEntry>::new()),
                config.vault.clone(),
            )
            .with_audit(sink.clone()),
        );
        let limiter =
            Arc::new(RateLimiter::new(config.rate_limit.clone()).with_audit(sink.clone()));
        let validator = RequestValidator::new(config.validator.clone());

        let mut tasks = BackgroundTasks::new();
        spawn_maintenance(&mut tasks, &config, &keys, &vault, &limiter);
        info!(tasks = tasks.len(), "protection layer initialised");

        Ok(Self {
            crypto,
            audit,
            keys,
            vault,
            limiter,
            validator,
            tasks,
        })
    }

    pub async fn check_limit(
        &self,
        subject: &str,
        endpoint: &str,
        options: &RateLimitOptions,
    ) -> Admission {
        self.limiter.check_limit(subject, endpoint, options).await
    }

    pub fn validate(&self, input: &str) -> ValidationReport {
        self.validator.validate(input)
    }

    pub async fn tokenize<T>(&self, value: &T, ttl: Option<Duration>) -> AppResult<String>
    where
        T: Serialize + ?Sized,
    {
        Ok(self.vault.tokenize(value, ttl).await?)
    }

    pub async fn detokenize<T: DeserializeOwned>(&self, token: &str) -> AppResult<T> {
        Ok(self.vault.detokenize(token).await?)
    }

    pub async fn record(
        &self,
        event_type: AuditEventType,
        metadata: Value,
        subject_id: Option<&str>,
    ) -> AppResult<String> {
        Ok(self.audit.record(event_type, metadata, subject_id).await?)
    }

    pub async fn verify_integrity(&self, path: impl AsRef<Path>) -> AppResult<bool> {
        Ok(self.audit.verify_integrity(path).await?)
    }

    /// Administrative rotation; returns the new key id.
    pub async fn rotate_keys(&self) -> AppResult<String> {
        Ok(self.keys.rotate().await?)
    }

    pub async fn key_metadata(&self) -> Vec<KeyMetadata> {
        self.keys.metadata().await
    }

    pub fn crypto(&self) -> &CryptoPrimitives {
        &self.crypto
    }

    pub fn audit_log(&self) -> &AuditLog {
        &self.audit
    }

    pub fn vault(&self) -> &TokenVault {
        &self.vault
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub async fn shutdown(self) {
        self.tasks.shutdown().await;
        self.audit.shutdown().await;
        info!("protection layer stopped");
    }
}

fn spawn_maintenance(
    tasks: &mut BackgroundTasks,
    config: &HostConfig,
    keys: &Arc<KeyManager>,
    vault: &Arc<TokenVault>,
    limiter: &Arc<RateLimiter>,
) {
    let rotation_keys = keys.clone();
    tasks.spawn_periodic("key-rotation", config.keys.rotation_interval, move || {
        let keys = rotation_keys.clone();
        async move {
            keys.rotate().await?;
            Ok(())
        }
    });

    let purge_keys = keys.clone();
    tasks.spawn_periodic("key-purge", config.keys.purge_interval, move || {
        let keys = purge_keys.clone();
        async move {
            keys.purge_expired().await;
            Ok(())
        }
    });

    let sweep_vault = vault.clone();
    tasks.spawn_periodic("token-sweep", config.vault.sweep_interval, move || {
        let vault = sweep_vault.clone();
        async move {
            vault.sweep_expired().await;
            Ok(())
        }
    });

    let idle_limiter = limiter.clone();
    tasks.spawn_periodic("rate-limit-sweep", config.idle_sweep_interval, move || {
        let limiter = idle_limiter.clone();
        async move {
            limiter.sweep_idle();
            Ok(())
        }
    });

    let pattern_limiter = limiter.clone();
    tasks.spawn_periodic(
        "pattern-reset",
        config.rate_limit.pattern_reset_interval,
        move || {
            let limiter = pattern_limiter.clone();
            async move {
                limiter.reset_patterns();
                Ok(())
            }
        },
    );
}
