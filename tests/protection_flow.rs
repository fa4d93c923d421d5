use std::sync::Arc;

use aegis::audit::{AuditConfig, AuditLog, AuditSink, TracingAlertSink};
use aegis::crypto::CryptoPrimitives;
use aegis::keys::{KeyManager, KeyManagerConfig, StoredKey};
use aegis::rate_limit::{DenyReason, RateLimitOptions, RateLimiter, RateLimiterConfig};
use aegis::store::MemoryStore;
use aegis::tokenization::{TokenError, TokenVault, TokenVaultConfig, TokenVaultEntry};
use aegis::validator::{RequestValidator, ValidatorConfig, Violation};
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use tempfile::tempdir;

#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct Card {
    holder: String,
    number: String,
}

struct Stack {
    audit: Arc<AuditLog>,
    keys: Arc<KeyManager>,
    vault: TokenVault,
    limiter: RateLimiter,
}

async fn stack(dir: &std::path::Path) -> Stack {
    let crypto = Arc::new(CryptoPrimitives::new());
    let audit = Arc::new(
        AuditLog::open(
            AuditConfig::new(dir, "audit-secret", "audit-salt"),
            crypto.clone(),
            Arc::new(TracingAlertSink),
        )
        .await
        .unwrap(),
    );
    let sink: Arc<dyn AuditSink> = audit.clone();
    let keys = Arc::new(
        KeyManager::new(
            crypto.clone(),
            &[7u8; 32],
            Arc::new(MemoryStore::<StoredKey>::new()),
            KeyManagerConfig::default(),
        )
        .unwrap()
        .with_audit(sink.clone()),
    );
    let vault = TokenVault::new(
        keys.clone(),
        crypto,
        Arc::new(MemoryStore::<TokenVaultEntry>::new()),
        TokenVaultConfig::default(),
    )
    .with_audit(sink.clone());
    let limiter = RateLimiter::new(RateLimiterConfig::new("rl-salt")).with_audit(sink);
    Stack {
        audit,
        keys,
        vault,
        limiter,
    }
}

#[tokio::test]
async fn tokens_survive_rotation_until_their_key_is_purged() {
    let dir = tempdir().unwrap();
    let stack = stack(dir.path()).await;
    let start = Utc::now();
    stack.keys.rotate_at(start).await.unwrap();

    let card = Card {
        holder: "Ada".into(),
        number: "4111111111111111".into(),
    };
    let token = stack
        .vault
        .tokenize_at(&card, Some(Duration::days(30)), start)
        .await
        .unwrap();
    assert!(token.starts_with("tok_"));

    let later = start + Duration::days(2);
    stack.keys.rotate_at(later).await.unwrap();
    let restored: Card = stack.vault.detokenize_at(&token, later).await.unwrap();
    assert_eq!(restored, card);

    let after_retention = start + Duration::days(8);
    stack.keys.rotate_at(after_retention).await.unwrap();
    let err = stack
        .vault
        .detokenize_at::<Card>(&token, after_retention)
        .await
        .unwrap_err();
    assert!(matches!(err, TokenError::KeyUnavailable { .. }));
}

#[tokio::test]
async fn security_events_land_in_a_verifiable_log() {
    let dir = tempdir().unwrap();
    let stack = stack(dir.path()).await;
    stack.keys.init().await.unwrap();

    let options = RateLimitOptions {
        limit: 100,
        window: Duration::seconds(60),
        burst_limit: 3,
        burst_window: Duration::seconds(10),
    };
    let now = Utc::now();
    for _ in 0..3 {
        assert!(
            stack
                .limiter
                .check_limit_at("10.0.0.1", "/v1/login", &options, now)
                .await
                .allowed
        );
    }
    let denied = stack
        .limiter
        .check_limit_at("10.0.0.1", "/v1/login", &options, now)
        .await;
    assert_eq!(denied.reason, Some(DenyReason::BurstLimitExceeded));

    let log_path = stack.audit.log_path_for(Utc::now().date_naive());
    let contents = std::fs::read_to_string(&log_path).unwrap();
    assert!(contents.contains("API_KEY_ROTATION"));
    assert!(contents.contains("RATE_LIMIT_BLOCK"));
    assert!(!contents.contains("10.0.0.1"));
    assert!(stack.audit.verify_integrity(&log_path).await.unwrap());

    stack.audit.shutdown().await;
}

#[test]
fn validator_reports_injection_and_sanitizes() {
    let validator = RequestValidator::new(ValidatorConfig::default());

    let clean = validator.validate("Order 42, please ship it today!");
    assert!(clean.is_valid);

    let report = validator.validate("<script>alert(1)</script>");
    assert!(!report.is_valid);
    assert!(report.has_injection());
    assert!(report.errors.contains(&Violation::DisallowedCharacters));
    assert!(!report.sanitized.contains('<'));
}
