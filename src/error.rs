use thiserror::Error;

use crate::audit::AuditError;
use crate::config::ConfigError;
use crate::crypto::CryptoError;
use crate::envelope::EnvelopeError;
use crate::keys::KeyError;
use crate::tokenization::TokenError;

/// Umbrella error for host-facing operations. Validation and admission
/// outcomes are values and never appear here.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("key error: {0}")]
    Key(#[from] KeyError),
    #[error("token error: {0}")]
    Token(#[from] TokenError),
    #[error("audit error: {0}")]
    Audit(#[from] AuditError),
    #[error("envelope error: {0}")]
    Envelope(#[from] EnvelopeError),
}

impl AppError {
    /// Integrity failures are security events, distinct from lookups that
    /// simply found nothing.
    pub fn is_integrity_failure(&self) -> bool {
        matches!(
            self,
            AppError::Crypto(CryptoError::AuthenticationFailure)
                | AppError::Token(TokenError::AuthenticationFailure)
                | AppError::Token(TokenError::Crypto(CryptoError::AuthenticationFailure))
                | AppError::Audit(AuditError::TamperDetected { .. })
                | AppError::Envelope(EnvelopeError::Crypto(CryptoError::AuthenticationFailure))
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            AppError::Key(KeyError::KeyNotFound(_))
                | AppError::Token(TokenError::TokenNotFound)
                | AppError::Token(TokenError::KeyUnavailable { .. })
        )
    }
}

pub type AppResult<T> = Result<T, AppError>;
