//! Passphrase-sealed configuration files.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use zeroize::Zeroizing;

use crate::crypto::{CryptoError, CryptoPrimitives, EncryptedPackage};

pub const ENVELOPE_VERSION: u8 = 1;
pub const MIN_PASSPHRASE_LEN: usize = 12;

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("passphrase must be at least 12 characters")]
    WeakPassphrase,
    #[error("unsupported envelope version {0}")]
    UnsupportedVersion(u8),
    #[error("envelope hex field `{field}` is invalid")]
    Encoding { field: &'static str },
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error("envelope json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("envelope io error: {0}")]
    Io(#[from] std::io::Error),
}

/// key: config-envelope
/// Self-describing on-disk format. Binary fields are hex.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConfigEnvelope {
    pub version: u8,
    pub algorithm: String,
    pub salt: String,
    pub nonce: String,
    pub auth_tag: String,
    pub ciphertext: String,
    pub timestamp: DateTime<Utc>,
}

/// Where `write` put the sealed copies.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SealedPaths {
    pub primary: PathBuf,
    pub backup: PathBuf,
}

impl ConfigEnvelope {
    pub fn seal(
        crypto: &CryptoPrimitives,
        plaintext: &[u8],
        passphrase: &str,
        now: DateTime<Utc>,
    ) -> Result<Self, EnvelopeError> {
        check_passphrase(passphrase)?;
        let sealed = crypto.encrypt_with_passphrase(plaintext, passphrase)?;
        Ok(Self {
            version: ENVELOPE_VERSION,
            algorithm: sealed.package.algorithm,
            salt: hex::encode(sealed.salt),
            nonce: hex::encode(sealed.package.nonce),
            auth_tag: hex::encode(sealed.package.auth_tag),
            ciphertext: hex::encode(sealed.package.ciphertext),
            timestamp: now,
        })
    }

    /// A wrong passphrase surfaces as `CryptoError::AuthenticationFailure`.
    pub fn open(
        &self,
        crypto: &CryptoPrimitives,
        passphrase: &str,
    ) -> Result<Zeroizing<Vec<u8>>, EnvelopeError> {
        if self.version != ENVELOPE_VERSION {
            return Err(EnvelopeError::UnsupportedVersion(self.version));
        }
        let salt = decode_field("salt", &self.salt)?;
        let package = EncryptedPackage {
            nonce: decode_field("nonce", &self.nonce)?,
            auth_tag: decode_field("auth_tag", &self.auth_tag)?,
            ciphertext: decode_field("ciphertext", &self.ciphertext)?,
            algorithm: self.algorithm.clone(),
        };
        let derived = crypto.derive_key(passphrase.as_bytes(), Some(&salt));
        Ok(crypto.decrypt(&package, &derived.key[..])?)
    }

    pub fn read(path: &Path) -> Result<Self, EnvelopeError> {
        let raw = std::fs::read(path)?;
        Ok(serde_json::from_slice(&raw)?)
    }

    /// Writes `<input>.encrypted` (pretty JSON) and a compact
    /// `<input>.backup.<millis>.enc` next to `input`.
    pub fn write(&self, input: &Path) -> Result<SealedPaths, EnvelopeError> {
        self.write_as(input, suffixed(input, "encrypted"))
    }

    /// Like `write`, with the pretty copy placed at `primary`.
    pub fn write_as(&self, input: &Path, primary: PathBuf) -> Result<SealedPaths, EnvelopeError> {
        let backup = suffixed(
            input,
            &format!("backup.{}.enc", self.timestamp.timestamp_millis()),
        );
        write_private(&primary, &serde_json::to_vec_pretty(self)?)?;
        write_private(&backup, &serde_json::to_vec(self)?)?;
        Ok(SealedPaths { primary, backup })
    }
}

pub fn check_passphrase(passphrase: &str) -> Result<(), EnvelopeError> {
    if passphrase.chars().count() < MIN_PASSPHRASE_LEN {
        return Err(EnvelopeError::WeakPassphrase);
    }
    Ok(())
}

fn decode_field(field: &'static str, value: &str) -> Result<Vec<u8>, EnvelopeError> {
    hex::decode(value).map_err(|_| EnvelopeError::Encoding { field })
}

fn suffixed(input: &Path, suffix: &str) -> PathBuf {
    let mut name = input.as_os_str().to_owned();
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}

/// Creates or truncates `path` with owner-only permissions.
pub fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    use std::io::Write;

    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(contents)?;
    file.sync_all()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::ALGORITHM;
    use tempfile::tempdir;

    const PASSPHRASE: &str = "correct horse battery";

    #[test]
    fn sealed_configs_open_with_the_passphrase() {
        let crypto = CryptoPrimitives::new();
        let envelope =
            ConfigEnvelope::seal(&crypto, b"API_KEY=abc\n", PASSPHRASE, Utc::now()).unwrap();
        assert_eq!(envelope.version, 1);
        assert_eq!(envelope.algorithm, ALGORITHM);
        assert_eq!(envelope.salt.len(), 64);
        assert!(!envelope.ciphertext.contains("API_KEY"));

        let opened = envelope.open(&crypto, PASSPHRASE).unwrap();
        assert_eq!(opened.as_slice(), b"API_KEY=abc\n");
    }

    #[test]
    fn wrong_passphrase_fails_authentication() {
        let crypto = CryptoPrimitives::new();
        let envelope = ConfigEnvelope::seal(&crypto, b"X=1", PASSPHRASE, Utc::now()).unwrap();
        assert!(matches!(
            envelope.open(&crypto, "incorrect horse battery"),
            Err(EnvelopeError::Crypto(CryptoError::AuthenticationFailure))
        ));
    }

    #[test]
    fn short_passphrases_are_refused() {
        let crypto = CryptoPrimitives::new();
        assert!(matches!(
            ConfigEnvelope::seal(&crypto, b"X=1", "short", Utc::now()),
            Err(EnvelopeError::WeakPassphrase)
        ));
    }

    #[test]
    fn write_produces_primary_and_backup() {
        let dir = tempdir().unwrap();
        let input = dir.path().join(".env");
        std::fs::write(&input, "DB_PASSWORD=hunter2\n").unwrap();

        let crypto = CryptoPrimitives::new();
        let envelope = ConfigEnvelope::seal(
            &crypto,
            &std::fs::read(&input).unwrap(),
            PASSPHRASE,
            Utc::now(),
        )
        .unwrap();
        let paths = envelope.write(&input).unwrap();

        assert_eq!(paths.primary, dir.path().join(".env.encrypted"));
        let backup_name = paths.backup.file_name().unwrap().to_string_lossy().to_string();
        assert!(backup_name.starts_with(".env.backup."));
        assert!(backup_name.ends_with(".enc"));

        let primary = ConfigEnvelope::read(&paths.primary).unwrap();
        let backup = ConfigEnvelope::read(&paths.backup).unwrap();
        assert_eq!(primary, envelope);
        assert_eq!(backup, envelope);
        assert_eq!(
            primary.open(&crypto, PASSPHRASE).unwrap().as_slice(),
            b"DB_PASSWORD=hunter2\n"
        );
    }

    #[test]
    fn unknown_versions_are_rejected() {
        let crypto = CryptoPrimitives::new();
        let mut envelope = ConfigEnvelope::seal(&crypto, b"X=1", PASSPHRASE, Utc::now()).unwrap();
        envelope.version = 2;
        assert!(matches!(
            envelope.open(&crypto, PASSPHRASE),
            Err(EnvelopeError::UnsupportedVersion(2))
        ));
    }
}
