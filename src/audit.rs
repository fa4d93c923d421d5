//! Append-only, tamper-evident audit log.
//!
//! Every entry is signed with HMAC-SHA512 over its own serialized content, so
//! editing any byte of a written line is detected by `verify_integrity`.
//! Subject ids are salted and hashed before they are stored, and a denylist
//! of sensitive metadata fields is redacted.

use std::future::Future;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::crypto::CryptoPrimitives;

pub const REDACTED: &str = "[REDACTED]";
pub const DEFAULT_SESSION: &str = "system";
pub const COMPRESSED_EXTENSION: &str = "lz4";

const SENSITIVE_FIELDS: &[&str] = &[
    "password",
    "token",
    "credit_card",
    "cpf",
    "email",
    "secret",
    "api_key",
];
const HASHED_SUBJECT_LEN: usize = 32;
const INTEGRITY_FIELD: &str = "integrity_hash";

tokio::task_local! {
    static SESSION_ID: String;
}

/// Runs `fut` with `session_id` attached to every audit entry it records.
pub async fn with_session<F: Future>(session_id: impl Into<String>, fut: F) -> F::Output {
    SESSION_ID.scope(session_id.into(), fut).await
}

fn current_session() -> String {
    SESSION_ID
        .try_with(|session| session.clone())
        .unwrap_or_else(|_| DEFAULT_SESSION.to_string())
}

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("audit io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("audit serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("log tampering detected at entry {position}")]
    TamperDetected { position: usize },
    #[error("audit task failed: {0}")]
    Task(String),
}

/// key: audit-event-type
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum AuditEventType {
    KeyRotation,
    KeyPurged,
    SecurityAlert,
    UnauthorizedAccess,
    DataBreachAttempt,
    AdminAction,
    TokenIssued,
    TokenRedeemed,
    TokenRevoked,
    RateLimitBlock,
    Custom(String),
}

impl AuditEventType {
    pub fn as_str(&self) -> &str {
        match self {
            AuditEventType::KeyRotation => "API_KEY_ROTATION",
            AuditEventType::KeyPurged => "KEY_PURGED",
            AuditEventType::SecurityAlert => "SECURITY_ALERT",
            AuditEventType::UnauthorizedAccess => "UNAUTHORIZED_ACCESS",
            AuditEventType::DataBreachAttempt => "DATA_BREACH_ATTEMPT",
            AuditEventType::AdminAction => "ADMIN_ACTION",
            AuditEventType::TokenIssued => "TOKEN_ISSUED",
            AuditEventType::TokenRedeemed => "TOKEN_REDEEMED",
            AuditEventType::TokenRevoked => "TOKEN_REVOKED",
            AuditEventType::RateLimitBlock => "RATE_LIMIT_BLOCK",
            AuditEventType::Custom(value) => value.as_str(),
        }
    }

    /// Critical events additionally fire the alert side-channel.
    pub fn is_critical(&self) -> bool {
        matches!(
            self,
            AuditEventType::KeyRotation
                | AuditEventType::SecurityAlert
                | AuditEventType::UnauthorizedAccess
                | AuditEventType::DataBreachAttempt
                | AuditEventType::AdminAction
        )
    }
}

impl From<&str> for AuditEventType {
    fn from(value: &str) -> Self {
        match value {
            "API_KEY_ROTATION" => Self::KeyRotation,
            "KEY_PURGED" => Self::KeyPurged,
            "SECURITY_ALERT" => Self::SecurityAlert,
            "UNAUTHORIZED_ACCESS" => Self::UnauthorizedAccess,
            "DATA_BREACH_ATTEMPT" => Self::DataBreachAttempt,
            "ADMIN_ACTION" => Self::AdminAction,
            "TOKEN_ISSUED" => Self::TokenIssued,
            "TOKEN_REDEEMED" => Self::TokenRedeemed,
            "TOKEN_REVOKED" => Self::TokenRevoked,
            "RATE_LIMIT_BLOCK" => Self::RateLimitBlock,
            other => Self::Custom(other.to_string()),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceInfo {
    pub hostname: String,
    pub pid: u32,
    pub environment: String,
}

/// key: audit-log-entry
/// One line of the log. `integrity_hash` signs every other field.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub hashed_subject_id: Option<String>,
    pub metadata: Value,
    pub source: SourceInfo,
    pub session_id: String,
    pub integrity_hash: String,
}

#[derive(Clone)]
pub struct AuditConfig {
    pub log_dir: PathBuf,
    pub signing_secret: Zeroizing<String>,
    pub subject_salt: String,
    /// Size at which the day's file is rotated before the next append.
    pub rotate_bytes: u64,
    /// Size at which the current file is rotated immediately after an append.
    pub max_bytes: u64,
    pub hostname: String,
    pub environment: String,
}

impl std::fmt::Debug for AuditConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditConfig")
            .field("log_dir", &self.log_dir)
            .field("rotate_bytes", &self.rotate_bytes)
            .field("max_bytes", &self.max_bytes)
            .field("hostname", &self.hostname)
            .field("environment", &self.environment)
            .finish_non_exhaustive()
    }
}

impl AuditConfig {
    pub fn new(
        log_dir: impl Into<PathBuf>,
        signing_secret: impl Into<String>,
        subject_salt: impl Into<String>,
    ) -> Self {
        Self {
            log_dir: log_dir.into(),
            signing_secret: Zeroizing::new(signing_secret.into()),
            subject_salt: subject_salt.into(),
            rotate_bytes: 100 * 1024 * 1024,
            max_bytes: 500 * 1024 * 1024,
            hostname: "unknown".to_string(),
            environment: "development".to_string(),
        }
    }
}

/// Cross-cutting sink used by the other components to report security events.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(
        &self,
        event_type: AuditEventType,
        metadata: Value,
        subject_id: Option<&str>,
    ) -> Result<String, AuditError>;
}

/// Out-of-band notification for critical events. Failures are logged, never
/// propagated to the recording caller.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn send(&self, entry: &AuditLogEntry) -> anyhow::Result<()>;
}

#[derive(Debug, Default)]
pub struct TracingAlertSink;

#[async_trait]
impl AlertSink for TracingAlertSink {
    async fn send(&self, entry: &AuditLogEntry) -> anyhow::Result<()> {
        error!(
            target: "audit_alert",
            entry_id = %entry.id,
            event = %entry.event_type,
            session_id = %entry.session_id,
            "critical security event"
        );
        Ok(())
    }
}

/// Best-effort reporting helper for components holding an optional sink.
pub(crate) async fn report(
    sink: Option<&Arc<dyn AuditSink>>,
    event_type: AuditEventType,
    metadata: Value,
    subject_id: Option<&str>,
) {
    let Some(sink) = sink else {
        return;
    };
    let event = event_type.as_str().to_string();
    if let Err(err) = sink.record(event_type, metadata, subject_id).await {
        warn!(?err, %event, "failed to record audit event");
    }
}

struct ActiveFile {
    date: NaiveDate,
    path: PathBuf,
    file: fs::File,
    size: u64,
}

struct Writer {
    active: Option<ActiveFile>,
    compress_tx: Option<mpsc::Sender<PathBuf>>,
}

/// key: audit-log
pub struct AuditLog {
    config: AuditConfig,
    crypto: Arc<CryptoPrimitives>,
    alerts: Arc<dyn AlertSink>,
    writer: Mutex<Writer>,
    compressor: Mutex<Option<JoinHandle<()>>>,
}

impl AuditLog {
    /// Creates the log directory (owner-only) and starts the compression worker.
    pub async fn open(
        config: AuditConfig,
        crypto: Arc<CryptoPrimitives>,
        alerts: Arc<dyn AlertSink>,
    ) -> Result<Self, AuditError> {
        create_private_dir(&config.log_dir).await?;
        let (compress_tx, compress_rx) = mpsc::channel(32);
        let compressor = tokio::spawn(run_compressor(compress_rx));
        info!(log_dir = %config.log_dir.display(), "audit log opened");
        Ok(Self {
            config,
            crypto,
            alerts,
            writer: Mutex::new(Writer {
                active: None,
                compress_tx: Some(compress_tx),
            }),
            compressor: Mutex::new(Some(compressor)),
        })
    }

    pub fn log_dir(&self) -> &Path {
        &self.config.log_dir
    }

    pub fn log_path_for(&self, date: NaiveDate) -> PathBuf {
        self.config
            .log_dir
            .join(format!("audit-{}.log", date.format("%Y-%m-%d")))
    }

    pub fn hash_subject(&self, subject_id: &str) -> String {
        let digest = self
            .crypto
            .hash(subject_id.as_bytes(), Some(self.config.subject_salt.as_bytes()))
            .digest;
        digest[..HASHED_SUBJECT_LEN].to_string()
    }

    pub async fn record(
        &self,
        event_type: AuditEventType,
        metadata: Value,
        subject_id: Option<&str>,
    ) -> Result<String, AuditError> {
        let hashed_subject_id = subject_id.map(|subject| self.hash_subject(subject));
        let metadata = sanitize_metadata(metadata);
        let session_id = current_session();

        let entry = {
            let mut writer = self.writer.lock().await;
            // Timestamp taken under the writer lock keeps file order chronological.
            let mut entry = AuditLogEntry {
                id: Uuid::new_v4().simple().to_string(),
                timestamp: Utc::now(),
                event_type: event_type.as_str().to_string(),
                hashed_subject_id,
                metadata,
                source: SourceInfo {
                    hostname: self.config.hostname.clone(),
                    pid: std::process::id(),
                    environment: self.config.environment.clone(),
                },
                session_id,
                integrity_hash: String::new(),
            };
            entry.integrity_hash = self.sign(&entry)?;
            let mut line = serde_json::to_vec(&entry)?;
            line.push(b'\n');
            self.append(&mut writer, entry.timestamp.date_naive(), &line)
                .await?;
            entry
        };

        debug!(target: "audit", entry_id = %entry.id, event = %entry.event_type, "audit entry written");

        if event_type.is_critical() {
            let alerts = self.alerts.clone();
            let alert_entry = entry.clone();
            tokio::spawn(async move {
                if let Err(err) = alerts.send(&alert_entry).await {
                    warn!(?err, entry_id = %alert_entry.id, "alert channel unavailable");
                }
            });
        }

        Ok(entry.id)
    }

    /// Re-reads `path` in order and checks every entry's signature. Plain and
    /// `.lz4` compressed files are both accepted.
    pub async fn verify_integrity(&self, path: impl AsRef<Path>) -> Result<bool, AuditError> {
        let path = path.as_ref().to_path_buf();
        let secret = self.config.signing_secret.clone();
        let crypto = self.crypto.clone();
        tokio::task::spawn_blocking(move || verify_file(&crypto, &path, secret.as_bytes()))
            .await
            .map_err(|err| AuditError::Task(err.to_string()))?
    }

    /// Stops accepting compression work and waits for pending jobs.
    pub async fn shutdown(&self) {
        {
            let mut writer = self.writer.lock().await;
            if let Some(mut active) = writer.active.take() {
                if let Err(err) = active.file.flush().await {
                    warn!(?err, path = %active.path.display(), "failed to flush audit log");
                }
            }
            writer.compress_tx.take();
        }
        if let Some(handle) = self.compressor.lock().await.take() {
            if let Err(err) = handle.await {
                warn!(?err, "audit compressor ended abnormally");
            }
        }
        info!("audit log closed");
    }

    fn sign(&self, entry: &AuditLogEntry) -> Result<String, AuditError> {
        let mut value = serde_json::to_value(entry)?;
        if let Value::Object(map) = &mut value {
            map.remove(INTEGRITY_FIELD);
        }
        let payload = serde_json::to_vec(&value)?;
        Ok(self
            .crypto
            .hmac_sign(&payload, self.config.signing_secret.as_bytes()))
    }

    async fn append(
        &self,
        writer: &mut Writer,
        date: NaiveDate,
        line: &[u8],
    ) -> Result<(), AuditError> {
        let stale = writer
            .active
            .as_ref()
            .map_or(true, |active| active.date != date);
        if stale {
            if let Some(mut previous) = writer.active.take() {
                previous.file.flush().await?;
            }
            writer.active = Some(self.open_day_file(date).await?);
        }

        let needs_rotation = writer
            .active
            .as_ref()
            .map_or(false, |active| active.size > self.config.rotate_bytes);
        if needs_rotation {
            self.rotate(writer, date).await?;
        }

        if let Some(active) = writer.active.as_mut() {
            active.file.write_all(line).await?;
            active.file.flush().await?;
            active.size += line.len() as u64;
        }

        let oversized = writer
            .active
            .as_ref()
            .map_or(false, |active| active.size > self.config.max_bytes);
        if oversized {
            self.rotate(writer, date).await?;
        }
        Ok(())
    }

    async fn open_day_file(&self, date: NaiveDate) -> Result<ActiveFile, AuditError> {
        create_private_dir(&self.config.log_dir).await?;
        let path = self.log_path_for(date);
        let mut options = fs::OpenOptions::new();
        options.create(true).append(true);
        #[cfg(unix)]
        options.mode(0o600);
        let file = options.open(&path).await?;
        let size = file.metadata().await?.len();
        Ok(ActiveFile {
            date,
            path,
            file,
            size,
        })
    }

    /// Renames the active file aside, hands it to the compressor and opens a
    /// fresh file for `date`.
    async fn rotate(&self, writer: &mut Writer, date: NaiveDate) -> Result<(), AuditError> {
        let Some(mut active) = writer.active.take() else {
            return Ok(());
        };
        active.file.flush().await?;
        let path = active.path.clone();
        drop(active);

        // Two rotations within one millisecond must not clobber each other.
        let mut stamp = Utc::now().timestamp_millis();
        let rotated = loop {
            let candidate = PathBuf::from(format!("{}.{stamp}", path.display()));
            let compressed =
                PathBuf::from(format!("{}.{COMPRESSED_EXTENSION}", candidate.display()));
            if !fs::try_exists(&candidate).await? && !fs::try_exists(&compressed).await? {
                break candidate;
            }
            stamp += 1;
        };
        fs::rename(&path, &rotated).await?;
        info!(rotated = %rotated.display(), "audit log rotated");

        match writer.compress_tx.as_ref() {
            Some(tx) => {
                if let Err(err) = tx.send(rotated).await {
                    warn!(path = %err.0.display(), "compressor stopped; rotated file left uncompressed");
                }
            }
            None => warn!(path = %rotated.display(), "audit log shut down; rotated file left uncompressed"),
        }

        writer.active = Some(self.open_day_file(date).await?);
        Ok(())
    }
}

#[async_trait]
impl AuditSink for AuditLog {
    async fn record(
        &self,
        event_type: AuditEventType,
        metadata: Value,
        subject_id: Option<&str>,
    ) -> Result<String, AuditError> {
        AuditLog::record(self, event_type, metadata, subject_id).await
    }
}

/// Replaces denylisted fields (case-insensitive, at any depth) with a marker.
pub fn sanitize_metadata(metadata: Value) -> Value {
    match metadata {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(key, value)| {
                    if is_sensitive(&key) {
                        (key, Value::String(REDACTED.to_string()))
                    } else {
                        (key, sanitize_metadata(value))
                    }
                })
                .collect::<Map<String, Value>>(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(sanitize_metadata).collect()),
        other => other,
    }
}

fn is_sensitive(key: &str) -> bool {
    let lowered = key.to_ascii_lowercase();
    SENSITIVE_FIELDS.iter().any(|field| *field == lowered)
}

/// Offline verification of a plain or `.lz4` log file against `secret`.
pub fn verify_file(
    crypto: &CryptoPrimitives,
    path: &Path,
    secret: &[u8],
) -> Result<bool, AuditError> {
    let contents = read_log_bytes(path)?;
    let lines = contents
        .split(|byte| *byte == b'\n')
        .filter(|line| !line.is_empty());

    for (position, line) in lines.enumerate() {
        let Ok(Value::Object(mut map)) = serde_json::from_slice::<Value>(line) else {
            warn!(position, path = %path.display(), "unparseable audit entry");
            return Err(AuditError::TamperDetected { position });
        };
        let Some(Value::String(stored)) = map.remove(INTEGRITY_FIELD) else {
            return Err(AuditError::TamperDetected { position });
        };
        let payload = serde_json::to_vec(&Value::Object(map))?;
        if !crypto.hmac_verify(&payload, secret, &stored) {
            warn!(position, path = %path.display(), "audit entry signature mismatch");
            return Err(AuditError::TamperDetected { position });
        }
    }
    Ok(true)
}

fn read_log_bytes(path: &Path) -> Result<Vec<u8>, AuditError> {
    let raw = std::fs::read(path)?;
    let compressed = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map_or(false, |ext| ext == COMPRESSED_EXTENSION);
    if !compressed {
        return Ok(raw);
    }
    let mut decoder = lz4_flex::frame::FrameDecoder::new(raw.as_slice());
    let mut contents = Vec::new();
    decoder.read_to_end(&mut contents)?;
    Ok(contents)
}

async fn create_private_dir(dir: &Path) -> Result<(), AuditError> {
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    builder.mode(0o700);
    builder.create(dir).await?;
    Ok(())
}

async fn run_compressor(mut rx: mpsc::Receiver<PathBuf>) {
    while let Some(path) = rx.recv().await {
        let source_path = path.display().to_string();
        match tokio::task::spawn_blocking(move || compress_file(&path)).await {
            Ok(Ok(target)) => info!(source = %source_path, target = %target.display(), "audit log compressed"),
            Ok(Err(err)) => warn!(?err, source = %source_path, "audit log compression failed"),
            Err(err) => warn!(?err, source = %source_path, "audit compression task panicked"),
        }
    }
    debug!("audit compressor drained");
}

fn compress_file(source: &Path) -> std::io::Result<PathBuf> {
    let target = PathBuf::from(format!("{}.{COMPRESSED_EXTENSION}", source.display()));
    let mut input = std::fs::File::open(source)?;
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let output = options.open(&target)?;
    let mut encoder = lz4_flex::frame::FrameEncoder::new(output);
    std::io::copy(&mut input, &mut encoder)?;
    encoder
        .finish()
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err))?;
    std::fs::remove_file(source)?;
    Ok(target)
}
