//! Symmetric key lifecycle: rotation, lookup by id and retention purge.

pub mod models;
pub mod service;

pub use models::{CryptoKey, KeyMetadata, KeyState, StoredKey};
pub use service::{KeyError, KeyManager, KeyManagerConfig};
