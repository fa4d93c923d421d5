pub mod audit;
pub mod config;
pub mod crypto;
pub mod envelope;
pub mod error;
pub mod keys;
pub mod rate_limit;
pub mod services;
pub mod store;
pub mod tasks;
pub mod tokenization;
pub mod validator;

pub use error::{AppError, AppResult};
pub use services::ProtectionLayer;
