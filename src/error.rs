
use std::any::Any;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DBError {
    #[error("Operation cancelled")]
    Cancelled,
    #[error("Transaction failed: {0}")]
    Failed(String),
    #[error("Trigger '{id}' failed: {message}")]
    Trigger { id: String, message: String },
    #[error("Persistence error: {0}")]
    Persistence(String),
    #[error("Config error: {0}")]
    Config(String),
    #[error("Lifecycle error: {0}")]
    Lifecycle(String),
    #[error("Data corruption: {message}")]
    DataCorruption { message: String },
}

pub type Result<T> = std::result::Result<T, DBError>;

impl DBError {
    /// Turns the payload of a caught panic into a transaction failure.
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "panic with a non-string payload".to_string()
        };
        Self::Failed(message)
    }
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

// Helper conversions
impl From<rusqlite::Error> for DBError {
    fn from(e: rusqlite::Error) -> Self { Self::Persistence(e.to_string()) }
}
impl From<serde_json::Error> for DBError {
    fn from(e: serde_json::Error) -> Self { Self::DataCorruption { message: e.to_string() } }
}
impl From<config::ConfigError> for DBError {
    fn from(e: config::ConfigError) -> Self { Self::Config(e.to_string()) }
}
