use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MailError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SMTP protocol error: {0}")]
    SmtpProtocol(String),

    #[error("POP3 protocol error: {0}")]
    Pop3Protocol(String),

    #[error("Storage error: {0}")]
    Storage(String),

    /// The requested mailbox or message does not exist.
    #[error("Message not found: {0}")]
    NotFound(String),

    /// A mailbox index could not be decoded. The whole read is aborted.
    #[error("Corrupt mailbox index {path:?}: {reason}")]
    CorruptIndex { path: PathBuf, reason: String },

    #[error("Invalid email address: {0}")]
    InvalidAddress(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A background service stopped unexpectedly
    #[error("Service failed: {0}")]
    Service(String),

    #[error("Service is shutting down")]
    Shutdown,
}

impl MailError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, MailError::NotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, MailError>;
