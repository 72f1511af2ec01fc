//! Error types shared across the application.

use std::fmt::{Display, Formatter};

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all domain failure modes.
#[derive(Debug, Clone)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// Malformed request body, invalid enum token, or missing field.
    Validation(String),
    /// Agent Protocol framing or RPC plumbing failure.
    Protocol(String),
    /// The agent child reported or caused a turn failure.
    Agent(String),
    /// Thread store read/write failure.
    Store(String),
    /// Requested entity does not exist.
    NotFound(String),
    /// Request conflicts with current state (idempotency, no runtime).
    Conflict(String),
    /// File-system or I/O operation failure.
    Io(String),
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Validation(msg) => write!(f, "validation: {msg}"),
            Self::Protocol(msg) => write!(f, "protocol: {msg}"),
            Self::Agent(msg) => write!(f, "agent: {msg}"),
            Self::Store(msg) => write!(f, "store: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::Conflict(msg) => write!(f, "conflict: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
