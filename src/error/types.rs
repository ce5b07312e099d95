//! Error types
//!
//! Defines domain-specific error types for each layer of the transfer engine.

use std::fmt;
use std::io;

use crate::mission::ContactUid;

/// Synchronous argument errors raised by the engines and the client registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    IllegalArgument(String),
    /// Client unknown to the registry or already destroyed
    UnknownClient,
    InvalidCertificates(String),
}

impl fmt::Display for TransferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferError::IllegalArgument(msg) => write!(f, "Illegal argument: {}", msg),
            TransferError::UnknownClient => write!(f, "Unknown client"),
            TransferError::InvalidCertificates(msg) => {
                write!(f, "Invalid CA certificates: {}", msg)
            }
        }
    }
}

impl std::error::Error for TransferError {}

/// Classification of a failed connection-level exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    UnsupportedProtocol,
    MalformedUrl,
    ResolveHost,
    Connect,
    RemoteAccessDenied,
    UploadFailed,
    LoginDenied,
    ReadError,
    WriteError,
    Timeout,
    Tls,
    UntrustedCertificate,
    RemoteFileNotFound,
    Protocol,
    Other,
}

/// Error produced by a transport while driving one exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub detail: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.detail)
    }
}

impl std::error::Error for TransportError {}

/// Mission package orchestrator errors
#[derive(Debug)]
pub enum MissionError {
    IllegalArgument(String),
    ContactGone,
    NoReachableDestinations(Vec<ContactUid>),
    LocalServer(io::Error),
    Io(io::Error),
}

impl fmt::Display for MissionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MissionError::IllegalArgument(msg) => write!(f, "Illegal argument: {}", msg),
            MissionError::ContactGone => write!(f, "Contact or endpoint is gone"),
            MissionError::NoReachableDestinations(gone) => {
                write!(f, "No reachable destinations ({} gone)", gone.len())
            }
            MissionError::LocalServer(e) => {
                write!(f, "Could not start internal web server: {}", e)
            }
            MissionError::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for MissionError {}

impl From<io::Error> for MissionError {
    fn from(error: io::Error) -> Self {
        MissionError::Io(error)
    }
}

/// Transfer settings errors
#[derive(Debug)]
pub enum SettingsError {
    OutOfRange {
        field: &'static str,
        value: i64,
        min: i64,
        max: i64,
    },
    Config(config::ConfigError),
}

impl fmt::Display for SettingsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SettingsError::OutOfRange {
                field,
                value,
                min,
                max,
            } => write!(
                f,
                "{} out of range: {} (allowed {}..={})",
                field, value, min, max
            ),
            SettingsError::Config(e) => write!(f, "Configuration error: {}", e),
        }
    }
}

impl std::error::Error for SettingsError {}

impl From<config::ConfigError> for SettingsError {
    fn from(error: config::ConfigError) -> Self {
        SettingsError::Config(error)
    }
}

impl From<SettingsError> for MissionError {
    fn from(error: SettingsError) -> Self {
        MissionError::IllegalArgument(error.to_string())
    }
}
