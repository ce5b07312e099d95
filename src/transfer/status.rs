//! Transfer status types
//!
//! The shared status taxonomy reported for every transfer, and the base update
//! record handed to callbacks.

use std::fmt;

/// Status of a transfer, shared by every protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileIoStatus {
    InProgress,
    Success,
    HostResolutionFail,
    ConnectFail,
    UrlInvalid,
    UrlUnsupported,
    UrlNoResource,
    LocalFileOpenFailure,
    LocalIoError,
    SslUntrustedServer,
    SslOtherError,
    AuthError,
    AccessDenied,
    TransferTimeout,
    OtherError,
}

impl FileIoStatus {
    /// Whether this status ends the transfer
    pub fn is_terminal(&self) -> bool {
        !matches!(self, FileIoStatus::InProgress)
    }
}

impl fmt::Display for FileIoStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FileIoStatus::InProgress => "in progress",
            FileIoStatus::Success => "success",
            FileIoStatus::HostResolutionFail => "host resolution failed",
            FileIoStatus::ConnectFail => "connect failed",
            FileIoStatus::UrlInvalid => "invalid url",
            FileIoStatus::UrlUnsupported => "unsupported url",
            FileIoStatus::UrlNoResource => "no such resource",
            FileIoStatus::LocalFileOpenFailure => "local file open failure",
            FileIoStatus::LocalIoError => "local io error",
            FileIoStatus::SslUntrustedServer => "untrusted server certificate",
            FileIoStatus::SslOtherError => "ssl error",
            FileIoStatus::AuthError => "authentication error",
            FileIoStatus::AccessDenied => "access denied",
            FileIoStatus::TransferTimeout => "transfer timeout",
            FileIoStatus::OtherError => "other error",
        };
        write!(f, "{}", name)
    }
}

/// Base status update for one transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferUpdate {
    pub xfer_id: i32,
    pub status: FileIoStatus,
    pub additional_info: Option<String>,
    pub bytes_transferred: u64,
    pub total_bytes: u64,
}

impl TransferUpdate {
    pub fn new(
        xfer_id: i32,
        status: FileIoStatus,
        additional_info: Option<String>,
        bytes_transferred: u64,
        total_bytes: u64,
    ) -> Self {
        Self {
            xfer_id,
            status,
            additional_info,
            bytes_transferred,
            total_bytes,
        }
    }
}
