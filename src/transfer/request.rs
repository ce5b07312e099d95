//! Transfer requests
//!
//! A request describes one transfer handed to a `UrlRequestManager`: where it
//! goes, which direction data flows, and how protocol adapters customise the
//! exchange and interpret its result.

use std::path::PathBuf;

use crate::transfer::status::{FileIoStatus, TransferUpdate};
use crate::transport::tls::TlsSettings;

/// Direction of a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    /// Local file is sent to the remote URL
    FileUpload,
    /// Remote resource is written to a local file
    FileDownload,
    /// Remote resource is handed to the request in memory
    BufferDownload,
}

impl TransferKind {
    pub fn is_upload(&self) -> bool {
        matches!(self, TransferKind::FileUpload)
    }
}

/// Login for the remote side
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub password: Option<String>,
}

/// Protocol-specific configuration applied just before the exchange starts
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub credentials: Option<Credentials>,
    /// Replaces the default verb of an HTTP exchange
    pub method: Option<String>,
    pub headers: Vec<(String, String)>,
    /// Raw FTP commands issued after login, before the transfer itself
    pub quote: Vec<String>,
}

/// What a request points at; fixed once the request is built
#[derive(Debug, Clone)]
pub struct RequestTarget {
    pub url: String,
    pub kind: TransferKind,
    pub local_file: Option<PathBuf>,
    /// Trust configuration used when the URL scheme is secure
    pub tls: TlsSettings,
}

impl RequestTarget {
    pub fn new(url: impl Into<String>, kind: TransferKind, tls: TlsSettings) -> Self {
        Self {
            url: url.into(),
            kind,
            local_file: None,
            tls,
        }
    }

    pub fn with_local_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.local_file = Some(path.into());
        self
    }
}

/// A transfer as seen by the engine
pub trait UrlRequest: Send + 'static {
    /// Update type delivered to the owner of this request
    type Update: Send + 'static;

    fn target(&self) -> &RequestTarget;

    /// Add protocol-specific configuration to the exchange
    fn configure(&self, _options: &mut RequestOptions) {}

    /// Refine a transport-level success using the application response code
    fn status_for_response(&self, _code: u32) -> FileIoStatus {
        FileIoStatus::Success
    }

    /// Receive data for `BufferDownload` requests
    fn downloaded_data(&mut self, _data: &[u8]) {}

    /// Wrap a base update into the owner's update type
    fn create_update(&mut self, update: TransferUpdate) -> Self::Update;
}

/// Receiver of status updates for requests it owns
pub trait UrlRequestIo<U>: Send + Sync {
    fn url_request_update(&self, update: U);
}
