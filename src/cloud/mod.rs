//! Cloud transfer clients
//!
//! FTP(S) and WebDAV clients that run their operations on a shared transfer
//! engine, and the registry that creates and tears them down.

pub mod client;
pub mod davxml;
pub mod ftp;
pub mod listparse;
pub mod registry;
pub mod webdav;

use std::fmt;

use crate::transfer::TransferUpdate;

pub use client::{CloudClient, CloudRequest};
pub use registry::CloudIoManager;

/// Protocol spoken by a cloud client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloudProtocol {
    Http,
    Https,
    Ftp,
    Ftps,
}

impl CloudProtocol {
    pub fn is_secure(&self) -> bool {
        matches!(self, CloudProtocol::Https | CloudProtocol::Ftps)
    }

    pub fn scheme(&self) -> &'static str {
        match self {
            CloudProtocol::Http => "http",
            CloudProtocol::Https => "https",
            CloudProtocol::Ftp => "ftp",
            CloudProtocol::Ftps => "ftps",
        }
    }
}

/// Operations offered by every cloud client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloudOperation {
    ListCollection,
    Get,
    Put,
    Move,
    MakeCollection,
    TestServer,
}

impl fmt::Display for CloudOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CloudOperation::ListCollection => "list",
            CloudOperation::Get => "get",
            CloudOperation::Put => "put",
            CloudOperation::Move => "move",
            CloudOperation::MakeCollection => "mkcol",
            CloudOperation::TestServer => "test",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionEntryKind {
    File,
    Collection,
}

/// One item of a collection listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionEntry {
    pub kind: CollectionEntryKind,
    /// Path relative to the client's base path
    pub path: String,
    /// `None` when the server did not report a size
    pub size: Option<u64>,
}

impl CollectionEntry {
    pub fn new(kind: CollectionEntryKind, path: impl Into<String>, size: Option<u64>) -> Self {
        Self {
            kind,
            path: path.into(),
            size,
        }
    }
}

/// Status update for a cloud operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloudIoUpdate {
    pub operation: CloudOperation,
    pub base: TransferUpdate,
    /// Present only on a successful listing
    pub entries: Option<Vec<CollectionEntry>>,
}

/// Receiver of cloud operation updates
pub trait CloudIo: Send + Sync {
    fn cloud_operation_update(&self, update: CloudIoUpdate);
}

/// Collapse runs of `/` into one
pub fn remove_extra_slashes(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut saw_slash = false;
    for c in s.chars() {
        if c == '/' {
            if saw_slash {
                continue;
            }
            saw_slash = true;
        } else {
            saw_slash = false;
        }
        out.push(c);
    }
    out
}
