//! Transfer engine
//!
//! Request and status types shared by every protocol, the generic multiplexed
//! engine, and the simple FTP(S) engine built on it.

pub mod dispatch;
pub mod manager;
pub mod request;
pub mod simple;
pub mod status;

// Re-export key types
pub use dispatch::{IdleBarrier, StatusDispatcher};
pub use manager::{EngineConfig, UrlRequestManager};
pub use request::{Credentials, RequestOptions, RequestTarget, TransferKind, UrlRequest, UrlRequestIo};
pub use simple::{SimpleFileIo, SimpleFileIoManager, SimpleFileIoUpdate, SimpleFileRequest};
pub use status::{FileIoStatus, TransferUpdate};
