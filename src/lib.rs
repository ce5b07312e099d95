//! File transfer services for a tactical messaging stack
//!
//! A multiplexed URL transfer engine with FTP(S) and HTTP(S) transports,
//! cloud storage clients for FTP and WebDAV servers, and the mission package
//! orchestrator that moves packages between contacts.

pub mod cloud;
pub mod error;
pub mod mission;
pub mod settings;
pub mod storage;
pub mod transfer;
pub mod transport;
pub mod utils;

pub use cloud::{CloudClient, CloudIoManager};
pub use mission::MissionPackageManager;
pub use settings::MpTransferSettings;
pub use transfer::{SimpleFileIoManager, UrlRequestManager};
