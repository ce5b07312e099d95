//! Mission package distribution
//!
//! Sends packages to contacts directly from the embedded web server or
//! through relay servers, and downloads packages offered by others.

pub mod collaborators;
pub mod context;
pub mod manager;
pub mod receive;
pub mod responder;
pub mod types;
pub mod upload;

pub use collaborators::{
    Collaborators, ContactDirectory, MissionPackageIo, NetworkInterfaces, StreamingEndpoints,
};
pub use manager::{MissionPackageManager, SERVER_TRANSFER_NAME};
pub use types::{
    ContactUid, FileTransferAck, FileTransferRequest, MP_LOCAL_PORT_DISABLE, MpReceiveUpdate,
    MpSendUpdate, MpTransferStatus, ReceiveDecision, TransferMessage,
};
