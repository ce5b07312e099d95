//! Mission package collaborators
//!
//! The orchestrator reaches contacts, streaming endpoints, local interfaces
//! and the application only through these traits.

use std::net::IpAddr;
use std::sync::Arc;

use uuid::Uuid;

use crate::error::MissionError;
use crate::mission::types::{
    ContactUid, FileTransferRequest, MpReceiveUpdate, MpSendUpdate, ReceiveDecision,
    TransferMessage,
};
use crate::storage::FileIoProvider;
use crate::transport::tls::TlsSettings;

/// Known contacts and the messaging layer that reaches them
pub trait ContactDirectory: Send + Sync {
    fn has_contact(&self, contact: &ContactUid) -> bool;

    /// Streaming endpoint the contact is reached through, if any
    fn stream_endpoint(&self, contact: &ContactUid) -> Option<String>;

    fn has_streaming_endpoint(&self, contact: &ContactUid) -> bool {
        self.stream_endpoint(contact).is_some()
    }

    /// Host of the contact's currently active endpoint
    fn active_endpoint_host(&self, contact: &ContactUid) -> Option<String>;

    /// Send a message to one contact
    ///
    /// Fails with `ContactGone` if the contact cannot be reached.
    fn send_message(&self, to: &ContactUid, message: TransferMessage) -> Result<(), MissionError>;
}

/// Connections to streaming (server) endpoints
pub trait StreamingEndpoints: Send + Sync {
    fn endpoint_address(&self, endpoint: &str) -> Option<IpAddr>;

    fn is_endpoint_ssl(&self, endpoint: &str) -> bool;

    /// Trust material and client identity used by the endpoint's connection
    fn endpoint_tls(&self, endpoint: &str) -> Option<TlsSettings>;
}

/// Local network interfaces
pub trait NetworkInterfaces: Send + Sync {
    /// Address advertised in locally served URLs
    fn primary_address(&self) -> Option<String>;
}

/// Application side of mission package transfers
pub trait MissionPackageIo: Send + Sync {
    /// Decide where (and whether) an offered package is received
    fn receive_init(&self, request: &FileTransferRequest) -> ReceiveDecision;

    fn send_status_update(&self, update: MpSendUpdate);

    fn receive_status_update(&self, update: MpReceiveUpdate);

    fn create_uuid(&self) -> String {
        Uuid::new_v4().to_string()
    }
}

/// Everything the orchestrator depends on
#[derive(Clone)]
pub struct Collaborators {
    pub io: Arc<dyn MissionPackageIo>,
    pub contacts: Arc<dyn ContactDirectory>,
    pub endpoints: Arc<dyn StreamingEndpoints>,
    pub interfaces: Arc<dyn NetworkInterfaces>,
    pub files: Arc<dyn FileIoProvider>,
}
