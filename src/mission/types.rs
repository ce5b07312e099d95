//! Mission package types
//!
//! Transfer messages exchanged with peers, status updates delivered to the
//! application, and the receive-init decision.

use std::fmt;
use std::path::PathBuf;

/// Value of a local port that disables the corresponding server
pub const MP_LOCAL_PORT_DISABLE: i32 = -1;

/// Unique id of a contact
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContactUid(String);

impl ContactUid {
    pub fn new(uid: impl Into<String>) -> Self {
        Self(uid.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContactUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ContactUid {
    fn from(uid: &str) -> Self {
        Self::new(uid)
    }
}

impl From<String> for ContactUid {
    fn from(uid: String) -> Self {
        Self(uid)
    }
}

/// Status of a mission package transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MpTransferStatus {
    FinishedSuccess,
    FinishedFailed,
    FinishedContactGone,
    FinishedDisabledLocally,
    ServerUploadPending,
    ServerUploadInProgress,
    ServerUploadSuccess,
    ServerUploadFailed,
    AttemptInProgress,
    AttemptFailed,
}

impl MpTransferStatus {
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            MpTransferStatus::FinishedSuccess
                | MpTransferStatus::FinishedFailed
                | MpTransferStatus::FinishedContactGone
                | MpTransferStatus::FinishedDisabledLocally
        )
    }
}

/// Progress of an outbound transfer for one recipient
///
/// `recipient` is `None` for server-only uploads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MpSendUpdate {
    pub xfer_id: i32,
    pub recipient: Option<ContactUid>,
    pub status: MpTransferStatus,
    pub detail: Option<String>,
    pub bytes_transferred: u64,
}

impl MpSendUpdate {
    pub fn new(
        xfer_id: i32,
        recipient: Option<ContactUid>,
        status: MpTransferStatus,
        detail: Option<&str>,
        bytes_transferred: u64,
    ) -> Self {
        Self {
            xfer_id,
            recipient,
            status,
            detail: detail.map(str::to_string),
            bytes_transferred,
        }
    }
}

/// Progress of an inbound transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MpReceiveUpdate {
    pub local_file: PathBuf,
    pub status: MpTransferStatus,
    pub bytes_received: u64,
    pub total_bytes_expected: u64,
    pub attempt: u32,
    pub max_attempts: u32,
    pub detail: Option<String>,
}

/// Offer of a package, sent to each local or relayed recipient
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileTransferRequest {
    pub sha256: String,
    /// Transfer (package) name
    pub name: String,
    pub sender_filename: String,
    pub sender_url: String,
    pub size: u64,
    pub sender_callsign: String,
    pub sender_uid: ContactUid,
    /// Correlates the recipient's ack with this request
    pub ack_uid: String,
    /// Served by the sender itself rather than a server
    pub peer_hosted: bool,
    /// Sender's https port, or `MP_LOCAL_PORT_DISABLE`
    pub https_port: i32,
}

/// Recipient's answer to a `FileTransferRequest`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileTransferAck {
    pub uid: String,
    pub success: bool,
    pub reason: String,
    pub sender: ContactUid,
    pub size: u64,
}

/// Mission package message carried by the messaging layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferMessage {
    Request(FileTransferRequest),
    Ack(FileTransferAck),
}

/// Application's answer when a package is offered
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiveDecision {
    /// Download into this file
    Accept(PathBuf),
    FileExists,
    DisabledLocally,
    Failed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_finished_statuses() {
        assert!(MpTransferStatus::FinishedDisabledLocally.is_finished());
        assert!(MpTransferStatus::FinishedContactGone.is_finished());
        assert!(!MpTransferStatus::AttemptFailed.is_finished());
        assert!(!MpTransferStatus::ServerUploadSuccess.is_finished());
    }

    #[test]
    fn test_contact_uid_conversions() {
        let uid: ContactUid = "ANDROID-1".into();
        assert_eq!(uid.as_str(), "ANDROID-1");
        assert_eq!(uid.to_string(), "ANDROID-1");
        assert_eq!(uid, ContactUid::from("ANDROID-1".to_string()));
    }
}
