//! Error handlers
//!
//! Translates transport failures and application response codes into the
//! shared `FileIoStatus` taxonomy.

use crate::error::types::{TransportError, TransportErrorKind};
use crate::transfer::FileIoStatus;
use log::debug;

/// Map a transport failure onto the shared status taxonomy
pub fn status_for_transport_error(err: &TransportError) -> FileIoStatus {
    match err.kind {
        TransportErrorKind::UnsupportedProtocol => FileIoStatus::UrlUnsupported,
        TransportErrorKind::MalformedUrl => FileIoStatus::UrlInvalid,
        TransportErrorKind::ResolveHost => FileIoStatus::HostResolutionFail,
        TransportErrorKind::Connect => FileIoStatus::ConnectFail,
        TransportErrorKind::RemoteAccessDenied | TransportErrorKind::UploadFailed => {
            FileIoStatus::AccessDenied
        }
        TransportErrorKind::LoginDenied => FileIoStatus::AuthError,
        TransportErrorKind::ReadError | TransportErrorKind::WriteError => {
            FileIoStatus::LocalIoError
        }
        TransportErrorKind::Timeout => FileIoStatus::TransferTimeout,
        TransportErrorKind::Tls => FileIoStatus::SslOtherError,
        TransportErrorKind::UntrustedCertificate => FileIoStatus::SslUntrustedServer,
        TransportErrorKind::RemoteFileNotFound => FileIoStatus::UrlNoResource,
        TransportErrorKind::Protocol | TransportErrorKind::Other => FileIoStatus::OtherError,
    }
}

/// Shared HTTP-style response code table
pub fn status_for_response_code(code: u32) -> FileIoStatus {
    match code {
        401 => FileIoStatus::AuthError,
        403 => FileIoStatus::AccessDenied,
        404 | 410 => FileIoStatus::UrlNoResource,
        405 => FileIoStatus::UrlUnsupported,
        200 | 201 | 202 | 204 | 207 => FileIoStatus::Success,
        _ => FileIoStatus::OtherError,
    }
}

/// FTP reply codes: any 2xx completion is success, plus the 530/550 cases
pub fn status_for_ftp_reply(code: u32) -> FileIoStatus {
    match code {
        200..=299 => FileIoStatus::Success,
        530 => FileIoStatus::AuthError,
        550 => FileIoStatus::UrlNoResource,
        _ => status_for_response_code(code),
    }
}

/// Log a transport failure for a job
pub fn log_transport_error(id: i32, err: &TransportError) {
    debug!("Transfer {} failed at transport level: {}", id, err);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_table() {
        assert_eq!(status_for_response_code(207), FileIoStatus::Success);
        assert_eq!(status_for_response_code(401), FileIoStatus::AuthError);
        assert_eq!(status_for_response_code(403), FileIoStatus::AccessDenied);
        assert_eq!(status_for_response_code(410), FileIoStatus::UrlNoResource);
        assert_eq!(status_for_response_code(405), FileIoStatus::UrlUnsupported);
        assert_eq!(status_for_response_code(500), FileIoStatus::OtherError);
        assert_eq!(status_for_response_code(226), FileIoStatus::OtherError);
    }

    #[test]
    fn test_ftp_table() {
        assert_eq!(status_for_ftp_reply(226), FileIoStatus::Success);
        assert_eq!(status_for_ftp_reply(200), FileIoStatus::Success);
        assert_eq!(status_for_ftp_reply(530), FileIoStatus::AuthError);
        assert_eq!(status_for_ftp_reply(550), FileIoStatus::UrlNoResource);
        assert_eq!(status_for_ftp_reply(451), FileIoStatus::OtherError);
    }

    #[test]
    fn test_transport_mapping() {
        let err = TransportError::new(TransportErrorKind::LoginDenied, "530 Login incorrect");
        assert_eq!(status_for_transport_error(&err), FileIoStatus::AuthError);
        let err = TransportError::new(TransportErrorKind::UploadFailed, "553");
        assert_eq!(status_for_transport_error(&err), FileIoStatus::AccessDenied);
        let err = TransportError::new(TransportErrorKind::UntrustedCertificate, "x");
        assert_eq!(status_for_transport_error(&err), FileIoStatus::SslUntrustedServer);
    }
}
