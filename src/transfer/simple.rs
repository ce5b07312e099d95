//! Simple file transfers
//!
//! `SimpleFileIoManager` is the transfer engine specialised to plain FTP(S)
//! uploads and downloads reported to a single callback sink.

use std::path::PathBuf;
use std::sync::Arc;

use log::info;

use crate::error::TransferError;
use crate::storage::FileIoProvider;
use crate::transfer::manager::{EngineConfig, UrlRequestManager};
use crate::transfer::request::{
    Credentials, RequestOptions, RequestTarget, TransferKind, UrlRequest, UrlRequestIo,
};
use crate::transfer::status::TransferUpdate;
use crate::transport::Transport;
use crate::transport::tls::TlsSettings;

/// Update delivered for simple transfers
pub type SimpleFileIoUpdate = TransferUpdate;

/// Receiver of simple transfer updates
pub trait SimpleFileIo: Send + Sync {
    fn file_transfer_update(&self, update: SimpleFileIoUpdate);
}

const SIMPLE_OWNER: u64 = 0;

struct SimpleSink(Arc<dyn SimpleFileIo>);

impl UrlRequestIo<SimpleFileIoUpdate> for SimpleSink {
    fn url_request_update(&self, update: SimpleFileIoUpdate) {
        self.0.file_transfer_update(update);
    }
}

/// Plain FTP(S) upload or download
pub struct SimpleFileRequest {
    target: RequestTarget,
    credentials: Option<Credentials>,
}

impl SimpleFileRequest {
    /// Validate and build a request
    ///
    /// # Behavior
    /// * Only `ftp` and `ftps` URLs are accepted
    /// * A password without a user name is rejected
    /// * CA certificates are only parsed for `ftps`
    pub fn new(
        upload: bool,
        remote_url: &str,
        local_file: impl Into<PathBuf>,
        ca_cert: Option<&[u8]>,
        user: Option<&str>,
        password: Option<&str>,
    ) -> Result<Self, TransferError> {
        let (scheme, _) = remote_url
            .split_once(':')
            .ok_or_else(|| TransferError::IllegalArgument(format!("no protocol in {}", remote_url)))?;
        let secure = match scheme.to_ascii_uppercase().as_str() {
            "FTPS" => true,
            "FTP" => false,
            other => {
                return Err(TransferError::IllegalArgument(format!(
                    "unsupported protocol {}",
                    other
                )));
            }
        };

        let credentials = match (user, password) {
            (None, Some(_)) => {
                return Err(TransferError::IllegalArgument(
                    "password given without user name".into(),
                ));
            }
            (Some(user), password) => Some(Credentials {
                user: user.to_string(),
                password: password.map(str::to_string),
            }),
            (None, None) => None,
        };

        let tls = match ca_cert {
            Some(pem) if secure => TlsSettings::from_ca_pem(pem)?,
            _ => TlsSettings::accept_any(),
        };

        let kind = if upload {
            TransferKind::FileUpload
        } else {
            TransferKind::FileDownload
        };
        Ok(Self {
            target: RequestTarget::new(remote_url, kind, tls).with_local_file(local_file),
            credentials,
        })
    }
}

impl UrlRequest for SimpleFileRequest {
    type Update = SimpleFileIoUpdate;

    fn target(&self) -> &RequestTarget {
        &self.target
    }

    fn configure(&self, options: &mut RequestOptions) {
        options.credentials = self.credentials.clone();
    }

    fn create_update(&mut self, update: TransferUpdate) -> Self::Update {
        update
    }
}

/// Engine for simple FTP(S) transfers
pub struct SimpleFileIoManager {
    engine: UrlRequestManager<SimpleFileRequest>,
    sink: Arc<SimpleSink>,
}

impl SimpleFileIoManager {
    pub fn new(io: Arc<dyn SimpleFileIo>) -> Self {
        Self {
            engine: UrlRequestManager::new(),
            sink: Arc::new(SimpleSink(io)),
        }
    }

    pub fn with_parts(
        io: Arc<dyn SimpleFileIo>,
        config: EngineConfig,
        transport: Arc<dyn Transport>,
        provider: Arc<dyn FileIoProvider>,
    ) -> Self {
        Self {
            engine: UrlRequestManager::with_parts(config, transport, provider),
            sink: Arc::new(SimpleSink(io)),
        }
    }

    /// Create an upload of `local_file` to `remote_url`; start it with `start_transfer`
    pub fn upload_file(
        &self,
        remote_url: &str,
        local_file: impl Into<PathBuf>,
        ca_cert: Option<&[u8]>,
        user: Option<&str>,
        password: Option<&str>,
    ) -> Result<i32, TransferError> {
        self.queue(true, remote_url, local_file.into(), ca_cert, user, password)
    }

    /// Create a download of `remote_url` into `local_file`; start it with `start_transfer`
    pub fn download_file(
        &self,
        local_file: impl Into<PathBuf>,
        remote_url: &str,
        ca_cert: Option<&[u8]>,
        user: Option<&str>,
        password: Option<&str>,
    ) -> Result<i32, TransferError> {
        self.queue(false, remote_url, local_file.into(), ca_cert, user, password)
    }

    pub fn start_transfer(&self, id: i32) -> Result<(), TransferError> {
        self.engine.start_transfer(id)
    }

    pub async fn shutdown(&self) {
        self.engine.shutdown().await;
    }

    fn queue(
        &self,
        upload: bool,
        remote_url: &str,
        local_file: PathBuf,
        ca_cert: Option<&[u8]>,
        user: Option<&str>,
        password: Option<&str>,
    ) -> Result<i32, TransferError> {
        let display = local_file.display().to_string();
        let request = SimpleFileRequest::new(upload, remote_url, local_file, ca_cert, user, password)?;
        let id = self
            .engine
            .init_request(SIMPLE_OWNER, self.sink.clone(), request);
        info!(
            "SimpleIO: Creating {} transfer transaction - id {} URL {} local file {}",
            if upload { "upload" } else { "download" },
            id,
            remote_url,
            display
        );
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_non_ftp() {
        let err = SimpleFileRequest::new(true, "http://host/file", "/tmp/x", None, None, None);
        assert!(matches!(err, Err(TransferError::IllegalArgument(_))));
        let err = SimpleFileRequest::new(true, "no-protocol", "/tmp/x", None, None, None);
        assert!(matches!(err, Err(TransferError::IllegalArgument(_))));
    }

    #[test]
    fn test_password_requires_user() {
        let err = SimpleFileRequest::new(false, "ftp://host/file", "/tmp/x", None, None, Some("pw"));
        assert!(matches!(err, Err(TransferError::IllegalArgument(_))));
    }

    #[test]
    fn test_ca_only_parsed_for_ftps() {
        assert!(SimpleFileRequest::new(false, "ftp://host/f", "/tmp/x", Some(b"junk"), None, None).is_ok());
        assert!(matches!(
            SimpleFileRequest::new(false, "FTPS://host/f", "/tmp/x", Some(b"junk"), None, None),
            Err(TransferError::InvalidCertificates(_))
        ));
    }

    #[test]
    fn test_credentials_configured() {
        let request =
            SimpleFileRequest::new(true, "ftp://host/f", "/tmp/x", None, Some("user"), Some("pw")).unwrap();
        let mut options = RequestOptions::default();
        request.configure(&mut options);
        assert_eq!(
            options.credentials,
            Some(Credentials {
                user: "user".into(),
                password: Some("pw".into())
            })
        );
        assert_eq!(request.target().kind, TransferKind::FileUpload);
    }
}
