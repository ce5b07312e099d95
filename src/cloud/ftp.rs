//! FTP(S) cloud client
//!
//! Maps cloud operations onto FTP exchanges. Listings are parsed as they
//! stream in; move and create-collection are issued as raw commands ahead of a
//! listing of the root.

use crate::cloud::listparse::ListingParser;
use crate::cloud::{CloudIoUpdate, CloudOperation, remove_extra_slashes};
use crate::error::handlers::status_for_ftp_reply;
use crate::transfer::{
    Credentials, FileIoStatus, RequestOptions, RequestTarget, TransferKind, TransferUpdate,
    UrlRequest,
};
use crate::transport::ftp::NO_FILES;
use crate::transport::tls::TlsSettings;

/// Request for one FTP cloud operation
#[derive(Debug)]
pub struct FtpCloudRequest {
    operation: CloudOperation,
    target: RequestTarget,
    credentials: Option<Credentials>,
    quote: Vec<String>,
    listing: Option<ListingParser>,
}

impl FtpCloudRequest {
    pub fn operation(&self) -> CloudOperation {
        self.operation
    }

    /// Raw commands sent before the exchange
    pub fn quote(&self) -> &[String] {
        &self.quote
    }
}

impl UrlRequest for FtpCloudRequest {
    type Update = CloudIoUpdate;

    fn target(&self) -> &RequestTarget {
        &self.target
    }

    fn configure(&self, options: &mut RequestOptions) {
        options.credentials = self.credentials.clone();
        options.quote = self.quote.clone();
    }

    fn status_for_response(&self, code: u32) -> FileIoStatus {
        // An empty directory answers LIST with 450
        if self.operation == CloudOperation::ListCollection && code == NO_FILES {
            return FileIoStatus::Success;
        }
        status_for_ftp_reply(code)
    }

    fn downloaded_data(&mut self, data: &[u8]) {
        if let Some(listing) = self.listing.as_mut() {
            listing.feed(data);
        }
    }

    fn create_update(&mut self, update: TransferUpdate) -> CloudIoUpdate {
        let entries = match (self.listing.as_mut(), update.status) {
            (Some(listing), FileIoStatus::Success) => Some(listing.finish()),
            _ => None,
        };
        CloudIoUpdate {
            operation: self.operation,
            base: update,
            entries,
        }
    }
}

/// Builds FTP requests for one server and base path
#[derive(Debug, Clone)]
pub struct FtpCloudClient {
    base_url: String,
    base_path: String,
    tls: TlsSettings,
    credentials: Option<Credentials>,
}

impl FtpCloudClient {
    /// # Arguments
    /// * `secure` - use implicit FTPS
    /// * `base_path` - directory on the server all paths are relative to
    pub fn new(
        secure: bool,
        host: &str,
        port: u16,
        base_path: &str,
        tls: TlsSettings,
        credentials: Option<Credentials>,
    ) -> Self {
        let base_path = remove_extra_slashes(&format!("/{}/", base_path));
        let scheme = if secure { "ftps" } else { "ftp" };
        Self {
            base_url: format!("{}://{}:{}{}", scheme, host, port, base_path),
            base_path,
            tls,
            credentials,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url_for(&self, request_path: &str) -> String {
        remove_extra_slashes_after_scheme(&self.base_url, request_path)
    }

    fn request(
        &self,
        operation: CloudOperation,
        request_path: &str,
        kind: TransferKind,
    ) -> FtpCloudRequest {
        FtpCloudRequest {
            operation,
            target: RequestTarget::new(self.url_for(request_path), kind, self.tls.clone()),
            credentials: self.credentials.clone(),
            quote: Vec::new(),
            listing: None,
        }
    }

    /// Connect, log in and list the base path
    pub fn test_server(&self) -> FtpCloudRequest {
        self.request(CloudOperation::TestServer, "/", TransferKind::BufferDownload)
    }

    pub fn list_collection(&self, path: &str) -> FtpCloudRequest {
        let request_path = remove_extra_slashes(&format!("/{}/", path));
        let mut request = self.request(
            CloudOperation::ListCollection,
            &request_path,
            TransferKind::BufferDownload,
        );
        request.listing = Some(ListingParser::new(request_path));
        request
    }

    pub fn get_file(&self, remote_path: &str, local_file: &str) -> FtpCloudRequest {
        let request_path = remove_extra_slashes(&format!("/{}", remote_path));
        let mut request = self.request(CloudOperation::Get, &request_path, TransferKind::FileDownload);
        request.target = request.target.with_local_file(local_file);
        request
    }

    pub fn put_file(&self, remote_path: &str, local_file: &str) -> FtpCloudRequest {
        let request_path = remove_extra_slashes(&format!("/{}", remote_path));
        let mut request = self.request(CloudOperation::Put, &request_path, TransferKind::FileUpload);
        request.target = request.target.with_local_file(local_file);
        request
    }

    pub fn move_resource(&self, from: &str, to: &str) -> FtpCloudRequest {
        let mut request = self.request(CloudOperation::Move, "/", TransferKind::BufferDownload);
        request.quote = vec![
            format!("RNFR {}", remove_extra_slashes(&format!("{}{}", self.base_path, from))),
            format!("RNTO {}", remove_extra_slashes(&format!("{}{}", self.base_path, to))),
        ];
        request
    }

    pub fn create_collection(&self, path: &str) -> FtpCloudRequest {
        let mut request =
            self.request(CloudOperation::MakeCollection, "/", TransferKind::BufferDownload);
        request.quote = vec![format!(
            "MKD {}",
            remove_extra_slashes(&format!("{}{}", self.base_path, path))
        )];
        request
    }
}

/// Join `base_url` and `path`, collapsing slashes in the path part only
pub(crate) fn remove_extra_slashes_after_scheme(base_url: &str, path: &str) -> String {
    match base_url.split_once("://") {
        Some((scheme, rest)) => format!(
            "{}://{}",
            scheme,
            remove_extra_slashes(&format!("{}{}", rest, path))
        ),
        None => remove_extra_slashes(&format!("{}{}", base_url, path)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> FtpCloudClient {
        FtpCloudClient::new(false, "files.example.com", 21, "/data//", TlsSettings::accept_any(), None)
    }

    #[test]
    fn test_urls() {
        let client = client();
        assert_eq!(client.base_url(), "ftp://files.example.com:21/data/");
        assert_eq!(
            client.list_collection("sub").target().url,
            "ftp://files.example.com:21/data/sub/"
        );
        assert_eq!(
            client.get_file("/sub/a.zip", "/tmp/a.zip").target().url,
            "ftp://files.example.com:21/data/sub/a.zip"
        );
        assert_eq!(client.test_server().target().url, "ftp://files.example.com:21/data/");
    }

    #[test]
    fn test_move_and_mkcol_quote_commands() {
        let client = client();
        let mv = client.move_resource("/a.zip", "old/a.zip");
        assert_eq!(mv.quote(), &["RNFR /data/a.zip".to_string(), "RNTO /data/old/a.zip".to_string()]);
        assert_eq!(mv.target().url, "ftp://files.example.com:21/data/");

        let mk = client.create_collection("new");
        assert_eq!(mk.quote(), &["MKD /data/new".to_string()]);
        assert_eq!(mk.operation(), CloudOperation::MakeCollection);
    }

    #[test]
    fn test_list_statuses() {
        let client = client();
        let list = client.list_collection("/");
        assert_eq!(list.status_for_response(450), FileIoStatus::Success);
        assert_eq!(list.status_for_response(226), FileIoStatus::Success);
        let get = client.get_file("a", "b");
        assert_eq!(get.status_for_response(450), FileIoStatus::OtherError);
        assert_eq!(get.status_for_response(550), FileIoStatus::UrlNoResource);
    }

    #[test]
    fn test_listing_entries_only_on_success() {
        let client = client();
        let mut list = client.list_collection("sub");
        list.downloaded_data(b"-rw-r--r--   1 root     other        531 Jan 29 03:26 README\r\n");
        let update = list.create_update(TransferUpdate::new(3, FileIoStatus::Success, None, 0, 0));
        let entries = update.entries.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].path, "/sub/README");

        let mut failed = client.list_collection("sub");
        let update = failed.create_update(TransferUpdate::new(4, FileIoStatus::AuthError, None, 0, 0));
        assert!(update.entries.is_none());

        let mut get = client.get_file("a", "b");
        let update = get.create_update(TransferUpdate::new(5, FileIoStatus::Success, None, 0, 0));
        assert!(update.entries.is_none());
    }
}
