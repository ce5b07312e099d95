//! WebDAV cloud client for ownCloud-style servers
//!
//! Files live below `<base>/remote.php/webdav`; `test_server` fetches the
//! capabilities document to read the server version.

use crate::cloud::davxml::{DavDocument, DavFeed, DavParser};
use crate::cloud::ftp::remove_extra_slashes_after_scheme;
use crate::cloud::{CloudIoUpdate, CloudOperation, remove_extra_slashes};
use crate::error::handlers::status_for_response_code;
use crate::transfer::{
    Credentials, FileIoStatus, RequestOptions, RequestTarget, TransferKind, TransferUpdate,
    UrlRequest,
};
use crate::transport::tls::TlsSettings;

const SERVICE_PATH: &str = "/remote.php/webdav";
const CAPABILITIES_PATH: &str = "/ocs/v1.php/cloud/capabilities";

/// Request for one WebDAV cloud operation
#[derive(Debug)]
pub struct WebDavRequest {
    operation: CloudOperation,
    target: RequestTarget,
    credentials: Option<Credentials>,
    service_path: String,
    request_path: String,
    destination: Option<String>,
    /// Present for operations whose response body is parsed
    parser: Option<DavParser>,
    feed: DavFeed,
}

impl WebDavRequest {
    pub fn operation(&self) -> CloudOperation {
        self.operation
    }

    fn document(&self) -> Option<DavDocument> {
        match self.operation {
            CloudOperation::ListCollection => Some(DavDocument::Listing),
            CloudOperation::TestServer => Some(DavDocument::Capabilities),
            _ => None,
        }
    }
}

impl UrlRequest for WebDavRequest {
    type Update = CloudIoUpdate;

    fn target(&self) -> &RequestTarget {
        &self.target
    }

    fn configure(&self, options: &mut RequestOptions) {
        options.credentials = self.credentials.clone();
        match self.operation {
            CloudOperation::ListCollection => {
                options.method = Some("PROPFIND".into());
                options.headers.push(("Depth".into(), "1".into()));
            }
            CloudOperation::Move => {
                options.method = Some("MOVE".into());
                if let Some(destination) = &self.destination {
                    options.headers.push(("Destination".into(), destination.clone()));
                }
            }
            CloudOperation::MakeCollection => options.method = Some("MKCOL".into()),
            CloudOperation::Get | CloudOperation::Put | CloudOperation::TestServer => {}
        }
    }

    fn status_for_response(&self, code: u32) -> FileIoStatus {
        status_for_response_code(code)
    }

    fn downloaded_data(&mut self, data: &[u8]) {
        if let Some(parser) = self.parser.as_mut() {
            self.feed.feed(parser, data);
        }
    }

    fn create_update(&mut self, mut update: TransferUpdate) -> CloudIoUpdate {
        let mut entries = None;
        let parser = match update.status {
            FileIoStatus::Success => self.parser.take(),
            _ => None,
        };
        if let Some(mut parser) = parser {
            self.feed.finish(&mut parser);
            if let Some(error) = parser.error() {
                update.status = FileIoStatus::OtherError;
                update.additional_info = Some(error.to_string());
            } else if self.operation == CloudOperation::ListCollection {
                entries = Some(parser.take_entries());
            } else {
                update.additional_info = Some(parser.version().to_string());
            }
        }
        CloudIoUpdate {
            operation: self.operation,
            base: update,
            entries,
        }
    }
}

/// Builds WebDAV requests for one server and base path
#[derive(Debug, Clone)]
pub struct WebDavClient {
    base_url: String,
    service_path: String,
    capabilities_path: String,
    tls: TlsSettings,
    credentials: Option<Credentials>,
}

impl WebDavClient {
    pub fn new(
        secure: bool,
        host: &str,
        port: u16,
        base_path: &str,
        tls: TlsSettings,
        credentials: Option<Credentials>,
    ) -> Self {
        let scheme = if secure { "https" } else { "http" };
        Self {
            base_url: format!("{}://{}:{}", scheme, host, port),
            service_path: remove_extra_slashes(&format!("/{}{}", base_path, SERVICE_PATH)),
            capabilities_path: remove_extra_slashes(&format!("/{}{}", base_path, CAPABILITIES_PATH)),
            tls,
            credentials,
        }
    }

    pub fn service_path(&self) -> &str {
        &self.service_path
    }

    fn service_url(&self, request_path: &str) -> String {
        remove_extra_slashes_after_scheme(&self.base_url, &format!("{}{}", self.service_path, request_path))
    }

    fn request(
        &self,
        operation: CloudOperation,
        url: String,
        request_path: String,
        kind: TransferKind,
    ) -> WebDavRequest {
        let mut request = WebDavRequest {
            operation,
            target: RequestTarget::new(url, kind, self.tls.clone()),
            credentials: self.credentials.clone(),
            service_path: self.service_path.clone(),
            request_path,
            destination: None,
            parser: None,
            feed: DavFeed::new(),
        };
        request.parser = request
            .document()
            .map(|document| DavParser::new(document, &request.service_path, &request.request_path));
        request
    }

    /// Fetch the capabilities document; success reports the server version
    pub fn test_server(&self) -> WebDavRequest {
        let url = remove_extra_slashes_after_scheme(&self.base_url, &self.capabilities_path);
        self.request(CloudOperation::TestServer, url, "/".into(), TransferKind::BufferDownload)
    }

    pub fn list_collection(&self, path: &str) -> WebDavRequest {
        let request_path = remove_extra_slashes(&format!("/{}/", path));
        let url = self.service_url(&request_path);
        self.request(CloudOperation::ListCollection, url, request_path, TransferKind::BufferDownload)
    }

    pub fn get_file(&self, remote_path: &str, local_file: &str) -> WebDavRequest {
        let request_path = remove_extra_slashes(&format!("/{}", remote_path));
        let url = self.service_url(&request_path);
        let mut request = self.request(CloudOperation::Get, url, request_path, TransferKind::FileDownload);
        request.target = request.target.with_local_file(local_file);
        request
    }

    pub fn put_file(&self, remote_path: &str, local_file: &str) -> WebDavRequest {
        let request_path = remove_extra_slashes(&format!("/{}", remote_path));
        let url = self.service_url(&request_path);
        let mut request = self.request(CloudOperation::Put, url, request_path, TransferKind::FileUpload);
        request.target = request.target.with_local_file(local_file);
        request
    }

    /// `MOVE` with an absolute `Destination` inside the service path
    ///
    /// The header carries the full URL since RFC 4918 section 10.3 defines
    /// `Destination` as an absolute URI.
    pub fn move_resource(&self, from: &str, to: &str) -> WebDavRequest {
        let from_path = remove_extra_slashes(&format!("/{}", from));
        let to_path = remove_extra_slashes(&format!("/{}", to));
        let url = self.service_url(&from_path);
        let mut request = self.request(CloudOperation::Move, url, from_path, TransferKind::BufferDownload);
        request.destination = Some(self.service_url(&to_path));
        request
    }

    pub fn create_collection(&self, path: &str) -> WebDavRequest {
        let request_path = remove_extra_slashes(&format!("/{}", path));
        let url = self.service_url(&request_path);
        self.request(CloudOperation::MakeCollection, url, request_path, TransferKind::BufferDownload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::CollectionEntryKind;

    fn client() -> WebDavClient {
        WebDavClient::new(true, "cloud.example.com", 443, "owncloud", TlsSettings::accept_any(), None)
    }

    #[test]
    fn test_paths() {
        let client = client();
        assert_eq!(client.service_path(), "/owncloud/remote.php/webdav");
        assert_eq!(
            client.list_collection("docs").target().url,
            "https://cloud.example.com:443/owncloud/remote.php/webdav/docs/"
        );
        assert_eq!(
            client.test_server().target().url,
            "https://cloud.example.com:443/owncloud/ocs/v1.php/cloud/capabilities"
        );
    }

    #[test]
    fn test_list_uses_propfind_depth_one() {
        let request = client().list_collection("/");
        let mut options = RequestOptions::default();
        request.configure(&mut options);
        assert_eq!(options.method.as_deref(), Some("PROPFIND"));
        assert_eq!(options.headers, vec![("Depth".to_string(), "1".to_string())]);
    }

    #[test]
    fn test_move_destination_is_absolute() {
        let request = client().move_resource("a.zip", "/old/a.zip");
        let mut options = RequestOptions::default();
        request.configure(&mut options);
        assert_eq!(options.method.as_deref(), Some("MOVE"));
        assert_eq!(
            options.headers,
            vec![(
                "Destination".to_string(),
                "https://cloud.example.com:443/owncloud/remote.php/webdav/old/a.zip".to_string()
            )]
        );
    }

    #[test]
    fn test_listing_parsed_on_success() {
        let mut request = client().list_collection("sub");
        request.downloaded_data(
            br#"<d:multistatus xmlns:d="DAV:"><d:response><d:href>/owncloud/remote.php/webdav/sub/</d:href></d:response><d:response><d:href>/owncloud/remote.php/webdav/sub/x.zip</d:href><d:propstat><d:prop><d:getcontentlength>9</d:getcontentlength></d:prop></d:propstat></d:response></d:multistatus>"#,
        );
        let update = request.create_update(TransferUpdate::new(1, FileIoStatus::Success, None, 0, 0));
        let entries = update.entries.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].path, "/sub/x.zip");
        assert_eq!(entries[0].size, Some(9));
    }

    #[test]
    fn test_bad_xml_becomes_other_error() {
        let mut request = client().list_collection("sub");
        request.downloaded_data(b"<d:multistatus xmlns:d=\"DAV:\"><d:response>");
        let update = request.create_update(TransferUpdate::new(1, FileIoStatus::Success, None, 0, 0));
        assert_eq!(update.base.status, FileIoStatus::OtherError);
        assert_eq!(update.base.additional_info.as_deref(), Some("XML parsing error"));
        assert!(update.entries.is_none());
    }

    #[test]
    fn test_server_reports_version() {
        let mut request = client().test_server();
        request.downloaded_data(b"<ocs><data><version><string>10.2.1</string></version></data></ocs>");
        let update = request.create_update(TransferUpdate::new(1, FileIoStatus::Success, None, 0, 0));
        assert_eq!(update.base.status, FileIoStatus::Success);
        assert_eq!(update.base.additional_info.as_deref(), Some("10.2.1"));
    }

    #[test]
    fn test_listing_split_across_chunks() {
        let body: &[u8] = br#"<d:multistatus xmlns:d="DAV:"><d:response><d:href>/owncloud/remote.php/webdav/sub/a.zip</d:href><d:propstat><d:prop><d:getcontentlength>17</d:getcontentlength></d:prop></d:propstat></d:response><d:response><d:href>/owncloud/remote.php/webdav/sub/b/</d:href><d:propstat><d:prop><d:resourcetype><d:collection/></d:resourcetype></d:prop></d:propstat></d:response></d:multistatus>"#;
        let mut request = client().list_collection("sub");
        for chunk in body.chunks(13) {
            request.downloaded_data(chunk);
        }
        let update = request.create_update(TransferUpdate::new(1, FileIoStatus::Success, None, 0, 0));
        assert_eq!(update.base.status, FileIoStatus::Success);
        let entries = update.entries.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].path, "/sub/a.zip");
        assert_eq!(entries[0].size, Some(17));
        assert_eq!(entries[1].path, "/sub/b/");
        assert_eq!(entries[1].kind, CollectionEntryKind::Collection);
    }

    #[test]
    fn test_failed_listing_skips_parsing() {
        let mut request = client().list_collection("sub");
        request.downloaded_data(b"<html><body>Not Found");
        let update = request.create_update(TransferUpdate::new(1, FileIoStatus::UrlNoResource, None, 0, 0));
        assert_eq!(update.base.status, FileIoStatus::UrlNoResource);
        assert!(update.entries.is_none());
    }
}
