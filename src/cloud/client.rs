//! Cloud clients
//!
//! A `CloudClient` binds one server configuration to the shared engine. Every
//! operation is created with an `*_init` call and runs once started.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use log::info;

use crate::cloud::ftp::{FtpCloudClient, FtpCloudRequest};
use crate::cloud::webdav::{WebDavClient, WebDavRequest};
use crate::cloud::{CloudIo, CloudIoUpdate, CloudOperation, CloudProtocol};
use crate::error::TransferError;
use crate::transfer::{
    FileIoStatus, RequestOptions, RequestTarget, TransferUpdate, UrlRequest, UrlRequestIo,
    UrlRequestManager,
};

/// Request type run by the cloud engine
#[derive(Debug)]
pub enum CloudRequest {
    Ftp(FtpCloudRequest),
    WebDav(WebDavRequest),
}

impl CloudRequest {
    pub fn operation(&self) -> CloudOperation {
        match self {
            CloudRequest::Ftp(r) => r.operation(),
            CloudRequest::WebDav(r) => r.operation(),
        }
    }
}

impl UrlRequest for CloudRequest {
    type Update = CloudIoUpdate;

    fn target(&self) -> &RequestTarget {
        match self {
            CloudRequest::Ftp(r) => r.target(),
            CloudRequest::WebDav(r) => r.target(),
        }
    }

    fn configure(&self, options: &mut RequestOptions) {
        match self {
            CloudRequest::Ftp(r) => r.configure(options),
            CloudRequest::WebDav(r) => r.configure(options),
        }
    }

    fn status_for_response(&self, code: u32) -> FileIoStatus {
        match self {
            CloudRequest::Ftp(r) => r.status_for_response(code),
            CloudRequest::WebDav(r) => r.status_for_response(code),
        }
    }

    fn downloaded_data(&mut self, data: &[u8]) {
        match self {
            CloudRequest::Ftp(r) => r.downloaded_data(data),
            CloudRequest::WebDav(r) => r.downloaded_data(data),
        }
    }

    fn create_update(&mut self, update: TransferUpdate) -> CloudIoUpdate {
        match self {
            CloudRequest::Ftp(r) => r.create_update(update),
            CloudRequest::WebDav(r) => r.create_update(update),
        }
    }
}

#[derive(Debug)]
pub(crate) enum Adapter {
    Ftp(FtpCloudClient),
    WebDav(WebDavClient),
}

struct CloudSink(Arc<dyn CloudIo>);

impl UrlRequestIo<CloudIoUpdate> for CloudSink {
    fn url_request_update(&self, update: CloudIoUpdate) {
        self.0.cloud_operation_update(update);
    }
}

/// Handle to one configured cloud server
pub struct CloudClient {
    id: u64,
    protocol: CloudProtocol,
    adapter: Adapter,
    engine: Arc<UrlRequestManager<CloudRequest>>,
    sink: Arc<CloudSink>,
    destroyed: AtomicBool,
}

impl CloudClient {
    pub(crate) fn new(
        id: u64,
        protocol: CloudProtocol,
        adapter: Adapter,
        engine: Arc<UrlRequestManager<CloudRequest>>,
        io: Arc<dyn CloudIo>,
    ) -> Self {
        Self {
            id,
            protocol,
            adapter,
            engine,
            sink: Arc::new(CloudSink(io)),
            destroyed: AtomicBool::new(false),
        }
    }

    /// Engine owner id of this client
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn protocol(&self) -> CloudProtocol {
        self.protocol
    }

    pub(crate) fn mark_destroyed(&self) {
        self.destroyed.store(true, Ordering::SeqCst);
    }

    fn submit(&self, request: CloudRequest) -> Result<i32, TransferError> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(TransferError::UnknownClient);
        }
        let operation = request.operation();
        let url = request.target().url.clone();
        let id = self.engine.init_request(self.id, self.sink.clone(), request);
        info!(
            "Cloud client {}: created {} operation {} for {}",
            self.id, operation, id, url
        );
        Ok(id)
    }

    fn build(
        &self,
        ftp: impl FnOnce(&FtpCloudClient) -> FtpCloudRequest,
        dav: impl FnOnce(&WebDavClient) -> WebDavRequest,
    ) -> Result<i32, TransferError> {
        let request = match &self.adapter {
            Adapter::Ftp(client) => CloudRequest::Ftp(ftp(client)),
            Adapter::WebDav(client) => CloudRequest::WebDav(dav(client)),
        };
        self.submit(request)
    }

    /// Create a connectivity and credentials check
    pub fn test_server_init(&self) -> Result<i32, TransferError> {
        self.build(|c| c.test_server(), |c| c.test_server())
    }

    pub fn list_init(&self, path: &str) -> Result<i32, TransferError> {
        self.build(|c| c.list_collection(path), |c| c.list_collection(path))
    }

    /// Create a download of `remote_path` into `local_file`
    pub fn get_init(&self, remote_path: &str, local_file: &str) -> Result<i32, TransferError> {
        self.build(
            |c| c.get_file(remote_path, local_file),
            |c| c.get_file(remote_path, local_file),
        )
    }

    /// Create an upload of `local_file` to `remote_path`
    pub fn put_init(&self, remote_path: &str, local_file: &str) -> Result<i32, TransferError> {
        self.build(
            |c| c.put_file(remote_path, local_file),
            |c| c.put_file(remote_path, local_file),
        )
    }

    pub fn move_init(&self, from: &str, to: &str) -> Result<i32, TransferError> {
        self.build(|c| c.move_resource(from, to), |c| c.move_resource(from, to))
    }

    pub fn create_collection_init(&self, path: &str) -> Result<i32, TransferError> {
        self.build(|c| c.create_collection(path), |c| c.create_collection(path))
    }

    /// Start an operation created by this client
    pub fn start_operation(&self, id: i32) -> Result<(), TransferError> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(TransferError::UnknownClient);
        }
        self.engine.start_owned_transfer(self.id, id)
    }

    /// Cancel one operation; no further update is delivered for it
    ///
    /// Ids belonging to other clients are ignored.
    pub async fn cancel_operation(&self, id: i32) {
        self.engine.cancel_owned(self.id, id).await;
    }
}

impl std::fmt::Debug for CloudClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudClient")
            .field("id", &self.id)
            .field("protocol", &self.protocol)
            .field("adapter", &self.adapter)
            .finish()
    }
}
