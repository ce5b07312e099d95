//! Mission package orchestrator
//!
//! `MissionPackageManager` routes outbound packages to local recipients, relay
//! servers or both; downloads offered packages with a retry ladder; and
//! correlates acks with the recipients they answer. Status events are
//! delivered to the application in order by a dedicated task.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use log::{debug, error, info, warn};
use tokio::net::TcpListener;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;

use crate::error::MissionError;
use crate::mission::collaborators::Collaborators;
use crate::mission::context::{TxState, TxTransferContext, TxUploadContext, UploadState};
use crate::mission::receive::run_receive_worker;
use crate::mission::responder::Responder;
use crate::mission::types::{
    ContactUid, FileTransferAck, FileTransferRequest, MP_LOCAL_PORT_DISABLE, MpReceiveUpdate,
    MpSendUpdate, MpTransferStatus, TransferMessage,
};
use crate::mission::upload::{UploadOutcome, run_upload_worker};
use crate::settings::MpTransferSettings;
use crate::storage::hash::sha256_file;
use crate::utils::url::url_append_param;

/// Transfer name of server-only uploads
pub const SERVER_TRANSFER_NAME: &str = "serverxfer";

const UPLOAD_FAILED_DETAIL: &str = "Uploading package to TAK server failed";
const QUERY_FAILED_DETAIL: &str = "Unable to query TAK server to see if package exists";

/// Event queued for the application
#[derive(Debug)]
pub(crate) enum MpEvent {
    Send(MpSendUpdate),
    Receive(MpReceiveUpdate),
}

/// State shared by the public API and the worker tasks
pub(crate) struct Inner {
    pub(crate) our_uid: ContactUid,
    pub(crate) collab: Collaborators,
    pub(crate) tx: Arc<Mutex<TxState>>,
    pub(crate) rx_active: StdMutex<HashSet<PathBuf>>,
    callsign: StdMutex<String>,
    events: mpsc::UnboundedSender<MpEvent>,
    uploads: mpsc::UnboundedSender<TxUploadContext>,
}

impl Inner {
    pub(crate) fn callsign(&self) -> String {
        self.callsign
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn emit_send(&self, update: MpSendUpdate) {
        if self.events.send(MpEvent::Send(update)).is_err() {
            warn!("MP event task is gone; dropping send update");
        }
    }

    pub(crate) fn emit_receive(&self, update: MpReceiveUpdate) {
        if self.events.send(MpEvent::Receive(update)).is_err() {
            warn!("MP event task is gone; dropping receive update");
        }
    }

    /// Answer an offered package
    pub(crate) fn send_ack(&self, request: &FileTransferRequest, success: bool, reason: &str) {
        let ack = FileTransferAck {
            uid: request.ack_uid.clone(),
            success,
            reason: reason.to_string(),
            sender: self.our_uid.clone(),
            size: request.size,
        };
        if let Err(e) = self
            .collab
            .contacts
            .send_message(&request.sender_uid, TransferMessage::Ack(ack))
        {
            debug!("MPRX - could not ack {} to {}: {}", request.name, request.sender_uid, e);
        }
    }

    /// Offer the package of `ctx` to `contact` at `url`
    fn send_request(
        &self,
        url: &str,
        ack_uid: &str,
        ctx: &TxTransferContext,
        contact: &ContactUid,
        https_port: i32,
    ) -> Result<(), MissionError> {
        let request = FileTransferRequest {
            sha256: ctx.sha256.clone(),
            name: ctx.transfer_name.clone(),
            sender_filename: ctx.filename.clone(),
            sender_url: url.to_string(),
            size: ctx.size,
            sender_callsign: self.callsign(),
            sender_uid: self.our_uid.clone(),
            ack_uid: ack_uid.to_string(),
            peer_hosted: https_port != MP_LOCAL_PORT_DISABLE,
            https_port,
        };
        self.collab
            .contacts
            .send_message(contact, TransferMessage::Request(request))
    }

    /// Finish one relay upload and fan its result out to the recipients
    pub(crate) async fn upload_completed(&self, outcome: UploadOutcome) {
        let UploadOutcome { upload, success } = outcome;
        let id = upload.xfer_id;
        let bytes = upload.bytes_transferred;
        let mut tx = self.tx.lock().await;

        if upload.contacts.is_empty() {
            info!("MP Send: server upload for transfer {} finished, success={}", id, success);
            let (status, detail) = if success {
                (MpTransferStatus::ServerUploadSuccess, upload.url_from_server.as_str())
            } else {
                (MpTransferStatus::ServerUploadFailed, UPLOAD_FAILED_DETAIL)
            };
            self.emit_send(MpSendUpdate::new(id, None, status, Some(detail), bytes));
            let status = if success {
                MpTransferStatus::FinishedSuccess
            } else {
                MpTransferStatus::FinishedFailed
            };
            self.emit_send(MpSendUpdate::new(id, None, status, None, bytes));
        } else if !success {
            let detail = if upload.state == UploadState::Upload {
                UPLOAD_FAILED_DETAIL
            } else {
                QUERY_FAILED_DETAIL
            };
            for contact in &upload.contacts {
                self.emit_send(MpSendUpdate::new(
                    id,
                    Some(contact.clone()),
                    MpTransferStatus::ServerUploadFailed,
                    Some(detail),
                    bytes,
                ));
                self.emit_send(MpSendUpdate::new(
                    id,
                    Some(contact.clone()),
                    MpTransferStatus::FinishedFailed,
                    None,
                    0,
                ));
            }
        } else {
            for contact in &upload.contacts {
                self.emit_send(MpSendUpdate::new(
                    id,
                    Some(contact.clone()),
                    MpTransferStatus::ServerUploadSuccess,
                    Some(&upload.url_from_server),
                    bytes,
                ));
                let ack_uid = self.collab.io.create_uuid();
                let sent = match tx.transfers.get(&id) {
                    Some(ctx) => self.send_request(
                        &upload.url_from_server,
                        &ack_uid,
                        ctx,
                        contact,
                        MP_LOCAL_PORT_DISABLE,
                    ),
                    None => Err(MissionError::ContactGone),
                };
                match sent {
                    Ok(()) => {
                        self.emit_send(MpSendUpdate::new(
                            id,
                            Some(contact.clone()),
                            MpTransferStatus::AttemptInProgress,
                            None,
                            0,
                        ));
                        tx.add_outstanding_ack(id, &ack_uid, contact.clone(), false);
                    }
                    Err(e) => {
                        debug!("MP Send: request for transfer {} to {} failed: {}", id, contact, e);
                        self.emit_send(MpSendUpdate::new(
                            id,
                            Some(contact.clone()),
                            MpTransferStatus::FinishedContactGone,
                            None,
                            0,
                        ));
                    }
                }
            }
        }

        tx.complete_upload(id, upload.id);
    }
}

/// Orchestrator for mission package transfers
pub struct MissionPackageManager {
    inner: Arc<Inner>,
    server: Mutex<Option<Responder>>,
    acks: mpsc::UnboundedSender<FileTransferAck>,
    requests: mpsc::UnboundedSender<(Option<String>, FileTransferRequest)>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl MissionPackageManager {
    /// Create the orchestrator and start its worker tasks
    ///
    /// # Arguments
    /// * `our_uid` - Contact uid of this node
    /// * `collab` - Contacts, endpoints, interfaces, files and the application
    /// * `settings` - Settings for transfers created from now on
    pub fn new(our_uid: ContactUid, collab: Collaborators, settings: MpTransferSettings) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (uploads_tx, uploads_rx) = mpsc::unbounded_channel();
        let (acks_tx, acks_rx) = mpsc::unbounded_channel();
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(Inner {
            our_uid,
            collab,
            tx: Arc::new(Mutex::new(TxState::new(settings))),
            rx_active: StdMutex::new(HashSet::new()),
            callsign: StdMutex::new(String::new()),
            events: events_tx,
            uploads: uploads_tx,
        });

        let tasks = vec![
            tokio::spawn(run_event_worker(inner.collab.clone(), events_rx)),
            tokio::spawn(run_ack_worker(inner.clone(), acks_rx)),
            tokio::spawn(run_upload_worker(inner.clone(), uploads_rx)),
            tokio::spawn(run_receive_worker(inner.clone(), requests_rx)),
        ];

        Self {
            inner,
            server: Mutex::new(None),
            acks: acks_tx,
            requests: requests_tx,
            tasks: StdMutex::new(tasks),
        }
    }

    pub fn set_callsign(&self, callsign: &str) {
        *self
            .inner
            .callsign
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = callsign.to_string();
    }

    /// Settings for transfers created after this call
    pub async fn set_mp_transfer_settings(&self, settings: MpTransferSettings) {
        self.inner.tx.lock().await.settings = settings;
    }

    /// Serve local packages on `port`, or stop serving with `MP_LOCAL_PORT_DISABLE`
    ///
    /// # Behavior
    /// * Setting the current port does nothing
    /// * Otherwise the running server stops and every local recipient is
    ///   reported `FinishedDisabledLocally`
    /// * A port outside 1..=65535 or a failed bind leaves serving disabled
    pub async fn set_local_port(&self, port: i32) -> Result<(), MissionError> {
        // Serializes port changes; the transmit state is never held across
        // the server shutdown or the bind
        let mut server = self.server.lock().await;
        let old = {
            let mut tx = self.inner.tx.lock().await;
            if tx.web_port == port {
                return Ok(());
            }
            tx.web_port = MP_LOCAL_PORT_DISABLE;
            for update in tx.abort_local_transfers() {
                self.inner.emit_send(update);
            }
            server.take()
        };
        if let Some(old) = old {
            old.stop().await;
        }

        if port == MP_LOCAL_PORT_DISABLE {
            return Ok(());
        }
        let port = u16::try_from(port)
            .ok()
            .filter(|p| *p != 0)
            .ok_or_else(|| MissionError::IllegalArgument("Web server port out of range".into()))?;

        let listener = TcpListener::bind(("0.0.0.0", port))
            .await
            .map_err(MissionError::LocalServer)?;
        *server = Some(Responder::start(
            listener,
            Arc::downgrade(&self.inner.tx),
            self.inner.collab.files.clone(),
        ));
        self.inner.tx.lock().await.web_port = i32::from(port);
        info!("MP web server listening on port {}", port);
        Ok(())
    }

    /// Port advertised for https retrieval of local packages
    pub async fn set_local_https_port(&self, port: i32) {
        let mut tx = self.inner.tx.lock().await;
        if tx.https_port == port {
            return;
        }
        for update in tx.abort_local_transfers() {
            self.inner.emit_send(update);
        }
        tx.https_port = port;
    }

    /// Port the local server is bound to, or `MP_LOCAL_PORT_DISABLE`
    pub async fn local_port(&self) -> i32 {
        self.inner.tx.lock().await.web_port
    }

    async fn describe_file(&self, file: &Path) -> Result<(u64, String), MissionError> {
        let files = &*self.inner.collab.files;
        let size = files
            .size(file)
            .await
            .map_err(|e| MissionError::IllegalArgument(format!("{}: {}", file.display(), e)))?;
        let hash = sha256_file(files, file)
            .await
            .map_err(|e| MissionError::IllegalArgument(format!("{}: {}", file.display(), e)))?;
        Ok((size, hash))
    }

    fn new_context(
        tx: &mut TxState,
        file: &Path,
        filename: &str,
        transfer_name: &str,
        size: u64,
        sha256: String,
    ) -> TxTransferContext {
        TxTransferContext {
            id: tx.next_xfer_id(),
            settings: tx.settings.clone(),
            file: file.to_path_buf(),
            filename: filename.to_string(),
            transfer_name: transfer_name.to_string(),
            size,
            sha256,
            pending_uploads: Vec::new(),
            uploads: HashSet::new(),
            outstanding_acks: Default::default(),
            local_acks: HashSet::new(),
            local_contacts: Vec::new(),
        }
    }

    fn add_upload(tx: &mut TxState, ctx: &mut TxTransferContext, endpoint: String, contacts: Vec<ContactUid>) {
        let upload = TxUploadContext {
            id: tx.next_upload_id(),
            xfer_id: ctx.id,
            endpoint,
            contacts,
            file: ctx.file.clone(),
            filename: ctx.filename.clone(),
            sha256: ctx.sha256.clone(),
            size: ctx.size,
            settings: ctx.settings.clone(),
            state: UploadState::Check,
            url_from_server: String::new(),
            bytes_transferred: 0,
        };
        ctx.uploads.insert(upload.id);
        ctx.pending_uploads.push(upload);
    }

    /// Prepare a package for the given recipients
    ///
    /// # Returns
    /// The transfer id and the recipients that cannot be reached at all.
    /// `NoReachableDestinations` if no recipient can be reached.
    pub async fn send_file_init(
        &self,
        destinations: &[ContactUid],
        file: &Path,
        filename: &str,
        transfer_name: &str,
    ) -> Result<(i32, Vec<ContactUid>), MissionError> {
        let (size, sha256) = self.describe_file(file).await?;
        let contacts = &self.inner.collab.contacts;

        let mut tx = self.inner.tx.lock().await;
        let mut gone = Vec::new();
        let mut by_endpoint: BTreeMap<String, Vec<ContactUid>> = BTreeMap::new();
        let mut local = Vec::new();
        for dest in destinations {
            if let Some(endpoint) = contacts.stream_endpoint(dest) {
                if tx.settings.is_server_transfer_enabled() {
                    debug!("MP Send to {} going via streaming ep {}", dest, endpoint);
                    by_endpoint.entry(endpoint).or_default().push(dest.clone());
                    continue;
                }
                debug!(
                    "MP Send to {} would be routed via streaming ep {}, but streaming transfers are disabled",
                    dest, endpoint
                );
            }
            if tx.web_port != MP_LOCAL_PORT_DISABLE && contacts.has_contact(dest) {
                debug!("MP Send to {} going via local transfer", dest);
                local.push((dest.clone(), self.inner.collab.io.create_uuid()));
            } else {
                gone.push(dest.clone());
            }
        }

        if local.is_empty() && by_endpoint.is_empty() {
            return Err(MissionError::NoReachableDestinations(gone));
        }

        let mut ctx = Self::new_context(&mut tx, file, filename, transfer_name, size, sha256);
        for (endpoint, contacts) in by_endpoint {
            Self::add_upload(&mut tx, &mut ctx, endpoint, contacts);
        }
        ctx.local_contacts = local;
        let id = ctx.id;
        info!(
            "MP Send: transfer {} of {} created ({} local, {} uploads, {} gone)",
            id,
            file.display(),
            ctx.local_contacts.len(),
            ctx.pending_uploads.len(),
            gone.len()
        );
        tx.transfers.insert(id, ctx);
        Ok((id, gone))
    }

    /// Prepare an upload of a package to a streaming endpoint only
    pub async fn upload_file_init(
        &self,
        streaming_endpoint: &str,
        file: &Path,
        filename: &str,
    ) -> Result<i32, MissionError> {
        if self
            .inner
            .collab
            .endpoints
            .endpoint_address(streaming_endpoint)
            .is_none()
        {
            return Err(MissionError::ContactGone);
        }
        let (size, sha256) = self.describe_file(file).await?;

        let mut tx = self.inner.tx.lock().await;
        let mut ctx = Self::new_context(&mut tx, file, filename, SERVER_TRANSFER_NAME, size, sha256);
        Self::add_upload(&mut tx, &mut ctx, streaming_endpoint.to_string(), Vec::new());
        let id = ctx.id;
        info!("MP Send: server upload {} of {} to {}", id, file.display(), streaming_endpoint);
        tx.transfers.insert(id, ctx);
        Ok(id)
    }

    /// URL the local server publishes transfer `id` under, if it can be built
    fn local_url(&self, web_port: i32, id: i32) -> Option<String> {
        if web_port == MP_LOCAL_PORT_DISABLE {
            return None;
        }
        let ip = self.inner.collab.interfaces.primary_address()?;
        let url = format!("http://{}:{}/getfile?file={}", ip, web_port, id);
        Some(url_append_param(&url, "sender", &self.inner.callsign()))
    }

    /// Start a prepared transfer
    pub async fn send_file_start(&self, id: i32) -> Result<(), MissionError> {
        let mut tx = self.inner.tx.lock().await;
        let web_port = tx.web_port;
        let https_port = tx.https_port;
        let Some(ctx) = tx.transfers.get_mut(&id) else {
            return Err(MissionError::IllegalArgument(format!("unknown transfer id {}", id)));
        };

        for upload in ctx.pending_uploads.drain(..) {
            if upload.contacts.is_empty() {
                self.inner.emit_send(MpSendUpdate::new(
                    id,
                    None,
                    MpTransferStatus::ServerUploadPending,
                    None,
                    0,
                ));
            }
            for contact in &upload.contacts {
                self.inner.emit_send(MpSendUpdate::new(
                    id,
                    Some(contact.clone()),
                    MpTransferStatus::ServerUploadPending,
                    None,
                    0,
                ));
            }
            if self.inner.uploads.send(upload).is_err() {
                error!("MP upload task is gone");
            }
        }

        let local_url = self.local_url(web_port, id);
        let local_contacts = std::mem::take(&mut ctx.local_contacts);
        let mut accepted = Vec::new();
        for (contact, ack_uid) in local_contacts {
            let sent = match &local_url {
                Some(url) => self.inner.send_request(url, &ack_uid, ctx, &contact, https_port),
                None => Err(MissionError::ContactGone),
            };
            if let Err(e) = sent {
                let status = if web_port == MP_LOCAL_PORT_DISABLE {
                    error!("MP Send to local contact failed - transfers disabled locally");
                    MpTransferStatus::FinishedDisabledLocally
                } else {
                    error!("MP Send to local contact failed - {}", e);
                    MpTransferStatus::FinishedContactGone
                };
                self.inner
                    .emit_send(MpSendUpdate::new(id, Some(contact), status, None, 0));
                continue;
            }
            self.inner.emit_send(MpSendUpdate::new(
                id,
                Some(contact.clone()),
                MpTransferStatus::AttemptInProgress,
                None,
                0,
            ));
            accepted.push((contact, ack_uid));
        }
        for (contact, ack_uid) in accepted {
            tx.add_outstanding_ack(id, &ack_uid, contact, true);
        }
        tx.free_if_done(id);
        Ok(())
    }

    /// Hand a mission package message to the orchestrator
    ///
    /// # Arguments
    /// * `source_endpoint` - Streaming endpoint the message arrived on, if any
    pub fn message_received(&self, source_endpoint: Option<&str>, message: TransferMessage) {
        let queued = match message {
            TransferMessage::Ack(ack) => self.acks.send(ack).is_ok(),
            TransferMessage::Request(request) => self
                .requests
                .send((source_endpoint.map(str::to_string), request))
                .is_ok(),
        };
        if !queued {
            warn!("MP worker task is gone; dropping message");
        }
    }

    /// Number of outbound transfers still tracked
    pub async fn active_transfers(&self) -> usize {
        self.inner.tx.lock().await.transfers.len()
    }

    /// Stop the local server and every worker task
    pub async fn shutdown(&self) {
        if let Some(server) = self.server.lock().await.take() {
            server.stop().await;
        }
        let tasks: Vec<_> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for task in tasks {
            task.abort();
            let _ = task.await;
        }
    }
}

impl Drop for MissionPackageManager {
    fn drop(&mut self) {
        if let Some(server) = self.server.get_mut().take() {
            server.abort();
        }
        for task in self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
        {
            task.abort();
        }
    }
}

/// Deliver queued status events in order
async fn run_event_worker(collab: Collaborators, mut events: mpsc::UnboundedReceiver<MpEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            MpEvent::Send(update) => collab.io.send_status_update(update),
            MpEvent::Receive(update) => collab.io.receive_status_update(update),
        }
    }
    debug!("MP event task exiting");
}

/// Match acks against outstanding recipients
async fn run_ack_worker(inner: Arc<Inner>, mut acks: mpsc::UnboundedReceiver<FileTransferAck>) {
    while let Some(ack) = acks.recv().await {
        let update = inner.tx.lock().await.take_ack(&ack);
        match update {
            Some(update) => {
                info!(
                    "MP Send: ack {} for transfer {} success={}",
                    ack.uid, update.xfer_id, ack.success
                );
                inner.emit_send(update);
            }
            None => debug!("MP Send: ignoring ack {} with no outstanding transfer", ack.uid),
        }
    }
    debug!("MP ack task exiting");
}
