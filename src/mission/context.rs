//! Mission package transfer contexts
//!
//! `TxState` is the outbound table shared by the orchestrator's public API,
//! its ack and upload workers and the embedded responder. `RxTransferContext`
//! carries the retry ladder of one inbound download.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use log::debug;

use crate::mission::types::{
    ContactUid, FileTransferAck, FileTransferRequest, MP_LOCAL_PORT_DISABLE, MpSendUpdate,
    MpTransferStatus,
};
use crate::settings::MpTransferSettings;
use crate::utils::url::{url_replace_host, url_replace_port};

/// Step of the relay upload protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadState {
    Check,
    Upload,
    Toolset,
}

/// Upload of one package to one streaming endpoint
#[derive(Debug, Clone)]
pub struct TxUploadContext {
    pub id: u64,
    pub xfer_id: i32,
    pub endpoint: String,
    /// Recipients reached through the endpoint; empty for server-only uploads
    pub contacts: Vec<ContactUid>,
    pub file: PathBuf,
    pub filename: String,
    pub sha256: String,
    pub size: u64,
    pub settings: MpTransferSettings,
    pub state: UploadState,
    pub url_from_server: String,
    pub bytes_transferred: u64,
}

/// Outbound transfer of one package
#[derive(Debug)]
pub struct TxTransferContext {
    pub id: i32,
    pub settings: MpTransferSettings,
    pub file: PathBuf,
    pub filename: String,
    pub transfer_name: String,
    pub size: u64,
    pub sha256: String,
    /// Uploads created but not yet handed to the upload worker
    pub pending_uploads: Vec<TxUploadContext>,
    /// Ids of every upload not yet completed
    pub uploads: HashSet<u64>,
    /// Ack uid to the recipient it was issued for
    pub outstanding_acks: HashMap<String, ContactUid>,
    /// Subset of `outstanding_acks` served by the local web server
    pub local_acks: HashSet<String>,
    /// Local recipients and their ack uids, until the transfer starts
    pub local_contacts: Vec<(ContactUid, String)>,
}

impl TxTransferContext {
    /// Nothing left to wait for
    pub fn is_done(&self) -> bool {
        self.uploads.is_empty() && self.outstanding_acks.is_empty()
    }
}

/// Outbound table and the settings that shape new transfers
#[derive(Debug)]
pub struct TxState {
    pub transfers: HashMap<i32, TxTransferContext>,
    pub acks_to_ids: HashMap<String, i32>,
    pub settings: MpTransferSettings,
    pub web_port: i32,
    pub https_port: i32,
    next_xfer_id: i32,
    next_upload_id: u64,
}

impl Default for TxState {
    fn default() -> Self {
        Self::new(MpTransferSettings::default())
    }
}

impl TxState {
    pub fn new(settings: MpTransferSettings) -> Self {
        Self {
            transfers: HashMap::new(),
            acks_to_ids: HashMap::new(),
            settings,
            web_port: MP_LOCAL_PORT_DISABLE,
            https_port: MP_LOCAL_PORT_DISABLE,
            next_xfer_id: 1,
            next_upload_id: 1,
        }
    }

    pub fn next_xfer_id(&mut self) -> i32 {
        let id = self.next_xfer_id;
        self.next_xfer_id += 1;
        id
    }

    pub fn next_upload_id(&mut self) -> u64 {
        let id = self.next_upload_id;
        self.next_upload_id += 1;
        id
    }

    /// Record an ack issued for `contact` of transfer `xfer_id`
    pub fn add_outstanding_ack(&mut self, xfer_id: i32, ack_uid: &str, contact: ContactUid, local: bool) {
        if let Some(ctx) = self.transfers.get_mut(&xfer_id) {
            ctx.outstanding_acks.insert(ack_uid.to_string(), contact);
            if local {
                ctx.local_acks.insert(ack_uid.to_string());
            }
            self.acks_to_ids.insert(ack_uid.to_string(), xfer_id);
        }
    }

    /// Drop the transfer if nothing is outstanding
    ///
    /// # Returns
    /// `true` if the transfer was removed by this call
    pub fn free_if_done(&mut self, xfer_id: i32) -> bool {
        let done = self
            .transfers
            .get(&xfer_id)
            .is_some_and(TxTransferContext::is_done);
        if done {
            self.transfers.remove(&xfer_id);
            debug!("MP Send: transfer {} complete, context released", xfer_id);
        }
        done
    }

    /// Consume an ack and produce the recipient's terminal update
    ///
    /// Unknown or already consumed ack uids yield `None`.
    pub fn take_ack(&mut self, ack: &FileTransferAck) -> Option<MpSendUpdate> {
        let xfer_id = self.acks_to_ids.remove(&ack.uid)?;
        let ctx = self.transfers.get_mut(&xfer_id)?;
        let contact = ctx.outstanding_acks.remove(&ack.uid)?;
        ctx.local_acks.remove(&ack.uid);
        self.free_if_done(xfer_id);

        let (status, bytes) = if ack.success {
            (MpTransferStatus::FinishedSuccess, ack.size)
        } else {
            (MpTransferStatus::FinishedFailed, 0)
        };
        Some(MpSendUpdate::new(
            xfer_id,
            Some(contact),
            status,
            Some(&ack.reason),
            bytes,
        ))
    }

    /// Abandon every recipient served by the local web server
    pub fn abort_local_transfers(&mut self) -> Vec<MpSendUpdate> {
        let mut updates = Vec::new();
        let mut finished = Vec::new();
        for (id, ctx) in self.transfers.iter_mut() {
            for ack in ctx.local_acks.drain() {
                if let Some(contact) = ctx.outstanding_acks.remove(&ack) {
                    updates.push(MpSendUpdate::new(
                        *id,
                        Some(contact),
                        MpTransferStatus::FinishedDisabledLocally,
                        None,
                        0,
                    ));
                }
                self.acks_to_ids.remove(&ack);
            }
            if ctx.is_done() {
                finished.push(*id);
            }
        }
        for id in finished {
            self.free_if_done(id);
        }
        updates
    }

    /// Remove a completed upload from its transfer
    ///
    /// # Returns
    /// `true` if the transfer was released as a result
    pub fn complete_upload(&mut self, xfer_id: i32, upload_id: u64) -> bool {
        match self.transfers.get_mut(&xfer_id) {
            Some(ctx) => {
                ctx.uploads.remove(&upload_id);
                self.free_if_done(xfer_id)
            }
            None => false,
        }
    }

    /// File and size served for `xfer_id`
    pub fn served_file(&self, xfer_id: i32) -> Option<(PathBuf, u64)> {
        self.transfers
            .get(&xfer_id)
            .map(|ctx| (ctx.file.clone(), ctx.size))
    }
}

/// What to do after a failed download attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Try the alternate URL right away
    Alternate,
    /// Revert to the sender URL after the retry delay
    RetryLater,
    GiveUp,
}

/// Inbound download of one package
#[derive(Debug, Clone)]
pub struct RxTransferContext {
    pub request: FileTransferRequest,
    pub local_file: PathBuf,
    /// Streaming endpoint the request arrived on, if any
    pub source_endpoint: Option<String>,
    pub settings: MpTransferSettings,
    pub attempt: u32,
    pub using_sender_url: bool,
    pub adjusted_url: String,
    pub is_relay: bool,
    pub bytes_received: u64,
}

impl RxTransferContext {
    pub fn new(
        request: FileTransferRequest,
        local_file: PathBuf,
        source_endpoint: Option<String>,
        settings: MpTransferSettings,
    ) -> Self {
        let mut adjusted_url = request.sender_url.clone();
        if request.peer_hosted
            && request.https_port != MP_LOCAL_PORT_DISABLE
            && adjusted_url.starts_with("http://")
        {
            let https = format!("https://{}", &adjusted_url["http://".len()..]);
            adjusted_url = u16::try_from(request.https_port)
                .ok()
                .and_then(|port| url_replace_port(&https, port))
                .unwrap_or(https);
        }
        let is_relay = adjusted_url.contains("/Marti/");
        Self {
            request,
            local_file,
            source_endpoint,
            settings,
            attempt: 1,
            using_sender_url: true,
            adjusted_url,
            is_relay,
            bytes_received: 0,
        }
    }

    /// URL for the next attempt
    ///
    /// # Arguments
    /// * `endpoint_host` - host of the sender's active endpoint, if known
    /// * `sender_streams` - whether the sender has a streaming endpoint
    ///
    /// When an alternate URL is due but cannot be built, the attempt counter
    /// advances and the sender URL is used instead.
    pub fn next_url(&mut self, endpoint_host: Option<&str>, sender_streams: bool) -> String {
        if self.using_sender_url {
            return self.adjusted_url.clone();
        }
        let alternate = match endpoint_host {
            Some(host) if !self.is_relay || !sender_streams => {
                url_replace_host(&self.adjusted_url, host)
            }
            _ => None,
        };
        match alternate {
            Some(url) => url,
            None => {
                self.attempt += 1;
                self.using_sender_url = true;
                debug!(
                    "MPRX - no alternate URL for {}; retrying original (attempt {} of {})",
                    self.request.name,
                    self.attempt,
                    self.settings.num_tries()
                );
                self.adjusted_url.clone()
            }
        }
    }

    /// Advance the retry ladder after a failed attempt
    pub fn after_failure(&mut self) -> RetryDecision {
        let tries = self.settings.num_tries();
        if self.using_sender_url && !self.is_relay && self.attempt < tries {
            self.using_sender_url = false;
            return RetryDecision::Alternate;
        }
        self.attempt += 1;
        if self.attempt >= tries {
            return RetryDecision::GiveUp;
        }
        self.using_sender_url = true;
        RetryDecision::RetryLater
    }
}
