//! Relay server uploads
//!
//! Each upload job walks the Check / Upload / Toolset protocol against the
//! `/Marti` API of one streaming endpoint. Jobs run concurrently; their
//! outcomes are folded back into the transmit state in completion order.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures_util::StreamExt;
use log::{debug, info, warn};
use reqwest::header::CONTENT_TYPE;
use reqwest::multipart::{Form, Part};
use reqwest::{Body, Client, Response};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::io::ReaderStream;

use crate::error::{TransportError, TransportErrorKind};
use crate::mission::context::{TxUploadContext, UploadState};
use crate::mission::manager::Inner;
use crate::mission::types::{MpSendUpdate, MpTransferStatus};
use crate::settings::MpTransferSettings;
use crate::transport::http::{build_client, classify_error, send_watched};
use crate::transport::tls::TlsSettings;
use crate::transport::{LOW_SPEED_LIMIT, StallGuard, TransferLimits};
use crate::utils::url::url_append_param;

const PACKAGE_CONTENT_TYPE: &str = "application/x-zip-compressed";
const CHUNK_SIZE: usize = 8192;

/// Where the protocol goes after one exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadStep {
    Next(UploadState),
    Finished { success: bool },
}

/// Protocol transition for the response code of one exchange
///
/// `None` stands for a transport failure. The toolset exchange is advisory,
/// so anything it returns finishes the job successfully.
pub fn next_upload_step(state: UploadState, code: Option<u16>) -> UploadStep {
    match (state, code) {
        (UploadState::Check, Some(200)) => UploadStep::Next(UploadState::Toolset),
        (UploadState::Check, Some(404)) => UploadStep::Next(UploadState::Upload),
        (UploadState::Upload, Some(200)) => UploadStep::Next(UploadState::Toolset),
        (UploadState::Toolset, _) => UploadStep::Finished { success: true },
        _ => UploadStep::Finished { success: false },
    }
}

/// Finished upload job
#[derive(Debug)]
pub struct UploadOutcome {
    pub upload: TxUploadContext,
    pub success: bool,
}

/// Limits applied to mission package exchanges
pub(crate) fn limits_for(settings: &MpTransferSettings) -> TransferLimits {
    TransferLimits {
        connect_timeout: settings.connect_timeout(),
        low_speed_limit: LOW_SPEED_LIMIT,
        low_speed_time: settings.transfer_timeout(),
    }
}

fn server_base(inner: &Inner, upload: &TxUploadContext) -> Result<(String, Client), TransportError> {
    let endpoints = &inner.collab.endpoints;
    let ip = endpoints.endpoint_address(&upload.endpoint).ok_or_else(|| {
        TransportError::new(
            TransportErrorKind::Connect,
            format!("streaming endpoint {} is gone", upload.endpoint),
        )
    })?;
    let limits = limits_for(&upload.settings);
    if endpoints.is_endpoint_ssl(&upload.endpoint) {
        let tls = endpoints
            .endpoint_tls(&upload.endpoint)
            .unwrap_or_else(TlsSettings::accept_any);
        let addr = SocketAddr::new(ip, upload.settings.https_port());
        Ok((format!("https://{}/Marti", addr), build_client(&limits, Some(&tls))?))
    } else {
        let addr = SocketAddr::new(ip, upload.settings.http_port());
        Ok((format!("http://{}/Marti", addr), build_client(&limits, None)?))
    }
}

async fn read_response(response: Response, guard: &StallGuard) -> Result<(u16, String), TransportError> {
    let code = response.status().as_u16();
    let body = guard.within(response.text()).await?.map_err(classify_error)?;
    Ok((code, body))
}

async fn query_package(
    client: &Client,
    base: &str,
    upload: &TxUploadContext,
    guard: &StallGuard,
) -> Result<(u16, String), TransportError> {
    let url = url_append_param(&format!("{}/sync/missionquery", base), "hash", &upload.sha256);
    let response = guard
        .within(client.get(&url).send())
        .await?
        .map_err(classify_error)?;
    read_response(response, guard).await
}

fn report_progress(inner: &Inner, upload: &TxUploadContext, bytes: u64) {
    if upload.contacts.is_empty() {
        inner.emit_send(MpSendUpdate::new(
            upload.xfer_id,
            None,
            MpTransferStatus::ServerUploadInProgress,
            None,
            bytes,
        ));
    }
    for contact in &upload.contacts {
        inner.emit_send(MpSendUpdate::new(
            upload.xfer_id,
            Some(contact.clone()),
            MpTransferStatus::ServerUploadInProgress,
            None,
            bytes,
        ));
    }
}

async fn post_package(
    inner: &Arc<Inner>,
    client: &Client,
    base: &str,
    upload: &mut TxUploadContext,
    guard: &StallGuard,
) -> Result<(u16, String), TransportError> {
    let mut url = url_append_param(&format!("{}/sync/missionupload", base), "hash", &upload.sha256);
    url = url_append_param(&url, "filename", &upload.filename);
    url = url_append_param(&url, "creatorUid", inner.our_uid.as_str());

    let reader = inner.collab.files.open_read(&upload.file).await.map_err(|e| {
        TransportError::new(
            TransportErrorKind::ReadError,
            format!("{}: {}", upload.file.display(), e),
        )
    })?;

    let sent = Arc::new(AtomicU64::new(0));
    let counter = sent.clone();
    let stream = ReaderStream::with_capacity(reader, CHUNK_SIZE).inspect(move |chunk| {
        if let Ok(chunk) = chunk {
            counter.fetch_add(chunk.len() as u64, Ordering::Relaxed);
        }
    });

    let part = Part::stream_with_length(Body::wrap_stream(stream), upload.size)
        .file_name(upload.filename.clone())
        .mime_str(PACKAGE_CONTENT_TYPE)
        .map_err(classify_error)?;
    let form = Form::new().part("assetfile", part);

    let mut stall = StallGuard::new(limits_for(&upload.settings));
    let request = client.post(&url).multipart(form);
    let result = send_watched(request, &sent, &mut stall, |bytes| {
        report_progress(inner, upload, bytes)
    })
    .await;
    upload.bytes_transferred = sent.load(Ordering::Relaxed);
    read_response(result?, guard).await
}

async fn set_tool(
    client: &Client,
    base: &str,
    upload: &TxUploadContext,
    guard: &StallGuard,
) -> Result<(u16, String), TransportError> {
    let url = format!("{}/api/sync/metadata/{}/tool", base, upload.sha256);
    let tool = if upload.contacts.is_empty() {
        "public"
    } else {
        "private"
    };
    let request = client
        .put(&url)
        .header(CONTENT_TYPE, "text/plain")
        .body(tool);
    let response = guard
        .within(request.send())
        .await?
        .map_err(classify_error)?;
    read_response(response, guard).await
}

/// Run one upload job to completion
pub(crate) async fn run_upload(inner: Arc<Inner>, mut upload: TxUploadContext) -> UploadOutcome {
    upload.state = UploadState::Check;
    let (base, client) = match server_base(&inner, &upload) {
        Ok(server) => server,
        Err(e) => {
            warn!("MP upload {} to {}: {}", upload.xfer_id, upload.endpoint, e);
            return UploadOutcome {
                upload,
                success: false,
            };
        }
    };
    let guard = StallGuard::new(limits_for(&upload.settings));

    loop {
        let result = match upload.state {
            UploadState::Check => query_package(&client, &base, &upload, &guard).await,
            UploadState::Upload => post_package(&inner, &client, &base, &mut upload, &guard).await,
            UploadState::Toolset => set_tool(&client, &base, &upload, &guard).await,
        };
        let code = match result {
            Ok((code, body)) => {
                debug!(
                    "MP upload {} to {}: {:?} returned {}",
                    upload.xfer_id, upload.endpoint, upload.state, code
                );
                if code == 200 && upload.state != UploadState::Toolset {
                    upload.url_from_server = body.trim().to_string();
                }
                Some(code)
            }
            Err(e) => {
                warn!(
                    "MP upload {} to {}: {:?} failed: {}",
                    upload.xfer_id, upload.endpoint, upload.state, e
                );
                None
            }
        };
        match next_upload_step(upload.state, code) {
            UploadStep::Next(state) => upload.state = state,
            UploadStep::Finished { success } => {
                info!(
                    "MP upload {} to {} finished, success={}",
                    upload.xfer_id, upload.endpoint, success
                );
                return UploadOutcome { upload, success };
            }
        }
    }
}

/// Accept upload jobs and complete them as they finish
pub(crate) async fn run_upload_worker(
    inner: Arc<Inner>,
    mut jobs: mpsc::UnboundedReceiver<TxUploadContext>,
) {
    let mut running = JoinSet::new();
    loop {
        tokio::select! {
            job = jobs.recv() => match job {
                Some(upload) => {
                    debug!("MP upload {} to {} queued", upload.xfer_id, upload.endpoint);
                    running.spawn(run_upload(inner.clone(), upload));
                }
                None => break,
            },
            Some(done) = running.join_next(), if !running.is_empty() => match done {
                Ok(outcome) => inner.upload_completed(outcome).await,
                Err(e) => warn!("MP upload task failed: {}", e),
            },
        }
    }
    running.shutdown().await;
    debug!("MP upload task exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_check_found_skips_upload() {
        assert_eq!(
            next_upload_step(UploadState::Check, Some(200)),
            UploadStep::Next(UploadState::Toolset)
        );
    }

    #[test]
    fn test_check_missing_uploads() {
        assert_eq!(
            next_upload_step(UploadState::Check, Some(404)),
            UploadStep::Next(UploadState::Upload)
        );
        assert_eq!(
            next_upload_step(UploadState::Upload, Some(200)),
            UploadStep::Next(UploadState::Toolset)
        );
    }

    #[test]
    fn test_check_and_upload_failures_are_terminal() {
        for state in [UploadState::Check, UploadState::Upload] {
            assert_eq!(
                next_upload_step(state, Some(500)),
                UploadStep::Finished { success: false }
            );
            assert_eq!(
                next_upload_step(state, None),
                UploadStep::Finished { success: false }
            );
        }
        assert_eq!(
            next_upload_step(UploadState::Upload, Some(404)),
            UploadStep::Finished { success: false }
        );
    }

    #[test]
    fn test_toolset_never_fails_the_job() {
        for code in [Some(200), Some(403), Some(500), None] {
            assert_eq!(
                next_upload_step(UploadState::Toolset, code),
                UploadStep::Finished { success: true }
            );
        }
    }

    #[test]
    fn test_limits_follow_settings() {
        let mut settings = MpTransferSettings::default();
        settings.set_conn_timeout_sec(10).unwrap();
        settings.set_xfer_timeout_sec(30).unwrap();
        let limits = limits_for(&settings);
        assert_eq!(limits.connect_timeout, Duration::from_secs(10));
        assert_eq!(limits.low_speed_time, Duration::from_secs(30));
        assert_eq!(limits.low_speed_limit, LOW_SPEED_LIMIT);
    }
}
