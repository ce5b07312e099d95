//! Inbound package downloads
//!
//! Offered packages are accepted through the application, then downloaded by
//! one task per destination file. Failed attempts walk the retry ladder kept
//! in `RxTransferContext`; the sender is acked once the download settles.

use std::sync::{Arc, PoisonError};
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use log::{debug, info, warn};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use crate::error::{TransportError, TransportErrorKind};
use crate::mission::context::{RetryDecision, RxTransferContext};
use crate::mission::manager::Inner;
use crate::mission::types::{FileTransferRequest, MpReceiveUpdate, MpTransferStatus, ReceiveDecision};
use crate::mission::upload::limits_for;
use crate::transport::StallGuard;
use crate::transport::http::{build_client, classify_error};
use crate::transport::tls::TlsSettings;
use crate::utils::url::url_append_param;

/// Delay before retrying the sender URL
pub const RETRY_DELAY: Duration = Duration::from_secs(10);

const SUCCESS_DETAIL: &str = "File transferred successfully";
const UNEXPECTED_CODE_DETAIL: &str = "Received unexpected http response code";
const FILE_EXISTS_REASON: &str = "File already exists; transfer not needed";
const DISABLED_REASON: &str = "File transfers disabled";
const GAVE_UP_REASON: &str = "Unable to download";
const PROGRESS_INTERVAL: Duration = Duration::from_millis(250);

fn update(ctx: &RxTransferContext, status: MpTransferStatus, detail: Option<&str>) -> MpReceiveUpdate {
    MpReceiveUpdate {
        local_file: ctx.local_file.clone(),
        status,
        bytes_received: ctx.bytes_received,
        total_bytes_expected: ctx.request.size,
        attempt: ctx.attempt,
        max_attempts: ctx.settings.num_tries(),
        detail: detail.map(str::to_string),
    }
}

/// Trust material for an https download
fn download_tls(inner: &Inner, ctx: &RxTransferContext) -> Result<TlsSettings, TransportError> {
    if ctx.request.peer_hosted {
        return Ok(TlsSettings::accept_any());
    }
    let endpoints = &inner.collab.endpoints;
    inner
        .collab
        .contacts
        .stream_endpoint(&ctx.request.sender_uid)
        .and_then(|ep| endpoints.endpoint_tls(&ep))
        .or_else(|| {
            ctx.source_endpoint
                .as_deref()
                .and_then(|ep| endpoints.endpoint_tls(ep))
        })
        .ok_or_else(|| {
            TransportError::new(
                TransportErrorKind::Tls,
                "No streaming connection available to secure download",
            )
        })
}

fn write_error(ctx: &RxTransferContext, err: std::io::Error) -> TransportError {
    TransportError::new(
        TransportErrorKind::WriteError,
        format!("{}: {}", ctx.local_file.display(), err),
    )
}

/// One download attempt; returns the HTTP response code
async fn attempt(inner: &Inner, ctx: &mut RxTransferContext, url: &str) -> Result<u16, TransportError> {
    let limits = limits_for(&ctx.settings);
    let tls = if url.get(..8).is_some_and(|s| s.eq_ignore_ascii_case("https://")) {
        Some(download_tls(inner, ctx)?)
    } else {
        None
    };
    let client = build_client(&limits, tls.as_ref())?;
    let mut guard = StallGuard::new(limits);

    let response = guard
        .within(client.get(url).send())
        .await?
        .map_err(classify_error)?;
    let code = response.status().as_u16();
    if code != 200 {
        return Ok(code);
    }

    let mut writer = inner
        .collab
        .files
        .open_write(&ctx.local_file)
        .await
        .map_err(|e| write_error(ctx, e))?;
    let mut body = response.bytes_stream();
    let mut last_report = Instant::now();
    loop {
        let next = guard.within(body.next()).await?;
        let Some(chunk) = next else {
            break;
        };
        let chunk = chunk.map_err(classify_error)?;
        writer.write_all(&chunk).await.map_err(|e| write_error(ctx, e))?;
        ctx.bytes_received += chunk.len() as u64;
        guard.record(chunk.len() as u64)?;
        if last_report.elapsed() >= PROGRESS_INTERVAL {
            last_report = Instant::now();
            inner.emit_receive(update(ctx, MpTransferStatus::AttemptInProgress, None));
        }
    }
    writer.shutdown().await.map_err(|e| write_error(ctx, e))?;
    Ok(code)
}

/// Download one package, retrying per the ladder, then ack the sender
pub(crate) async fn run_download(inner: Arc<Inner>, mut ctx: RxTransferContext) {
    loop {
        let sender = ctx.request.sender_uid.clone();
        let host = inner.collab.contacts.active_endpoint_host(&sender);
        let streams = inner.collab.contacts.has_streaming_endpoint(&sender);
        let url = ctx.next_url(host.as_deref(), streams);
        let url = url_append_param(&url, "receiver", &inner.callsign());

        ctx.bytes_received = 0;
        inner.emit_receive(update(&ctx, MpTransferStatus::AttemptInProgress, None));
        debug!(
            "MPRX - {} attempt {} of {} from {}",
            ctx.request.name,
            ctx.attempt,
            ctx.settings.num_tries(),
            url
        );

        let detail = match attempt(&inner, &mut ctx, &url).await {
            Ok(200) => {
                info!("MPRX - {} received into {}", ctx.request.name, ctx.local_file.display());
                inner.emit_receive(update(&ctx, MpTransferStatus::FinishedSuccess, Some(SUCCESS_DETAIL)));
                inner.send_ack(&ctx.request, true, SUCCESS_DETAIL);
                break;
            }
            Ok(code) => {
                debug!("MPRX - {} got response code {}", ctx.request.name, code);
                UNEXPECTED_CODE_DETAIL.to_string()
            }
            Err(e) => {
                debug!("MPRX - {} attempt failed: {}", ctx.request.name, e);
                e.detail
            }
        };

        match ctx.after_failure() {
            RetryDecision::Alternate => {
                debug!("MPRX - {} trying alternate URL", ctx.request.name);
            }
            RetryDecision::RetryLater => {
                inner.emit_receive(update(&ctx, MpTransferStatus::AttemptFailed, Some(&detail)));
                tokio::time::sleep(RETRY_DELAY).await;
            }
            RetryDecision::GiveUp => {
                warn!("MPRX - giving up on {}: {}", ctx.request.name, detail);
                inner.emit_receive(update(&ctx, MpTransferStatus::FinishedFailed, Some(&detail)));
                inner.send_ack(&ctx.request, false, GAVE_UP_REASON);
                break;
            }
        }
    }

    inner
        .rx_active
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .remove(&ctx.local_file);
}

/// Ask the application about an offered package
///
/// # Returns
/// The download to run, or `None` when the offer was answered or dropped.
async fn accept_request(
    inner: &Inner,
    source_endpoint: Option<String>,
    request: FileTransferRequest,
) -> Option<RxTransferContext> {
    let settings = inner.tx.lock().await.settings.clone();
    match inner.collab.io.receive_init(&request) {
        ReceiveDecision::Accept(local_file) => {
            let fresh = inner
                .rx_active
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(local_file.clone());
            if !fresh {
                debug!("MPRX - {} is already being received; dropping request", local_file.display());
                return None;
            }
            Some(RxTransferContext::new(request, local_file, source_endpoint, settings))
        }
        ReceiveDecision::FileExists => {
            inner.send_ack(&request, true, FILE_EXISTS_REASON);
            None
        }
        ReceiveDecision::DisabledLocally => {
            inner.send_ack(&request, false, DISABLED_REASON);
            None
        }
        ReceiveDecision::Failed => {
            debug!("MPRX - application declined {}", request.name);
            None
        }
    }
}

/// Accept offered packages and run their downloads
pub(crate) async fn run_receive_worker(
    inner: Arc<Inner>,
    mut requests: mpsc::UnboundedReceiver<(Option<String>, FileTransferRequest)>,
) {
    let mut running = JoinSet::new();
    loop {
        tokio::select! {
            msg = requests.recv() => match msg {
                Some((source, request)) => {
                    if let Some(ctx) = accept_request(&inner, source, request).await {
                        running.spawn(run_download(inner.clone(), ctx));
                    }
                }
                None => break,
            },
            Some(done) = running.join_next(), if !running.is_empty() => {
                if let Err(e) = done {
                    warn!("MPRX - download task failed: {}", e);
                }
            },
        }
    }
    running.shutdown().await;
    debug!("MP receive task exiting");
}
