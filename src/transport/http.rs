//! HTTP(S) transport
//!
//! Performs one request with reqwest. Uploads stream the local file as the
//! request body; response bodies are always handed to the sink whatever the
//! status code, and the status code is reported back for refinement.

use std::error::Error as StdError;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use log::debug;
use reqwest::header::CONTENT_LENGTH;
use reqwest::{Body, Client, Method, RequestBuilder, Response, Url};
use tokio_util::io::ReaderStream;

use super::tls::{TlsSettings, is_untrusted};
use super::{Exchange, StallGuard, TransferLimits, TransferSink, Transport};
use crate::error::{TransportError, TransportErrorKind};

const PROGRESS_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Default)]
pub struct HttpTransport;

/// Build a reqwest client for the given limits and trust material
pub fn build_client(limits: &TransferLimits, tls: Option<&TlsSettings>) -> Result<Client, TransportError> {
    let mut builder = Client::builder().connect_timeout(limits.connect_timeout);
    if let Some(tls) = tls {
        let config = tls.client_config()?;
        builder = builder.use_preconfigured_tls((*config).clone());
    }
    builder.build().map_err(classify_error)
}

/// Map a reqwest failure onto a transport error
pub fn classify_error(err: reqwest::Error) -> TransportError {
    let detail = error_chain(&err);
    let kind = if err.is_builder() {
        TransportErrorKind::MalformedUrl
    } else if err.is_timeout() {
        TransportErrorKind::Timeout
    } else if let Some(untrusted) = find_tls_error(&err) {
        if untrusted {
            TransportErrorKind::UntrustedCertificate
        } else {
            TransportErrorKind::Tls
        }
    } else if err.is_connect() {
        if detail.contains("dns error") || detail.contains("failed to lookup address") {
            TransportErrorKind::ResolveHost
        } else {
            TransportErrorKind::Connect
        }
    } else if err.is_body() || err.is_request() {
        TransportErrorKind::ReadError
    } else {
        TransportErrorKind::Other
    };
    TransportError::new(kind, detail)
}

fn error_chain(err: &reqwest::Error) -> String {
    let mut detail = err.to_string();
    let mut source = err.source();
    while let Some(s) = source {
        detail.push_str(": ");
        detail.push_str(&s.to_string());
        source = s.source();
    }
    detail
}

/// Some(untrusted) if a rustls error is anywhere in the chain
fn find_tls_error(err: &reqwest::Error) -> Option<bool> {
    let mut source = err.source();
    while let Some(s) = source {
        if let Some(tls) = s.downcast_ref::<tokio_rustls::rustls::Error>() {
            return Some(is_untrusted(tls));
        }
        if let Some(tls) = s
            .downcast_ref::<io::Error>()
            .and_then(|e| e.get_ref())
            .and_then(|inner| inner.downcast_ref::<tokio_rustls::rustls::Error>())
        {
            return Some(is_untrusted(tls));
        }
        source = s.source();
    }
    None
}

/// Send `request` while the guard watches the upload counter `sent`
///
/// Fails with a timeout once a low-speed window passes without enough bytes
/// leaving, which includes a server that took the body and never answers.
/// `progress` sees the running total whenever it moved since the last tick.
pub async fn send_watched(
    request: RequestBuilder,
    sent: &AtomicU64,
    guard: &mut StallGuard,
    mut progress: impl FnMut(u64),
) -> Result<Response, TransportError> {
    let mut ticker = tokio::time::interval(PROGRESS_INTERVAL);
    let mut reported = 0;
    let send = request.send();
    tokio::pin!(send);
    let response = loop {
        tokio::select! {
            result = &mut send => break result.map_err(classify_error)?,
            _ = ticker.tick() => {
                let now = sent.load(Ordering::Relaxed);
                if now != reported {
                    guard.record(now - reported)?;
                    reported = now;
                    progress(now);
                } else {
                    guard.check()?;
                }
            }
        }
    };
    let now = sent.load(Ordering::Relaxed);
    if now != reported {
        progress(now);
    }
    Ok(response)
}

#[async_trait]
impl Transport for HttpTransport {
    async fn perform(
        &self,
        exchange: Exchange,
        sink: &mut dyn TransferSink,
    ) -> Result<u32, TransportError> {
        let url = Url::parse(&exchange.url).map_err(|e| {
            TransportError::new(TransportErrorKind::MalformedUrl, format!("{}: {}", exchange.url, e))
        })?;
        let secure = url.scheme() == "https";
        let client = build_client(&exchange.limits, secure.then_some(&exchange.tls))?;

        let method = match &exchange.options.method {
            Some(verb) => Method::from_bytes(verb.as_bytes()).map_err(|_| {
                TransportError::new(TransportErrorKind::Other, format!("Bad method {}", verb))
            })?,
            None if exchange.kind.is_upload() => Method::PUT,
            None => Method::GET,
        };

        debug!("HTTP {} {}", method, url);
        let mut request = client.request(method, url);
        for (name, value) in &exchange.options.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(creds) = &exchange.options.credentials {
            request = request.basic_auth(&creds.user, creds.password.as_ref());
        }

        let sent = Arc::new(AtomicU64::new(0));
        let mut upload_len = 0;
        if let Some(upload) = exchange.upload {
            upload_len = upload.len;
            let counter = sent.clone();
            let stream = ReaderStream::new(upload.reader).map(move |chunk| {
                if let Ok(bytes) = &chunk {
                    counter.fetch_add(bytes.len() as u64, Ordering::Relaxed);
                }
                chunk
            });
            request = request
                .header(CONTENT_LENGTH, upload.len)
                .body(Body::wrap_stream(stream));
        }

        let mut guard = StallGuard::new(exchange.limits);
        let mut response = send_watched(request, &sent, &mut guard, |now| {
            sink.progress(now, upload_len)
        })
        .await?;

        let code = u32::from(response.status().as_u16());
        let total = response.content_length().unwrap_or(0);
        let mut received = 0u64;
        while let Some(chunk) = guard.within(response.chunk()).await?.map_err(classify_error)? {
            guard.record(chunk.len() as u64)?;
            if exchange.kind.is_upload() {
                continue;
            }
            received += chunk.len() as u64;
            sink.data(&chunk).await?;
            sink.progress(received, total);
        }

        Ok(code)
    }
}
