//! Connection layer
//!
//! A `Transport` drives one exchange to completion: it connects, performs the
//! request, streams data through a `TransferSink`, and reports the final
//! application response code. `NetTransport` dispatches on the URL scheme to
//! the HTTP and FTP implementations.

pub mod ftp;
pub mod http;
pub mod tls;

use std::future::Future;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::AsyncRead;

use crate::error::{TransportError, TransportErrorKind};
use crate::transfer::{RequestOptions, TransferKind};
use tls::TlsSettings;

pub use ftp::FtpTransport;
pub use http::HttpTransport;

/// Default connect timeout
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(90);
/// Transfers slower than this many bytes per second ...
pub const LOW_SPEED_LIMIT: u64 = 10;
/// ... for this long are abandoned
pub const LOW_SPEED_TIME: Duration = Duration::from_secs(120);

/// Connect and stall limits for one exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferLimits {
    pub connect_timeout: Duration,
    pub low_speed_limit: u64,
    pub low_speed_time: Duration,
}

impl Default for TransferLimits {
    fn default() -> Self {
        Self {
            connect_timeout: CONNECT_TIMEOUT,
            low_speed_limit: LOW_SPEED_LIMIT,
            low_speed_time: LOW_SPEED_TIME,
        }
    }
}

/// Local data sent by an upload
pub struct UploadSource {
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
    pub len: u64,
}

/// Everything a transport needs for one exchange
pub struct Exchange {
    pub url: String,
    pub kind: TransferKind,
    pub options: RequestOptions,
    pub tls: TlsSettings,
    pub upload: Option<UploadSource>,
    pub limits: TransferLimits,
}

/// Receives downloaded data and progress from a transport
#[async_trait]
pub trait TransferSink: Send {
    async fn data(&mut self, chunk: &[u8]) -> Result<(), TransportError>;

    fn progress(&mut self, transferred: u64, total: u64);
}

/// Drives a single exchange and returns the final response code
#[async_trait]
pub trait Transport: Send + Sync {
    async fn perform(
        &self,
        exchange: Exchange,
        sink: &mut dyn TransferSink,
    ) -> Result<u32, TransportError>;
}

/// Scheme-dispatching transport used by default
#[derive(Default)]
pub struct NetTransport {
    http: HttpTransport,
    ftp: FtpTransport,
}

impl NetTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Transport for NetTransport {
    async fn perform(
        &self,
        exchange: Exchange,
        sink: &mut dyn TransferSink,
    ) -> Result<u32, TransportError> {
        let scheme = match exchange.url.split_once("://") {
            Some((scheme, _)) => scheme.to_ascii_lowercase(),
            None => {
                return Err(TransportError::new(
                    TransportErrorKind::MalformedUrl,
                    format!("URL using bad/illegal format or missing URL: {}", exchange.url),
                ));
            }
        };
        match scheme.as_str() {
            "http" | "https" => self.http.perform(exchange, sink).await,
            "ftp" | "ftps" => self.ftp.perform(exchange, sink).await,
            other => Err(TransportError::new(
                TransportErrorKind::UnsupportedProtocol,
                format!("Protocol \"{}\" not supported", other),
            )),
        }
    }
}

/// Enforces the low-speed rule over a running exchange
pub struct StallGuard {
    limits: TransferLimits,
    window_start: Instant,
    window_bytes: u64,
}

impl StallGuard {
    pub fn new(limits: TransferLimits) -> Self {
        Self {
            limits,
            window_start: Instant::now(),
            window_bytes: 0,
        }
    }

    /// Account for `n` bytes moved and check the rate
    pub fn record(&mut self, n: u64) -> Result<(), TransportError> {
        self.window_bytes += n;
        self.check()
    }

    pub fn check(&mut self) -> Result<(), TransportError> {
        let window = self.limits.low_speed_time;
        if self.window_start.elapsed() < window {
            return Ok(());
        }
        if self.window_bytes < self.limits.low_speed_limit * window.as_secs() {
            return Err(self.too_slow());
        }
        self.window_start = Instant::now();
        self.window_bytes = 0;
        Ok(())
    }

    /// Await `fut`, failing if nothing completes within the low-speed window
    pub async fn within<F: Future>(&self, fut: F) -> Result<F::Output, TransportError> {
        tokio::time::timeout(self.limits.low_speed_time, fut)
            .await
            .map_err(|_| self.too_slow())
    }

    fn too_slow(&self) -> TransportError {
        TransportError::new(
            TransportErrorKind::Timeout,
            format!(
                "Operation too slow. Less than {} bytes/sec transferred the last {} seconds",
                self.limits.low_speed_limit,
                self.limits.low_speed_time.as_secs()
            ),
        )
    }
}

/// Await a connect step under the connect timeout
pub async fn with_connect_timeout<F, T>(limits: &TransferLimits, fut: F) -> Result<T, TransportError>
where
    F: Future<Output = Result<T, TransportError>>,
{
    match tokio::time::timeout(limits.connect_timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::new(
            TransportErrorKind::Timeout,
            format!(
                "Connection timed out after {} milliseconds",
                limits.connect_timeout.as_millis()
            ),
        )),
    }
}
