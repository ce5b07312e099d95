//! FTP(S) transport
//!
//! A small FTP client covering what the transfer engine needs: login, optional
//! implicit TLS on control and data connections, pre-transfer quote commands,
//! passive-mode RETR/STOR, and CWD+LIST for directory URLs.
//!
//! URL paths are relative to the login directory. A path ending in `/` is a
//! directory listing; anything else names a file.

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use log::debug;
use percent_encoding::percent_decode_str;
use reqwest::Url;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::ClientConfig;
use tokio_rustls::rustls::pki_types::ServerName;

use super::tls::{handshake_error, server_name};
use super::{Exchange, StallGuard, TransferLimits, TransferSink, Transport, with_connect_timeout};
use crate::error::{TransportError, TransportErrorKind};
use crate::transfer::TransferKind;

/// FTP reply codes the client acts on
pub const DATA_OPENING: u32 = 150;
pub const DATA_ALREADY_OPEN: u32 = 125;
pub const READY: u32 = 220;
pub const PASSIVE_MODE: u32 = 227;
pub const LOGIN_SUCCESS: u32 = 230;
pub const NO_LOGIN_NEEDED: u32 = 202;
pub const PASSWORD_REQUIRED: u32 = 331;
pub const LOGIN_FAILED: u32 = 530;
pub const NO_FILES: u32 = 450;
pub const FILE_NOT_FOUND: u32 = 550;

const DEFAULT_FTP_PORT: u16 = 21;
const DEFAULT_FTPS_PORT: u16 = 990;
const ANONYMOUS_USER: &str = "anonymous";
const ANONYMOUS_PASSWORD: &str = "ftp@example.com";
const DATA_BUFFER_SIZE: usize = 8192;

#[derive(Default)]
pub struct FtpTransport;

/// Plain or TLS-wrapped connection
enum FtpStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for FtpStream {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            FtpStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            FtpStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for FtpStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            FtpStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            FtpStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            FtpStream::Plain(s) => Pin::new(s).poll_flush(cx),
            FtpStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            FtpStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            FtpStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// TLS parameters shared by control and data connections
struct SecureChannel {
    connector: TlsConnector,
    name: ServerName<'static>,
}

impl SecureChannel {
    fn new(config: Arc<ClientConfig>, host: &str) -> Result<Self, TransportError> {
        Ok(Self {
            connector: TlsConnector::from(config),
            name: server_name(host)?,
        })
    }

    async fn wrap(&self, tcp: TcpStream) -> Result<FtpStream, TransportError> {
        let stream = self
            .connector
            .connect(self.name.clone(), tcp)
            .await
            .map_err(handshake_error)?;
        Ok(FtpStream::Tls(Box::new(stream)))
    }
}

/// Control connection
struct Control {
    reader: BufReader<FtpStream>,
    peer: SocketAddr,
    limits: TransferLimits,
}

impl Control {
    /// Read one (possibly multi-line) reply
    async fn reply(&mut self) -> Result<(u32, String), TransportError> {
        let timeout = self.limits.low_speed_time;
        tokio::time::timeout(timeout, self.read_reply())
            .await
            .map_err(|_| {
                TransportError::new(
                    TransportErrorKind::Timeout,
                    format!("FTP response timeout after {} seconds", timeout.as_secs()),
                )
            })?
    }

    async fn read_reply(&mut self) -> Result<(u32, String), TransportError> {
        let mut text = String::new();
        let mut line = String::new();
        let mut multi_code: Option<String> = None;
        loop {
            line.clear();
            let n = self
                .reader
                .read_line(&mut line)
                .await
                .map_err(|e| TransportError::new(TransportErrorKind::Protocol, e.to_string()))?;
            if n == 0 {
                return Err(TransportError::new(
                    TransportErrorKind::Protocol,
                    "Server closed the control connection",
                ));
            }
            let trimmed = line.trim_end_matches(['\r', '\n']);
            text.push_str(trimmed);
            text.push('\n');

            let code = trimmed.get(..3).filter(|c| c.bytes().all(|b| b.is_ascii_digit()));
            let sep = trimmed.as_bytes().get(3).copied();
            match (&multi_code, code) {
                (None, Some(code)) if sep == Some(b'-') => multi_code = Some(code.to_string()),
                (None, Some(code)) => return Ok((parse_code(code), text)),
                (Some(first), Some(code)) if first == code && sep != Some(b'-') => {
                    return Ok((parse_code(code), text));
                }
                (None, None) => {
                    return Err(TransportError::new(
                        TransportErrorKind::Protocol,
                        format!("Weird server reply: {}", trimmed),
                    ));
                }
                _ => {}
            }
        }
    }

    async fn command(&mut self, cmd: &str) -> Result<(u32, String), TransportError> {
        if cmd.starts_with("PASS ") {
            debug!("FTP > PASS ****");
        } else {
            debug!("FTP > {}", cmd);
        }
        let stream = self.reader.get_mut();
        stream
            .write_all(format!("{}\r\n", cmd).as_bytes())
            .await
            .map_err(|e| TransportError::new(TransportErrorKind::Protocol, e.to_string()))?;
        stream
            .flush()
            .await
            .map_err(|e| TransportError::new(TransportErrorKind::Protocol, e.to_string()))?;
        let (code, text) = self.reply().await?;
        debug!("FTP < {}", text.trim_end());
        Ok((code, text))
    }
}

fn parse_code(code: &str) -> u32 {
    code.parse().unwrap_or(0)
}

/// Parse the address out of a 227 reply; only the port is used
pub fn parse_pasv_port(text: &str) -> Option<u16> {
    let open = match text.find('(') {
        Some(i) => i + 1,
        None => 4.min(text.len()),
    };
    let nums: Vec<u32> = text[open..]
        .split(|c: char| !c.is_ascii_digit())
        .filter(|s| !s.is_empty())
        .take(6)
        .filter_map(|s| s.parse().ok())
        .collect();
    if nums.len() < 6 || nums.iter().any(|n| *n > 255) {
        return None;
    }
    u16::try_from(nums[4] * 256 + nums[5]).ok()
}

/// Size announced in a 150 reply, e.g. "150 Opening BINARY mode data connection for x (1234 bytes)"
pub fn parse_announced_size(text: &str) -> Option<u64> {
    let end = text.rfind(" bytes")?;
    let start = text[..end].rfind('(')? + 1;
    text[start..end].trim().parse().ok()
}

/// Split a URL path into the login-relative directory chain and the leaf
fn split_remote_path(path: &str) -> (Vec<String>, Option<String>) {
    let decoded = percent_decode_str(path).decode_utf8_lossy().to_string();
    let relative = decoded.strip_prefix('/').unwrap_or(&decoded);
    let is_dir = relative.is_empty() || relative.ends_with('/');
    let mut parts: Vec<String> = relative
        .split('/')
        .filter(|p| !p.is_empty())
        .map(|p| p.to_string())
        .collect();
    if is_dir {
        (parts, None)
    } else {
        let leaf = parts.pop();
        (parts, leaf)
    }
}

fn ftp_error(kind: TransportErrorKind, what: &str, code: u32, text: &str) -> TransportError {
    TransportError::new(kind, format!("{}: {} {}", what, code, text.trim_end()))
}

#[async_trait]
impl Transport for FtpTransport {
    async fn perform(
        &self,
        exchange: Exchange,
        sink: &mut dyn TransferSink,
    ) -> Result<u32, TransportError> {
        let url = Url::parse(&exchange.url).map_err(|e| {
            TransportError::new(TransportErrorKind::MalformedUrl, format!("{}: {}", exchange.url, e))
        })?;
        let secure = url.scheme().eq_ignore_ascii_case("ftps");
        let host = url
            .host_str()
            .ok_or_else(|| TransportError::new(TransportErrorKind::MalformedUrl, "No host part in the URL"))?
            .to_string();
        let port = url
            .port()
            .unwrap_or(if secure { DEFAULT_FTPS_PORT } else { DEFAULT_FTP_PORT });
        let limits = exchange.limits;

        let secure_channel = if secure {
            Some(SecureChannel::new(exchange.tls.client_config()?, &host)?)
        } else {
            None
        };

        let tcp = with_connect_timeout(&limits, connect(&host, port)).await?;
        let peer = tcp
            .peer_addr()
            .map_err(|e| TransportError::new(TransportErrorKind::Connect, e.to_string()))?;
        let stream = match &secure_channel {
            Some(channel) => with_connect_timeout(&limits, channel.wrap(tcp)).await?,
            None => FtpStream::Plain(tcp),
        };
        let mut control = Control {
            reader: BufReader::new(stream),
            peer,
            limits,
        };

        let (code, text) = control.reply().await?;
        if code != READY {
            return Err(ftp_error(TransportErrorKind::Protocol, "Unexpected greeting", code, &text));
        }

        let (user, password) = match &exchange.options.credentials {
            Some(creds) => (creds.user.clone(), creds.password.clone().unwrap_or_default()),
            None => (ANONYMOUS_USER.to_string(), ANONYMOUS_PASSWORD.to_string()),
        };
        login(&mut control, &user, &password).await?;

        if secure_channel.is_some() {
            control.command("PBSZ 0").await?;
            let (code, text) = control.command("PROT P").await?;
            if code >= 400 {
                return Err(ftp_error(TransportErrorKind::Tls, "PROT P rejected", code, &text));
            }
        }

        for quote in &exchange.options.quote {
            let (code, text) = control.command(quote).await?;
            if code >= 400 {
                return Err(ftp_error(TransportErrorKind::Other, "QUOT command failed", code, &text));
            }
        }

        let (dirs, leaf) = split_remote_path(url.path());
        for dir in &dirs {
            let (code, text) = control.command(&format!("CWD {}", dir)).await?;
            if code >= 400 {
                return Err(ftp_error(
                    TransportErrorKind::RemoteAccessDenied,
                    "Server denied you to change to the given directory",
                    code,
                    &text,
                ));
            }
        }

        let listing = leaf.is_none();
        let type_cmd = if listing { "TYPE A" } else { "TYPE I" };
        let (code, text) = control.command(type_cmd).await?;
        if code >= 400 {
            return Err(ftp_error(TransportErrorKind::Other, "Couldn't set transfer type", code, &text));
        }

        let (code, text) = control.command("PASV").await?;
        if code != PASSIVE_MODE {
            return Err(ftp_error(TransportErrorKind::Other, "PASV failed", code, &text));
        }
        let data_port = parse_pasv_port(&text).ok_or_else(|| {
            TransportError::new(TransportErrorKind::Protocol, format!("Weird PASV reply: {}", text.trim_end()))
        })?;
        let data_addr = SocketAddr::new(control.peer.ip(), data_port);
        let data_tcp = with_connect_timeout(&limits, async {
            TcpStream::connect(data_addr).await.map_err(|e| {
                TransportError::new(
                    TransportErrorKind::Connect,
                    format!("Failed to connect to {} for data: {}", data_addr, e),
                )
            })
        })
        .await?;

        let transfer_cmd = match (&leaf, exchange.kind) {
            (None, _) => "LIST".to_string(),
            (Some(name), TransferKind::FileUpload) => format!("STOR {}", name),
            (Some(name), _) => format!("RETR {}", name),
        };
        let (code, text) = control.command(&transfer_cmd).await?;
        if code != DATA_OPENING && code != DATA_ALREADY_OPEN {
            return Err(match (listing, exchange.kind, code) {
                (true, _, NO_FILES) => {
                    debug!("FTP LIST reported no files");
                    let _ = control.command("QUIT").await;
                    return Ok(code);
                }
                (_, TransferKind::FileUpload, _) => {
                    ftp_error(TransportErrorKind::UploadFailed, "Failed FTP upload", code, &text)
                }
                (_, _, FILE_NOT_FOUND) => {
                    ftp_error(TransportErrorKind::RemoteFileNotFound, "Remote file not found", code, &text)
                }
                _ => ftp_error(TransportErrorKind::Other, "Transfer command failed", code, &text),
            });
        }

        let mut data = match &secure_channel {
            Some(channel) => with_connect_timeout(&limits, channel.wrap(data_tcp)).await?,
            None => FtpStream::Plain(data_tcp),
        };

        let mut guard = StallGuard::new(limits);
        match exchange.upload {
            Some(mut upload) if exchange.kind.is_upload() => {
                let mut buf = vec![0u8; DATA_BUFFER_SIZE];
                let mut sent = 0u64;
                loop {
                    let n = upload
                        .reader
                        .read(&mut buf)
                        .await
                        .map_err(|e| TransportError::new(TransportErrorKind::ReadError, e.to_string()))?;
                    if n == 0 {
                        break;
                    }
                    guard
                        .within(data.write_all(&buf[..n]))
                        .await?
                        .map_err(|e| TransportError::new(TransportErrorKind::UploadFailed, e.to_string()))?;
                    sent += n as u64;
                    guard.record(n as u64)?;
                    sink.progress(sent, upload.len);
                }
            }
            _ => {
                let total = parse_announced_size(&text).unwrap_or(0);
                let mut buf = vec![0u8; DATA_BUFFER_SIZE];
                let mut received = 0u64;
                loop {
                    let n = guard
                        .within(data.read(&mut buf))
                        .await?
                        .map_err(|e| TransportError::new(TransportErrorKind::Other, e.to_string()))?;
                    if n == 0 {
                        break;
                    }
                    received += n as u64;
                    guard.record(n as u64)?;
                    sink.data(&buf[..n]).await?;
                    sink.progress(received, total);
                }
            }
        }
        let _ = data.shutdown().await;
        drop(data);

        let (code, text) = control.reply().await?;
        debug!("FTP < {}", text.trim_end());
        if code >= 400 {
            let kind = if exchange.kind.is_upload() {
                TransportErrorKind::UploadFailed
            } else {
                TransportErrorKind::Other
            };
            return Err(ftp_error(kind, "Transfer failed", code, &text));
        }
        let _ = control.command("QUIT").await;
        Ok(code)
    }
}

async fn connect(host: &str, port: u16) -> Result<TcpStream, TransportError> {
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| {
            TransportError::new(
                TransportErrorKind::ResolveHost,
                format!("Could not resolve host: {} ({})", host, e),
            )
        })?
        .collect();
    let mut last_err = None;
    for addr in addrs {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(e) => last_err = Some(e),
        }
    }
    Err(TransportError::new(
        TransportErrorKind::Connect,
        match last_err {
            Some(e) => format!("Failed to connect to {} port {}: {}", host, port, e),
            None => format!("Could not resolve host: {}", host),
        },
    ))
}

async fn login(control: &mut Control, user: &str, password: &str) -> Result<(), TransportError> {
    let (code, text) = control.command(&format!("USER {}", user)).await?;
    match code {
        LOGIN_SUCCESS => return Ok(()),
        PASSWORD_REQUIRED => {}
        LOGIN_FAILED => {
            return Err(ftp_error(TransportErrorKind::LoginDenied, "Access denied", code, &text));
        }
        _ => {
            return Err(ftp_error(TransportErrorKind::LoginDenied, "Unexpected USER reply", code, &text));
        }
    }
    let (code, text) = control.command(&format!("PASS {}", password)).await?;
    match code {
        LOGIN_SUCCESS | NO_LOGIN_NEEDED => Ok(()),
        _ => Err(ftp_error(TransportErrorKind::LoginDenied, "Access denied", code, &text)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pasv_port() {
        assert_eq!(
            parse_pasv_port("227 Entering Passive Mode (127,0,0,1,195,80).\n"),
            Some(195 * 256 + 80)
        );
        assert_eq!(parse_pasv_port("227 Entering Passive Mode 10,0,0,2,4,1\n"), Some(1025));
        assert_eq!(parse_pasv_port("227 nonsense\n"), None);
    }

    #[test]
    fn test_parse_announced_size() {
        assert_eq!(
            parse_announced_size("150 Opening BINARY mode data connection for a.zip (1234 bytes).\n"),
            Some(1234)
        );
        assert_eq!(parse_announced_size("150 Here comes the directory listing.\n"), None);
    }

    #[test]
    fn test_split_remote_path() {
        assert_eq!(split_remote_path("/"), (vec![], None));
        assert_eq!(
            split_remote_path("/base/sub%20dir/"),
            (vec!["base".to_string(), "sub dir".to_string()], None)
        );
        assert_eq!(
            split_remote_path("/base/file.zip"),
            (vec!["base".to_string()], Some("file.zip".to_string()))
        );
    }
}
