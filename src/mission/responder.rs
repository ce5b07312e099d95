//! Embedded package web server
//!
//! Serves packages of live outbound transfers to local recipients. Only GET
//! is answered; any other request gets its connection closed without a
//! response.

use std::io;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Weak};
use std::time::Duration;

use log::{debug, error, info};
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::{JoinHandle, JoinSet};

use crate::mission::context::TxState;
use crate::storage::FileIoProvider;

/// Body of `/getinfo`
pub const INFO_BODY: &str = "Commo file server";
/// Body of every 404
pub const NOT_FOUND_BODY: &str =
    "<html><head><title>File not found</title></head><body>Could not locate specified file</body></html>";
/// Size of the chunks a served file is streamed in
pub const SERVE_CHUNK_SIZE: usize = 4096;

const MAX_HEADER_LINES: usize = 100;
/// Longest request or header line accepted
pub const MAX_LINE_LEN: u64 = 8192;
/// Time a client gets to send its request line and headers
pub const HEADER_TIMEOUT: Duration = Duration::from_secs(30);

/// What a request path resolves to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Info,
    File(i32),
    NotFound,
}

/// Resolve a request target such as `/getfile?file=3&sender=alpha`
pub fn route(target: &str) -> Route {
    let (path, query) = target.split_once('?').unwrap_or((target, ""));
    match path {
        "/getinfo" => Route::Info,
        "/getfile" => query
            .split('&')
            .find_map(|pair| pair.strip_prefix("file="))
            .and_then(|id| id.parse().ok())
            .map_or(Route::NotFound, Route::File),
        _ => Route::NotFound,
    }
}

/// Running server; stops when `stop` is called
pub struct Responder {
    addr: SocketAddr,
    accept: JoinHandle<()>,
}

impl Responder {
    /// Start serving on an already bound listener
    ///
    /// # Arguments
    /// * `state` - transmit state, looked up per request
    /// * `files` - provider the served files are read through
    pub fn start(
        listener: TcpListener,
        state: Weak<Mutex<TxState>>,
        files: Arc<dyn FileIoProvider>,
    ) -> Self {
        let addr = listener
            .local_addr()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 0)));
        let accept = tokio::spawn(accept_loop(listener, state, files));
        Self { addr, accept }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop without waiting for the accept task to wind down
    pub fn abort(&self) {
        self.accept.abort();
    }

    /// Stop accepting and drop every open connection
    pub async fn stop(self) {
        self.accept.abort();
        let _ = self.accept.await;
        info!("MP web server on {} stopped", self.addr);
    }
}

async fn accept_loop(
    listener: TcpListener,
    state: Weak<Mutex<TxState>>,
    files: Arc<dyn FileIoProvider>,
) {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    debug!("MP web server: connection from {}", addr);
                    let state = state.clone();
                    let files = files.clone();
                    connections.spawn(async move {
                        if let Err(e) = handle_connection(stream, state, files).await {
                            debug!("MP web server: connection {} failed: {}", addr, e);
                        }
                    });
                }
                Err(e) => error!("MP web server: error accepting connection: {}", e),
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }
}

/// Method and target of a request whose headers have been read
struct RequestHead {
    method: String,
    target: String,
}

/// Read one line of at most `MAX_LINE_LEN` bytes
async fn read_bounded_line<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    line: &mut String,
) -> io::Result<usize> {
    let n = (&mut *reader).take(MAX_LINE_LEN).read_line(line).await?;
    if n as u64 == MAX_LINE_LEN && !line.ends_with('\n') {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "request line too long"));
    }
    Ok(n)
}

async fn read_head<R: AsyncBufRead + Unpin>(reader: &mut R) -> io::Result<Option<RequestHead>> {
    let mut line = String::new();
    if read_bounded_line(reader, &mut line).await? == 0 {
        return Ok(None);
    }
    let mut parts = line.split_whitespace();
    let (Some(method), Some(target)) = (parts.next(), parts.next()) else {
        return Ok(None);
    };
    let head = RequestHead {
        method: method.to_string(),
        target: target.to_string(),
    };

    for _ in 0..MAX_HEADER_LINES {
        let mut header = String::new();
        let n = read_bounded_line(reader, &mut header).await?;
        if n == 0 || header.trim_end().is_empty() {
            break;
        }
    }
    Ok(Some(head))
}

async fn handle_connection(
    stream: TcpStream,
    state: Weak<Mutex<TxState>>,
    files: Arc<dyn FileIoProvider>,
) -> io::Result<()> {
    let mut reader = BufReader::new(stream);
    let head = tokio::time::timeout(HEADER_TIMEOUT, read_head(&mut reader))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "request headers timed out"))??;
    let Some(RequestHead { method, target }) = head else {
        return Ok(());
    };
    if method != "GET" {
        debug!("MP web server: closing {} {} request", method, target);
        return Ok(());
    }
    let mut stream = reader.into_inner();

    match route(&target) {
        Route::Info => write_response(&mut stream, "200 OK", "text/plain", INFO_BODY.as_bytes()).await,
        Route::File(id) => {
            let served = match state.upgrade() {
                Some(tx) => tx.lock().await.served_file(id),
                None => None,
            };
            match served {
                Some((path, size)) => serve_file(&mut stream, &*files, &path, size).await,
                None => not_found(&mut stream).await,
            }
        }
        Route::NotFound => not_found(&mut stream).await,
    }
}

async fn write_head<W: AsyncWrite + Unpin>(
    out: &mut W,
    status: &str,
    content_type: &str,
    len: u64,
) -> io::Result<()> {
    let head = format!(
        "HTTP/1.1 {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        status, content_type, len
    );
    out.write_all(head.as_bytes()).await
}

async fn write_response<W: AsyncWrite + Unpin>(
    out: &mut W,
    status: &str,
    content_type: &str,
    body: &[u8],
) -> io::Result<()> {
    write_head(out, status, content_type, body.len() as u64).await?;
    out.write_all(body).await?;
    out.flush().await
}

async fn not_found<W: AsyncWrite + Unpin>(out: &mut W) -> io::Result<()> {
    write_response(out, "404 Not Found", "text/html", NOT_FOUND_BODY.as_bytes()).await
}

async fn serve_file<W: AsyncWrite + Unpin>(
    out: &mut W,
    files: &dyn FileIoProvider,
    path: &Path,
    size: u64,
) -> io::Result<()> {
    let reader = match files.open_read(path).await {
        Ok(reader) => reader,
        Err(e) => {
            debug!("MP web server: cannot open {}: {}", path.display(), e);
            return not_found(out).await;
        }
    };
    write_head(out, "200 OK", "application/octet-stream", size).await?;
    copy_chunked(reader, out).await?;
    out.flush().await
}

/// Copy `reader` to `out` in `SERVE_CHUNK_SIZE` pieces
async fn copy_chunked<R, W>(mut reader: R, out: &mut W) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = [0u8; SERVE_CHUNK_SIZE];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(total);
        }
        out.write_all(&buf[..n]).await?;
        total += n as u64;
    }
}
