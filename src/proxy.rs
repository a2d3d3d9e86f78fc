use crate::config::TimeoutConfig;
use crate::readiness::ReadinessFlag;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info};

/// Request lines matching either marker are liveness probes and always get a
/// successful response, so health-checking infrastructure never sees a
/// failure during boot or a transient backend hiccup.
const HEALTH_PROBE_MARKERS: [&str; 2] = ["GET / HTTP", "GET /_stcore/health"];

/// Cap on accumulated request line plus header bytes. Enforced per byte via
/// a `take` limit on every line read, so a single unterminated line cannot
/// buffer past it either; a client exceeding it is dropped without a
/// response.
const MAX_HEADER_BYTES: usize = 64 * 1024;

/// Served to generic requests while the backend boots. The meta refresh makes
/// browsers retry on their own every 3 seconds.
const LOADING_PAGE: &[u8] = b"HTTP/1.1 200 OK\r\n\
Content-Type: text/html; charset=utf-8\r\n\
Connection: close\r\n\r\n\
<html><head><meta http-equiv='refresh' content='3'></head>\
<body style='background:#1A1A1A;color:#FED100;display:flex;\
justify-content:center;align-items:center;height:100vh;font-family:sans-serif'>\
<h2>Loading application, one moment...</h2></body></html>";

/// Served to liveness probes while the backend is unreachable.
const HEALTH_OK: &[u8] = b"HTTP/1.1 200 OK\r\n\
Content-Type: text/plain\r\n\
Content-Length: 2\r\n\
Connection: close\r\n\r\n\
ok";

/// The public listener.
///
/// Accepts connections and spawns one fully independent handler task per
/// connection; the only shared state across handlers is the readiness flag.
pub struct ProxyServer {
    listener: TcpListener,
    upstream_addr: SocketAddr,
    readiness: ReadinessFlag,
    timeouts: TimeoutConfig,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyServer {
    /// Bind the public listener. Binding failures are startup errors.
    pub async fn bind(
        addr: SocketAddr,
        upstream_addr: SocketAddr,
        readiness: ReadinessFlag,
        timeouts: TimeoutConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind listener on {}: {}", addr, e))?;
        Ok(Self {
            listener,
            upstream_addr,
            readiness,
            timeouts,
            shutdown_rx,
        })
    }

    /// Address the listener actually bound (useful with port 0)
    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let local_addr = self.listener.local_addr()?;
        info!(
            addr = %local_addr,
            upstream = %self.upstream_addr,
            "Proxy server listening"
        );

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let upstream_addr = self.upstream_addr;
                            let readiness = self.readiness.clone();
                            let timeouts = self.timeouts.clone();
                            tokio::spawn(async move {
                                if let Err(e) =
                                    handle_connection(stream, addr, upstream_addr, readiness, timeouts).await
                                {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Proxy server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

/// Per-connection state machine: read the request line, accumulate raw header
/// bytes, then either serve a placeholder or relay to the backend.
///
/// Every exit path drops both sockets; errors and timeouts close the
/// connection without a response.
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    upstream_addr: SocketAddr,
    readiness: ReadinessFlag,
    timeouts: TimeoutConfig,
) -> anyhow::Result<()> {
    let read_timeout = timeouts.header_read();
    let mut client = BufReader::new(stream);
    let mut budget = MAX_HEADER_BYTES;

    // Request line. An empty read means the client went away.
    let mut request_line = Vec::new();
    let n = read_line_capped(&mut client, &mut request_line, budget, read_timeout).await?;
    if n == 0 {
        return Ok(());
    }
    budget -= n;
    if !request_line.ends_with(b"\n") && budget == 0 {
        debug!(addr = %addr, "Request line exceeds the header cap, dropping connection");
        return Ok(());
    }

    let request_line_text = String::from_utf8_lossy(&request_line).trim().to_string();
    let is_probe = is_health_probe(&request_line_text);

    // Raw header bytes, blank line included, never parsed. EOF mid-headers is
    // tolerated; whatever was read is forwarded as-is.
    let mut header_bytes = Vec::new();
    loop {
        if budget == 0 {
            debug!(addr = %addr, "Header block exceeds the cap, dropping connection");
            return Ok(());
        }
        let line_start = header_bytes.len();
        let n = read_line_capped(&mut client, &mut header_bytes, budget, read_timeout).await?;
        if n == 0 {
            break;
        }
        budget -= n;
        let line = &header_bytes[line_start..];
        if line == b"\r\n" || line == b"\n" {
            break;
        }
        if !line.ends_with(b"\n") && budget == 0 {
            debug!(addr = %addr, "Header block exceeds the cap, dropping connection");
            return Ok(());
        }
    }

    if !readiness.is_ready() {
        debug!(addr = %addr, request_line = %request_line_text, is_probe, "Backend not ready, serving placeholder");
        return write_placeholder(&mut client, is_probe).await;
    }

    // Readiness is trusted but the backend may still refuse; degrade to the
    // placeholder instead of surfacing an error to the client.
    let mut upstream =
        match tokio::time::timeout(timeouts.upstream_connect(), TcpStream::connect(upstream_addr))
            .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                debug!(addr = %addr, upstream = %upstream_addr, error = %e, "Upstream connect failed, serving placeholder");
                return write_placeholder(&mut client, is_probe).await;
            }
            Err(_) => {
                debug!(addr = %addr, upstream = %upstream_addr, "Upstream connect timed out, serving placeholder");
                return write_placeholder(&mut client, is_probe).await;
            }
        };

    // Replay the buffered request head verbatim, then go byte-for-byte.
    upstream.write_all(&request_line).await?;
    upstream.write_all(&header_bytes).await?;
    upstream.flush().await?;

    debug!(addr = %addr, request_line = %request_line_text, "Relaying connection to backend");
    relay(client, upstream, timeouts.relay_chunk_bytes).await;

    Ok(())
}

/// Read one `\n`-terminated line with a timeout, never buffering more than
/// `limit` further bytes. A line that never terminates returns once the
/// limit is consumed; the caller tells that apart from EOF by the budget.
async fn read_line_capped(
    client: &mut BufReader<TcpStream>,
    buf: &mut Vec<u8>,
    limit: usize,
    read_timeout: Duration,
) -> anyhow::Result<usize> {
    let mut limited = client.take(limit as u64);
    let n = tokio::time::timeout(read_timeout, limited.read_until(b'\n', buf))
        .await
        .map_err(|_| anyhow::anyhow!("Timed out reading request head"))??;
    Ok(n)
}

fn is_health_probe(request_line: &str) -> bool {
    HEALTH_PROBE_MARKERS
        .iter()
        .any(|marker| request_line.contains(marker))
}

async fn write_placeholder<W>(stream: &mut W, is_probe: bool) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let payload = if is_probe { HEALTH_OK } else { LOADING_PAGE };
    stream.write_all(payload).await?;
    stream.flush().await?;
    Ok(())
}

/// Bidirectional passthrough. Whichever direction finishes first wins the
/// select and both connections are dropped together; there is no half-close.
async fn relay(client: BufReader<TcpStream>, upstream: TcpStream, chunk_size: usize) {
    let (client_read, client_write) = tokio::io::split(client);
    let (upstream_read, upstream_write) = upstream.into_split();

    tokio::select! {
        _ = pump(client_read, upstream_write, chunk_size) => {}
        _ = pump(upstream_read, client_write, chunk_size) => {}
    }
}

/// One directional copy loop: read up to a chunk, write it unmodified,
/// repeat until EOF or an I/O error. Errors only end this connection.
async fn pump<R, W>(mut from: R, mut to: W, chunk_size: usize)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; chunk_size];
    loop {
        let n = match from.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        if to.write_all(&buf[..n]).await.is_err() {
            break;
        }
        if to.flush().await.is_err() {
            break;
        }
    }
}
