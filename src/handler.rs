//! Per-connection request pipeline.
//!
//! Each accepted client socket runs through one state machine: classify
//! the first bytes, optionally terminate TLS, parse a single proxy
//! request, open the upstream stream, then relay bytes in both directions
//! until either side closes. One request per connection; failures close
//! only that connection.

use std::net::SocketAddr;
use std::sync::Arc;

use n0_error::{anyerr, e};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, warn};

use crate::error::ProxyError;
use crate::net::AddrFamily;
use crate::parse::{self, Authority, RequestHead};
use crate::sniff::{self, Prefixed, Verdict};
use crate::upstream::Selector;

/// Buffer size for each relay direction.
const RELAY_BUF_LEN: usize = 80 * 1024;

/// Shared state for all connections: the upstream selector and the
/// optional TLS acceptor.
pub struct ProxyContext {
    pub selector: Selector,
    pub tls: Option<TlsAcceptor>,
}

/// Runs one accepted connection to completion, logging the outcome.
pub(crate) async fn handle(stream: TcpStream, peer: SocketAddr, ctx: Arc<ProxyContext>) {
    let family = AddrFamily::of(&peer);
    if let Err(err) = handle_inner(stream, family, &ctx).await {
        match &err {
            ProxyError::ClientDisconnect { .. }
            | ProxyError::ClassifyTimeout { .. }
            | ProxyError::TlsNotEnabled { .. }
            | ProxyError::TlsHandshake { .. } => warn!("closing connection: {err:#}"),
            _ => error!("failed to handle connection: {err:#}"),
        }
    }
}

async fn handle_inner(
    stream: TcpStream,
    family: AddrFamily,
    ctx: &ProxyContext,
) -> Result<(), ProxyError> {
    let (stream, verdict) = sniff::sniff(stream).await?;
    match verdict {
        Verdict::Tls => {
            let Some(acceptor) = &ctx.tls else {
                return Err(e!(ProxyError::TlsNotEnabled));
            };
            let stream = acceptor
                .accept(stream)
                .await
                .map_err(|source| e!(ProxyError::TlsHandshake { source }))?;
            debug!("tls terminated");
            serve_request(stream, family, ctx).await
        }
        Verdict::Clear => serve_request(stream, family, ctx).await,
    }
}

/// Parses the single proxy request on `stream` and dispatches it.
async fn serve_request<S>(stream: S, family: AddrFamily, ctx: &ProxyContext) -> Result<(), ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (read_half, mut write_half) = tokio::io::split(stream);
    let mut reader = Prefixed::new(read_half, crate::HEADER_SECTION_MAX_LENGTH);
    let (header_len, head) = RequestHead::peek(&mut reader).await.map_err(|err| {
        e!(ProxyError::BadRequest {
            reason: format!("{err:#}"),
        })
    })?;

    if head.method.eq_ignore_ascii_case("CONNECT") {
        let target = Authority::parse(&head.target, 443).map_err(|err| {
            e!(ProxyError::BadRequest {
                reason: format!("invalid CONNECT target: {err:#}"),
            })
        })?;
        debug!(%target, "connect request");
        let upstream = ctx
            .selector
            .connect(&target, Some(family))
            .await
            .map_err(|err| e!(ProxyError::Upstream {
                source: anyerr!(err),
            }))?;

        // The tunnel headers are not forwarded; everything after the
        // header section belongs to the tunnel.
        reader.discard(header_len);
        write_half
            .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
            .await
            .map_err(|source| e!(ProxyError::Io { source }))?;
        write_half
            .flush()
            .await
            .map_err(|source| e!(ProxyError::Io { source }))?;
        relay(reader, write_half, upstream, &target).await;
        Ok(())
    } else {
        let (target, path) = if parse::is_absolute_form(&head.target) {
            parse::split_absolute_form(&head.target).map_err(|err| {
                e!(ProxyError::BadRequest {
                    reason: format!("invalid absolute-form target: {err:#}"),
                })
            })?
        } else {
            let host = head.host_header().ok_or_else(|| {
                e!(ProxyError::BadRequest {
                    reason: "no Host header and no absolute-form target".to_string(),
                })
            })?;
            let authority = Authority::parse(host, 80).map_err(|err| {
                e!(ProxyError::BadRequest {
                    reason: format!("invalid Host header: {err:#}"),
                })
            })?;
            (authority, head.target.clone())
        };
        debug!(method = %head.method, %target, "forward request");
        let mut upstream = ctx
            .selector
            .connect(&target, Some(family))
            .await
            .map_err(|err| e!(ProxyError::Upstream {
                source: anyerr!(err),
            }))?;

        // Rewrite the request line to origin form; the header block is
        // forwarded byte for byte as received.
        let buffered = reader.peeked();
        let line_len = parse::line_end(buffered).unwrap_or(header_len);
        let header_block = buffered[line_len.min(header_len)..header_len].to_vec();
        reader.discard(header_len);

        let request_line = format!("{} {} {}\r\n", head.method, path, head.version);
        let write_head = async {
            upstream.write_all(request_line.as_bytes()).await?;
            upstream.write_all(&header_block).await?;
            upstream.flush().await
        };
        write_head
            .await
            .map_err(|source| e!(ProxyError::Io { source }))?;
        relay(reader, write_half, upstream, &target).await;
        Ok(())
    }
}

/// Relays both directions until each source reaches EOF or errors.
///
/// Stream termination mid-relay is indistinguishable from a benign close,
/// so both outcomes are logged at debug level.
async fn relay<R, W>(client_read: R, client_write: W, upstream: TcpStream, target: &Authority)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let (upstream_read, upstream_write) = upstream.into_split();
    let (to_upstream, to_client) = tokio::join!(
        copy_half(client_read, upstream_write),
        copy_half(upstream_read, client_write),
    );
    match (&to_upstream, &to_client) {
        (Ok(up), Ok(down)) => {
            debug!(%target, client_to_upstream = up, upstream_to_client = down, "relay finished")
        }
        _ => debug!(%target, ?to_upstream, ?to_client, "relay terminated"),
    }
}

/// Copies until EOF with a relay-sized buffer, then shuts down the write
/// side so the peer sees EOF.
async fn copy_half(
    mut reader: impl AsyncRead + Unpin,
    mut writer: impl AsyncWrite + Unpin,
) -> std::io::Result<u64> {
    let mut buf = vec![0u8; RELAY_BUF_LEN];
    let mut total = 0u64;
    let result = loop {
        match reader.read(&mut buf).await {
            Ok(0) => break Ok(total),
            Ok(n) => match writer.write_all(&buf[..n]).await {
                Ok(()) => total += n as u64,
                Err(err) => break Err(err),
            },
            Err(err) => break Err(err),
        }
    };
    writer.shutdown().await.ok();
    result
}
