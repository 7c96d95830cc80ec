//! Minimal SOCKS5 client: RFC 1928 no-auth CONNECT.

use std::net::{Ipv4Addr, Ipv6Addr};

use n0_error::e;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use crate::error::UpstreamError;
use crate::net::{self, AddrFamily};
use crate::parse::Authority;

const VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const CMD_CONNECT: u8 = 0x01;

const ATYP_V4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_V6: u8 = 0x04;

/// Standard reply reasons per RFC 1928 §6.
fn reply_reason(code: u8) -> &'static str {
    match code {
        0x01 => "general SOCKS server failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unassigned failure code",
    }
}

/// Opens a tunnel to `target` through the SOCKS5 server at `proxy`.
///
/// Performs the no-auth method negotiation and a CONNECT request, consumes
/// the server's bound-address reply entirely, and returns the stream ready
/// to carry tunnel bytes.
pub async fn connect(
    proxy: &Authority,
    target: &Authority,
    preferred: Option<AddrFamily>,
) -> Result<TcpStream, UpstreamError> {
    let mut stream = net::dial(&proxy.host, proxy.port, preferred).await?;

    stream
        .write_all(&[VERSION, 1, METHOD_NO_AUTH])
        .await
        .map_err(|source| e!(UpstreamError::Io { source }))?;
    let mut method = [0u8; 2];
    stream
        .read_exact(&mut method)
        .await
        .map_err(|source| e!(UpstreamError::Io { source }))?;
    if method != [VERSION, METHOD_NO_AUTH] {
        return Err(e!(UpstreamError::HandshakeRejected { method: method[1] }));
    }

    let request = encode_connect_request(target)?;
    stream
        .write_all(&request)
        .await
        .map_err(|source| e!(UpstreamError::Io { source }))?;

    let mut header = [0u8; 4];
    stream
        .read_exact(&mut header)
        .await
        .map_err(|source| e!(UpstreamError::Io { source }))?;
    if header[1] != 0x00 {
        return Err(e!(UpstreamError::ConnectRefused {
            code: header[1],
            reason: reply_reason(header[1]),
        }));
    }

    consume_bound_addr(&mut stream, header[3]).await?;
    debug!(%proxy, %target, "socks5 tunnel established");
    Ok(stream)
}

/// Encodes `05 01 00 ATYP ADDR PORT`, choosing the address type by whether
/// the target host is a literal v4, literal v6, or a name.
fn encode_connect_request(target: &Authority) -> Result<Vec<u8>, UpstreamError> {
    let mut request = vec![VERSION, CMD_CONNECT, 0x00];
    if let Ok(v4) = target.host.parse::<Ipv4Addr>() {
        request.push(ATYP_V4);
        request.extend_from_slice(&v4.octets());
    } else if let Ok(v6) = target.host.parse::<Ipv6Addr>() {
        request.push(ATYP_V6);
        request.extend_from_slice(&v6.octets());
    } else {
        if target.host.len() > 255 {
            return Err(e!(UpstreamError::HostTooLong {
                host: target.host.clone(),
            }));
        }
        request.push(ATYP_DOMAIN);
        request.push(target.host.len() as u8);
        request.extend_from_slice(target.host.as_bytes());
    }
    request.extend_from_slice(&target.port.to_be_bytes());
    Ok(request)
}

/// Drains the BND.ADDR/BND.PORT tail of a successful reply so no reply
/// bytes leak into the tunnel.
async fn consume_bound_addr(stream: &mut TcpStream, atyp: u8) -> Result<(), UpstreamError> {
    let len = match atyp {
        ATYP_V4 => 4 + 2,
        ATYP_V6 => 16 + 2,
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream
                .read_exact(&mut len)
                .await
                .map_err(|source| e!(UpstreamError::Io { source }))?;
            len[0] as usize + 2
        }
        other => {
            return Err(e!(UpstreamError::MalformedResponse {
                reason: format!("unknown bound address type {other:#04x}"),
            }));
        }
    };
    let mut tail = vec![0u8; len];
    stream
        .read_exact(&mut tail)
        .await
        .map_err(|source| e!(UpstreamError::Io { source }))?;
    Ok(())
}
