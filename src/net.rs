//! Outbound TCP dialing with address-family preference.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use n0_error::e;
use tokio::net::{TcpStream, lookup_host};
use tokio_util::time::FutureExt;
use tracing::debug;

use crate::error::UpstreamError;

/// Deadline applied to every outbound TCP connect.
pub(crate) const CONNECT_DEADLINE: Duration = Duration::from_secs(10);

/// IP address family of a socket address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddrFamily {
    V4,
    V6,
}

impl AddrFamily {
    /// The family of `addr`.
    pub fn of(addr: &SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(_) => Self::V4,
            SocketAddr::V6(_) => Self::V6,
        }
    }

    fn matches(self, addr: &SocketAddr) -> bool {
        Self::of(addr) == self
    }
}

/// Opens a TCP connection to `host:port`.
///
/// A literal IP connects directly. A name with no family preference is
/// connected through the resolver-ordered address list. With a preference,
/// the resolved addresses are searched for the first match of that family,
/// then the first of the opposite family, then the first returned.
pub async fn dial(
    host: &str,
    port: u16,
    preferred: Option<AddrFamily>,
) -> Result<TcpStream, UpstreamError> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return connect(SocketAddr::new(ip, port)).await;
    }

    let Some(preferred) = preferred else {
        // No preference: let the OS walk the resolved list in order.
        let addr = format!("{host}:{port}");
        return match TcpStream::connect(&addr).timeout(CONNECT_DEADLINE).await {
            Err(_elapsed) => Err(e!(UpstreamError::ConnectTimeout { addr })),
            Ok(Err(source)) => Err(e!(UpstreamError::Connect { addr, source })),
            Ok(Ok(stream)) => Ok(stream),
        };
    };

    let addrs: Vec<SocketAddr> = lookup_host((host, port))
        .await
        .map_err(|source| {
            e!(UpstreamError::Resolve {
                host: host.to_string(),
                source,
            })
        })?
        .collect();
    let addr = select_addr(&addrs, preferred).ok_or_else(|| {
        e!(UpstreamError::NoAddresses {
            host: host.to_string(),
        })
    })?;
    debug!(%host, %addr, ?preferred, "resolved target");
    connect(addr).await
}

/// Picks an address per the family preference rules.
fn select_addr(addrs: &[SocketAddr], preferred: AddrFamily) -> Option<SocketAddr> {
    addrs
        .iter()
        .find(|addr| preferred.matches(addr))
        .or_else(|| addrs.iter().find(|addr| !preferred.matches(addr)))
        .or_else(|| addrs.first())
        .copied()
}

async fn connect(addr: SocketAddr) -> Result<TcpStream, UpstreamError> {
    match TcpStream::connect(addr).timeout(CONNECT_DEADLINE).await {
        Err(_elapsed) => Err(e!(UpstreamError::ConnectTimeout {
            addr: addr.to_string(),
        })),
        Ok(Err(source)) => Err(e!(UpstreamError::Connect {
            addr: addr.to_string(),
            source,
        })),
        Ok(Ok(stream)) => Ok(stream),
    }
}
