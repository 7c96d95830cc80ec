//! Upstream selection: walks the enabled upstream list under the
//! configured load-balancing strategy and speaks each entry's protocol.

use std::sync::atomic::{AtomicU64, Ordering};

use n0_error::e;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::config::{Strategy, Upstream, UpstreamKind};
use crate::error::UpstreamError;
use crate::net::{self, AddrFamily};
use crate::parse::Authority;
use crate::{http_connect, socks5};

/// Picks and dials upstreams for outbound tunnels.
///
/// Holds the enabled upstream entries (read-only after startup) and the
/// round-robin cursor. With no enabled entries every connection goes out
/// directly.
#[derive(Debug)]
pub struct Selector {
    upstreams: Vec<Upstream>,
    strategy: Strategy,
    cursor: AtomicU64,
}

impl Selector {
    /// Builds a selector over the enabled entries of `upstreams`,
    /// preserving configuration order.
    pub fn new(upstreams: Vec<Upstream>, strategy: Strategy) -> Self {
        let upstreams: Vec<Upstream> = upstreams.into_iter().filter(|u| u.enabled).collect();
        debug!(
            enabled = upstreams.len(),
            ?strategy,
            "upstream selector ready"
        );
        Self {
            upstreams,
            strategy,
            cursor: AtomicU64::new(0),
        }
    }

    /// The enabled entries, in configuration order.
    pub fn upstreams(&self) -> &[Upstream] {
        &self.upstreams
    }

    /// Opens a stream to `target`, walking the upstreams per the strategy
    /// and failing over on per-entry errors.
    pub async fn connect(
        &self,
        target: &Authority,
        preferred: Option<AddrFamily>,
    ) -> Result<TcpStream, UpstreamError> {
        if self.upstreams.is_empty() {
            debug!(%target, "no upstreams configured, dialing directly");
            return net::dial(&target.host, target.port, preferred).await;
        }

        let mut attempts = Vec::new();
        for idx in self.attempt_order() {
            let upstream = &self.upstreams[idx];
            let label = upstream.label();
            if upstream.host.is_empty() {
                debug!(upstream = %label, "skipping upstream without a host");
                continue;
            }
            if upstream.kind == UpstreamKind::Direct {
                debug!(upstream = %label, "skipping direct upstream entry");
                continue;
            }
            let proxy = Authority::new(upstream.host.clone(), upstream.port);
            let result = match &upstream.kind {
                UpstreamKind::Socks5 => socks5::connect(&proxy, target, preferred).await,
                UpstreamKind::Http => http_connect::connect(&proxy, target, preferred).await,
                UpstreamKind::Direct => unreachable!("skipped above"),
                UpstreamKind::Other(kind) => Err(e!(UpstreamError::UnsupportedUpstreamType {
                    kind: kind.clone(),
                })),
            };
            match result {
                Ok(stream) => {
                    info!(upstream = %label, %target, "connected via upstream");
                    return Ok(stream);
                }
                Err(err) => {
                    warn!(upstream = %label, %target, "upstream attempt failed: {err:#}");
                    attempts.push(format!("{label}: {err:#}"));
                }
            }
        }

        Err(e!(UpstreamError::AllUpstreamsFailed {
            attempted: attempts.len(),
            attempts,
        }))
    }

    /// Indices to try, in order.
    ///
    /// Failover walks the list as configured. Round-robin advances a
    /// wrapping counter whose pre-increment value picks the rotation
    /// start, so the first connection after construction starts at
    /// index 0.
    fn attempt_order(&self) -> Vec<usize> {
        let len = self.upstreams.len();
        match self.strategy {
            Strategy::Failover => (0..len).collect(),
            Strategy::RoundRobin => {
                let start = (self.cursor.fetch_add(1, Ordering::Relaxed) % len as u64) as usize;
                (0..len).map(|offset| (start + offset) % len).collect()
            }
        }
    }
}
