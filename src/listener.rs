//! TCP accept loop for the proxy port.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use n0_error::{Result, StdResultExt};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error_span, warn};

use crate::handler::{self, ProxyContext};

/// Binds the proxy listener.
///
/// Prefers a dual-stack IPv6 socket on `::` so both address families are
/// served from one port; falls back to a v4 socket when the platform
/// refuses the v6 bind.
pub(crate) fn bind(port: u16) -> Result<TcpListener> {
    let v6 = SocketAddr::from((Ipv6Addr::UNSPECIFIED, port));
    match bind_socket(v6, true) {
        Ok(listener) => Ok(listener),
        Err(err) => {
            warn!("dual-stack bind failed ({err:#}), falling back to ipv4");
            let v4 = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
            bind_socket(v4, false).std_context("failed to bind listener socket")
        }
    }
}

fn bind_socket(addr: SocketAddr, dual_stack: bool) -> std::io::Result<TcpListener> {
    let domain = if addr.is_ipv6() {
        Domain::IPV6
    } else {
        Domain::IPV4
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    if dual_stack {
        // Best effort; some platforms are dual-stack by default and
        // reject the option.
        let _ = socket.set_only_v6(false);
    }
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;
    TcpListener::from_std(socket.into())
}

/// Accepts connections until `cancel` fires, dispatching each to its own
/// handler task.
///
/// Accept errors while running are logged and the loop continues; after
/// cancellation they are silent.
pub(crate) async fn serve(listener: TcpListener, ctx: Arc<ProxyContext>, cancel: CancellationToken) {
    let mut id: u64 = 0;
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer)) => {
                debug!(client = %peer, id, "accepted connection");
                let ctx = ctx.clone();
                tokio::spawn(
                    cancel
                        .child_token()
                        .run_until_cancelled_owned(handler::handle(stream, peer, ctx))
                        .instrument(error_span!("conn", id, client = %peer)),
                );
                id += 1;
            }
            Err(err) => {
                if cancel.is_cancelled() {
                    break;
                }
                warn!("accept failed: {err:#}");
            }
        }
    }
    debug!("listener stopped");
}
