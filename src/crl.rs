//! Static-byte CRL distribution endpoint.
//!
//! Clients that validate the locally issued server certificate may fetch a
//! revocation list from the port configured as `crl_port`. The body is a
//! fixed blob; every connection gets the same response.

use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Placeholder DER body served when no real CRL has been provisioned: an
/// empty ASN.1 SEQUENCE.
pub(crate) const EMPTY_CRL_DER: &[u8] = &[0x30, 0x00];

/// Serves `body` to every connection accepted on `listener` until `cancel`
/// fires.
pub(crate) async fn serve(listener: TcpListener, body: Arc<Vec<u8>>, cancel: CancellationToken) {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((mut stream, peer)) => {
                debug!(client = %peer, "serving crl");
                let body = body.clone();
                tokio::spawn(async move {
                    let header = format!(
                        "HTTP/1.1 200 OK\r\nContent-Type: application/pkix-crl\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                        body.len()
                    );
                    let result = async {
                        stream.write_all(header.as_bytes()).await?;
                        stream.write_all(&body).await?;
                        stream.shutdown().await
                    }
                    .await;
                    if let Err(err) = result {
                        debug!("failed to serve crl response: {err:#}");
                    }
                });
            }
            Err(err) => {
                if cancel.is_cancelled() {
                    break;
                }
                warn!("crl accept failed: {err:#}");
            }
        }
    }
    debug!("crl responder stopped");
}
