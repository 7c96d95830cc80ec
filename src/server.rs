//! Proxy server lifecycle: composition of supervisors, TLS material, the
//! CRL responder, and the listener, with one idempotent shutdown path.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use n0_error::{Result, StackResultExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::time::FutureExt;
use tracing::{info, warn};

use crate::config::Config;
use crate::crl;
use crate::handler::ProxyContext;
use crate::listener;
use crate::supervisor::Supervisor;
use crate::tls::{self, ServerCert};
use crate::upstream::Selector;

/// How long shutdown waits for the listener and CRL tasks.
const SHUTDOWN_TASK_WAIT: Duration = Duration::from_secs(2);

/// A running proxy instance.
pub struct ProxyServer {
    cancel: CancellationToken,
    local_addr: SocketAddr,
    cert: Option<ServerCert>,
    supervisors: Vec<Supervisor>,
    tasks: Vec<JoinHandle<()>>,
}

impl ProxyServer {
    /// Starts everything the configuration asks for.
    ///
    /// Helper-process and CRL failures are logged and skipped; a bind
    /// failure or (when HTTPS is on) certificate failure aborts startup.
    pub async fn start(config: Config) -> Result<Self> {
        let proxy = &config.proxy;
        let upstreams = proxy.merged_upstreams();

        let mut supervisors = Vec::new();
        for upstream in upstreams.iter().filter(|u| u.enabled) {
            let Some(process) = &upstream.process else {
                continue;
            };
            if !process.auto_start {
                continue;
            }
            let probe =
                (!upstream.host.is_empty()).then(|| (upstream.host.clone(), upstream.port));
            let supervisor = Supervisor::new(
                upstream.label(),
                process.clone(),
                upstream.health_check.clone(),
                probe,
            );
            if let Err(err) = supervisor.start().await {
                warn!(upstream = %upstream.label(), "failed to start helper process: {err:#}");
            }
            supervisors.push(supervisor);
        }

        let (cert, tls_acceptor) = if proxy.use_https {
            tls::install_crypto_provider();
            let cert = if proxy.cert_file.is_empty() {
                ServerCert::self_signed()?
            } else {
                ServerCert::load(&proxy.cert_file, &proxy.key_file)?
            };
            let acceptor = cert.acceptor()?;
            (Some(cert), Some(acceptor))
        } else {
            (None, None)
        };

        let cancel = CancellationToken::new();
        let mut tasks = Vec::new();

        if proxy.crl_port != 0 {
            // Same dual-stack bind (and v4 fallback) as the proxy port.
            match listener::bind(proxy.crl_port) {
                Ok(listener) => {
                    info!(port = proxy.crl_port, "crl responder listening");
                    let body = Arc::new(crl::EMPTY_CRL_DER.to_vec());
                    tasks.push(tokio::spawn(crl::serve(listener, body, cancel.clone())));
                }
                Err(err) => warn!("failed to start crl responder: {err:#}"),
            }
        }

        let ctx = Arc::new(ProxyContext {
            selector: Selector::new(upstreams, proxy.load_balancing_strategy),
            tls: tls_acceptor,
        });
        let tcp = listener::bind(proxy.port).context("failed to bind proxy listener")?;
        let local_addr = tcp.local_addr()?;
        info!(%local_addr, https = proxy.use_https, "proxy listening");
        tasks.push(tokio::spawn(listener::serve(tcp, ctx, cancel.clone())));

        Ok(Self {
            cancel,
            local_addr,
            cert,
            supervisors,
            tasks,
        })
    }

    /// The bound address of the proxy listener.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The listener certificate, when HTTPS is enabled.
    pub fn tls_cert(&self) -> Option<&ServerCert> {
        self.cert.as_ref()
    }

    /// The supervisors constructed at startup, in upstream order.
    pub fn supervisors(&self) -> &[Supervisor] {
        &self.supervisors
    }

    /// Stops the listener, the CRL responder, and every supervisor, in
    /// that order. Safe to call more than once.
    pub async fn shutdown(&mut self) {
        self.cancel.cancel();
        for mut task in self.tasks.drain(..) {
            if (&mut task).timeout(SHUTDOWN_TASK_WAIT).await.is_err() {
                task.abort();
            }
        }
        for supervisor in &self.supervisors {
            supervisor.stop().await;
        }
        info!("proxy stopped");
    }
}

impl Drop for ProxyServer {
    fn drop(&mut self) {
        // Best effort when shutdown was never awaited; supervised
        // children also carry kill-on-drop.
        self.cancel.cancel();
    }
}
