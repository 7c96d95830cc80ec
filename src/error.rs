use std::io;

use n0_error::{AnyError, stack_error};

/// Errors raised while establishing an outbound stream to a target, either
/// directly or through a configured upstream.
#[stack_error(derive, add_meta)]
#[non_exhaustive]
pub enum UpstreamError {
    /// Name resolution returned no usable addresses.
    #[error("no addresses resolved for {host}")]
    NoAddresses { host: String },

    /// Name resolution failed outright.
    #[error("failed to resolve {host}")]
    Resolve {
        host: String,
        #[error(source, std_err)]
        source: io::Error,
    },

    /// The TCP connect to the target or upstream failed.
    #[error("failed to connect to {addr}")]
    Connect {
        addr: String,
        #[error(source, std_err)]
        source: io::Error,
    },

    /// The TCP connect did not complete within the dial deadline.
    #[error("timed out connecting to {addr}")]
    ConnectTimeout { addr: String },

    /// The SOCKS5 server did not accept the no-auth method.
    #[error("socks5 upstream rejected the handshake (offered method {method})")]
    HandshakeRejected { method: u8 },

    /// The SOCKS5 server answered the CONNECT request with a failure status.
    #[error("socks5 upstream refused the connection: {reason} (status {code})")]
    ConnectRefused { code: u8, reason: &'static str },

    /// The HTTP upstream answered the CONNECT request with a non-200 status.
    #[error("http upstream rejected the tunnel: {status} {reason}")]
    UpstreamRejected { status: u16, reason: String },

    /// The entry's configured type is not a protocol the dispatcher
    /// speaks. Not retryable for this entry; selection moves on.
    #[error("unsupported upstream type {kind:?}")]
    UnsupportedUpstreamType { kind: String },

    /// The target domain name does not fit a SOCKS5 address field.
    #[error("target host {host} exceeds the 255 byte SOCKS5 limit")]
    HostTooLong { host: String },

    /// IO on the upstream control stream failed mid-handshake.
    #[error("io error while talking to the upstream")]
    Io {
        #[error(source, std_err)]
        source: io::Error,
    },

    /// The upstream sent a malformed handshake response.
    #[error("malformed response from upstream: {reason}")]
    MalformedResponse { reason: String },

    /// Every configured upstream was tried and none produced a stream.
    ///
    /// `attempts` lists one rendered `label: error` entry per tried
    /// upstream, in attempt order.
    #[error("all {attempted} upstream attempts failed")]
    AllUpstreamsFailed {
        attempted: usize,
        attempts: Vec<String>,
    },
}

impl UpstreamError {
    /// Per-entry failures carried by [`UpstreamError::AllUpstreamsFailed`].
    pub fn attempts(&self) -> Option<&[String]> {
        match self {
            UpstreamError::AllUpstreamsFailed { attempts, .. } => Some(attempts),
            _ => None,
        }
    }
}

/// Errors local to one accepted client connection.
///
/// Anything raised before the relay phase closes only that connection; the
/// listener and all other connections are unaffected.
#[stack_error(derive, add_meta)]
#[non_exhaustive]
pub enum ProxyError {
    /// The client closed the connection before sending any bytes.
    #[error("client closed the connection before sending data")]
    ClientDisconnect,

    /// No bytes arrived within the classification deadline.
    #[error("timed out waiting for the first client bytes")]
    ClassifyTimeout,

    /// The client opened a TLS handshake but the listener has no certificate.
    #[error("client sent a TLS hello but TLS is not enabled on this listener")]
    TlsNotEnabled,

    /// The TLS server handshake with the client failed.
    #[error("tls handshake with client failed")]
    TlsHandshake {
        #[error(source, std_err)]
        source: io::Error,
    },

    /// The proxy request could not be parsed.
    #[error("bad request: {reason}")]
    BadRequest { reason: String },

    /// No upstream (or direct dial) produced a stream for the target.
    #[error("failed to open an upstream stream")]
    Upstream {
        #[error(source)]
        source: AnyError,
    },

    /// IO on the client stream failed before the relay started.
    #[error("io error on the client stream")]
    Io {
        #[error(source, std_err)]
        source: io::Error,
    },
}

/// Errors raised by the helper-process supervisor.
#[stack_error(derive, add_meta)]
#[non_exhaustive]
pub enum SupervisorError {
    /// Spawning the configured executable failed.
    #[error("failed to spawn {command}")]
    Spawn {
        command: String,
        #[error(source, std_err)]
        source: io::Error,
    },

    /// The child exited during the startup delay.
    #[error("{name} exited during startup ({status})")]
    EarlyExit { name: String, status: String },

    /// The configured executable name is empty after expansion.
    #[error("no executable configured for {name}")]
    MissingExecutable { name: String },

    /// A platform containment operation failed.
    #[error("process containment failed during {op}")]
    Containment {
        op: &'static str,
        #[error(source, std_err)]
        source: io::Error,
    },
}
