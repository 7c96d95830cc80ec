//! Listener-side TLS material.
//!
//! The proxy terminates TLS for the proxy-protocol layer only; tunneled
//! payloads are never decrypted. CA hierarchy generation and trust-store
//! installation happen outside this crate — here we either load a prepared
//! PEM pair or mint an ephemeral self-signed certificate.

use std::io::BufReader;
use std::sync::Arc;

use n0_error::{Result, StackResultExt, StdResultExt};
use tokio_rustls::TlsAcceptor;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::{ServerConfig, version};
use tracing::info;

/// Installs the process-wide rustls crypto provider. Safe to call more
/// than once; later calls are no-ops.
pub fn install_crypto_provider() {
    let _ = tokio_rustls::rustls::crypto::ring::default_provider().install_default();
}

/// Certificate chain and private key used for TLS on the listener.
///
/// Loaded once at startup and shared read-only by every accepted
/// connection.
pub struct ServerCert {
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
}

impl ServerCert {
    /// Loads a PEM certificate chain and private key from disk.
    pub fn load(cert_file: &str, key_file: &str) -> Result<Self> {
        let mut cert_reader = BufReader::new(
            std::fs::File::open(cert_file)
                .std_context(format!("failed to open certificate file {cert_file}"))?,
        );
        let certs = rustls_pemfile::certs(&mut cert_reader)
            .collect::<Result<Vec<_>, _>>()
            .std_context("failed to parse certificate file")?;

        let mut key_reader = BufReader::new(
            std::fs::File::open(key_file)
                .std_context(format!("failed to open key file {key_file}"))?,
        );
        let key = rustls_pemfile::private_key(&mut key_reader)
            .std_context("failed to parse key file")?
            .context("no private key found in key file")?;

        info!(%cert_file, "loaded server certificate");
        Ok(Self { certs, key })
    }

    /// Mints an ephemeral self-signed certificate for loopback use.
    pub fn self_signed() -> Result<Self> {
        let key_pair = rcgen::KeyPair::generate().std_context("failed to generate key pair")?;
        let params = rcgen::CertificateParams::new(vec![
            "localhost".to_string(),
            "127.0.0.1".to_string(),
            "::1".to_string(),
        ])
        .std_context("invalid certificate parameters")?;
        let cert = params
            .self_signed(&key_pair)
            .std_context("failed to self-sign certificate")?;
        info!("generated ephemeral self-signed server certificate");
        Ok(Self {
            certs: vec![cert.der().clone()],
            key: PrivateKeyDer::Pkcs8(key_pair.serialize_der().into()),
        })
    }

    /// The leaf certificate in DER form.
    pub fn leaf_der(&self) -> &CertificateDer<'static> {
        &self.certs[0]
    }

    /// Builds a TLS acceptor restricted to TLS 1.2 and 1.3, without client
    /// certificate requirements.
    pub fn acceptor(&self) -> Result<TlsAcceptor> {
        let config =
            ServerConfig::builder_with_protocol_versions(&[&version::TLS13, &version::TLS12])
                .with_no_client_auth()
                .with_single_cert(self.certs.clone(), self.key.clone_key())
                .std_context("invalid certificate or key")?;
        Ok(TlsAcceptor::from(Arc::new(config)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn self_signed_material_builds_an_acceptor() {
        install_crypto_provider();
        let cert = ServerCert::self_signed().unwrap();
        assert!(!cert.leaf_der().as_ref().is_empty());
        cert.acceptor().unwrap();
    }
}
