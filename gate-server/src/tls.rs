//! Optional TLS termination for the session listener, driven by the
//! `-tls-key`/`-tls-cert` flags. Transport security itself is out of
//! scope for the gateway's core; this module only wires the configured
//! keypair into a `tokio_rustls::TlsAcceptor` so `main.rs` can upgrade
//! accepted connections when TLS is configured.

use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use anyhow::{Context, Result};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::TlsAcceptor;

use crate::config::TlsConfig;

/// Builds a `TlsAcceptor` from a PEM certificate chain and private key.
/// Installs the process-wide default crypto provider on first use, the
/// way `rustls` 0.23 expects callers to do exactly once at startup.
pub fn build_acceptor(tls: &TlsConfig) -> Result<TlsAcceptor> {
    let _ = rustls::crypto::ring::default_provider().install_default();

    let certs = load_certs(&tls.cert_path)?;
    let key = load_private_key(&tls.key_path)?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("invalid TLS certificate/key pair")?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn load_certs(path: &std::path::Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path).with_context(|| format!("opening TLS cert file {}", path.display()))?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .with_context(|| format!("parsing TLS cert file {}", path.display()))
}

fn load_private_key(path: &std::path::Path) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path).with_context(|| format!("opening TLS key file {}", path.display()))?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .with_context(|| format!("parsing TLS key file {}", path.display()))?
        .with_context(|| format!("no private key found in {}", path.display()))
}
