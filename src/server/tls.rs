//! TLS acceptor construction

use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::version::{TLS12, TLS13};
use rustls::SupportedProtocolVersion;
use tokio_rustls::TlsAcceptor;

use super::config::{TlsCredentials, TlsVersions};
use crate::error::{Error, Result};

static TLS12_ONLY: &[&SupportedProtocolVersion] = &[&TLS12];
static TLS13_ONLY: &[&SupportedProtocolVersion] = &[&TLS13];

fn protocol_versions(versions: TlsVersions) -> &'static [&'static SupportedProtocolVersion] {
    match versions {
        TlsVersions::Tls12Only => TLS12_ONLY,
        TlsVersions::Tls13Only => TLS13_ONLY,
        TlsVersions::Negotiable => rustls::ALL_VERSIONS,
    }
}

/// Build an acceptor from host-supplied PEM credentials
pub fn build_acceptor(credentials: &TlsCredentials) -> Result<TlsAcceptor> {
    let certs = rustls_pemfile::certs(&mut &credentials.certificate_chain_pem[..])
        .collect::<std::result::Result<Vec<CertificateDer<'static>>, _>>()
        .map_err(|e| Error::Tls(format!("invalid certificate PEM: {}", e)))?;
    if certs.is_empty() {
        return Err(Error::Tls("no certificate found".into()));
    }

    let key: PrivateKeyDer<'static> =
        rustls_pemfile::private_key(&mut &credentials.private_key_pem[..])
            .map_err(|e| Error::Tls(format!("invalid private key PEM: {}", e)))?
            .ok_or_else(|| Error::Tls("no private key found".into()))?;

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = rustls::ServerConfig::builder_with_provider(provider)
        .with_protocol_versions(protocol_versions(credentials.versions))
        .map_err(|e| Error::Tls(e.to_string()))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| Error::Tls(e.to_string()))?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}
