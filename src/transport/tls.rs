//! QUIC endpoint configuration
//!
//! Servers present a freshly generated self-signed certificate; clients and
//! peer clients accept any certificate. Suitable for trusted networks only.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use quinn::Endpoint;
use quinn::crypto::rustls::{QuicClientConfig, QuicServerConfig};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};

use crate::error::{RelayError, Result};

/// ALPN protocol id negotiated by servers, clients and peers
pub const ALPN: &[u8] = b"hermod";

/// Transport knobs shared by both sides
#[derive(Debug, Clone, Copy)]
pub struct TransportSettings {
    pub idle_timeout: Duration,
    pub keep_alive: Option<Duration>,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(300),
            keep_alive: Some(Duration::from_secs(15)),
        }
    }
}

fn crypto_provider() -> Arc<rustls::crypto::CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn transport_config(settings: &TransportSettings) -> Result<quinn::TransportConfig> {
    let idle = settings
        .idle_timeout
        .try_into()
        .map_err(|e| RelayError::config(format!("Invalid idle timeout: {}", e)))?;

    let mut transport = quinn::TransportConfig::default();
    transport.max_concurrent_bidi_streams(4u32.into());
    transport.max_concurrent_uni_streams(0u32.into());
    transport.max_idle_timeout(Some(idle));
    transport.keep_alive_interval(settings.keep_alive);
    Ok(transport)
}

/// Server-side QUIC configuration with a self-signed certificate
pub fn server_config(settings: &TransportSettings) -> Result<quinn::ServerConfig> {
    let rcgen::CertifiedKey { cert, key_pair } =
        rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
            .map_err(|e| RelayError::config(format!("Failed to generate certificate: {}", e)))?;

    let cert_der: CertificateDer<'static> = cert.der().clone();
    let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));

    let mut tls = rustls::ServerConfig::builder_with_provider(crypto_provider())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|e| RelayError::config(format!("Failed to configure TLS: {}", e)))?
        .with_no_client_auth()
        .with_single_cert(vec![cert_der], key_der)
        .map_err(|e| RelayError::config(format!("Failed to configure TLS: {}", e)))?;

    tls.alpn_protocols = vec![ALPN.to_vec()];
    tls.max_early_data_size = 0;

    let crypto = QuicServerConfig::try_from(tls)
        .map_err(|e| RelayError::config(format!("Failed to create QUIC config: {}", e)))?;

    let mut config = quinn::ServerConfig::with_crypto(Arc::new(crypto));
    config.transport_config(Arc::new(transport_config(settings)?));
    Ok(config)
}

/// Client-side QUIC configuration
pub fn client_config(settings: &TransportSettings) -> Result<quinn::ClientConfig> {
    let mut tls = rustls::ClientConfig::builder_with_provider(crypto_provider())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|e| RelayError::config(format!("Failed to configure TLS: {}", e)))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate))
        .with_no_client_auth();

    tls.alpn_protocols = vec![ALPN.to_vec()];

    let crypto = QuicClientConfig::try_from(tls)
        .map_err(|e| RelayError::config(format!("Failed to create QUIC config: {}", e)))?;

    let mut config = quinn::ClientConfig::new(Arc::new(crypto));
    config.transport_config(Arc::new(transport_config(settings)?));
    Ok(config)
}

/// Client endpoint with the default client configuration installed
pub fn client_endpoint(bind_addr: SocketAddr, settings: &TransportSettings) -> Result<Endpoint> {
    let mut endpoint = Endpoint::client(bind_addr)
        .map_err(|e| RelayError::network(format!("Failed to create endpoint: {}", e)))?;
    endpoint.set_default_client_config(client_config(settings)?);
    Ok(endpoint)
}

/// Unspecified local address of the same family as `remote`
pub fn wildcard_for(remote: SocketAddr) -> SocketAddr {
    if remote.is_ipv6() {
        SocketAddr::from(([0u16; 8], 0))
    } else {
        SocketAddr::from(([0u8; 4], 0))
    }
}

#[derive(Debug)]
struct AcceptAnyCertificate;

impl rustls::client::danger::ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        crypto_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
