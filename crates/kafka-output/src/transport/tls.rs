// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! TLS client configuration for broker connections.

use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider, WebPkiSupportedAlgorithms};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tracing::{debug, warn};

use crate::errors::TransportError;

/// Builds the client configuration.
///
/// Certificates are checked against the platform roots unless
/// `insecure_skip_verify` is set, in which case [`InsecureCertVerifier`] is
/// installed.
pub fn client_config(insecure_skip_verify: bool) -> Result<Arc<ClientConfig>, TransportError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()
        .map_err(|e| TransportError::Tls(e.to_string()))?;

    let config = if insecure_skip_verify {
        warn!("TLS certificate verification is disabled, broker identities will not be checked");
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(InsecureCertVerifier::new(&provider)))
            .with_no_client_auth()
    } else {
        builder
            .with_root_certificates(native_root_store()?)
            .with_no_client_auth()
    };
    Ok(Arc::new(config))
}

fn native_root_store() -> Result<RootCertStore, TransportError> {
    let mut root_cert_store = RootCertStore::empty();
    let native_certs = rustls_native_certs::load_native_certs();
    for err in &native_certs.errors {
        debug!("Failed to load native certificate: {err}");
    }
    let mut valid_count = 0;
    for cert in native_certs.certs {
        match root_cert_store.add(cert) {
            Ok(()) => valid_count += 1,
            Err(err) => {
                debug!("Failed to parse certificate: {:?}", err);
            }
        }
    }
    if valid_count == 0 {
        return Err(TransportError::Tls(
            "no valid certificates found in native root store".to_string(),
        ));
    }
    Ok(root_cert_store)
}

/// Accepts any server certificate.
///
/// The handshake signatures are still verified, so the peer must hold the key
/// of the certificate it presents.
#[derive(Debug)]
pub struct InsecureCertVerifier {
    algorithms: WebPkiSupportedAlgorithms,
}

impl InsecureCertVerifier {
    #[must_use]
    pub fn new(provider: &CryptoProvider) -> Self {
        InsecureCertVerifier {
            algorithms: provider.signature_verification_algorithms,
        }
    }
}

impl ServerCertVerifier for InsecureCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

/// Name presented in SNI and checked against the certificate, taken from a
/// `host:port` broker address.
pub fn server_name(address: &str) -> Result<ServerName<'static>, TransportError> {
    let host = match address.rsplit_once(':') {
        Some((host, port)) if port.bytes().all(|b| b.is_ascii_digit()) => host,
        _ => address,
    };
    let host = host.trim_start_matches('[').trim_end_matches(']');
    ServerName::try_from(host.to_string())
        .map_err(|e| TransportError::Tls(format!("invalid server name '{host}': {e}")))
}
