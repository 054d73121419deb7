// SPDX-License-Identifier: Apache-2.0

//! TLS material handling for socket inputs (server side) and the socket
//! output (client side).
//!
//! The `ssl_verify` option carries the classic verify-mode flags:
//! `PEER=0x01`, `FAIL_IF_NO_PEER_CERT=0x02`, `CLIENT_ONCE=0x04`, `NONE=0x00`.
//! On the server they control whether a client certificate is requested and
//! required; on the client, `NONE` disables server-certificate verification.

use rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme};
use rustls_pki_types::pem::PemObject;
use rustls_pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use std::sync::Arc;
use thiserror::Error;

use crate::config::TlsSettings;

pub const VERIFY_NONE: u8 = 0x00;
pub const VERIFY_PEER: u8 = 0x01;
pub const VERIFY_FAIL_IF_NO_PEER_CERT: u8 = 0x02;
pub const VERIFY_CLIENT_ONCE: u8 = 0x04;

#[derive(Error, Debug)]
pub enum Error {
    #[error("unable to read {0}: {1}")]
    Pem(String, rustls_pki_types::pem::Error),

    #[error("tls setup failed: {0}")]
    Rustls(#[from] rustls::Error),

    #[error("client verifier setup failed: {0}")]
    Verifier(#[from] rustls::server::VerifierBuilderError),

    #[error("{0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, Error>;

fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>> {
    CertificateDer::pem_file_iter(path)
        .map_err(|e| Error::Pem(path.to_string(), e))?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Pem(path.to_string(), e))
}

fn load_key(path: &str) -> Result<PrivateKeyDer<'static>> {
    PrivateKeyDer::from_pem_file(path).map_err(|e| Error::Pem(path.to_string(), e))
}

fn root_store(ca_file: &str) -> Result<RootCertStore> {
    let mut store = RootCertStore::empty();
    for cert in load_certs(ca_file)? {
        store.add(cert)?;
    }
    Ok(store)
}

/// Server-side config for a TLS socket input.
pub fn server_config(settings: &TlsSettings) -> Result<Arc<ServerConfig>> {
    let cert_file = settings
        .cert_file
        .as_deref()
        .ok_or_else(|| Error::Invalid("tls listener requires ssl_cert".to_string()))?;
    let key_file = settings
        .key_file
        .as_deref()
        .ok_or_else(|| Error::Invalid("tls listener requires ssl_key".to_string()))?;

    let certs = load_certs(cert_file)?;
    let key = load_key(key_file)?;

    let builder = if settings.verify & VERIFY_PEER != 0 {
        let ca_file = settings.ca_file.as_deref().ok_or_else(|| {
            Error::Invalid("ssl_verify with PEER requires ssl_ca".to_string())
        })?;
        let roots = Arc::new(root_store(ca_file)?);
        let verifier = if settings.verify & VERIFY_FAIL_IF_NO_PEER_CERT != 0 {
            WebPkiClientVerifier::builder(roots).build()?
        } else {
            WebPkiClientVerifier::builder(roots)
                .allow_unauthenticated()
                .build()?
        };
        ServerConfig::builder().with_client_cert_verifier(verifier)
    } else {
        ServerConfig::builder().with_no_client_auth()
    };

    Ok(Arc::new(builder.with_single_cert(certs, key)?))
}

/// Client-side config for the socket output.
pub fn client_config(settings: &TlsSettings) -> Result<Arc<ClientConfig>> {
    let builder = if settings.verify == VERIFY_NONE {
        ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(SkipServerVerification::new())
    } else {
        let ca_file = settings.ca_file.as_deref().ok_or_else(|| {
            Error::Invalid("ssl_verify on a socket output requires ssl_ca".to_string())
        })?;
        ClientConfig::builder().with_root_certificates(root_store(ca_file)?)
    };

    let config = match (&settings.cert_file, &settings.key_file) {
        (Some(cert_file), Some(key_file)) => {
            builder.with_client_auth_cert(load_certs(cert_file)?, load_key(key_file)?)?
        }
        (None, None) => builder.with_no_client_auth(),
        _ => {
            return Err(Error::Invalid(
                "ssl_cert and ssl_key must be given together".to_string(),
            ))
        }
    };

    Ok(Arc::new(config))
}

/// Accepts any server certificate. Installed only for `ssl_verify 0`.
#[derive(Debug)]
struct SkipServerVerification(rustls::crypto::CryptoProvider);

impl SkipServerVerification {
    fn new() -> Arc<Self> {
        Arc::new(Self(rustls::crypto::ring::default_provider()))
    }
}

impl ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0
            .signature_verification_algorithms
            .supported_schemes()
    }
}
