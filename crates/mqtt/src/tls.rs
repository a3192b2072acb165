//! Credential and TLS material validation.
//!
//! [`validate_tls_files`] is the fast, pre-handshake check: configured paths
//! are checked in the fixed order CA certificate, client certificate, client
//! key, and the first missing file produces its own error naming the file.
//! Only after all configured files exist are they parsed, so an operator who
//! is missing several files always hears about the CA first.
//!
//! [`build_client_config`] turns the same material into a rustls
//! `ClientConfig`, used both for the broker session and for the diagnostic
//! runner's handshake probe.

use std::{
    fs::File,
    io::BufReader,
    path::Path,
    sync::Arc,
};

use rustls::{
    pki_types::{CertificateDer, PrivateKeyDer},
    ClientConfig, RootCertStore,
};
use tracing::{debug, warn};

use crate::{config::TlsConfig, error::ClientError, Result};

/// Checks that every configured certificate file exists and parses.
///
/// # Errors
/// - `CaCertMissing`, `ClientCertMissing`, `ClientKeyMissing` for the first
///   missing file, in that order
/// - `TlsMaterial` when a file exists but holds no usable PEM data
pub fn validate_tls_files(tls: &TlsConfig) -> Result<()> {
    if let Some(ca) = tls.ca_cert_path() {
        if !Path::new(ca).is_file() {
            return Err(ClientError::CaCertMissing(ca.to_string()));
        }
    }
    if let Some(cert) = tls.client_cert_path() {
        if !Path::new(cert).is_file() {
            return Err(ClientError::ClientCertMissing(cert.to_string()));
        }
    }
    if let Some(key) = tls.client_key_path() {
        if !Path::new(key).is_file() {
            return Err(ClientError::ClientKeyMissing(key.to_string()));
        }
    }

    if let Some(ca) = tls.ca_cert_path() {
        load_certs(ca, "CA certificate")?;
    }
    if let Some(cert) = tls.client_cert_path() {
        load_certs(cert, "client certificate")?;
    }
    if let Some(key) = tls.client_key_path() {
        load_private_key(key)?;
    }

    Ok(())
}

fn load_certs(path: &str, what: &str) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| ClientError::TlsMaterial(format!("cannot read {what} {path}: {e}")))?;
    let mut reader = BufReader::new(file);

    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| ClientError::TlsMaterial(format!("cannot parse {what} {path}: {e}")))?;

    if certs.is_empty() {
        return Err(ClientError::TlsMaterial(format!(
            "no certificates found in {what} {path}"
        )));
    }
    Ok(certs)
}

fn load_private_key(path: &str) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path)
        .map_err(|e| ClientError::TlsMaterial(format!("cannot read client key {path}: {e}")))?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| ClientError::TlsMaterial(format!("cannot parse client key {path}: {e}")))?
        .ok_or_else(|| ClientError::TlsMaterial(format!("no private key found in {path}")))
}

/// Builds a rustls client configuration from validated material.
///
/// Without a CA file the bundled webpki roots are trusted. With
/// `insecure_skip_verify` server certificates are not verified at all.
pub fn build_client_config(tls: &TlsConfig) -> Result<ClientConfig> {
    validate_tls_files(tls)?;

    let builder = if tls.insecure_skip_verify {
        warn!("TLS certificate verification is disabled");
        ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(danger::NoCertificateVerification))
    } else {
        let mut roots = RootCertStore::empty();
        match tls.ca_cert_path() {
            Some(ca) => {
                for cert in load_certs(ca, "CA certificate")? {
                    roots.add(cert).map_err(|e| {
                        ClientError::TlsMaterial(format!("invalid CA certificate {ca}: {e}"))
                    })?;
                }
                debug!(ca, "Loaded custom CA certificate");
            }
            None => roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
        }
        ClientConfig::builder().with_root_certificates(roots)
    };

    match (tls.client_cert_path(), tls.client_key_path()) {
        (Some(cert), Some(key)) => {
            let certs = load_certs(cert, "client certificate")?;
            let key_der = load_private_key(key)?;
            builder.with_client_auth_cert(certs, key_der).map_err(|e| {
                ClientError::TlsMaterial(format!("client certificate and key do not match: {e}"))
            })
        }
        _ => Ok(builder.with_no_client_auth()),
    }
}

mod danger {
    use rustls::{
        client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
        pki_types::{CertificateDer, ServerName, UnixTime},
        DigitallySignedStruct, Error, SignatureScheme,
    };

    #[derive(Debug)]
    pub struct NoCertificateVerification;

    impl ServerCertVerifier for NoCertificateVerification {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn verify_tls13_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            vec![
                SignatureScheme::RSA_PKCS1_SHA256,
                SignatureScheme::RSA_PKCS1_SHA384,
                SignatureScheme::RSA_PKCS1_SHA512,
                SignatureScheme::ECDSA_NISTP256_SHA256,
                SignatureScheme::ECDSA_NISTP384_SHA384,
                SignatureScheme::RSA_PSS_SHA256,
                SignatureScheme::RSA_PSS_SHA384,
                SignatureScheme::RSA_PSS_SHA512,
                SignatureScheme::ED25519,
            ]
        }
    }
}
