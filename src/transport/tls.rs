//! TLS configuration for outbound transfers
//!
//! Peers are usually addressed by IP, so host names in certificates are never
//! checked. Without CA certificates any server certificate is accepted; with
//! them the chain must lead to one of the given CAs.

use std::fmt;
use std::io;
use std::sync::Arc;

use tokio_rustls::rustls::client::WebPkiServerVerifier;
use tokio_rustls::rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::crypto::{CryptoProvider, ring};
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use tokio_rustls::rustls::{
    CertificateError, ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme,
};

use crate::error::{TransferError, TransportError, TransportErrorKind};

/// Client certificate and key presented to streaming endpoints
pub struct ClientIdentity {
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
}

impl Clone for ClientIdentity {
    fn clone(&self) -> Self {
        Self {
            certs: self.certs.clone(),
            key: self.key.clone_key(),
        }
    }
}

/// Trust material for one secure exchange
#[derive(Clone, Default)]
pub struct TlsSettings {
    ca_certs: Vec<CertificateDer<'static>>,
    identity: Option<ClientIdentity>,
}

impl fmt::Debug for TlsSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsSettings")
            .field("ca_certs", &self.ca_certs.len())
            .field("identity", &self.identity.is_some())
            .finish()
    }
}

impl TlsSettings {
    /// Accept any server certificate
    pub fn accept_any() -> Self {
        Self::default()
    }

    /// Trust the CA certificates found in a PEM bundle
    pub fn from_ca_pem(pem: &[u8]) -> Result<Self, TransferError> {
        let certs = rustls_pemfile::certs(&mut &pem[..])
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| TransferError::InvalidCertificates(e.to_string()))?;
        if certs.is_empty() {
            return Err(TransferError::InvalidCertificates(
                "no certificates found in PEM data".into(),
            ));
        }
        Ok(Self {
            ca_certs: certs,
            identity: None,
        })
    }

    /// Trust the given DER certificates
    pub fn with_ca_certs(certs: Vec<CertificateDer<'static>>) -> Self {
        Self {
            ca_certs: certs,
            identity: None,
        }
    }

    /// Present a client certificate chain and key, both PEM encoded
    pub fn with_identity_pem(mut self, cert_pem: &[u8], key_pem: &[u8]) -> Result<Self, TransferError> {
        let certs = rustls_pemfile::certs(&mut &cert_pem[..])
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| TransferError::InvalidCertificates(e.to_string()))?;
        let key = rustls_pemfile::private_key(&mut &key_pem[..])
            .map_err(|e| TransferError::InvalidCertificates(e.to_string()))?
            .ok_or_else(|| TransferError::InvalidCertificates("no private key found".into()))?;
        self.identity = Some(ClientIdentity { certs, key });
        Ok(self)
    }

    pub fn verifies_peer(&self) -> bool {
        !self.ca_certs.is_empty()
    }

    /// Build a client configuration for this trust material
    pub fn client_config(&self) -> Result<Arc<ClientConfig>, TransportError> {
        let provider = Arc::new(ring::default_provider());

        let verifier: Arc<dyn ServerCertVerifier> = if self.ca_certs.is_empty() {
            Arc::new(NoVerifier {
                provider: provider.clone(),
            })
        } else {
            let mut roots = RootCertStore::empty();
            for cert in &self.ca_certs {
                roots
                    .add(cert.clone())
                    .map_err(|e| tls_error(format!("Bad CA certificate: {}", e)))?;
            }
            let inner = WebPkiServerVerifier::builder_with_provider(Arc::new(roots), provider.clone())
                .build()
                .map_err(|e| tls_error(format!("Could not build verifier: {}", e)))?;
            Arc::new(CaOnlyVerifier { inner })
        };

        let builder = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| tls_error(e.to_string()))?
            .dangerous()
            .with_custom_certificate_verifier(verifier);

        let config = match &self.identity {
            Some(identity) => builder
                .with_client_auth_cert(identity.certs.clone(), identity.key.clone_key())
                .map_err(|e| tls_error(format!("Bad client certificate: {}", e)))?,
            None => builder.with_no_client_auth(),
        };
        Ok(Arc::new(config))
    }
}

/// Server name used for the handshake; IP literals are accepted as-is
pub fn server_name(host: &str) -> Result<ServerName<'static>, TransportError> {
    let host = host.trim_start_matches('[').trim_end_matches(']');
    ServerName::try_from(host.to_string()).map_err(|_| {
        TransportError::new(TransportErrorKind::MalformedUrl, format!("Invalid host name {}", host))
    })
}

/// Classify a failed handshake
pub fn handshake_error(err: io::Error) -> TransportError {
    let untrusted = err
        .get_ref()
        .and_then(|inner| inner.downcast_ref::<tokio_rustls::rustls::Error>())
        .is_some_and(is_untrusted);
    if untrusted {
        TransportError::new(
            TransportErrorKind::UntrustedCertificate,
            format!("SSL certificate problem: {}", err),
        )
    } else {
        tls_error(format!("SSL connect error: {}", err))
    }
}

/// Whether a rustls error means the peer's chain is not trusted
pub fn is_untrusted(err: &tokio_rustls::rustls::Error) -> bool {
    matches!(
        err,
        tokio_rustls::rustls::Error::InvalidCertificate(
            CertificateError::UnknownIssuer
                | CertificateError::BadSignature
                | CertificateError::Expired
                | CertificateError::NotValidYet
                | CertificateError::Revoked
        )
    )
}

fn tls_error(detail: String) -> TransportError {
    TransportError::new(TransportErrorKind::Tls, detail)
}

fn is_name_mismatch(err: &CertificateError) -> bool {
    matches!(err, CertificateError::NotValidForName)
        || format!("{:?}", err).starts_with("NotValidForName")
}

/// Verifier that accepts any certificate
#[derive(Debug)]
struct NoVerifier {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, tokio_rustls::rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Verifier that checks the chain against the given CAs but not the host name
#[derive(Debug)]
struct CaOnlyVerifier {
    inner: Arc<WebPkiServerVerifier>,
}

impl ServerCertVerifier for CaOnlyVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, tokio_rustls::rustls::Error> {
        match self
            .inner
            .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
        {
            Err(tokio_rustls::rustls::Error::InvalidCertificate(ref e)) if is_name_mismatch(e) => {
                Ok(ServerCertVerified::assertion())
            }
            other => other,
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}
