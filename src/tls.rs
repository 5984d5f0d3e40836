// ABOUTME: TLS upgrade for TCP client/server connections, built on rustls and tokio-rustls
// ABOUTME: Implements the default "trust the chain, or accept a self-signed root" validation policy

use std::io::{BufReader, Cursor};
use std::sync::Arc;

use rustls::client::WebPkiServerVerifier;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, Error as RustlsError, RootCertStore, ServerConfig, SignatureScheme};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::error::TlsError;

/// Caller override for chain validation: `Some(true)`/`Some(false)` forces accept/reject,
/// `None` ("no decision") falls back to the default policy described below.
pub type CertificateVerificationHook =
    Arc<dyn Fn(&[CertificateDer<'static>]) -> Option<bool> + Send + Sync>;

/// Builds the server or client side of a TLS upgrade, mirroring `hdds`'s
/// `TlsConfig::server()`/`TlsConfig::client()` split.
#[derive(Clone, Default)]
pub struct TlsOptions {
    cert_chain_pem: Option<Vec<u8>>,
    private_key_pem: Option<Vec<u8>>,
    extra_roots_pem: Option<Vec<u8>>,
    verification_hook: Option<CertificateVerificationHook>,
}

impl TlsOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Server-side certificate chain and private key, PEM-encoded.
    pub fn with_cert_chain(mut self, cert_chain_pem: Vec<u8>, private_key_pem: Vec<u8>) -> Self {
        self.cert_chain_pem = Some(cert_chain_pem);
        self.private_key_pem = Some(private_key_pem);
        self
    }

    /// Additional trusted roots beyond the platform/webpki-roots bundle, PEM-encoded.
    pub fn with_extra_roots(mut self, roots_pem: Vec<u8>) -> Self {
        self.extra_roots_pem = Some(roots_pem);
        self
    }

    /// Override the default chain-validation policy for client connections.
    pub fn with_verification_hook(mut self, hook: CertificateVerificationHook) -> Self {
        self.verification_hook = Some(hook);
        self
    }

    pub fn build_acceptor(&self) -> Result<TlsAcceptor, TlsError> {
        let cert_pem = self
            .cert_chain_pem
            .as_ref()
            .ok_or_else(|| TlsError::InvalidCertificate("no certificate chain configured".into()))?;
        let key_pem = self
            .private_key_pem
            .as_ref()
            .ok_or_else(|| TlsError::InvalidCertificate("no private key configured".into()))?;

        let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut BufReader::new(Cursor::new(cert_pem)))
            .collect::<Result<_, _>>()
            .map_err(|e| TlsError::InvalidCertificate(e.to_string()))?;
        let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut BufReader::new(Cursor::new(key_pem)))
            .map_err(|e| TlsError::InvalidCertificate(e.to_string()))?
            .ok_or_else(|| TlsError::InvalidCertificate("no private key found in PEM".into()))?;

        let config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| TlsError::InvalidCertificate(e.to_string()))?;

        Ok(TlsAcceptor::from(Arc::new(config)))
    }

    pub fn build_connector(&self) -> Result<TlsConnector, TlsError> {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        if let Some(extra) = &self.extra_roots_pem {
            for cert in rustls_pemfile::certs(&mut BufReader::new(Cursor::new(extra))) {
                let cert = cert.map_err(|e| TlsError::InvalidCertificate(e.to_string()))?;
                roots
                    .add(cert)
                    .map_err(|e| TlsError::InvalidCertificate(e.to_string()))?;
            }
        }

        let verifier = ChainValidationPolicy::new(roots, self.verification_hook.clone())?;

        let config = ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(verifier))
            .with_no_client_auth();

        Ok(TlsConnector::from(Arc::new(config)))
    }
}

/// Accepts fully trusted chains, accepts self-signed roots whose subject equals their
/// issuer, rejects everything else. A caller-supplied hook may override either outcome.
#[derive(Debug)]
struct ChainValidationPolicy {
    inner: Arc<WebPkiServerVerifier>,
    hook: Option<CertificateVerificationHook>,
}

impl ChainValidationPolicy {
    fn new(roots: RootCertStore, hook: Option<CertificateVerificationHook>) -> Result<Self, TlsError> {
        let inner = WebPkiServerVerifier::builder(Arc::new(roots))
            .build()
            .map_err(|e| TlsError::InvalidCertificate(e.to_string()))?;
        Ok(ChainValidationPolicy { inner, hook })
    }
}

impl ServerCertVerifier for ChainValidationPolicy {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, RustlsError> {
        if let Some(hook) = &self.hook {
            let mut chain = Vec::with_capacity(intermediates.len() + 1);
            chain.push(end_entity.clone().into_owned());
            chain.extend(intermediates.iter().map(|c| c.clone().into_owned()));
            match hook(&chain) {
                Some(true) => return Ok(ServerCertVerified::assertion()),
                Some(false) => return Err(RustlsError::General("rejected by verification hook".into())),
                None => {}
            }
        }

        match self
            .inner
            .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
        {
            Ok(verified) => Ok(verified),
            Err(err) if intermediates.is_empty() && is_self_signed(end_entity) => {
                tracing::debug!("accepting self-signed root with matching subject/issuer");
                let _ = err;
                Ok(ServerCertVerified::assertion())
            }
            Err(err) => Err(err),
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, RustlsError> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, RustlsError> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

/// A self-signed leaf, i.e. one whose `subject` equals its `issuer`.
fn is_self_signed(cert: &CertificateDer<'_>) -> bool {
    match x509_parser::parse_x509_certificate(cert.as_ref()) {
        Ok((_, parsed)) => parsed.subject() == parsed.issuer(),
        Err(_) => false,
    }
}
