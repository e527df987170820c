//! TLS support for mortar connections using Rustls.
//!
//! This module provides TLS configuration types for securing connections:
//!
//! - [`TlsClientConfig`] - Client-side TLS configuration
//! - [`TlsServerConfig`] - Server-side TLS configuration
//! - [`CertificateValidator`] - Application callback deciding whether a
//!   peer certificate is acceptable
//!
//! ## Security Features
//!
//! - TLS 1.3 only, `ring` crypto provider
//! - Mozilla root certificates included by default
//! - Optional certificate revocation checking against supplied CRLs
//! - Mutual TLS (mTLS) with a "client certificate required" flag
//!
//! ## Client Configuration
//!
//! ```rust,ignore
//! use mortar_transport::{TlsClientConfig, load_root_certs};
//!
//! // Public servers, Mozilla roots
//! let config = TlsClientConfig::builder().build()?;
//!
//! // Private CA plus a client certificate for mutual TLS
//! let config = TlsClientConfig::builder()
//!     .root_certs(load_root_certs("ca-cert.pem")?)
//!     .client_cert_from_pem("client-cert.pem", "client-key.pem")?
//!     .build()?;
//! ```
//!
//! ## Server Configuration
//!
//! ```rust,ignore
//! use mortar_transport::{TlsServerConfig, load_certs, load_private_key, load_root_certs};
//!
//! let config = TlsServerConfig::builder(load_certs("cert.pem")?, load_private_key("key.pem")?)
//!     .client_roots(load_root_certs("client-ca.pem")?)
//!     .require_client_certificate(true)
//!     .build()?;
//! ```
//!
//! ## Certificate Validation
//!
//! Without a validator the WebPKI verdict is final. With a validator the
//! callback sees the verdict in [`CertificateCheck::error`] and decides.

use std::fmt;
use std::fs::File;
use std::io::{self, BufReader};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::{ResolvesClientCert, WebPkiServerVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{
    CertificateDer, CertificateRevocationListDer, PrivateKeyDer, ServerName, UnixTime,
};
use rustls::server::WebPkiClientVerifier;
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::sign::CertifiedKey;
use rustls::{
    CertificateError, ClientConfig, DigitallySignedStruct, DistinguishedName, RootCertStore,
    ServerConfig, SignatureScheme,
};

use mortar_core::TransportError;

/// Default TLS handshake timeout.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Facts about a peer certificate handed to a [`CertificateValidator`].
#[derive(Debug)]
pub struct CertificateCheck<'a> {
    /// Name the client expects the server to present; `None` when a
    /// server is checking a client.
    pub peer_name: Option<&'a str>,

    /// The peer's end-entity certificate.
    pub end_entity: &'a CertificateDer<'a>,

    /// Intermediate certificates the peer sent.
    pub intermediates: &'a [CertificateDer<'a>],

    /// Why WebPKI validation rejected the chain, `None` if it passed.
    pub error: Option<&'a rustls::Error>,
}

/// Application callback deciding whether a peer certificate is accepted.
pub type CertificateValidator = Arc<dyn Fn(&CertificateCheck<'_>) -> bool + Send + Sync>;

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn config_error(side: &str, err: impl fmt::Display) -> TransportError {
    TransportError::TlsAuthentication(format!("invalid {side} tls config: {err}"))
}

/// Combine a WebPKI verdict with an optional application validator.
fn decide(
    validator: Option<&CertificateValidator>,
    check: &CertificateCheck<'_>,
) -> Result<(), rustls::Error> {
    match (validator, check.error) {
        (Some(validator), error) => {
            if validator(check) {
                Ok(())
            } else {
                Err(error.cloned().unwrap_or(rustls::Error::InvalidCertificate(
                    CertificateError::ApplicationVerificationFailure,
                )))
            }
        }
        (None, None) => Ok(()),
        (None, Some(error)) => Err(error.clone()),
    }
}

fn unknown_issuer() -> rustls::Error {
    rustls::Error::InvalidCertificate(CertificateError::UnknownIssuer)
}

// ============================================================================
// Client
// ============================================================================

/// Verifies server certificates with WebPKI and an optional callback.
struct ServerVerifier {
    webpki: Option<Arc<WebPkiServerVerifier>>,
    validator: Option<CertificateValidator>,
    provider: Arc<CryptoProvider>,
}

impl fmt::Debug for ServerVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerVerifier")
            .field("webpki", &self.webpki.is_some())
            .field("validator", &self.validator.is_some())
            .finish()
    }
}

impl ServerCertVerifier for ServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let error = match &self.webpki {
            Some(webpki) => webpki
                .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
                .err(),
            None => Some(unknown_issuer()),
        };

        let peer_name = server_name.to_str();
        let check = CertificateCheck {
            peer_name: Some(peer_name.as_ref()),
            end_entity,
            intermediates,
            error: error.as_ref(),
        };

        decide(self.validator.as_ref(), &check).map(|()| ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Client certificate resolver that has no certificate but records
/// whether the server asked for one.
#[derive(Debug)]
struct RecordingCertResolver {
    requested: Arc<AtomicBool>,
}

impl ResolvesClientCert for RecordingCertResolver {
    fn resolve(
        &self,
        _root_hint_subjects: &[&[u8]],
        _sigschemes: &[SignatureScheme],
    ) -> Option<Arc<CertifiedKey>> {
        self.requested.store(true, Ordering::Release);
        None
    }

    fn has_certs(&self) -> bool {
        true
    }
}

/// TLS configuration for clients.
///
/// Configures how the client validates server certificates and optionally
/// provides a client certificate for mutual TLS authentication.
#[derive(Clone)]
pub struct TlsClientConfig {
    /// Rustls client configuration.
    config: Arc<ClientConfig>,
    /// Whether a client certificate is configured.
    has_client_cert: bool,
    /// Handshake timeout.
    pub handshake_timeout: Duration,
}

impl fmt::Debug for TlsClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsClientConfig")
            .field("has_client_cert", &self.has_client_cert)
            .field("handshake_timeout", &self.handshake_timeout)
            .finish_non_exhaustive()
    }
}

impl TlsClientConfig {
    /// Start building a client configuration.
    #[must_use]
    pub fn builder() -> TlsClientConfigBuilder {
        TlsClientConfigBuilder::default()
    }

    /// Whether a client certificate is configured.
    #[must_use]
    pub fn has_client_cert(&self) -> bool {
        self.has_client_cert
    }

    /// Get the underlying Rustls client config.
    #[must_use]
    pub fn rustls_config(&self) -> Arc<ClientConfig> {
        Arc::clone(&self.config)
    }

    /// Rustls config for one connection attempt.
    ///
    /// Without a client certificate the returned flag flips when the
    /// server requests one, so a later failure can be attributed to
    /// missing mutual authentication.
    pub(crate) fn for_connection(&self) -> (Arc<ClientConfig>, Option<Arc<AtomicBool>>) {
        if self.has_client_cert {
            return (self.rustls_config(), None);
        }

        let requested = Arc::new(AtomicBool::new(false));
        let mut config = (*self.config).clone();
        config.client_auth_cert_resolver = Arc::new(RecordingCertResolver {
            requested: Arc::clone(&requested),
        });
        (Arc::new(config), Some(requested))
    }
}

/// Builder for [`TlsClientConfig`].
pub struct TlsClientConfigBuilder {
    root_certs: Option<RootCertStore>,
    client_cert: Option<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)>,
    validator: Option<CertificateValidator>,
    check_revocation: bool,
    crls: Vec<CertificateRevocationListDer<'static>>,
    handshake_timeout: Duration,
}

impl Default for TlsClientConfigBuilder {
    fn default() -> Self {
        Self {
            root_certs: None,
            client_cert: None,
            validator: None,
            check_revocation: false,
            crls: Vec::new(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }
}

impl TlsClientConfigBuilder {
    /// Trust these roots instead of Mozilla's.
    #[must_use]
    pub fn root_certs(mut self, roots: RootCertStore) -> Self {
        self.root_certs = Some(roots);
        self
    }

    /// Present a client certificate for mutual TLS.
    #[must_use]
    pub fn client_cert(
        mut self,
        cert_chain: Vec<CertificateDer<'static>>,
        private_key: PrivateKeyDer<'static>,
    ) -> Self {
        self.client_cert = Some((cert_chain, private_key));
        self
    }

    /// Load the client certificate and key from PEM files.
    ///
    /// # Errors
    ///
    /// Returns an error if the files cannot be read or parsed.
    pub fn client_cert_from_pem(
        self,
        cert_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
    ) -> io::Result<Self> {
        let cert_chain = load_certs(cert_path)?;
        let private_key = load_private_key(key_path)?;
        Ok(self.client_cert(cert_chain, private_key))
    }

    /// Let an application callback decide whether the server certificate
    /// is accepted.
    #[must_use]
    pub fn validator<F>(mut self, validator: F) -> Self
    where
        F: Fn(&CertificateCheck<'_>) -> bool + Send + Sync + 'static,
    {
        self.validator = Some(Arc::new(validator));
        self
    }

    /// Check server certificates against the configured CRLs.
    #[must_use]
    pub fn check_certificate_revocation(mut self, check: bool) -> Self {
        self.check_revocation = check;
        self
    }

    /// Certificate revocation lists used when revocation checking is on.
    #[must_use]
    pub fn crls(mut self, crls: Vec<CertificateRevocationListDer<'static>>) -> Self {
        self.crls = crls;
        self
    }

    /// Set the handshake timeout.
    #[must_use]
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Build the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the CRLs or the client certificate are invalid.
    pub fn build(self) -> Result<TlsClientConfig, TransportError> {
        let provider = provider();

        let roots = self.root_certs.unwrap_or_else(|| {
            RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned())
        });

        let webpki = if roots.is_empty() {
            None
        } else {
            let mut builder =
                WebPkiServerVerifier::builder_with_provider(Arc::new(roots), Arc::clone(&provider));
            if self.check_revocation {
                builder = builder.with_crls(self.crls);
            }
            Some(builder.build().map_err(|e| config_error("client", e))?)
        };

        let verifier = Arc::new(ServerVerifier {
            webpki,
            validator: self.validator,
            provider: Arc::clone(&provider),
        });

        let builder = ClientConfig::builder_with_provider(provider)
            .with_protocol_versions(&[&rustls::version::TLS13])
            .map_err(|e| config_error("client", e))?
            .dangerous()
            .with_custom_certificate_verifier(verifier);

        let has_client_cert = self.client_cert.is_some();
        let config = match self.client_cert {
            Some((cert_chain, private_key)) => builder
                .with_client_auth_cert(cert_chain, private_key)
                .map_err(|e| config_error("client", e))?,
            None => builder.with_no_client_auth(),
        };

        Ok(TlsClientConfig {
            config: Arc::new(config),
            has_client_cert,
            handshake_timeout: self.handshake_timeout,
        })
    }
}

// ============================================================================
// Server
// ============================================================================

/// Verifies client certificates with WebPKI and an optional callback.
///
/// Client authentication is offered but never mandatory inside rustls;
/// the listener enforces "certificate required" after the handshake.
struct ClientVerifier {
    webpki: Option<Arc<dyn ClientCertVerifier>>,
    validator: Option<CertificateValidator>,
    provider: Arc<CryptoProvider>,
}

impl fmt::Debug for ClientVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientVerifier")
            .field("webpki", &self.webpki.is_some())
            .field("validator", &self.validator.is_some())
            .finish()
    }
}

impl ClientCertVerifier for ClientVerifier {
    fn offer_client_auth(&self) -> bool {
        true
    }

    fn client_auth_mandatory(&self) -> bool {
        false
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        match &self.webpki {
            Some(webpki) => webpki.root_hint_subjects(),
            None => &[],
        }
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        let error = match &self.webpki {
            Some(webpki) => webpki
                .verify_client_cert(end_entity, intermediates, now)
                .err(),
            None => Some(unknown_issuer()),
        };

        let check = CertificateCheck {
            peer_name: None,
            end_entity,
            intermediates,
            error: error.as_ref(),
        };

        decide(self.validator.as_ref(), &check).map(|()| ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// TLS configuration for servers.
///
/// Configures the server's certificate and optionally requires
/// client certificates for mutual TLS authentication.
#[derive(Clone)]
pub struct TlsServerConfig {
    /// Rustls server configuration.
    config: Arc<ServerConfig>,
    /// Reject clients that present no certificate.
    client_certificate_required: bool,
    /// Handshake timeout.
    pub handshake_timeout: Duration,
}

impl fmt::Debug for TlsServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsServerConfig")
            .field("client_certificate_required", &self.client_certificate_required)
            .field("handshake_timeout", &self.handshake_timeout)
            .finish_non_exhaustive()
    }
}

impl TlsServerConfig {
    /// Start building a server configuration around a certificate.
    #[must_use]
    pub fn builder(
        cert_chain: Vec<CertificateDer<'static>>,
        private_key: PrivateKeyDer<'static>,
    ) -> TlsServerConfigBuilder {
        TlsServerConfigBuilder {
            cert_chain,
            private_key,
            client_certificate_required: false,
            client_roots: None,
            validator: None,
            check_revocation: false,
            crls: Vec::new(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }

    /// Load server certificate and key from PEM files.
    ///
    /// # Errors
    ///
    /// Returns an error if the files cannot be read or parsed.
    pub fn load_from_pem(
        cert_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
    ) -> io::Result<Self> {
        let cert_chain = load_certs(cert_path)?;
        let private_key = load_private_key(key_path)?;

        Self::builder(cert_chain, private_key)
            .build()
            .map_err(|e| io::Error::other(e.to_string()))
    }

    /// Whether clients must present a certificate.
    #[must_use]
    pub fn client_certificate_required(&self) -> bool {
        self.client_certificate_required
    }

    /// Get the underlying Rustls server config.
    #[must_use]
    pub fn rustls_config(&self) -> Arc<ServerConfig> {
        Arc::clone(&self.config)
    }
}

/// Builder for [`TlsServerConfig`].
pub struct TlsServerConfigBuilder {
    cert_chain: Vec<CertificateDer<'static>>,
    private_key: PrivateKeyDer<'static>,
    client_certificate_required: bool,
    client_roots: Option<RootCertStore>,
    validator: Option<CertificateValidator>,
    check_revocation: bool,
    crls: Vec<CertificateRevocationListDer<'static>>,
    handshake_timeout: Duration,
}

impl TlsServerConfigBuilder {
    /// Reject clients that present no certificate.
    #[must_use]
    pub fn require_client_certificate(mut self, required: bool) -> Self {
        self.client_certificate_required = required;
        self
    }

    /// Roots client certificates are validated against.
    #[must_use]
    pub fn client_roots(mut self, roots: RootCertStore) -> Self {
        self.client_roots = Some(roots);
        self
    }

    /// Let an application callback decide whether a client certificate
    /// is accepted.
    #[must_use]
    pub fn validator<F>(mut self, validator: F) -> Self
    where
        F: Fn(&CertificateCheck<'_>) -> bool + Send + Sync + 'static,
    {
        self.validator = Some(Arc::new(validator));
        self
    }

    /// Check client certificates against the configured CRLs.
    #[must_use]
    pub fn check_certificate_revocation(mut self, check: bool) -> Self {
        self.check_revocation = check;
        self
    }

    /// Certificate revocation lists used when revocation checking is on.
    #[must_use]
    pub fn crls(mut self, crls: Vec<CertificateRevocationListDer<'static>>) -> Self {
        self.crls = crls;
        self
    }

    /// Set the handshake timeout.
    #[must_use]
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Build the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the certificate, key, or CRLs are invalid.
    pub fn build(self) -> Result<TlsServerConfig, TransportError> {
        let provider = provider();

        let wants_client_auth = self.client_certificate_required
            || self.client_roots.is_some()
            || self.validator.is_some();

        let builder = ServerConfig::builder_with_provider(Arc::clone(&provider))
            .with_protocol_versions(&[&rustls::version::TLS13])
            .map_err(|e| config_error("server", e))?;

        let builder = if wants_client_auth {
            let webpki = match self.client_roots {
                Some(roots) if !roots.is_empty() => {
                    let mut builder = WebPkiClientVerifier::builder_with_provider(
                        Arc::new(roots),
                        Arc::clone(&provider),
                    )
                    .allow_unauthenticated();
                    if self.check_revocation {
                        builder = builder.with_crls(self.crls);
                    }
                    Some(builder.build().map_err(|e| config_error("server", e))?)
                }
                _ => None,
            };

            builder.with_client_cert_verifier(Arc::new(ClientVerifier {
                webpki,
                validator: self.validator,
                provider,
            }))
        } else {
            builder.with_no_client_auth()
        };

        let config = builder
            .with_single_cert(self.cert_chain, self.private_key)
            .map_err(|e| config_error("server", e))?;

        Ok(TlsServerConfig {
            config: Arc::new(config),
            client_certificate_required: self.client_certificate_required,
            handshake_timeout: self.handshake_timeout,
        })
    }
}

// ============================================================================
// PEM helpers
// ============================================================================

/// Load certificates from a PEM file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed.
pub fn load_certs(path: impl AsRef<Path>) -> io::Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path.as_ref())?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::certs(&mut reader).collect()
}

/// Load a private key from a PEM file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or holds no key.
pub fn load_private_key(path: impl AsRef<Path>) -> io::Result<PrivateKeyDer<'static>> {
    let file = File::open(path.as_ref())?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)?
        .ok_or_else(|| io::Error::other("no private key found in file"))
}

/// Load certificate revocation lists from a PEM file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed.
pub fn load_crls(
    path: impl AsRef<Path>,
) -> io::Result<Vec<CertificateRevocationListDer<'static>>> {
    let file = File::open(path.as_ref())?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::crls(&mut reader).collect()
}

/// Load root certificates from a PEM file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or contains invalid certificates.
pub fn load_root_certs(path: impl AsRef<Path>) -> io::Result<RootCertStore> {
    let certs = load_certs(path)?;
    let mut store = RootCertStore::empty();
    for cert in certs {
        store
            .add(cert)
            .map_err(|e| io::Error::other(format!("invalid root certificate: {e}")))?;
    }
    Ok(store)
}

/// Create a `ServerName` from a host string.
///
/// # Errors
///
/// Returns an error if the name is not a valid DNS name or IP address.
pub fn server_name(name: &str) -> Result<ServerName<'static>, TransportError> {
    ServerName::try_from(name.to_string())
        .map_err(|e| TransportError::TlsAuthentication(format!("invalid server name {name:?}: {e}")))
}
