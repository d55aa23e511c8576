//! TLS termination with certificates minted per host.

use std::{fmt, fs, io, path::Path, sync::Arc};

use parking_lot::Mutex;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyUsagePurpose,
};
use rustls::{
    client::{ServerCertVerified, ServerCertVerifier},
    server::{ClientHello, ResolvesServerCert},
    sign::CertifiedKey,
    ServerConfig,
};
use rustc_hash::FxHashMap;
use tracing::{debug, warn};

use crate::{HttpError, Protocol};

/// Host used for clients that send no server name.
const DEFAULT_HOST: &str = "localhost";

/// A generated certificate authority that signs a leaf certificate for every host clients ask
/// for. Test browsers must trust [`CertificateAuthority::pem`].
pub struct CertificateAuthority {
    cert: Certificate,
    der: Vec<u8>,
    pem: String,
}

impl fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateAuthority").finish_non_exhaustive()
    }
}

impl CertificateAuthority {
    pub fn generate() -> Result<Self, HttpError> {
        let mut name = DistinguishedName::new();
        name.push(DnType::CommonName, "wpr replay CA");
        name.push(DnType::OrganizationName, "wpr");

        let mut params = CertificateParams::default();
        params.distinguished_name = name;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];

        let cert = Certificate::from_params(params).map_err(certificate_error)?;
        let der = cert.serialize_der().map_err(certificate_error)?;
        let pem = cert.serialize_pem().map_err(certificate_error)?;

        Ok(Self { cert, der, pem })
    }

    /// The CA certificate in PEM format.
    pub fn pem(&self) -> &str {
        &self.pem
    }

    /// The CA certificate in DER format.
    pub fn der(&self) -> &[u8] {
        &self.der
    }

    pub fn write_pem(&self, path: impl AsRef<Path>) -> io::Result<()> {
        fs::write(path, &self.pem)
    }

    /// Issues a leaf certificate for `host`, chained to this authority.
    pub fn issue(&self, host: &str) -> Result<CertifiedKey, HttpError> {
        let mut params = CertificateParams::new(vec![host.to_string()]);
        params.distinguished_name.push(DnType::CommonName, host);
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        let leaf = Certificate::from_params(params).map_err(certificate_error)?;
        let der = leaf.serialize_der_with_signer(&self.cert).map_err(certificate_error)?;
        let key = rustls::PrivateKey(leaf.serialize_private_key_der());
        let key = rustls::sign::any_supported_type(&key).map_err(certificate_error)?;

        let chain = vec![rustls::Certificate(der), rustls::Certificate(self.der.clone())];
        Ok(CertifiedKey::new(chain, key))
    }
}

fn certificate_error(e: impl fmt::Display) -> HttpError {
    HttpError::Certificate(e.to_string())
}

/// Picks the leaf certificate from the SNI of each handshake, minting it on first use.
struct PerHostCertificates {
    ca: Arc<CertificateAuthority>,
    issued: Mutex<FxHashMap<String, Arc<CertifiedKey>>>,
}

impl ResolvesServerCert for PerHostCertificates {
    fn resolve(&self, hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let host = hello.server_name().unwrap_or(DEFAULT_HOST).to_ascii_lowercase();

        let mut issued = self.issued.lock();
        if let Some(key) = issued.get(&host) {
            return Some(Arc::clone(key));
        }

        match self.ca.issue(&host) {
            Ok(key) => {
                debug!(%host, "issued certificate");
                let key = Arc::new(key);
                issued.insert(host, Arc::clone(&key));
                Some(key)
            }
            Err(e) => {
                warn!(%host, error = %e, "failed to issue certificate");
                None
            }
        }
    }
}

/// The server configuration of the TLS listener.
pub(crate) fn server_config(
    ca: Arc<CertificateAuthority>,
    protocol: Protocol,
) -> Arc<ServerConfig> {
    let resolver = PerHostCertificates { ca, issued: Mutex::default() };
    let mut config = ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(resolver));

    if protocol == Protocol::Http1 {
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
    }

    Arc::new(config)
}

/// A server certificate verifier that automatically passes all checks. Origins are contacted
/// while recording, where their certificates do not matter.
struct SkipServerVerification;

impl ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::Certificate,
        _intermediates: &[rustls::Certificate],
        _server_name: &rustls::ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: std::time::SystemTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }
}

/// Returns a TLS configuration that skips all server verification and doesn't do any client
/// authentication.
pub(crate) fn insecure_client_config() -> rustls::ClientConfig {
    let mut config = rustls::ClientConfig::builder()
        .with_safe_defaults()
        .with_custom_certificate_verifier(Arc::new(SkipServerVerification))
        .with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    config
}
