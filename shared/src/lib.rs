#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

pub mod cert;
pub mod crypto;
pub mod error;
pub mod tls;
pub mod upstream;
pub mod util;

use rand::Rng;
use rcgen::{
    Certificate, CertificateParams, DistinguishedName, DnType, IsCa, Issuer, KeyPair,
    KeyUsagePurpose, PKCS_ECDSA_P256_SHA256,
};
use rustls::{
    RootCertStore,
    pki_types::{CertificateDer, pem::PemObject},
};
use std::{
    error::Error,
    fs,
    net::IpAddr,
    path::{Path, PathBuf},
    sync::Arc,
};
use time::{Duration, OffsetDateTime};
use tracing::{debug, trace, warn};

use crate::crypto::init_crypto;

static ROXYMITM: &str = "roxymitm";

/// Holds the proxy's root certificate authority and mints per-host leaf
/// certificates signed by it on demand.
#[derive(Debug, Clone)]
pub struct RoxyCA {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    issuer: Issuer<'static, KeyPair>,
    roots: Arc<RootCertStore>,
    ca_der: CertificateDer<'static>,
}

impl RoxyCA {
    pub fn new(issuer: Issuer<'static, KeyPair>, roots: RootCertStore, ca_der: Vec<u8>) -> Self {
        let inner = Arc::new(Inner {
            issuer,
            roots: Arc::new(roots),
            ca_der: CertificateDer::from(ca_der),
        });
        Self { inner }
    }

    /// Root store used to validate anything signed by this CA (not used for
    /// upstream dials, which always skip validation).
    pub fn roots(&self) -> Arc<RootCertStore> {
        self.inner.roots.clone()
    }

    pub fn ca_der(&self) -> CertificateDer<'static> {
        self.inner.ca_der.clone()
    }

    /// Mints a short-lived leaf certificate for `host`, valid for both a DNS
    /// name and, if `host` parses as an IP literal, a SAN IP entry.
    pub fn sign_leaf(&self, host: &str) -> Result<(Certificate, KeyPair), rcgen::Error> {
        let mut params = if let Ok(ip) = host.parse::<IpAddr>() {
            let mut p = CertificateParams::new(Vec::<String>::new())?;
            p.subject_alt_names.push(rcgen::SanType::IpAddress(ip));
            p
        } else {
            CertificateParams::new(vec![host.to_string()])?
        };

        params.distinguished_name.push(DnType::CommonName, host);
        params
            .distinguished_name
            .push(DnType::OrganizationName, ROXYMITM);
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![rcgen::ExtendedKeyUsagePurpose::ServerAuth];
        params.not_before = OffsetDateTime::now_utc().saturating_sub(Duration::days(1));
        params.not_after = OffsetDateTime::now_utc().saturating_add(Duration::days(365));
        params.serial_number = Some(rcgen::SerialNumber::from(
            rand::rng().random_range(0u64..1_000_000u64),
        ));

        let key_pair = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)?;
        let leaf = params.signed_by(&key_pair, &self.inner.issuer)?;

        Ok((leaf, key_pair))
    }
}

fn load_native_certs(extra: Option<CertificateDer<'static>>) -> RootCertStore {
    let mut roots = rustls::RootCertStore::empty();

    let cert_result = rustls_native_certs::load_native_certs();
    for err in cert_result.errors.iter() {
        warn!("load native cert error: {err}");
    }
    for cert in cert_result.certs {
        if let Err(e) = roots.add(cert) {
            warn!("failed to parse trust anchor: {}", e);
        }
    }

    if let Some(extra) = extra
        && let Err(err) = roots.add(extra)
    {
        warn!("error adding roxy CA cert to root store: {err}");
    }
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    roots
}

struct CaFiles {
    key_path: PathBuf,
    cert_path: PathBuf,
}

impl CaFiles {
    fn new(home: &Path) -> Self {
        CaFiles {
            key_path: home.join("roxy-ca-key.pem"),
            cert_path: home.join("roxy-ca-cert.pem"),
        }
    }
}

#[derive(Debug)]
pub enum CaError {
    Io(std::io::Error),
    RcGen(rcgen::Error),
    RustLS(rustls::Error),
    RustLSPem(rustls::pki_types::pem::Error),
    MissingHomeDir,
}

impl Error for CaError {}

impl std::fmt::Display for CaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CaError::Io(e) => write!(f, "io error: {e}"),
            CaError::RcGen(e) => write!(f, "certificate generation error: {e}"),
            CaError::RustLS(e) => write!(f, "tls error: {e}"),
            CaError::RustLSPem(e) => write!(f, "pem error: {e}"),
            CaError::MissingHomeDir => write!(f, "could not determine a home directory for CA material"),
        }
    }
}

impl From<std::io::Error> for CaError {
    fn from(value: std::io::Error) -> Self {
        CaError::Io(value)
    }
}

impl From<rcgen::Error> for CaError {
    fn from(value: rcgen::Error) -> Self {
        CaError::RcGen(value)
    }
}

impl From<rustls::Error> for CaError {
    fn from(value: rustls::Error) -> Self {
        CaError::RustLS(value)
    }
}

impl From<rustls::pki_types::pem::Error> for CaError {
    fn from(value: rustls::pki_types::pem::Error) -> Self {
        CaError::RustLSPem(value)
    }
}

/// Loads the root CA from `~/.roxy`, generating and persisting a new one the
/// first time the proxy runs.
pub fn generate_roxy_root_ca() -> Result<RoxyCA, CaError> {
    generate_roxy_root_ca_with_path(None)
}

/// Loads CA material from two explicit PEM files: a PKCS#8 private key and a
/// single `CERTIFICATE` block, per §4.2.1/§6. Unlike
/// [`generate_roxy_root_ca_with_path`] this never generates material on a
/// miss — a missing or unparsable file is the fatal startup error §4.2.1
/// requires.
pub fn load_ca_from_paths(key_path: &Path, cert_path: &Path) -> Result<RoxyCA, CaError> {
    init_crypto();

    let key_pem = std::fs::read_to_string(key_path)?;
    let key_pair = rcgen::KeyPair::from_pem(&key_pem)?;

    let cert_pem = std::fs::read_to_string(cert_path)?;
    let issuer = Issuer::from_ca_cert_pem(&cert_pem, key_pair)?;

    let ca_der = CertificateDer::from_pem_file(cert_path)?;
    let ca_der = ca_der.to_vec();
    let roots = load_native_certs(Some(CertificateDer::from(ca_der.clone())));

    Ok(RoxyCA::new(issuer, roots, ca_der))
}

pub fn generate_roxy_root_ca_with_path(path: Option<PathBuf>) -> Result<RoxyCA, CaError> {
    init_crypto();
    let root_dir: PathBuf = match path {
        Some(p) => p,
        None => dirs::home_dir().ok_or(CaError::MissingHomeDir)?,
    };
    let home = root_dir.join(".roxy");
    fs::create_dir_all(&home)?;

    let ca_files = CaFiles::new(&home);

    let (issuer, ca_der) = if ca_files.key_path.exists() && ca_files.cert_path.exists() {
        trace!("roxy root CA already exists at {}", home.display());

        let key_pem = std::fs::read_to_string(&ca_files.key_path)?;
        let key_pair = rcgen::KeyPair::from_pem(&key_pem)?;

        let cert_pem = std::fs::read_to_string(&ca_files.cert_path)?;
        let issuer = Issuer::from_ca_cert_pem(&cert_pem, key_pair)?;

        let ca_der = CertificateDer::from_pem_file(&ca_files.cert_path)?;

        (issuer, ca_der)
    } else {
        generate(&ca_files)?
    };

    let ca_der = ca_der.to_vec();
    let roots = load_native_certs(Some(CertificateDer::from(ca_der.clone())));

    Ok(RoxyCA::new(issuer, roots, ca_der))
}

fn generate(
    ca_files: &CaFiles,
) -> Result<(Issuer<'static, KeyPair>, CertificateDer<'static>), CaError> {
    let mut ca_params = CertificateParams::default();
    ca_params.is_ca = IsCa::Ca(rcgen::BasicConstraints::Unconstrained);

    ca_params.distinguished_name = DistinguishedName::new();
    ca_params.distinguished_name.push(DnType::CountryName, "US");
    ca_params
        .distinguished_name
        .push(DnType::CommonName, ROXYMITM);
    ca_params
        .distinguished_name
        .push(DnType::OrganizationName, ROXYMITM);

    ca_params.key_usages.push(KeyUsagePurpose::DigitalSignature);
    ca_params.key_usages.push(KeyUsagePurpose::KeyCertSign);
    ca_params.key_usages.push(KeyUsagePurpose::CrlSign);

    ca_params.not_before = OffsetDateTime::now_utc();
    ca_params.not_after = OffsetDateTime::now_utc().saturating_add(Duration::days(365 * 10));

    let key_pair = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)?;
    let ca_cert = ca_params.self_signed(&key_pair)?;

    fs::write(&ca_files.key_path, key_pair.serialize_pem())?;
    fs::write(&ca_files.cert_path, ca_cert.pem())?;

    debug!("roxy root CA generated at {}", ca_files.cert_path.display());
    debug!("import this cert into your browser/system as a trusted root to intercept TLS traffic");

    let issuer = Issuer::new(ca_params, key_pair);
    Ok((issuer, ca_cert.der().clone()))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use x509_parser::extensions::{GeneralName, ParsedExtension};
    use x509_parser::prelude::FromDer;

    fn test_ca() -> RoxyCA {
        let temp_dir = tempfile::tempdir().unwrap();
        generate_roxy_root_ca_with_path(Some(temp_dir.path().to_path_buf())).unwrap()
    }

    /// Returns the DNS and IP SAN entries on a DER-encoded leaf certificate.
    fn sans(der: &[u8]) -> (Vec<String>, Vec<IpAddr>) {
        let (_, cert) = x509_parser::certificate::X509Certificate::from_der(der).unwrap();
        let mut dns_names = Vec::new();
        let mut ip_addrs = Vec::new();
        for ext in cert.extensions() {
            if let ParsedExtension::SubjectAlternativeName(san) = ext.parsed_extension() {
                for name in &san.general_names {
                    match name {
                        GeneralName::DNSName(s) => dns_names.push(s.to_string()),
                        GeneralName::IPAddress(bytes) => {
                            if let Ok(arr) = <[u8; 4]>::try_from(*bytes) {
                                ip_addrs.push(IpAddr::from(arr));
                            } else if let Ok(arr) = <[u8; 16]>::try_from(*bytes) {
                                ip_addrs.push(IpAddr::from(arr));
                            }
                        }
                        _ => {}
                    }
                }
            }
        }
        (dns_names, ip_addrs)
    }

    #[test]
    fn dns_hostname_lands_in_dns_sans_only() {
        let ca = test_ca();
        let (leaf, _) = ca.sign_leaf("example.test").unwrap();
        let (dns_names, ip_addrs) = sans(leaf.der());

        assert_eq!(dns_names, vec!["example.test".to_string()]);
        assert!(ip_addrs.is_empty());
    }

    #[test]
    fn ip_literal_lands_in_ip_sans_only() {
        let ca = test_ca();
        let (leaf, _) = ca.sign_leaf("127.0.0.1").unwrap();
        let (dns_names, ip_addrs) = sans(leaf.der());

        assert_eq!(ip_addrs, vec!["127.0.0.1".parse::<IpAddr>().unwrap()]);
        assert!(dns_names.is_empty());
    }

    #[test]
    fn leaf_carries_organization_and_key_usage_from_spec() {
        let ca = test_ca();
        let (leaf, _) = ca.sign_leaf("example.test").unwrap();
        let (_, cert) = x509_parser::certificate::X509Certificate::from_der(leaf.der()).unwrap();

        assert!(
            cert.subject()
                .iter_organization()
                .next()
                .is_some(),
            "leaf must carry an Organization DN component"
        );

        let key_usage_ext = cert
            .extensions()
            .iter()
            .find_map(|ext| match ext.parsed_extension() {
                ParsedExtension::KeyUsage(ku) => Some(ku),
                _ => None,
            })
            .expect("leaf must carry a KeyUsage extension");
        assert!(key_usage_ext.digital_signature());
        assert!(key_usage_ext.key_encipherment());
    }
}
