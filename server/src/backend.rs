//! Certificate signing backends
//!
//! A backend turns a [`CertificateTemplate`] into a signed leaf certificate
//! plus the chain a client needs to present it. The subject's public key is
//! always supplied from outside; a backend never sees the matching private
//! key.

use crate::error::{BackendError, ConfigError};
use rcgen::{
    string::Ia5String, CertificateParams, DistinguishedName, DnType, DnValue,
    ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair, KeyUsagePurpose, PublicKeyData, SanType,
    SerialNumber, SignatureAlgorithm,
};
use serde::Deserialize;
use shared::task::{CodecError, Curve, EcdsaKeyResponse};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};
use x509_parser::certificate::X509Certificate;
use x509_parser::prelude::FromDer;

/// A public key asserted by a client, ready to be certified
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubjectPublicKey {
    curve: Curve,
    point: Vec<u8>,
}

impl SubjectPublicKey {
    pub fn from_response(response: &EcdsaKeyResponse) -> Result<Self, CodecError> {
        Ok(Self {
            curve: response.curve,
            point: response.public_point()?,
        })
    }

    /// Uncompressed SEC1 point
    pub fn point(&self) -> &[u8] {
        &self.point
    }
}

impl PublicKeyData for SubjectPublicKey {
    fn der_bytes(&self) -> &[u8] {
        &self.point
    }

    fn algorithm(&self) -> &'static SignatureAlgorithm {
        self.curve.signature_algorithm()
    }
}

/// Everything a backend needs to issue a leaf certificate
#[derive(Debug, Clone)]
pub struct CertificateTemplate {
    pub common_name: String,
    pub dns_names: Vec<String>,
    pub ip_addresses: Vec<IpAddr>,
    /// Big-endian, positive
    pub serial: Vec<u8>,
    pub public_key: SubjectPublicKey,
    pub validity: time::Duration,
}

impl CertificateTemplate {
    /// Leaf certificate parameters valid from now for `validity`
    pub fn to_params(&self) -> Result<CertificateParams, BackendError> {
        let mut params = CertificateParams::default();

        let mut dn = DistinguishedName::new();
        if !self.common_name.is_empty() {
            dn.push(
                DnType::CommonName,
                DnValue::Utf8String(self.common_name.clone()),
            );
        }
        params.distinguished_name = dn;

        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];
        params.use_authority_key_identifier_extension = true;

        let now = time::OffsetDateTime::now_utc();
        params.not_before = now;
        params.not_after = now + self.validity;
        params.serial_number = Some(SerialNumber::from_slice(&self.serial));

        let mut sans = Vec::with_capacity(self.dns_names.len() + self.ip_addresses.len());
        for name in &self.dns_names {
            let name = Ia5String::try_from(name.clone())
                .map_err(|_| BackendError::InvalidDnsName(name.clone()))?;
            sans.push(SanType::DnsName(name));
        }
        sans.extend(self.ip_addresses.iter().copied().map(SanType::IpAddress));
        params.subject_alt_names = sans;

        Ok(params)
    }
}

/// Output of a signing backend, all DER
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedCertificate {
    pub leaf: Vec<u8>,
    /// Issuer first, then towards the root. Older deployments appended the
    /// issuer after the configured chain; TLS peers expect this order.
    pub chain: Vec<Vec<u8>>,
}

pub trait X509Backend: Send + Sync {
    fn sign(&self, template: &CertificateTemplate) -> Result<SignedCertificate, BackendError>;
}

/// Named backends, built once at startup and shared read-only
#[derive(Clone, Default)]
pub struct Backends {
    x509: BTreeMap<String, Arc<dyn X509Backend>>,
}

impl Backends {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_x509(
        &mut self,
        name: impl Into<String>,
        backend: Arc<dyn X509Backend>,
    ) -> Result<(), ConfigError> {
        let name = name.into();
        if self.x509.contains_key(&name) {
            return Err(ConfigError::DuplicateBackend(name));
        }
        self.x509.insert(name, backend);
        Ok(())
    }

    pub fn x509(&self, name: &str) -> Option<&Arc<dyn X509Backend>> {
        self.x509.get(name)
    }

    pub fn x509_names(&self) -> impl Iterator<Item = &str> {
        self.x509.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.x509.len()
    }

    pub fn is_empty(&self) -> bool {
        self.x509.is_empty()
    }
}

/// `x509_file` backend settings
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct X509FileConfig {
    pub key: PathBuf,
    pub cert: PathBuf,
    #[serde(default)]
    pub chain: Option<PathBuf>,
}

/// Issuer key and certificate loaded from PEM files
pub struct X509File {
    // KeyPair is rebuilt per signature from the PEM; it is not Clone
    key_pem: String,
    cert_pem: String,
    cert_der: Vec<u8>,
    chain: Vec<Vec<u8>>,
}

impl X509File {
    pub fn load(config: &X509FileConfig) -> Result<Self, BackendError> {
        let key_pem = read_pem_file(&config.key)?;
        expect_single_block(&config.key, &key_pem, None)?;
        let key = KeyPair::from_pem(&key_pem).map_err(|source| BackendError::Key {
            path: config.key.clone(),
            source,
        })?;

        let cert_pem = read_pem_file(&config.cert)?;
        let cert_der = expect_single_block(&config.cert, &cert_pem, Some("CERTIFICATE"))?;
        let (_, cert) =
            X509Certificate::from_der(&cert_der).map_err(|e| BackendError::Certificate {
                path: config.cert.clone(),
                reason: e.to_string(),
            })?;
        let cert_key: &[u8] = &cert.public_key().subject_public_key.data;
        if cert_key != key.public_key_raw() {
            return Err(BackendError::KeyMismatch {
                key: config.key.clone(),
                cert: config.cert.clone(),
            });
        }
        let issuer_name = cert.subject().to_string();

        Issuer::from_ca_cert_pem(&cert_pem, key).map_err(|e| BackendError::Certificate {
            path: config.cert.clone(),
            reason: e.to_string(),
        })?;

        let chain = match &config.chain {
            Some(path) => load_chain(path)?,
            None => Vec::new(),
        };

        info!(issuer = %issuer_name, chain = chain.len(), "Loaded x509_file backend");

        Ok(Self {
            key_pem,
            cert_pem,
            cert_der,
            chain,
        })
    }

    fn issuer(&self) -> Result<Issuer<'static, KeyPair>, BackendError> {
        let key = KeyPair::from_pem(&self.key_pem)?;
        Ok(Issuer::from_ca_cert_pem(&self.cert_pem, key)?)
    }
}

impl X509Backend for X509File {
    fn sign(&self, template: &CertificateTemplate) -> Result<SignedCertificate, BackendError> {
        let params = template.to_params()?;
        let issuer = self.issuer()?;
        let cert = params.signed_by(&template.public_key, &issuer)?;

        debug!(common_name = %template.common_name, "Signed leaf certificate");

        let mut chain = Vec::with_capacity(1 + self.chain.len());
        chain.push(self.cert_der.clone());
        chain.extend(self.chain.iter().cloned());

        Ok(SignedCertificate {
            leaf: cert.der().to_vec(),
            chain,
        })
    }
}

/// Construct an `x509_file` backend from its configuration block
pub fn x509_file(name: &str, config: serde_yaml::Value) -> Result<Arc<dyn X509Backend>, ConfigError> {
    let config: X509FileConfig =
        serde_yaml::from_value(config).map_err(|source| ConfigError::Invalid {
            what: format!("backend '{}'", name),
            source,
        })?;
    let backend = X509File::load(&config).map_err(|source| ConfigError::Backend {
        name: name.to_string(),
        source,
    })?;
    Ok(Arc::new(backend))
}

fn read_pem_file(path: &Path) -> Result<String, BackendError> {
    std::fs::read_to_string(path).map_err(|source| BackendError::Read {
        path: path.to_path_buf(),
        source,
    })
}

fn expect_single_block(
    path: &Path,
    data: &str,
    tag: Option<&str>,
) -> Result<Vec<u8>, BackendError> {
    let block = ::pem::parse(data.as_bytes()).map_err(|e| BackendError::Pem {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    if let Some(tag) = tag {
        if block.tag() != tag {
            return Err(BackendError::PemType {
                path: path.to_path_buf(),
                tag: block.tag().to_string(),
            });
        }
    }
    Ok(block.contents().to_vec())
}

fn load_chain(path: &Path) -> Result<Vec<Vec<u8>>, BackendError> {
    let data = std::fs::read(path).map_err(|source| BackendError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let blocks = ::pem::parse_many(&data).map_err(|e| BackendError::Pem {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    if blocks.is_empty() {
        return Err(BackendError::Pem {
            path: path.to_path_buf(),
            reason: "no PEM blocks found".to_string(),
        });
    }

    blocks
        .into_iter()
        .map(|block| {
            if block.tag() != "CERTIFICATE" {
                return Err(BackendError::PemType {
                    path: path.to_path_buf(),
                    tag: block.tag().to_string(),
                });
            }
            Ok(block.into_contents())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{client_key, write_ca, TestCa};
    use x509_parser::extensions::GeneralName;

    fn template(public_key: SubjectPublicKey) -> CertificateTemplate {
        CertificateTemplate {
            common_name: "svc.example.com".to_string(),
            dns_names: vec!["svc.example.com".to_string(), "alt.example.com".to_string()],
            ip_addresses: vec!["10.0.0.7".parse().unwrap()],
            serial: vec![0x01, 0x02, 0x03, 0x04],
            public_key,
            validity: time::Duration::days(30),
        }
    }

    #[test]
    fn signs_client_supplied_key() {
        let dir = tempfile::tempdir().unwrap();
        let ca = write_ca(dir.path(), "Test CA");
        let backend = X509File::load(&ca.config()).unwrap();

        let public_key = client_key(Curve::P521);
        let signed = backend.sign(&template(public_key.clone())).unwrap();

        let (_, leaf) = X509Certificate::from_der(&signed.leaf).unwrap();
        let cn = leaf
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .unwrap();
        assert_eq!(cn, "svc.example.com");
        assert_eq!(leaf.issuer().to_string(), "CN=Test CA");
        assert_eq!(leaf.raw_serial(), &[0x01, 0x02, 0x03, 0x04]);

        let spki: &[u8] = &leaf.public_key().subject_public_key.data;
        assert_eq!(spki, public_key.point());

        let san = leaf.subject_alternative_name().unwrap().unwrap();
        let dns: Vec<_> = san
            .value
            .general_names
            .iter()
            .filter_map(|n| match n {
                GeneralName::DNSName(d) => Some(d.to_string()),
                _ => None,
            })
            .collect();
        assert_eq!(dns, vec!["svc.example.com", "alt.example.com"]);
        assert!(san
            .value
            .general_names
            .iter()
            .any(|n| matches!(n, GeneralName::IPAddress(ip) if *ip == [10, 0, 0, 7])));

        assert_eq!(signed.chain, vec![ca.cert_der.clone()]);
    }

    #[test]
    fn explicit_chain_follows_issuer() {
        let dir = tempfile::tempdir().unwrap();
        let ca = write_ca(dir.path(), "Intermediate");
        let root_a = write_ca(&dir.path().join("a"), "Root A");
        let root_b = write_ca(&dir.path().join("b"), "Root B");
        let chain_path = dir.path().join("chain.pem");
        std::fs::write(
            &chain_path,
            format!("{}{}", root_a.cert_pem, root_b.cert_pem),
        )
        .unwrap();

        let mut config = ca.config();
        config.chain = Some(chain_path);
        let backend = X509File::load(&config).unwrap();

        let signed = backend.sign(&template(client_key(Curve::P256))).unwrap();
        assert_eq!(
            signed.chain,
            vec![ca.cert_der.clone(), root_a.cert_der.clone(), root_b.cert_der.clone()]
        );
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = X509FileConfig {
            key: dir.path().join("nope.key"),
            cert: dir.path().join("nope.pem"),
            chain: None,
        };
        assert!(matches!(
            X509File::load(&config),
            Err(BackendError::Read { .. })
        ));
    }

    #[test]
    fn garbage_pem_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let ca = write_ca(dir.path(), "Test CA");
        std::fs::write(&ca.cert_path, "not a pem file").unwrap();
        assert!(matches!(
            X509File::load(&ca.config()),
            Err(BackendError::Pem { .. })
        ));
    }

    #[test]
    fn key_must_match_certificate() {
        let dir = tempfile::tempdir().unwrap();
        let ca = write_ca(dir.path(), "Test CA");
        let other: TestCa = write_ca(&dir.path().join("other"), "Other CA");

        let mut config = ca.config();
        config.key = other.key_path.clone();
        assert!(matches!(
            X509File::load(&config),
            Err(BackendError::KeyMismatch { .. })
        ));
    }

    #[test]
    fn loads_sec1_issuer_key() {
        use aws_lc_rs::encoding::AsDer;
        use aws_lc_rs::signature::{EcdsaKeyPair, ECDSA_P256_SHA256_ASN1_SIGNING};

        let dir = tempfile::tempdir().unwrap();
        let ca = write_ca(dir.path(), "Test CA");
        let pkcs8 = ::pem::parse(std::fs::read(&ca.key_path).unwrap()).unwrap();
        let pair =
            EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_ASN1_SIGNING, pkcs8.contents()).unwrap();
        let sec1 = pair.private_key().as_der().unwrap();
        std::fs::write(
            &ca.key_path,
            ::pem::encode(&::pem::Pem::new("EC PRIVATE KEY", sec1.as_ref())),
        )
        .unwrap();

        let backend = X509File::load(&ca.config()).unwrap();
        let signed = backend.sign(&template(client_key(Curve::P521))).unwrap();
        let (_, leaf) = X509Certificate::from_der(&signed.leaf).unwrap();
        assert_eq!(leaf.issuer().to_string(), "CN=Test CA");
    }

    #[test]
    fn chain_must_hold_certificates_only() {
        let dir = tempfile::tempdir().unwrap();
        let ca = write_ca(dir.path(), "Test CA");
        let chain_path = dir.path().join("chain.pem");
        std::fs::write(
            &chain_path,
            format!("{}{}", ca.cert_pem, std::fs::read_to_string(&ca.key_path).unwrap()),
        )
        .unwrap();

        let mut config = ca.config();
        config.chain = Some(chain_path);
        assert!(matches!(
            X509File::load(&config),
            Err(BackendError::PemType { tag, .. }) if tag == "PRIVATE KEY"
        ));
    }

    #[test]
    fn invalid_dns_name_fails_signing() {
        let dir = tempfile::tempdir().unwrap();
        let ca = write_ca(dir.path(), "Test CA");
        let backend = X509File::load(&ca.config()).unwrap();

        let mut t = template(client_key(Curve::P384));
        t.dns_names = vec!["bücher.example".to_string()];
        assert!(matches!(
            backend.sign(&t),
            Err(BackendError::InvalidDnsName(_))
        ));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let yaml: serde_yaml::Value =
            serde_yaml::from_str("{key: a, cert: b, chian: c}").unwrap();
        assert!(matches!(
            x509_file("ca1", yaml),
            Err(ConfigError::Invalid { .. })
        ));
    }

    #[test]
    fn registry_rejects_duplicate_names() {
        let dir = tempfile::tempdir().unwrap();
        let ca = write_ca(dir.path(), "Test CA");
        let backend: Arc<dyn X509Backend> = Arc::new(X509File::load(&ca.config()).unwrap());

        let mut backends = Backends::new();
        backends.insert_x509("ca1", backend.clone()).unwrap();
        assert!(matches!(
            backends.insert_x509("ca1", backend),
            Err(ConfigError::DuplicateBackend(n)) if n == "ca1"
        ));
        assert_eq!(backends.x509_names().collect::<Vec<_>>(), vec!["ca1"]);
    }
}
