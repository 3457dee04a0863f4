//! TLS material and certificate loading.
//!
//! # Responsibilities
//! - Load certificate chains and private keys from PEM files or PEM bytes
//! - Reject chains with no certificate inside its validity window
//! - Load client CA roots for mutual TLS
//! - Hold the material the controller carries from one run to the next
//! - Build the rustls server configuration when a run is baked
//!
//! # Design Decisions
//! - Material can be emptied in place (`clear`) to revoke certificates between
//!   runs; an empty set is treated as "no TLS" by the server
//! - Several key pairs are served by SNI against each leaf's DNS names; a
//!   client naming no known host gets the first pair

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{ClientHello, ResolvesServerCert, WebPkiClientVerifier};
use rustls::sign::CertifiedKey;
use rustls::RootCertStore;
use thiserror::Error;
use x509_parser::extensions::GeneralName;
use x509_parser::parse_x509_certificate;

/// ALPN protocols advertised when the material does not name any.
pub const DEFAULT_ALPN: [&[u8]; 2] = [b"h2", b"http/1.1"];

/// Errors produced while loading or baking TLS material.
#[derive(Debug, Error)]
pub enum TlsError {
    #[error("the path to the certificate file is empty")]
    CertPathEmpty,

    #[error("the path to the key file is empty")]
    KeyPathEmpty,

    #[error("PEM certificate block is empty")]
    CertPemEmpty,

    #[error("PEM key block is empty")]
    KeyPemEmpty,

    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse PEM data: {0}")]
    Parse(#[source] std::io::Error),

    #[error("no certificates found in PEM data")]
    NoCertificates,

    #[error("no private key found in PEM data")]
    NoPrivateKey,

    #[error("no valid certificate")]
    NoValid,

    #[error("failed to add CA's certificate: {0}")]
    AppendCertFailed(#[source] rustls::Error),

    #[error("client certificate verifier: {0}")]
    ClientVerifier(#[from] rustls::server::VerifierBuilderError),

    #[error("TLS material holds no certificates")]
    Empty,

    #[error("invalid certificate or key: {0}")]
    Rustls(#[from] rustls::Error),
}

/// A certificate chain and the private key it was issued for.
pub struct CertifiedKeyPair {
    chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
}

impl CertifiedKeyPair {
    /// Pair a DER certificate chain (leaf first) with its private key.
    pub fn new(chain: Vec<CertificateDer<'static>>, key: PrivateKeyDer<'static>) -> Self {
        Self { chain, key }
    }

    /// Parse a PEM-encoded chain and key. At least one certificate of the
    /// chain must be valid now.
    pub fn from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<Self, TlsError> {
        if cert_pem.is_empty() {
            return Err(TlsError::CertPemEmpty);
        }
        if key_pem.is_empty() {
            return Err(TlsError::KeyPemEmpty);
        }

        let chain = rustls_pemfile::certs(&mut &cert_pem[..])
            .collect::<Result<Vec<_>, _>>()
            .map_err(TlsError::Parse)?;
        if chain.is_empty() {
            return Err(TlsError::NoCertificates);
        }

        let key = rustls_pemfile::private_key(&mut &key_pem[..])
            .map_err(TlsError::Parse)?
            .ok_or(TlsError::NoPrivateKey)?;

        let pair = Self { chain, key };
        pair.validate()?;
        Ok(pair)
    }

    /// Certificate chain, leaf first.
    pub fn chain(&self) -> &[CertificateDer<'static>] {
        &self.chain
    }

    /// Fails with [`TlsError::NoValid`] unless some certificate of the chain
    /// is inside its validity window. Unparseable certificates are skipped.
    pub fn validate(&self) -> Result<(), TlsError> {
        let valid = self.chain.iter().any(|der| {
            parse_x509_certificate(der.as_ref())
                .map(|(_, cert)| cert.validity().is_valid())
                .unwrap_or(false)
        });
        if valid {
            Ok(())
        } else {
            Err(TlsError::NoValid)
        }
    }

    /// DNS names of the leaf certificate, lowercased. Falls back to the
    /// subject common name when the leaf has no DNS subject alternative names.
    pub fn dns_names(&self) -> Vec<String> {
        let Some(leaf) = self.chain.first() else {
            return Vec::new();
        };
        let Ok((_, cert)) = parse_x509_certificate(leaf.as_ref()) else {
            return Vec::new();
        };

        let mut names: Vec<String> = match cert.subject_alternative_name() {
            Ok(Some(san)) => san
                .value
                .general_names
                .iter()
                .filter_map(|name| match name {
                    GeneralName::DNSName(dns) => Some(dns.to_ascii_lowercase()),
                    _ => None,
                })
                .collect(),
            _ => Vec::new(),
        };
        if names.is_empty() {
            names.extend(
                cert.subject()
                    .iter_common_name()
                    .filter_map(|cn| cn.as_str().ok())
                    .map(str::to_ascii_lowercase),
            );
        }
        names
    }
}

impl Clone for CertifiedKeyPair {
    fn clone(&self) -> Self {
        Self {
            chain: self.chain.clone(),
            key: self.key.clone_key(),
        }
    }
}

impl fmt::Debug for CertifiedKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertifiedKeyPair")
            .field("chain_len", &self.chain.len())
            .finish_non_exhaustive()
    }
}

/// Whether clients must present a certificate.
#[derive(Debug, Clone, Default)]
pub enum ClientAuth {
    /// Client certificates are not requested.
    #[default]
    None,
    /// Requested and verified against the roots when sent.
    Optional(RootCertStore),
    /// Every client must present a certificate issued under the roots.
    Required(RootCertStore),
}

/// Read CA certificates for verifying clients from a PEM file.
pub fn load_client_roots(path: &Path) -> Result<RootCertStore, TlsError> {
    let pem = read(path)?;
    let roots = client_roots_from_pem(&pem)?;
    tracing::info!(ca = %path.display(), roots = roots.len(), "Loaded client CA certificates");
    Ok(roots)
}

/// Parse CA certificates for verifying clients from PEM bytes.
pub fn client_roots_from_pem(pem: &[u8]) -> Result<RootCertStore, TlsError> {
    if pem.is_empty() {
        return Err(TlsError::CertPemEmpty);
    }
    let certs = rustls_pemfile::certs(&mut &pem[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(TlsError::Parse)?;
    if certs.is_empty() {
        return Err(TlsError::NoCertificates);
    }

    let mut roots = RootCertStore::empty();
    for cert in certs {
        roots.add(cert).map_err(TlsError::AppendCertFailed)?;
    }
    Ok(roots)
}

/// Certificates, client roots and protocol list used by a TLS listener.
#[derive(Debug, Clone, Default)]
pub struct TlsMaterial {
    certificates: Vec<CertifiedKeyPair>,
    client_auth: ClientAuth,
    alpn: Vec<Vec<u8>>,
}

impl TlsMaterial {
    /// Material serving a single key pair.
    pub fn new(pair: CertifiedKeyPair) -> Self {
        Self {
            certificates: vec![pair],
            client_auth: ClientAuth::None,
            alpn: Vec::new(),
        }
    }

    /// Load a key pair from PEM files on disk.
    pub fn from_pem_files(cert_path: &Path, key_path: &Path) -> Result<Self, TlsError> {
        if cert_path.as_os_str().is_empty() {
            return Err(TlsError::CertPathEmpty);
        }
        if key_path.as_os_str().is_empty() {
            return Err(TlsError::KeyPathEmpty);
        }

        let cert_pem = read(cert_path)?;
        let key_pem = read(key_path)?;
        let material = Self::from_pem(&cert_pem, &key_pem)?;

        tracing::info!(
            cert = %cert_path.display(),
            chain_len = material.certificates[0].chain.len(),
            "Loaded TLS certificate"
        );

        Ok(material)
    }

    /// Load a key pair from PEM bytes, e.g. assets embedded with `include_bytes!`.
    pub fn from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<Self, TlsError> {
        CertifiedKeyPair::from_pem(cert_pem, key_pem).map(Self::new)
    }

    /// Replace the advertised ALPN protocols.
    pub fn with_alpn<I, P>(mut self, protocols: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<Vec<u8>>,
    {
        self.alpn = protocols.into_iter().map(Into::into).collect();
        self
    }

    /// Verify client certificates against a set of CA roots.
    pub fn with_client_auth(mut self, client_auth: ClientAuth) -> Self {
        self.client_auth = client_auth;
        self
    }

    pub fn client_auth(&self) -> &ClientAuth {
        &self.client_auth
    }

    /// Add another key pair, served to clients asking for one of its names.
    pub fn push(&mut self, pair: CertifiedKeyPair) {
        self.certificates.push(pair);
    }

    /// Drop every certificate. The next run serves plaintext.
    pub fn clear(&mut self) {
        self.certificates.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.certificates.is_empty()
    }

    pub fn len(&self) -> usize {
        self.certificates.len()
    }

    pub fn certificates(&self) -> &[CertifiedKeyPair] {
        &self.certificates
    }

    pub fn alpn(&self) -> &[Vec<u8>] {
        &self.alpn
    }

    /// Build the rustls configuration for a listener.
    pub fn server_config(&self) -> Result<Arc<rustls::ServerConfig>, TlsError> {
        let (first, rest) = self.certificates.split_first().ok_or(TlsError::Empty)?;

        let builder = rustls::ServerConfig::builder();
        let builder = match &self.client_auth {
            ClientAuth::None => builder.with_no_client_auth(),
            ClientAuth::Optional(roots) => {
                let verifier = WebPkiClientVerifier::builder(Arc::new(roots.clone()))
                    .allow_unauthenticated()
                    .build()?;
                builder.with_client_cert_verifier(verifier)
            }
            ClientAuth::Required(roots) => {
                let verifier = WebPkiClientVerifier::builder(Arc::new(roots.clone())).build()?;
                builder.with_client_cert_verifier(verifier)
            }
        };

        let mut config = if rest.is_empty() {
            builder.with_single_cert(first.chain.clone(), first.key.clone_key())?
        } else {
            let provider = Arc::clone(builder.crypto_provider());
            let certified = |pair: &CertifiedKeyPair| -> Result<Arc<CertifiedKey>, TlsError> {
                let key = provider.key_provider.load_private_key(pair.key.clone_key())?;
                Ok(Arc::new(CertifiedKey::new(pair.chain.clone(), key)))
            };

            let mut resolver = SniResolver {
                by_name: HashMap::new(),
                fallback: certified(first)?,
            };
            for name in first.dns_names() {
                resolver.by_name.insert(name, Arc::clone(&resolver.fallback));
            }
            for pair in rest {
                let key = certified(pair)?;
                for name in pair.dns_names() {
                    resolver.by_name.entry(name).or_insert_with(|| Arc::clone(&key));
                }
            }
            tracing::debug!(
                pairs = self.certificates.len(),
                names = resolver.by_name.len(),
                "Serving TLS key pairs by SNI"
            );
            builder.with_cert_resolver(Arc::new(resolver))
        };

        config.alpn_protocols = if self.alpn.is_empty() {
            DEFAULT_ALPN.iter().map(|p| p.to_vec()).collect()
        } else {
            self.alpn.clone()
        };

        Ok(Arc::new(config))
    }
}

/// Picks a key pair by the SNI name the client sent.
#[derive(Debug)]
struct SniResolver {
    by_name: HashMap<String, Arc<CertifiedKey>>,
    fallback: Arc<CertifiedKey>,
}

impl SniResolver {
    fn lookup(&self, server_name: Option<&str>) -> Arc<CertifiedKey> {
        let Some(name) = server_name.map(str::to_ascii_lowercase) else {
            return Arc::clone(&self.fallback);
        };
        let wildcard = name.split_once('.').map(|(_, parent)| format!("*.{parent}"));
        self.by_name
            .get(&name)
            .or_else(|| wildcard.and_then(|w| self.by_name.get(&w)))
            .map_or_else(|| Arc::clone(&self.fallback), Arc::clone)
    }
}

impl ResolvesServerCert for SniResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(self.lookup(client_hello.server_name()))
    }
}

fn read(path: &Path) -> Result<Vec<u8>, TlsError> {
    std::fs::read(path).map_err(|source| TlsError::Io {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const CERT_PEM: &[u8] = include_bytes!("../../tests/fixtures/cert.pem");
    const KEY_PEM: &[u8] = include_bytes!("../../tests/fixtures/key.pem");
    const OTHER_PEM: &[u8] = include_bytes!("../../tests/fixtures/other.pem");
    const OTHER_KEY_PEM: &[u8] = include_bytes!("../../tests/fixtures/other-key.pem");
    const EXPIRED_PEM: &[u8] = include_bytes!("../../tests/fixtures/expired.pem");
    const EXPIRED_KEY_PEM: &[u8] = include_bytes!("../../tests/fixtures/expired-key.pem");
    const CA_PEM: &[u8] = include_bytes!("../../tests/fixtures/ca.pem");

    fn certified(pair: &CertifiedKeyPair) -> Arc<CertifiedKey> {
        let provider = Arc::clone(rustls::ServerConfig::builder().crypto_provider());
        let key = provider
            .key_provider
            .load_private_key(pair.key.clone_key())
            .unwrap();
        Arc::new(CertifiedKey::new(pair.chain.clone(), key))
    }

    #[test]
    fn loads_embedded_pem() {
        let material = TlsMaterial::from_pem(CERT_PEM, KEY_PEM).unwrap();
        assert_eq!(material.len(), 1);
        assert_eq!(material.certificates()[0].chain().len(), 1);
        assert!(material.server_config().is_ok());
    }

    #[test]
    fn empty_inputs_are_rejected() {
        assert!(matches!(
            TlsMaterial::from_pem(b"", KEY_PEM),
            Err(TlsError::CertPemEmpty)
        ));
        assert!(matches!(
            TlsMaterial::from_pem(CERT_PEM, b""),
            Err(TlsError::KeyPemEmpty)
        ));
        assert!(matches!(
            TlsMaterial::from_pem_files(Path::new(""), Path::new("key.pem")),
            Err(TlsError::CertPathEmpty)
        ));
        assert!(matches!(
            TlsMaterial::from_pem_files(Path::new("cert.pem"), Path::new("")),
            Err(TlsError::KeyPathEmpty)
        ));
    }

    #[test]
    fn pem_without_blocks_is_rejected() {
        assert!(matches!(
            TlsMaterial::from_pem(b"not a certificate", KEY_PEM),
            Err(TlsError::NoCertificates)
        ));
        assert!(matches!(
            TlsMaterial::from_pem(CERT_PEM, b"not a key"),
            Err(TlsError::NoPrivateKey)
        ));
    }

    #[test]
    fn missing_file_reports_path() {
        let err = TlsMaterial::from_pem_files(
            Path::new("/nonexistent/cert.pem"),
            Path::new("/nonexistent/key.pem"),
        )
        .unwrap_err();
        assert!(err.to_string().contains("/nonexistent/cert.pem"));
    }

    #[test]
    fn cleared_material_cannot_be_served() {
        let mut material = TlsMaterial::from_pem(CERT_PEM, KEY_PEM).unwrap();
        material.clear();
        assert!(material.is_empty());
        assert!(matches!(material.server_config(), Err(TlsError::Empty)));
    }

    #[test]
    fn expired_certificate_is_rejected() {
        assert!(matches!(
            TlsMaterial::from_pem(EXPIRED_PEM, EXPIRED_KEY_PEM),
            Err(TlsError::NoValid)
        ));

        let dir = tempfile::tempdir().unwrap();
        let cert = dir.path().join("cert.pem");
        let key = dir.path().join("key.pem");
        std::fs::write(&cert, EXPIRED_PEM).unwrap();
        std::fs::write(&key, EXPIRED_KEY_PEM).unwrap();
        assert!(matches!(
            TlsMaterial::from_pem_files(&cert, &key),
            Err(TlsError::NoValid)
        ));
    }

    #[test]
    fn any_valid_certificate_in_chain_is_enough() {
        let expired = rustls_pemfile::certs(&mut &EXPIRED_PEM[..])
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        let current = CertifiedKeyPair::from_pem(CERT_PEM, KEY_PEM).unwrap();

        let mut chain = expired.clone();
        chain.extend(current.chain().iter().cloned());
        let mixed = CertifiedKeyPair::new(chain, current.key.clone_key());
        assert!(mixed.validate().is_ok());

        let stale = CertifiedKeyPair::new(expired, current.key.clone_key());
        assert!(matches!(stale.validate(), Err(TlsError::NoValid)));

        let garbage = CertifiedKeyPair::new(
            vec![CertificateDer::from(vec![0u8; 8])],
            current.key.clone_key(),
        );
        assert!(matches!(garbage.validate(), Err(TlsError::NoValid)));
    }

    #[test]
    fn leaf_dns_names() {
        let localhost = CertifiedKeyPair::from_pem(CERT_PEM, KEY_PEM).unwrap();
        assert_eq!(localhost.dns_names(), vec!["localhost".to_string()]);

        let other = CertifiedKeyPair::from_pem(OTHER_PEM, OTHER_KEY_PEM).unwrap();
        assert_eq!(other.dns_names(), vec!["other.example".to_string()]);
    }

    #[test]
    fn client_roots_load_from_pem() {
        let roots = client_roots_from_pem(CA_PEM).unwrap();
        assert_eq!(roots.len(), 1);

        assert!(matches!(client_roots_from_pem(b""), Err(TlsError::CertPemEmpty)));
        assert!(matches!(
            client_roots_from_pem(b"no certificates here"),
            Err(TlsError::NoCertificates)
        ));
        assert!(matches!(
            load_client_roots(Path::new("/nonexistent/ca.pem")),
            Err(TlsError::Io { .. })
        ));
    }

    #[test]
    fn client_roots_enable_client_verification() {
        let material = TlsMaterial::from_pem(CERT_PEM, KEY_PEM).unwrap();
        assert!(material.server_config().is_ok());

        let roots = client_roots_from_pem(CA_PEM).unwrap();
        let required = material
            .clone()
            .with_client_auth(ClientAuth::Required(roots.clone()));
        assert!(required.server_config().is_ok());

        let optional = material.with_client_auth(ClientAuth::Optional(roots));
        assert!(optional.server_config().is_ok());

        let empty = TlsMaterial::from_pem(CERT_PEM, KEY_PEM)
            .unwrap()
            .with_client_auth(ClientAuth::Required(RootCertStore::empty()));
        assert!(matches!(
            empty.server_config(),
            Err(TlsError::ClientVerifier(_))
        ));
    }

    #[test]
    fn several_pairs_build_one_config() {
        let mut material = TlsMaterial::from_pem(CERT_PEM, KEY_PEM).unwrap();
        material.push(CertifiedKeyPair::from_pem(OTHER_PEM, OTHER_KEY_PEM).unwrap());
        assert_eq!(material.len(), 2);
        assert!(material.server_config().is_ok());
    }

    #[test]
    fn sni_picks_pair_by_name() {
        let localhost = certified(&CertifiedKeyPair::from_pem(CERT_PEM, KEY_PEM).unwrap());
        let other = certified(&CertifiedKeyPair::from_pem(OTHER_PEM, OTHER_KEY_PEM).unwrap());
        let resolver = SniResolver {
            by_name: HashMap::from([
                ("localhost".to_string(), Arc::clone(&localhost)),
                ("other.example".to_string(), Arc::clone(&other)),
                ("*.wild.example".to_string(), Arc::clone(&other)),
            ]),
            fallback: Arc::clone(&localhost),
        };

        assert!(Arc::ptr_eq(&resolver.lookup(Some("other.example")), &other));
        assert!(Arc::ptr_eq(&resolver.lookup(Some("OTHER.example")), &other));
        assert!(Arc::ptr_eq(&resolver.lookup(Some("api.wild.example")), &other));
        assert!(Arc::ptr_eq(&resolver.lookup(Some("localhost")), &localhost));
        assert!(Arc::ptr_eq(&resolver.lookup(Some("unknown.example")), &localhost));
        assert!(Arc::ptr_eq(&resolver.lookup(None), &localhost));
    }

    #[test]
    fn alpn_defaults_and_overrides() {
        let material = TlsMaterial::from_pem(CERT_PEM, KEY_PEM).unwrap();
        let config = material.server_config().unwrap();
        assert_eq!(config.alpn_protocols, vec![b"h2".to_vec(), b"http/1.1".to_vec()]);

        let material = material.with_alpn(["http/1.1"]);
        let config = material.server_config().unwrap();
        assert_eq!(config.alpn_protocols, vec![b"http/1.1".to_vec()]);
    }
}
