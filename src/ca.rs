//! Certificate authority and per-host leaf forgery for MITM tunnels
//!
//! Loads a root CA from disk (or generates and persists one on first run)
//! and forges leaf certificates for intercepted hosts, signed by that CA.
//! Clients that install the root certificate in their trust store will
//! accept the forged identities.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use rand::Rng;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose, SanType,
};
use time::{Duration, OffsetDateTime};
use tokio::fs;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio_rustls::rustls::ServerConfig;
use tracing::{debug, info};

use crate::error::{Result, SpyglassError};

/// Leaf certificate validity period in seconds (1 year)
const LEAF_TTL_SECS: i64 = 365 * 24 * 60 * 60;
/// Root CA validity period in days (10 years)
const CA_TTL_DAYS: i64 = 3650;
/// Offset for not_before timestamps to tolerate client clock skew (60 seconds)
const NOT_BEFORE_OFFSET: i64 = 60;

const CA_CERT_FILE: &str = "ca_cert.pem";
const CA_KEY_FILE: &str = "ca_key.pem";

/// Certificate authority that forges per-host server identities.
///
/// Forged `ServerConfig`s are cached per host: the leaf is generated once
/// per process per host and reused by every subsequent tunnel.
pub struct CertificateAuthority {
    ca_cert: Certificate,
    ca_key: KeyPair,
    /// Root certificate exactly as persisted on disk, presented in chains
    ca_cert_der: CertificateDer<'static>,
    cert_path: PathBuf,
    configs: DashMap<String, Arc<ServerConfig>>,
}

impl std::fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("cert_path", &self.cert_path)
            .field("cached_configs", &self.configs.len())
            .finish_non_exhaustive()
    }
}

impl CertificateAuthority {
    /// Load the CA from `dir`, generating and persisting a fresh one if the
    /// PEM files are not present.
    pub async fn load_or_generate(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        if !dir.exists() {
            fs::create_dir_all(&dir).await?;
        }

        let cert_path = dir.join(CA_CERT_FILE);
        let key_path = dir.join(CA_KEY_FILE);

        let (ca_cert, ca_key, ca_cert_der) = if cert_path.exists() && key_path.exists() {
            Self::load(&cert_path, &key_path).await?
        } else {
            Self::generate(&cert_path, &key_path).await?
        };

        Ok(Self {
            ca_cert,
            ca_key,
            ca_cert_der,
            cert_path,
            configs: DashMap::new(),
        })
    }

    async fn load(
        cert_path: &Path,
        key_path: &Path,
    ) -> Result<(Certificate, KeyPair, CertificateDer<'static>)> {
        let cert_pem = fs::read_to_string(cert_path).await?;
        let key_pem = fs::read_to_string(key_path).await?;

        let ca_key = KeyPair::from_pem(&key_pem)
            .map_err(|e| SpyglassError::Certificate(format!("failed to parse CA key: {}", e)))?;

        let params = CertificateParams::from_ca_cert_pem(&cert_pem)
            .map_err(|e| SpyglassError::Certificate(format!("failed to parse CA cert: {}", e)))?;
        let ca_cert = params.self_signed(&ca_key)?;

        // Chains must carry the certificate clients actually installed, so
        // take the DER from the on-disk PEM rather than the re-signed copy.
        let ca_cert_der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
            .next()
            .ok_or_else(|| {
                SpyglassError::Certificate("no certificate found in CA PEM".to_string())
            })?
            .map_err(|e| SpyglassError::Certificate(format!("invalid CA PEM: {}", e)))?;

        info!(path = %cert_path.display(), "loaded existing root CA");
        Ok((ca_cert, ca_key, ca_cert_der))
    }

    async fn generate(
        cert_path: &Path,
        key_path: &Path,
    ) -> Result<(Certificate, KeyPair, CertificateDer<'static>)> {
        let mut params = CertificateParams::default();

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "Spyglass Proxy CA");
        dn.push(DnType::OrganizationName, "Spyglass");
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];

        let now = OffsetDateTime::now_utc();
        params.not_before = now;
        params.not_after = now + Duration::days(CA_TTL_DAYS);

        let ca_key = KeyPair::generate()?;
        let ca_cert = params.self_signed(&ca_key)?;

        fs::write(cert_path, ca_cert.pem()).await?;
        fs::write(key_path, ca_key.serialize_pem()).await?;

        let ca_cert_der = ca_cert.der().clone();

        info!(path = %cert_path.display(), "generated new root CA");
        Ok((ca_cert, ca_key, ca_cert_der))
    }

    /// Build (or fetch from cache) a client-facing TLS server configuration
    /// presenting a forged identity for `host`.
    pub fn server_config(&self, host: &str) -> Result<Arc<ServerConfig>> {
        if let Some(config) = self.configs.get(host) {
            debug!(host = %host, "reusing forged certificate");
            return Ok(config.clone());
        }

        let (leaf_der, leaf_key) = self.forge_leaf(host)?;

        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![leaf_der, self.ca_cert_der.clone()], leaf_key)
            .map_err(|e| SpyglassError::Certificate(format!("invalid forged identity: {}", e)))?;
        config.alpn_protocols = vec![b"http/1.1".to_vec()];

        let config = Arc::new(config);
        self.configs.insert(host.to_string(), config.clone());
        debug!(host = %host, "forged new leaf certificate");
        Ok(config)
    }

    /// Forge a leaf certificate for `host`, signed by the root CA.
    fn forge_leaf(&self, host: &str) -> Result<(CertificateDer<'static>, PrivateKeyDer<'static>)> {
        let mut params = CertificateParams::default();

        params.serial_number = Some(rand::thread_rng().gen::<u64>().into());

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, host);
        params.distinguished_name = dn;
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        // IP literals need an iPAddress SAN; everything else a dNSName SAN.
        let bare = host.trim_start_matches('[').trim_end_matches(']');
        params.subject_alt_names = if let Ok(ip) = bare.parse::<IpAddr>() {
            vec![SanType::IpAddress(ip)]
        } else {
            vec![SanType::DnsName(host.try_into().map_err(|_| {
                SpyglassError::Certificate(format!("invalid hostname: {}", host))
            })?)]
        };

        let now = OffsetDateTime::now_utc();
        params.not_before = now - Duration::seconds(NOT_BEFORE_OFFSET);
        params.not_after = now + Duration::seconds(LEAF_TTL_SECS);

        let leaf_key = KeyPair::generate()?;
        let leaf_cert = params.signed_by(&leaf_key, &self.ca_cert, &self.ca_key)?;

        let leaf_der = leaf_cert.der().clone();
        let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(leaf_key.serialize_der()));

        Ok((leaf_der, key_der))
    }

    /// The root certificate in DER form, for installation into trust stores.
    pub fn ca_certificate(&self) -> CertificateDer<'static> {
        self.ca_cert_der.clone()
    }

    /// Path of the persisted root certificate PEM.
    pub fn ca_cert_path(&self) -> &Path {
        &self.cert_path
    }
}
