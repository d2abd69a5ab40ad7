//! Per-tunnel leaf certificates signed by the root CA.
//!
//! Every intercepted CONNECT gets a brand new key pair and certificate. There
//! is no cache: a certificate is owned by exactly one TLS server session and
//! dropped when the tunnel closes.

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use hickory_resolver::TokioResolver;
use hickory_resolver::config::ResolverConfig;
use hickory_resolver::name_server::TokioConnectionProvider;
use rand::RngCore;
use rand::rngs::OsRng;
use rcgen::{
    CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, KeyPair,
    KeyUsagePurpose, PKCS_RSA_SHA256, RsaKeySize, SanType, SerialNumber,
};
use rustls::ServerConfig;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use time::{Duration, OffsetDateTime};
use tracing::debug;

use crate::ca::{CA_COUNTRY, CertificateAuthority, NOT_BEFORE_SKEW};
use crate::error::{Error, Result};

pub const LEAF_ORGANIZATION: &str = "PacketPeek Dynamic Cert";
const LEAF_VALIDITY_DAYS: i64 = 365;

/// Forward name resolution used to attach IP SANs to hostname certificates.
#[async_trait]
pub trait HostResolver: Send + Sync {
    /// Addresses for `host`. Failures are reported as an empty list.
    async fn lookup(&self, host: &str) -> Vec<IpAddr>;
}

/// Resolver backed by the system DNS configuration.
pub struct SystemResolver {
    resolver: TokioResolver,
}

impl SystemResolver {
    pub fn new() -> Self {
        let resolver = match TokioResolver::builder_tokio() {
            Ok(builder) => builder.build(),
            Err(e) => {
                debug!("System resolver config unavailable ({}), using defaults", e);
                TokioResolver::builder_with_config(
                    ResolverConfig::default(),
                    TokioConnectionProvider::default(),
                )
                .build()
            }
        };
        SystemResolver { resolver }
    }
}

impl Default for SystemResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HostResolver for SystemResolver {
    async fn lookup(&self, host: &str) -> Vec<IpAddr> {
        match self.resolver.lookup_ip(host).await {
            Ok(ips) => ips.iter().collect(),
            Err(e) => {
                debug!(host, "DNS lookup failed: {}", e);
                Vec::new()
            }
        }
    }
}

/// A freshly issued end-entity certificate and its private key.
pub struct LeafCertificate {
    pub host: String,
    pub ips: Vec<IpAddr>,
    pub cert_der: CertificateDer<'static>,
    pub key_der: PrivateKeyDer<'static>,
    /// Root certificate, sent as the second element of the chain.
    pub ca_der: CertificateDer<'static>,
}

impl LeafCertificate {
    pub fn cert_chain(&self) -> Vec<CertificateDer<'static>> {
        vec![self.cert_der.clone(), self.ca_der.clone()]
    }

    /// rustls server configuration serving this certificate as its only identity.
    pub fn server_config(&self) -> Result<ServerConfig> {
        let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
        let mut config = ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_single_cert(self.cert_chain(), self.key_der.clone_key())
            .map_err(|e| Error::tls(format!("Failed to create TLS config: {}", e)))?;
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        Ok(config)
    }
}

pub struct LeafIssuer {
    ca: Arc<CertificateAuthority>,
    resolver: Arc<dyn HostResolver>,
}

impl LeafIssuer {
    pub fn new(ca: Arc<CertificateAuthority>, resolver: Arc<dyn HostResolver>) -> Self {
        LeafIssuer { ca, resolver }
    }

    pub fn ca(&self) -> &Arc<CertificateAuthority> {
        &self.ca
    }

    /// Issue a certificate for `authority` (`host` or `host:port`).
    pub async fn issue(&self, authority: &str) -> Result<LeafCertificate> {
        let host = strip_port(authority).to_string();
        if host.is_empty() {
            return Err(Error::invalid_request(format!("No host in {:?}", authority)));
        }

        let ips = match host.parse::<IpAddr>() {
            Ok(ip) => vec![ip],
            Err(_) => self.resolver.lookup(&host).await,
        };

        let ca = self.ca.clone();
        tokio::task::spawn_blocking(move || sign_leaf(&ca, host, ips))
            .await
            .map_err(|e| Error::certificate(format!("Leaf signing task failed: {}", e)))?
    }
}

fn sign_leaf(ca: &CertificateAuthority, host: String, ips: Vec<IpAddr>) -> Result<LeafCertificate> {
    let key_pair = KeyPair::generate_rsa_for(&PKCS_RSA_SHA256, RsaKeySize::_2048)
        .map_err(|e| Error::certificate(format!("Failed to generate leaf key: {}", e)))?;
    let serial = random_serial()?;

    let is_ip = host.parse::<IpAddr>().is_ok();
    let mut params = CertificateParams::default();

    let mut dn = DistinguishedName::new();
    dn.push(DnType::OrganizationName, LEAF_ORGANIZATION);
    dn.push(DnType::CommonName, host.as_str());
    dn.push(DnType::CountryName, CA_COUNTRY);
    params.distinguished_name = dn;
    params.serial_number = Some(serial);

    let now = OffsetDateTime::now_utc();
    params.not_before = now - NOT_BEFORE_SKEW;
    params.not_after = now + Duration::days(LEAF_VALIDITY_DAYS);

    params.key_usages = vec![KeyUsagePurpose::KeyEncipherment, KeyUsagePurpose::DigitalSignature];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

    if !is_ip {
        let dns_name = host
            .as_str()
            .try_into()
            .map_err(|e| Error::certificate(format!("Invalid host name {}: {}", host, e)))?;
        params.subject_alt_names.push(SanType::DnsName(dns_name));
    }
    params
        .subject_alt_names
        .extend(ips.iter().copied().map(SanType::IpAddress));

    let cert = params
        .signed_by(&key_pair, ca.issuer())
        .map_err(|e| Error::certificate(format!("Failed to sign leaf for {}: {}", host, e)))?;

    let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));

    Ok(LeafCertificate {
        host,
        ips,
        cert_der: cert.der().clone(),
        key_der,
        ca_der: ca.cert_der().clone(),
    })
}

/// Positive 128-bit serial from the OS RNG.
fn random_serial() -> Result<SerialNumber> {
    let mut bytes = [0u8; 16];
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|e| Error::certificate(format!("Failed to generate serial number: {}", e)))?;
    bytes[0] &= 0x7f;
    Ok(SerialNumber::from_slice(&bytes))
}

/// `example.com:443` -> `example.com`, `[::1]:443` -> `::1`. Anything without
/// a parseable port is returned unchanged.
pub fn strip_port(authority: &str) -> &str {
    if let Some(rest) = authority.strip_prefix('[') {
        if let Some(end) = rest.find(']') {
            return &rest[..end];
        }
        return authority;
    }
    match authority.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') && port.parse::<u16>().is_ok() => host,
        _ => authority,
    }
}
