//! Root certificate authority: the trust anchor every forged leaf chains to.
//!
//! The root key pair and certificate are persisted as PEM files so that client
//! devices only have to install and trust the CA once. On startup the files
//! are loaded when present and valid, otherwise a fresh CA is generated and
//! written out.

use std::fs::{self, OpenOptions};
use std::io::Write;
#[cfg(unix)]
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, Issuer, KeyPair,
    KeyUsagePurpose, PKCS_RSA_SHA256, RsaKeySize, SerialNumber,
};
use rustls::pki_types::CertificateDer;
use time::{Duration, OffsetDateTime};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

pub const CA_ORGANIZATION: &str = "PacketPeek CA";
pub const CA_COMMON_NAME: &str = "PacketPeek Root CA";
pub const CA_COUNTRY: &str = "IT";

const CA_VALIDITY_DAYS: i64 = 3650;
/// Both the root and the leaves are back-dated by a day to tolerate clock skew.
pub(crate) const NOT_BEFORE_SKEW: Duration = Duration::days(1);

pub struct CertificateAuthority {
    issuer: Issuer<'static, KeyPair>,
    cert_der: CertificateDer<'static>,
    cert_pem: String,
    cert_path: PathBuf,
}

impl CertificateAuthority {
    /// Load the CA from `key_path`/`cert_path`, generating and persisting a new
    /// one if either file is missing or unusable.
    pub fn load_or_generate(key_path: impl AsRef<Path>, cert_path: impl AsRef<Path>) -> Result<Self> {
        let (key_path, cert_path) = (key_path.as_ref(), cert_path.as_ref());
        match Self::load(key_path, cert_path) {
            Ok(ca) => {
                info!(path = %cert_path.display(), "Loaded existing root CA");
                Ok(ca)
            }
            Err(e) => {
                if key_path.exists() || cert_path.exists() {
                    warn!("Existing root CA is unusable ({}), generating a new one", e);
                } else {
                    debug!("No root CA on disk: {}", e);
                }
                let ca = Self::generate(key_path, cert_path)?;
                info!(path = %cert_path.display(), "Generated new root CA");
                Ok(ca)
            }
        }
    }

    /// Read a persisted CA. Nothing is kept if any step fails.
    pub fn load(key_path: &Path, cert_path: &Path) -> Result<Self> {
        let key_pem = fs::read_to_string(key_path)?;
        let key_pair = KeyPair::from_pem(&key_pem)
            .map_err(|e| Error::certificate(format!("Failed to parse CA key: {}", e)))?;
        if key_pair.algorithm() != &PKCS_RSA_SHA256 {
            return Err(Error::certificate("CA key is not an RSA private key"));
        }

        let cert_pem = fs::read_to_string(cert_path)?;
        let cert_der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
            .next()
            .ok_or_else(|| Error::certificate("No certificate found in CA PEM"))?
            .map_err(|e| Error::certificate(format!("Failed to decode CA PEM: {}", e)))?;

        let issuer = Issuer::from_ca_cert_pem(&cert_pem, key_pair)
            .map_err(|e| Error::certificate(format!("Failed to parse CA certificate: {}", e)))?;

        Ok(CertificateAuthority {
            issuer,
            cert_der,
            cert_pem,
            cert_path: cert_path.to_path_buf(),
        })
    }

    /// Create a new 4096-bit RSA root, persist it and adopt it.
    pub fn generate(key_path: &Path, cert_path: &Path) -> Result<Self> {
        let key_pair = KeyPair::generate_rsa_for(&PKCS_RSA_SHA256, RsaKeySize::_4096)
            .map_err(|e| Error::certificate(format!("Failed to generate CA key: {}", e)))?;

        let params = root_params(OffsetDateTime::now_utc());
        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| Error::certificate(format!("Failed to self-sign CA: {}", e)))?;

        let cert_pem = cert.pem();
        fs::write(cert_path, &cert_pem)?;
        write_private_key(key_path, &key_pair.serialize_pem())?;

        Ok(CertificateAuthority {
            cert_der: cert.der().clone(),
            issuer: Issuer::new(params, key_pair),
            cert_pem,
            cert_path: cert_path.to_path_buf(),
        })
    }

    pub(crate) fn issuer(&self) -> &Issuer<'static, KeyPair> {
        &self.issuer
    }

    /// Root certificate exactly as persisted on disk.
    pub fn cert_der(&self) -> &CertificateDer<'static> {
        &self.cert_der
    }

    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    pub fn cert_path(&self) -> &Path {
        &self.cert_path
    }
}

/// Anyone who can read this key can mint trusted certificates: owner-only on unix.
fn write_private_key(path: &Path, pem: &str) -> Result<()> {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o600);
    let mut file = options.open(path)?;
    file.write_all(pem.as_bytes())?;
    // `mode` only applies on creation; tighten a key file that already existed.
    #[cfg(unix)]
    file.set_permissions(fs::Permissions::from_mode(0o600))?;
    Ok(())
}

fn root_params(now: OffsetDateTime) -> CertificateParams {
    let mut params = CertificateParams::default();

    let mut dn = DistinguishedName::new();
    dn.push(DnType::OrganizationName, CA_ORGANIZATION);
    dn.push(DnType::CommonName, CA_COMMON_NAME);
    dn.push(DnType::CountryName, CA_COUNTRY);
    params.distinguished_name = dn;

    params.serial_number = Some(SerialNumber::from(1u64));
    params.not_before = now - NOT_BEFORE_SKEW;
    params.not_after = now + Duration::days(CA_VALIDITY_DAYS);

    // No intermediate CAs below this root.
    params.is_ca = IsCa::Ca(BasicConstraints::Constrained(0));
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::{Arc, OnceLock};
    use x509_parser::parse_x509_certificate;

    /// One generated CA per test binary; RSA-4096 generation is slow.
    pub(crate) fn shared_ca() -> Arc<CertificateAuthority> {
        static CA: OnceLock<(tempfile::TempDir, Arc<CertificateAuthority>)> = OnceLock::new();
        CA.get_or_init(|| {
            let dir = tempfile::tempdir().unwrap();
            let ca = CertificateAuthority::load_or_generate(
                dir.path().join("ca.key"),
                dir.path().join("ca.pem"),
            )
            .unwrap();
            (dir, Arc::new(ca))
        })
        .1
        .clone()
    }

    #[test]
    fn generated_root_has_ca_constraints() {
        let ca = shared_ca();
        let (_, cert) = parse_x509_certificate(ca.cert_der()).unwrap();

        let bc = cert.basic_constraints().unwrap().unwrap().value;
        assert!(bc.ca);
        assert_eq!(bc.path_len_constraint, Some(0));

        let ku = cert.key_usage().unwrap().unwrap().value;
        assert!(ku.key_cert_sign());
        assert!(ku.digital_signature());
        assert!(ku.key_encipherment());

        assert_eq!(cert.raw_serial(), &[1u8]);
        let cn = cert.subject().iter_common_name().next().unwrap().as_str().unwrap();
        assert_eq!(cn, CA_COMMON_NAME);
        assert_eq!(cert.subject().to_string(), cert.issuer().to_string());
    }

    #[test]
    fn generated_root_is_backdated_and_long_lived() {
        let ca = shared_ca();
        let (_, cert) = parse_x509_certificate(ca.cert_der()).unwrap();
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let not_before = cert.validity().not_before.timestamp();
        let not_after = cert.validity().not_after.timestamp();
        assert!(not_before < now - 3600);
        assert!(not_after > now + 9 * 365 * 24 * 3600);
    }

    #[test]
    fn generated_root_uses_rsa_4096() {
        let ca = shared_ca();
        let (_, cert) = parse_x509_certificate(ca.cert_der()).unwrap();
        let spki = cert.public_key();
        match spki.parsed().unwrap() {
            x509_parser::public_key::PublicKey::RSA(rsa) => assert_eq!(rsa.key_size(), 4096),
            other => panic!("unexpected key type: {:?}", other),
        }
    }

    #[test]
    fn reload_keeps_the_same_root() {
        let dir = tempfile::tempdir().unwrap();
        let key_path = dir.path().join("ca.key");
        let cert_path = dir.path().join("ca.pem");

        let first = CertificateAuthority::load_or_generate(&key_path, &cert_path).unwrap();
        let second = CertificateAuthority::load_or_generate(&key_path, &cert_path).unwrap();

        assert_eq!(first.cert_der(), second.cert_der());
        assert_eq!(first.cert_pem(), second.cert_pem());
        assert_eq!(first.issuer().key().serialize_der(), second.issuer().key().serialize_der());
    }

    #[cfg(unix)]
    #[test]
    fn private_key_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let key_path = dir.path().join("ca.key");
        // A stale world-readable key must be tightened when replaced.
        fs::write(&key_path, "not a key").unwrap();
        fs::set_permissions(&key_path, fs::Permissions::from_mode(0o644)).unwrap();

        CertificateAuthority::load_or_generate(&key_path, dir.path().join("ca.pem")).unwrap();
        let mode = fs::metadata(&key_path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn load_fails_when_files_are_missing() {
        let dir = tempfile::tempdir().unwrap();
        let result = CertificateAuthority::load(&dir.path().join("ca.key"), &dir.path().join("ca.pem"));
        assert!(result.is_err());
    }

    #[test]
    fn garbage_files_are_replaced_by_a_new_root() {
        let dir = tempfile::tempdir().unwrap();
        let key_path = dir.path().join("ca.key");
        let cert_path = dir.path().join("ca.pem");
        fs::write(&key_path, "not a key").unwrap();
        fs::write(&cert_path, "not a cert").unwrap();

        assert!(CertificateAuthority::load(&key_path, &cert_path).is_err());
        let ca = CertificateAuthority::load_or_generate(&key_path, &cert_path).unwrap();

        let on_disk = fs::read_to_string(&cert_path).unwrap();
        assert_eq!(on_disk, ca.cert_pem());
        assert!(fs::read_to_string(&key_path).unwrap().contains("PRIVATE KEY"));
    }

    #[test]
    fn non_rsa_key_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let key_path = dir.path().join("ca.key");
        let cert_path = dir.path().join("ca.pem");
        let ca = shared_ca();
        fs::write(&cert_path, ca.cert_pem()).unwrap();
        let ec_key = KeyPair::generate().unwrap();
        fs::write(&key_path, ec_key.serialize_pem()).unwrap();

        match CertificateAuthority::load(&key_path, &cert_path) {
            Err(Error::Certificate(msg)) => assert!(msg.contains("RSA")),
            Err(other) => panic!("unexpected error: {}", other),
            Ok(_) => panic!("EC key accepted as CA key"),
        }
    }
}
