//! Certificate Store
//!
//! Loads or lazily generates the responder's self-signed certificate and
//! private key. The certificate provides transport encryption only; the
//! initiator does not validate it against any root.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use rcgen::{Certificate, CertificateParams, DistinguishedName, DnType, KeyPair, PKCS_RSA_SHA256};
use rsa::pkcs8::EncodePrivateKey;
use rsa::RsaPrivateKey;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use time::{Duration, OffsetDateTime};

use super::Fingerprint;
use crate::error::{Error, Result};

const RSA_KEY_BITS: usize = 2048;
const VALIDITY_DAYS: i64 = 365;

/// Freshly generated certificate material
#[derive(Debug, Clone)]
pub struct CertificateMaterial {
    pub certificate_pem: String,
    pub private_key_pem: String,
    pub not_before: OffsetDateTime,
    pub not_after: OffsetDateTime,
}

/// Certificate chain and key loaded for rustls
pub struct TlsIdentity {
    pub chain: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
}

impl TlsIdentity {
    /// Fingerprint of the leaf certificate
    pub fn fingerprint(&self) -> Result<Fingerprint> {
        self.chain
            .first()
            .map(|cert| Fingerprint::of(cert.as_ref()))
            .ok_or_else(|| Error::Certificate("certificate chain is empty".into()))
    }
}

/// Certificate and key file pair
#[derive(Debug, Clone)]
pub struct CertificateStore {
    cert_path: PathBuf,
    key_path: PathBuf,
}

impl CertificateStore {
    pub fn new(cert_path: impl Into<PathBuf>, key_path: impl Into<PathBuf>) -> Self {
        Self {
            cert_path: cert_path.into(),
            key_path: key_path.into(),
        }
    }

    pub fn cert_path(&self) -> &Path {
        &self.cert_path
    }

    pub fn key_path(&self) -> &Path {
        &self.key_path
    }

    /// Generate the certificate pair unless both files already exist.
    ///
    /// Returns the generated material, or `None` when existing files were kept.
    pub fn ensure(&self) -> Result<Option<CertificateMaterial>> {
        if self.cert_path.exists() && self.key_path.exists() {
            tracing::info!("Certificate exists at {:?}", self.cert_path);
            return Ok(None);
        }

        tracing::warn!(
            "No certificate found at {:?}; generating a new self-signed key pair",
            self.cert_path
        );
        let material = generate_self_signed()?;

        for path in [&self.cert_path, &self.key_path] {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(&self.key_path, &material.private_key_pem)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.key_path, std::fs::Permissions::from_mode(0o600))?;
        }
        std::fs::write(&self.cert_path, &material.certificate_pem)?;

        tracing::info!("TLS certificate written to {:?}, key to {:?}", self.cert_path, self.key_path);
        Ok(Some(material))
    }

    /// Load the PEM files for use by rustls
    pub fn load(&self) -> Result<TlsIdentity> {
        let mut reader = BufReader::new(File::open(&self.cert_path)?);
        let chain = rustls_pemfile::certs(&mut reader).collect::<std::result::Result<Vec<_>, _>>()?;
        if chain.is_empty() {
            return Err(Error::Certificate(format!("no certificate in {:?}", self.cert_path)));
        }

        let mut reader = BufReader::new(File::open(&self.key_path)?);
        let key = rustls_pemfile::private_key(&mut reader)?
            .ok_or_else(|| Error::Certificate(format!("no private key in {:?}", self.key_path)))?;

        Ok(TlsIdentity { chain, key })
    }
}

/// Build a 2048-bit RSA self-signed certificate valid for `localhost`
pub fn generate_self_signed() -> Result<CertificateMaterial> {
    let private_key = RsaPrivateKey::new(&mut rand::rngs::OsRng, RSA_KEY_BITS)
        .map_err(|e| Error::Certificate(format!("RSA key generation failed: {}", e)))?;
    let der = private_key
        .to_pkcs8_der()
        .map_err(|e| Error::Certificate(format!("PKCS#8 encoding failed: {}", e)))?;
    let key_pair = KeyPair::from_der_and_sign_algo(der.as_bytes(), &PKCS_RSA_SHA256)
        .map_err(|e| Error::Certificate(e.to_string()))?;

    let now = OffsetDateTime::now_utc();
    let not_before = now - Duration::days(1);
    let not_after = now + Duration::days(VALIDITY_DAYS);

    let mut subject = DistinguishedName::new();
    subject.push(DnType::OrganizationName, "Diablo Tunnel");
    subject.push(DnType::CommonName, "diablo.local");

    let mut params = CertificateParams::new(vec!["localhost".to_string()]);
    params.alg = &PKCS_RSA_SHA256;
    params.key_pair = Some(key_pair);
    params.distinguished_name = subject;
    params.not_before = not_before;
    params.not_after = not_after;

    let cert = Certificate::from_params(params).map_err(|e| Error::Certificate(e.to_string()))?;
    let certificate_pem = cert.serialize_pem().map_err(|e| Error::Certificate(e.to_string()))?;
    let private_key_pem = cert.serialize_private_key_pem();

    Ok(CertificateMaterial {
        certificate_pem,
        private_key_pem,
        not_before,
        not_after,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_ensure_generates_then_keeps() {
        let dir = tempdir().unwrap();
        let store = CertificateStore::new(
            dir.path().join("certs").join("cert.pem"),
            dir.path().join("certs").join("key.pem"),
        );

        let material = store.ensure().unwrap().expect("first call generates");
        assert!(material.certificate_pem.starts_with("-----BEGIN CERTIFICATE-----"));
        assert!(material.private_key_pem.contains("PRIVATE KEY"));
        assert_eq!((material.not_after - material.not_before).whole_days(), VALIDITY_DAYS + 1);

        let first = std::fs::read(store.cert_path()).unwrap();
        assert!(store.ensure().unwrap().is_none());
        assert_eq!(std::fs::read(store.cert_path()).unwrap(), first);

        let identity = store.load().unwrap();
        assert_eq!(identity.chain.len(), 1);
        assert!(matches!(identity.key, PrivateKeyDer::Pkcs8(_)));
    }

    #[test]
    fn test_regenerates_when_key_missing() {
        let dir = tempdir().unwrap();
        let store = CertificateStore::new(dir.path().join("cert.pem"), dir.path().join("key.pem"));
        std::fs::write(store.cert_path(), "stale").unwrap();

        assert!(store.ensure().unwrap().is_some());
        assert!(store.load().is_ok());
    }

    #[test]
    fn test_load_missing_files() {
        let dir = tempdir().unwrap();
        let store = CertificateStore::new(dir.path().join("cert.pem"), dir.path().join("key.pem"));
        assert!(matches!(store.load(), Err(Error::Io(_))));
    }
}
