//! Initiator-side certificate policy
//!
//! The responder's certificate is self-signed, so there is no root to
//! validate against. Without a pin any certificate is accepted: traffic is
//! protected from passive eavesdroppers but not from an active
//! man-in-the-middle. With a pin, the leaf certificate's SHA-256 must match.

use std::fmt;
use std::str::FromStr;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, WebPkiSupportedAlgorithms};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use sha2::{Digest, Sha256};

use crate::error::Error;

/// SHA-256 fingerprint of a DER certificate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    pub fn of(der: &[u8]) -> Self {
        Self(Sha256::digest(der).into())
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pairs: Vec<String> = self.0.iter().map(|b| format!("{:02X}", b)).collect();
        write!(f, "{}", pairs.join(":"))
    }
}

impl FromStr for Fingerprint {
    type Err = Error;

    /// Accepts plain hex or colon-separated pairs, any case
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let cleaned: String = s.chars().filter(|c| *c != ':' && !c.is_whitespace()).collect();
        let bytes = hex::decode(&cleaned)
            .map_err(|e| Error::Config(format!("invalid fingerprint '{}': {}", s, e)))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| Error::Config(format!("fingerprint '{}' is not 32 bytes", s)))?;
        Ok(Self(bytes))
    }
}

/// Accepts the responder's self-signed certificate, optionally pinned
#[derive(Debug)]
pub struct PeerCertVerifier {
    pin: Option<Fingerprint>,
    algorithms: WebPkiSupportedAlgorithms,
}

impl PeerCertVerifier {
    pub fn new(pin: Option<Fingerprint>) -> Self {
        Self {
            pin,
            algorithms: rustls::crypto::ring::default_provider().signature_verification_algorithms,
        }
    }
}

impl ServerCertVerifier for PeerCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let presented = Fingerprint::of(end_entity.as_ref());
        match self.pin {
            Some(pin) if pin != presented => {
                tracing::error!("Responder certificate {} does not match pin {}", presented, pin);
                Err(rustls::Error::General("certificate fingerprint mismatch".into()))
            }
            Some(_) => Ok(ServerCertVerified::assertion()),
            None => {
                tracing::warn!(
                    "Accepting unpinned responder certificate {}; use --pin to prevent MITM",
                    presented
                );
                Ok(ServerCertVerified::assertion())
            }
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}
