//! TLS transport
//!
//! Certificate management and the secure channel between responder and
//! initiator.

mod cert;
mod channel;
mod verifier;

pub use cert::{generate_self_signed, CertificateMaterial, CertificateStore, TlsIdentity};
pub use channel::{Initiator, Responder, SecureStream, PASSWORD_ENTRY_TIMEOUT};
pub use verifier::{Fingerprint, PeerCertVerifier};
