//! Diablo - Point-to-Point Encrypted Tunnel
//!
//! Bridges a virtual network interface on one host to its counterpart on
//! another through a TLS connection, so IP traffic routed into the local
//! interface reappears on the remote one.
//!
//! # Architecture
//!
//! A session has two roles. The responder listens on the tunnel port and
//! accepts exactly one peer; the initiator dials it. After the TLS
//! handshake the responder may demand a password, then both sides relay
//! raw IP packets between their TUN device and the encrypted stream.
//!
//! # Features
//!
//! - TUN devices on Linux and macOS (utun)
//! - Self-signed certificate generated on first start, optional fingerprint pinning
//! - Argon2 password gate after the handshake
//! - Raw or length-prefixed packet framing
//! - Single session per host with stale-record detection, stop and restart

pub mod auth;
pub mod config;
pub mod error;
pub mod forwarder;
pub mod session;
pub mod tls;
pub mod tun;

pub use config::Settings;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::auth::{PasswordGate, PasswordRecord};
    pub use crate::config::Settings;
    pub use crate::error::{Error, Result};
    pub use crate::forwarder::{Framing, PacketForwarder};
    pub use crate::session::{Role, SessionContext, SessionController, SessionRegistry, SessionStatus};
    pub use crate::tls::{CertificateStore, Fingerprint};
    pub use crate::tun::{InterfaceSpec, TunDevice};
}
