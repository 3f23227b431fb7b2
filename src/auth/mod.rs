//! Authentication
//!
//! Password gate applied by the responder after the TLS handshake.
//! Passwords are stored as Argon2 PHC strings.

mod protocol;

pub use protocol::{answer, challenge, respond, AuthReply, AuthRequest, Credentials, Verdict, MAX_LINE_LEN};

use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;

use crate::config::Settings;
use crate::error::{Error, Result};

/// Minimum accepted password length
pub const MIN_PASSWORD_LEN: usize = 4;

/// Stored password hash
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PasswordRecord {
    hash: String,
}

impl PasswordRecord {
    /// Hash a new password
    pub fn create(password: &str) -> Result<Self> {
        if password.chars().count() < MIN_PASSWORD_LEN {
            return Err(Error::Password(format!(
                "passwords must be at least {} characters",
                MIN_PASSWORD_LEN
            )));
        }
        let salt = SaltString::generate(&mut rand::rngs::OsRng);
        let hash = Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map_err(|e| Error::Password(e.to_string()))?
            .to_string();
        Ok(Self { hash })
    }

    /// Wrap an existing PHC string, checking that it parses
    pub fn from_hash(hash: impl Into<String>) -> Result<Self> {
        let hash = hash.into();
        PasswordHash::new(&hash).map_err(|e| Error::Password(format!("stored hash is invalid: {}", e)))?;
        Ok(Self { hash })
    }

    pub fn as_str(&self) -> &str {
        &self.hash
    }

    /// Check a submitted password. Malformed hashes never verify.
    pub fn verify(&self, attempt: &str) -> bool {
        match PasswordHash::new(&self.hash) {
            Ok(parsed) => Argon2::default().verify_password(attempt.as_bytes(), &parsed).is_ok(),
            Err(_) => false,
        }
    }
}

/// What the responder demands from a connecting peer
#[derive(Debug, Clone)]
pub enum PasswordGate {
    /// Accept without a password
    Open,
    /// Require a password matching the record
    Required(PasswordRecord),
}

impl PasswordGate {
    /// Build the gate from settings.
    ///
    /// Gating with no stored hash is a configuration error rather than an
    /// open door.
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        if !settings.server.require_password {
            return Ok(PasswordGate::Open);
        }
        if !settings.password_is_set() {
            return Err(Error::Config(
                "require_password is enabled but no password is set; run `diablo password`".into(),
            ));
        }
        Ok(PasswordGate::Required(PasswordRecord::from_hash(
            settings.server.password_hash.trim(),
        )?))
    }

    pub fn is_required(&self) -> bool {
        matches!(self, PasswordGate::Required(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_and_verify() {
        let record = PasswordRecord::create("correct").unwrap();
        assert!(record.as_str().starts_with("$argon2"));
        assert!(record.verify("correct"));
        assert!(!record.verify("wrong"));

        let reloaded = PasswordRecord::from_hash(record.as_str()).unwrap();
        assert!(reloaded.verify("correct"));
    }

    #[test]
    fn test_short_password_rejected() {
        assert!(matches!(PasswordRecord::create("abc"), Err(Error::Password(_))));
    }

    #[test]
    fn test_invalid_hash() {
        assert!(PasswordRecord::from_hash("not-a-hash").is_err());
    }

    #[test]
    fn test_gate_from_settings() {
        let mut settings = Settings::default();
        assert!(!PasswordGate::from_settings(&settings).unwrap().is_required());

        settings.server.require_password = true;
        assert!(matches!(PasswordGate::from_settings(&settings), Err(Error::Config(_))));

        settings.server.password_hash = PasswordRecord::create("hunter22").unwrap().as_str().to_string();
        assert!(PasswordGate::from_settings(&settings).unwrap().is_required());
    }
}
