//! Session Status
//!
//! The single per-host record describing the running tunnel session.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Tunnel role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Listens for and accepts the peer
    Responder,
    /// Dials the peer
    Initiator,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Responder => write!(f, "responder"),
            Role::Initiator => write!(f, "initiator"),
        }
    }
}

/// Persisted session record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionStatus {
    pub role: Role,
    pub process_id: u32,
    pub host_address: String,
    #[serde(default)]
    pub peer_count: u32,
    #[serde(default)]
    pub password_required: bool,
    pub started_at: DateTime<Utc>,
    /// Address dialled by an initiator, or the accepted peer of a responder
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface: Option<String>,
}

impl SessionStatus {
    /// Create a record for a session owned by `process_id`
    pub fn new(role: Role, process_id: u32, host_address: impl Into<String>) -> Self {
        Self {
            role,
            process_id,
            host_address: host_address.into(),
            peer_count: 0,
            password_required: false,
            started_at: Utc::now(),
            peer_address: None,
            interface: None,
        }
    }

    /// Time since the session started
    pub fn uptime(&self) -> chrono::Duration {
        Utc::now().signed_duration_since(self.started_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_wire_names() {
        assert_eq!(serde_json::to_string(&Role::Responder).unwrap(), "\"responder\"");
        assert_eq!(serde_json::to_string(&Role::Initiator).unwrap(), "\"initiator\"");
    }

    #[test]
    fn test_record_without_optional_fields() {
        let json = r#"{
            "role": "initiator",
            "process_id": 4242,
            "host_address": "192.168.1.20",
            "started_at": "2026-01-01T00:00:00Z"
        }"#;
        let status: SessionStatus = serde_json::from_str(json).unwrap();
        assert_eq!(status.role, Role::Initiator);
        assert_eq!(status.peer_count, 0);
        assert!(!status.password_required);
        assert!(status.peer_address.is_none());
    }
}
