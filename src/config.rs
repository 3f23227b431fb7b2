//! Diablo Configuration
//!
//! Settings the tunnel core reads at session start. The file is plain
//! TOML; everything except the password hash is treated as immutable
//! input for the lifetime of a session.

use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::forwarder::{Framing, MAX_PACKET_SIZE};
use crate::tls::Fingerprint;

/// Main Diablo configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Responder settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Virtual interface settings
    #[serde(default)]
    pub interface: InterfaceConfig,

    /// Certificate settings
    #[serde(default)]
    pub tls: TlsConfig,

    /// Wire framing
    #[serde(default)]
    pub transport: TransportConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// State file locations
    #[serde(default)]
    pub paths: PathsConfig,
}

/// Responder configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Require connecting peers to present the server password
    #[serde(default)]
    pub require_password: bool,

    /// Argon2 hash of the server password (empty when unset)
    #[serde(default)]
    pub password_hash: String,

    /// Address the tunnel listener binds to
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Tunnel port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Upper bound on the TLS handshake and each authentication message, in seconds
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,

    /// How long the responder waits for a peer to enter its password, in seconds
    #[serde(default = "default_password_timeout")]
    pub password_timeout_secs: u64,
}

/// Virtual interface configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterfaceConfig {
    /// Preferred device name (Linux only; macOS assigns utunN)
    #[serde(default = "default_interface_name")]
    pub name: String,

    /// Tunnel address of the responder
    #[serde(default = "default_server_address")]
    pub server_address: String,

    /// Tunnel address of the initiator
    #[serde(default = "default_client_address")]
    pub client_address: String,

    /// Netmask applied on both ends
    #[serde(default = "default_netmask")]
    pub netmask: String,

    /// Device MTU
    #[serde(default = "default_mtu")]
    pub mtu: u16,
}

/// Certificate configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    #[serde(default = "default_cert_path")]
    pub cert_path: PathBuf,

    #[serde(default = "default_key_path")]
    pub key_path: PathBuf,

    /// SHA-256 fingerprint the initiator expects from the responder
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pinned_fingerprint: Option<String>,
}

/// Transport configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransportConfig {
    #[serde(default)]
    pub framing: Framing,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

/// State file locations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    #[serde(default = "default_status_file")]
    pub status_file: PathBuf,
}

// Default value functions
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    4433
}

fn default_handshake_timeout() -> u64 {
    30
}

fn default_password_timeout() -> u64 {
    120
}

fn default_interface_name() -> String {
    "tun0".to_string()
}

fn default_server_address() -> String {
    "10.8.0.1".to_string()
}

fn default_client_address() -> String {
    "10.8.0.2".to_string()
}

fn default_netmask() -> String {
    "255.255.255.0".to_string()
}

fn default_mtu() -> u16 {
    1500
}

fn default_cert_path() -> PathBuf {
    PathBuf::from("certs/cert.pem")
}

fn default_key_path() -> PathBuf {
    PathBuf::from("certs/key.pem")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_status_file() -> PathBuf {
    state_dir().join("status.json")
}

fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/tmp"))
}

fn xdg_dir(var: &str, fallback: &str) -> PathBuf {
    match std::env::var_os(var) {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => home_dir().join(fallback),
    }
}

/// Per-user configuration directory
pub fn config_dir() -> PathBuf {
    xdg_dir("XDG_CONFIG_HOME", ".config").join("diablo")
}

/// Per-user state directory
pub fn state_dir() -> PathBuf {
    xdg_dir("XDG_STATE_HOME", ".local/share").join("diablo")
}

/// Default settings file location
pub fn default_config_path() -> PathBuf {
    config_dir().join("config.toml")
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            require_password: false,
            password_hash: String::new(),
            bind_address: default_bind_address(),
            port: default_port(),
            handshake_timeout_secs: default_handshake_timeout(),
            password_timeout_secs: default_password_timeout(),
        }
    }
}

impl Default for InterfaceConfig {
    fn default() -> Self {
        Self {
            name: default_interface_name(),
            server_address: default_server_address(),
            client_address: default_client_address(),
            netmask: default_netmask(),
            mtu: default_mtu(),
        }
    }
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            cert_path: default_cert_path(),
            key_path: default_key_path(),
            pinned_fingerprint: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            status_file: default_status_file(),
        }
    }
}

impl Settings {
    /// Load settings from a TOML file, falling back to defaults if it does not exist
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!("No settings at {:?}, using defaults", path);
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load settings from a TOML string
    pub fn from_str(content: &str) -> Result<Self> {
        let settings: Settings = toml::from_str(content)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Save settings to a TOML file
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(Error::Config("server.port cannot be 0".into()));
        }
        if self.server.handshake_timeout_secs == 0 || self.server.password_timeout_secs == 0 {
            return Err(Error::Config("server timeouts must be at least 1 second".into()));
        }
        self.listen_address()?;
        self.server_address()?;
        self.client_address()?;
        let netmask = self.netmask()?;
        if !is_contiguous_mask(netmask) {
            return Err(Error::Config(format!("interface.netmask {} is not contiguous", netmask)));
        }
        if usize::from(self.interface.mtu) > MAX_PACKET_SIZE {
            return Err(Error::Config(format!(
                "interface.mtu {} exceeds the {} byte packet limit",
                self.interface.mtu, MAX_PACKET_SIZE
            )));
        }
        if self.interface.name.is_empty() || self.interface.name.len() > 15 {
            return Err(Error::Config("interface.name must be 1-15 characters".into()));
        }
        self.pinned_fingerprint()?;
        Ok(())
    }

    /// Socket address the responder listens on
    pub fn listen_address(&self) -> Result<SocketAddr> {
        let ip = self.server.bind_address.parse().map_err(|_| {
            Error::Config(format!("server.bind_address '{}' is not an IP address", self.server.bind_address))
        })?;
        Ok(SocketAddr::new(ip, self.server.port))
    }

    pub fn server_address(&self) -> Result<Ipv4Addr> {
        parse_ipv4("interface.server_address", &self.interface.server_address)
    }

    pub fn client_address(&self) -> Result<Ipv4Addr> {
        parse_ipv4("interface.client_address", &self.interface.client_address)
    }

    pub fn netmask(&self) -> Result<Ipv4Addr> {
        parse_ipv4("interface.netmask", &self.interface.netmask)
    }

    /// Parsed certificate pin, if configured
    pub fn pinned_fingerprint(&self) -> Result<Option<Fingerprint>> {
        self.tls
            .pinned_fingerprint
            .as_deref()
            .map(|s| s.parse::<Fingerprint>())
            .transpose()
    }

    /// Whether a password hash has been stored
    pub fn password_is_set(&self) -> bool {
        !self.server.password_hash.trim().is_empty()
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.server.handshake_timeout_secs)
    }

    pub fn password_timeout(&self) -> Duration {
        Duration::from_secs(self.server.password_timeout_secs)
    }
}

fn parse_ipv4(field: &str, value: &str) -> Result<Ipv4Addr> {
    value
        .parse()
        .map_err(|_| Error::Config(format!("{} '{}' is not an IPv4 address", field, value)))
}

fn is_contiguous_mask(mask: Ipv4Addr) -> bool {
    let bits = u32::from(mask);
    bits.leading_ones() + bits.trailing_zeros() == 32
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_parse_settings() {
        let toml = r#"
[server]
require_password = true
port = 5544

[interface]
name = "diablo0"
netmask = "255.255.0.0"

[transport]
framing = "length-prefixed"
"#;

        let settings = Settings::from_str(toml).unwrap();
        assert!(settings.server.require_password);
        assert_eq!(settings.listen_address().unwrap().port(), 5544);
        assert_eq!(settings.interface.name, "diablo0");
        assert_eq!(settings.server_address().unwrap(), Ipv4Addr::new(10, 8, 0, 1));
        assert_eq!(settings.transport.framing, Framing::LengthPrefixed);
    }

    #[test]
    fn test_defaults() {
        let settings = Settings::from_str("").unwrap();
        assert!(!settings.server.require_password);
        assert!(!settings.password_is_set());
        assert_eq!(settings.server.port, 4433);
        assert_eq!(settings.interface.name, "tun0");
        assert_eq!(settings.transport.framing, Framing::Raw);
        assert_eq!(settings.tls.cert_path, PathBuf::from("certs/cert.pem"));
        assert_eq!(settings.handshake_timeout(), Duration::from_secs(30));
        assert_eq!(settings.password_timeout(), Duration::from_secs(120));
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(Settings::from_str("[interface]\nmtu = 9000\n").is_err());
        assert!(Settings::from_str("[interface]\nnetmask = \"255.0.255.0\"\n").is_err());
        assert!(Settings::from_str("[server]\nbind_address = \"nowhere\"\n").is_err());
        assert!(Settings::from_str("[tls]\npinned_fingerprint = \"abc\"\n").is_err());
        assert!(Settings::from_str("[server]\npassword_timeout_secs = 0\n").is_err());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut settings = Settings::default();
        settings.server.password_hash = "$argon2id$v=19$stub".into();
        settings.save(&path).unwrap();

        let loaded = Settings::load(&path).unwrap();
        assert_eq!(loaded.server.password_hash, settings.server.password_hash);
        assert!(loaded.password_is_set());
    }

    #[test]
    fn test_missing_file_is_default() {
        let dir = tempdir().unwrap();
        let settings = Settings::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(settings.server.port, 4433);
    }
}
