//! Endpoint configuration and per-send options.
//!
//! Configs are serde-derived and TOML-loadable, falling back to
//! defaults with a warning when the file is missing or invalid.
//! Validation runs when the endpoint starts and reports
//! [`TetherError::Config`] synchronously.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::TetherError;
use crate::frame::{
    CompressionAlgo, EncryptionAlgo, Frame, MessageType, EXTRA_CALLBACK_KEY, EXTRA_TYPE_KEY,
};
use crate::metadata::KvMap;
use crate::policy::PolicySet;

/// Default identification grace period, seconds.
pub const DEFAULT_IDENTIFICATION_TIMEOUT_SECS: u64 = 10;

/// Default client reconnect delay, seconds.
pub const DEFAULT_RECONNECT_SECS: u64 = 5;

/// Interval between client keepalive probes, seconds.
pub const KEEPALIVE_INTERVAL_SECS: u64 = 15;

// ── ServerConfig ─────────────────────────────────────────────────

/// Configuration for a listening endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// IP to bind. Empty or `*` binds every interface.
    pub host: String,
    /// Port to bind.
    pub port: u16,
    /// Admission rules.
    pub policy: PolicySet,
    /// Grace period for the peer's Auth frame, seconds.
    pub identification_timeout_secs: u64,
    /// Cap on the on-wire body of one frame.
    pub max_frame_bytes: usize,
    /// Bound on the per-session send queue; `None` is unbounded.
    pub max_queue_depth: Option<usize>,
    /// Passphrase for frame encryption. Without it, encrypted sends
    /// are downgraded with a warning.
    pub passphrase: Option<String>,
    /// TLS settings; `None` runs plain TCP.
    pub tls: Option<TlsServerConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 0,
            policy: PolicySet::default(),
            identification_timeout_secs: DEFAULT_IDENTIFICATION_TIMEOUT_SECS,
            max_frame_bytes: crate::codec::DEFAULT_MAX_FRAME_BYTES,
            max_queue_depth: None,
            passphrase: None,
            tls: None,
        }
    }
}

impl ServerConfig {
    /// Load from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        load_toml(path)
    }

    /// Validate and resolve the bind address.
    pub fn bind_addr(&self) -> Result<std::net::SocketAddr, TetherError> {
        let host: std::net::IpAddr = match self.host.as_str() {
            "" | "*" => std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED),
            other => other
                .parse()
                .map_err(|_| TetherError::Config(format!("invalid bind address '{other}'")))?,
        };
        Ok(std::net::SocketAddr::new(host, self.port))
    }

    pub fn validate(&self) -> Result<(), TetherError> {
        self.bind_addr()?;
        self.policy.validate()?;
        if self.identification_timeout_secs == 0 {
            return Err(TetherError::Config(
                "identification_timeout_secs must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

/// TLS settings for the listening side. Set `client_ca_path` to
/// require and verify client certificates.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsServerConfig {
    pub cert_path: String,
    pub key_path: String,
    pub client_ca_path: Option<String>,
}

// ── ClientConfig ─────────────────────────────────────────────────

/// Configuration for a connecting endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Server hostname or IP.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// Delay between reconnect attempts, seconds. Values below 1 are
    /// treated as 1.
    pub reconnect_secs: u64,
    /// Human-readable client name sent at identification.
    pub name: String,
    /// Stable client GUID; generated at connect time when empty.
    pub guid: String,
    /// Informational user-domain string.
    pub user_domain: String,
    /// Informational OS string.
    pub os_version: String,
    /// Cap on the on-wire body of one frame.
    pub max_frame_bytes: usize,
    /// Bound on the send queue; `None` is unbounded.
    pub max_queue_depth: Option<usize>,
    /// Passphrase for frame encryption.
    pub passphrase: Option<String>,
    /// TLS settings; `None` runs plain TCP.
    pub tls: Option<TlsClientConfig>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            reconnect_secs: DEFAULT_RECONNECT_SECS,
            name: "tether-client".into(),
            guid: String::new(),
            user_domain: "WORKGROUP".into(),
            os_version: std::env::consts::OS.into(),
            max_frame_bytes: crate::codec::DEFAULT_MAX_FRAME_BYTES,
            max_queue_depth: None,
            passphrase: None,
            tls: None,
        }
    }
}

impl ClientConfig {
    /// Load from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        load_toml(path)
    }

    pub fn validate(&self) -> Result<(), TetherError> {
        if self.host.is_empty() {
            return Err(TetherError::Config("host must not be empty".into()));
        }
        // every identity field lands in the pipe-delimited auth
        // payload, so none of them may carry the separator
        for (field, value) in [
            ("name", &self.name),
            ("guid", &self.guid),
            ("user_domain", &self.user_domain),
            ("os_version", &self.os_version),
        ] {
            if value.contains('|') {
                return Err(TetherError::Config(format!(
                    "{field} must not contain '|'"
                )));
            }
        }
        Ok(())
    }

    /// Effective reconnect delay, clamped to the 1 s minimum.
    pub fn reconnect_delay(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.reconnect_secs.max(1))
    }
}

/// TLS settings for the connecting side.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsClientConfig {
    /// Server name presented for SNI and certificate validation;
    /// defaults to the connect host.
    pub server_name: Option<String>,
    /// Root CA bundle used to validate the server certificate.
    pub ca_path: Option<String>,
    /// Client certificate and key for mutual TLS.
    pub cert_path: Option<String>,
    pub key_path: Option<String>,
    /// Skip certificate validation entirely.
    pub accept_invalid_certs: bool,
}

fn load_toml<T: serde::de::DeserializeOwned + Default>(path: &Path) -> T {
    match std::fs::read_to_string(path) {
        Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
            tracing::warn!("invalid config {}: {e}; using defaults", path.display());
            T::default()
        }),
        Err(_) => {
            tracing::info!("no config at {}; using defaults", path.display());
            T::default()
        }
    }
}

// ── SendOptions ──────────────────────────────────────────────────

/// Per-send options: one struct in place of an overload per
/// combination.
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// Opaque map surfaced verbatim to the peer handler.
    pub metadata: KvMap,
    /// Routes the inbound event to a named handler instead of the
    /// default event.
    pub dynamic_callback_key: Option<String>,
    pub compression: CompressionAlgo,
    pub encryption: EncryptionAlgo,
}

impl SendOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key, value);
        self
    }

    pub fn with_callback_key(mut self, key: impl Into<String>) -> Self {
        self.dynamic_callback_key = Some(key.into());
        self
    }

    pub fn with_compression(mut self, algo: CompressionAlgo) -> Self {
        self.compression = algo;
        self
    }

    pub fn with_encryption(mut self, algo: EncryptionAlgo) -> Self {
        self.encryption = algo;
        self
    }

    /// Build the outbound frame for a payload of the given kind.
    pub(crate) fn into_frame(self, msg_type: MessageType, payload: Vec<u8>) -> Frame {
        let mut extra = KvMap::new();
        if let Some(key) = self.dynamic_callback_key {
            extra.insert(EXTRA_CALLBACK_KEY, key);
        }
        Frame::new(
            msg_type,
            payload,
            self.metadata,
            extra,
            self.compression,
            self.encryption,
        )
    }

    /// Build an object frame carrying its type descriptor.
    pub(crate) fn into_object_frame(self, payload: Vec<u8>, type_name: &str) -> Frame {
        let mut extra = KvMap::new();
        extra.insert(EXTRA_TYPE_KEY, type_name);
        if let Some(key) = self.dynamic_callback_key {
            extra.insert(EXTRA_CALLBACK_KEY, key);
        }
        Frame::new(
            MessageType::Object,
            payload,
            self.metadata,
            extra,
            self.compression,
            self.encryption,
        )
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_server_config_serializes() {
        let cfg = ServerConfig::default();
        let text = toml::to_string_pretty(&cfg).unwrap();
        assert!(text.contains("identification_timeout_secs"));
        let parsed: ServerConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.policy.max_connections, 500);
    }

    #[test]
    fn bind_addr_resolves_any() {
        for host in ["", "*"] {
            let cfg = ServerConfig {
                host: host.into(),
                port: 9000,
                ..Default::default()
            };
            assert_eq!(cfg.bind_addr().unwrap().to_string(), "0.0.0.0:9000");
        }
    }

    #[test]
    fn bad_bind_addr_rejected() {
        let cfg = ServerConfig {
            host: "not an ip".into(),
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(TetherError::Config(_))));
    }

    #[test]
    fn reconnect_delay_clamped() {
        let cfg = ClientConfig {
            reconnect_secs: 0,
            ..Default::default()
        };
        assert_eq!(cfg.reconnect_delay(), std::time::Duration::from_secs(1));
    }

    #[test]
    fn pipe_in_identity_rejected() {
        let cfg = ClientConfig {
            name: "al|ice".into(),
            ..Default::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = ClientConfig {
            user_domain: "WORK|GROUP".into(),
            ..Default::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = ClientConfig {
            os_version: "linux|6.1".into(),
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn send_options_build_frame() {
        let frame = SendOptions::new()
            .with_metadata("room", "lobby")
            .with_callback_key("K")
            .with_compression(CompressionAlgo::Gzip)
            .into_frame(MessageType::Message, b"hi".to_vec());

        assert_eq!(frame.msg_type(), MessageType::Message);
        assert_eq!(frame.metadata().get("room"), Some("lobby"));
        assert_eq!(frame.extra().get(EXTRA_CALLBACK_KEY), Some("K"));
        assert_eq!(frame.compression(), CompressionAlgo::Gzip);
    }

    #[test]
    fn object_frame_carries_type_tag() {
        let frame = SendOptions::new().into_object_frame(vec![1, 2, 3], "chat.Post");
        assert_eq!(frame.extra().get(EXTRA_TYPE_KEY), Some("chat.Post"));
    }
}
