//! Admission policy: who may connect and how long an idle session lives.

use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::error::TetherError;

/// Default cap on concurrent sessions.
pub const DEFAULT_MAX_CONNECTIONS: usize = 500;

/// Smallest permitted non-zero inactivity timeout, in seconds.
pub const MIN_IDLE_TIMEOUT_SECS: u64 = 5;

/// Per-server admission rules.
///
/// A non-empty whitelist admits only listed peers (the blacklist is
/// ignored); otherwise a non-empty blacklist rejects listed peers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicySet {
    /// Ordered allow-list of peer addresses.
    pub allow: Vec<IpAddr>,
    /// Ordered deny-list of peer addresses.
    pub deny: Vec<IpAddr>,
    /// Maximum concurrent sessions.
    pub max_connections: usize,
    /// Per-session inactivity timeout in seconds; zero means infinite.
    pub idle_timeout_secs: u64,
}

impl Default for PolicySet {
    fn default() -> Self {
        Self {
            allow: Vec::new(),
            deny: Vec::new(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            idle_timeout_secs: 0,
        }
    }
}

impl PolicySet {
    /// Validate bounds. Called before the listener starts; mutation
    /// after that point is not supported.
    pub fn validate(&self) -> Result<(), TetherError> {
        if self.max_connections == 0 {
            return Err(TetherError::Config(
                "max_connections must be at least 1".into(),
            ));
        }
        if self.idle_timeout_secs != 0 && self.idle_timeout_secs < MIN_IDLE_TIMEOUT_SECS {
            return Err(TetherError::Config(format!(
                "idle_timeout_secs must be 0 (infinite) or at least {MIN_IDLE_TIMEOUT_SECS}"
            )));
        }
        Ok(())
    }

    /// Whether a peer at `addr` passes the whitelist/blacklist check.
    pub fn is_connection_allowed(&self, addr: &IpAddr) -> bool {
        if !self.allow.is_empty() {
            return self.allow.contains(addr);
        }
        !self.deny.contains(addr)
    }

    /// The inactivity timeout as a duration, `None` when infinite.
    pub fn idle_timeout(&self) -> Option<std::time::Duration> {
        match self.idle_timeout_secs {
            0 => None,
            secs => Some(std::time::Duration::from_secs(secs)),
        }
    }
}
