//! Room Controller configuration.
//!
//! Configuration is loaded from environment variables. Every variable is
//! optional; values that are present must parse.

use crate::media::types::TransportOptions;
use std::collections::HashMap;
use std::env;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Default WebSocket signaling bind address.
pub const DEFAULT_SIGNALING_BIND_ADDRESS: &str = "0.0.0.0:3000";

/// Default health endpoint bind address.
pub const DEFAULT_HEALTH_BIND_ADDRESS: &str = "0.0.0.0:8081";

/// Default number of media engine workers.
pub const DEFAULT_WORKER_COUNT: usize = 2;

/// Default bound on any single engine call, in milliseconds.
pub const DEFAULT_ENGINE_TIMEOUT_MS: u64 = 10_000;

/// Default RC instance ID prefix.
pub const DEFAULT_RC_ID_PREFIX: &str = "rc";

/// Room Controller configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// WebSocket signaling bind address (default: "0.0.0.0:3000").
    pub signaling_bind_address: String,

    /// Health endpoint bind address (default: "0.0.0.0:8081").
    pub health_bind_address: String,

    /// Unique identifier for this RC instance.
    pub rc_id: String,

    /// Media engine workers started at boot (default: 2, at least 1).
    pub worker_count: usize,

    /// Peer capacity per room, 0 = unbounded (default: 0).
    pub max_peers_per_room: usize,

    /// Bound on any single engine call (default: 10s).
    pub engine_timeout: Duration,

    /// IP transports listen on (default: "0.0.0.0").
    pub listen_ip: String,

    /// Public IP advertised in ICE candidates, if behind NAT.
    pub announced_ip: Option<String>,

    pub enable_udp: bool,
    pub enable_tcp: bool,
    pub prefer_udp: bool,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// `InvalidValue` if a present variable does not parse or is out of range.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    ///
    /// # Errors
    ///
    /// `InvalidValue` if a present variable does not parse or is out of range.
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let signaling_bind_address = vars
            .get("RC_SIGNALING_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_SIGNALING_BIND_ADDRESS.to_string());

        let health_bind_address = vars
            .get("RC_HEALTH_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_HEALTH_BIND_ADDRESS.to_string());

        let worker_count = parse_var(vars, "RC_WORKER_COUNT", DEFAULT_WORKER_COUNT)?;
        if worker_count == 0 {
            return Err(ConfigError::InvalidValue(
                "RC_WORKER_COUNT must be at least 1".to_string(),
            ));
        }

        let max_peers_per_room = parse_var(vars, "RC_MAX_PEERS_PER_ROOM", 0)?;

        let engine_timeout_ms = parse_var(vars, "RC_ENGINE_TIMEOUT_MS", DEFAULT_ENGINE_TIMEOUT_MS)?;
        if engine_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "RC_ENGINE_TIMEOUT_MS must be greater than 0".to_string(),
            ));
        }

        let defaults = TransportOptions::default();
        let listen_ip = vars
            .get("RC_LISTEN_IP")
            .cloned()
            .unwrap_or(defaults.listen_ip);
        let announced_ip = vars
            .get("RC_ANNOUNCED_IP")
            .filter(|ip| !ip.is_empty())
            .cloned();
        let enable_udp = parse_var(vars, "RC_ENABLE_UDP", defaults.enable_udp)?;
        let enable_tcp = parse_var(vars, "RC_ENABLE_TCP", defaults.enable_tcp)?;
        let prefer_udp = parse_var(vars, "RC_PREFER_UDP", defaults.prefer_udp)?;

        // Generate RC instance ID
        let rc_id = vars.get("RC_ID").cloned().unwrap_or_else(|| {
            let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string());
            let uuid_suffix = uuid::Uuid::new_v4().to_string();
            let short_suffix = uuid_suffix.get(..8).unwrap_or("00000000");
            format!("{DEFAULT_RC_ID_PREFIX}-{hostname}-{short_suffix}")
        });

        Ok(Config {
            signaling_bind_address,
            health_bind_address,
            rc_id,
            worker_count,
            max_peers_per_room,
            engine_timeout: Duration::from_millis(engine_timeout_ms),
            listen_ip,
            announced_ip,
            enable_udp,
            enable_tcp,
            prefer_udp,
        })
    }

    /// Listen options applied to every transport.
    #[must_use]
    pub fn transport_options(&self) -> TransportOptions {
        TransportOptions {
            listen_ip: self.listen_ip.clone(),
            announced_ip: self.announced_ip.clone(),
            enable_udp: self.enable_udp,
            enable_tcp: self.enable_tcp,
            prefer_udp: self.prefer_udp,
        }
    }
}

fn parse_var<T: FromStr>(
    vars: &HashMap<String, String>,
    name: &str,
    default: T,
) -> Result<T, ConfigError> {
    match vars.get(name) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(format!("{name}={raw}"))),
    }
}
