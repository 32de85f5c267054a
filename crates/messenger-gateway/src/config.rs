//! Gateway configuration, loaded from environment variables.
//!
//! All settings have defaults suitable for local development. The store
//! DSN is a secret and is redacted from `Debug` output.

use common::secret::{ExposeSecret, SecretString};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use crate::errors::GatewayError;

const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:8080";
const DEFAULT_HEALTH_BIND_ADDRESS: &str = "0.0.0.0:8081";
const DEFAULT_TYPING_TTL_SECONDS: u64 = 10;
const DEFAULT_TYPING_SWEEP_SECONDS: u64 = 2;
const DEFAULT_PERSISTENCE_TIMEOUT_MS: u64 = 3_000;
const DEFAULT_SEND_BUFFER: u64 = 64;

/// Gateway configuration.
pub struct GatewayConfig {
    /// Socket address the WebSocket gateway listens on.
    pub bind_address: SocketAddr,
    /// Socket address the health/metrics endpoints listen on.
    pub health_bind_address: SocketAddr,
    /// Instance identifier used in logs.
    pub instance_id: String,
    /// Connection string for the message store, if an external store is
    /// configured. Absent means the in-process store is used.
    pub store_dsn: Option<SecretString>,
    /// How long a typing indicator stays live without refresh.
    pub typing_ttl: Duration,
    /// How often expired typing indicators are swept.
    pub typing_sweep_interval: Duration,
    /// Upper bound on any single store call made from a room.
    pub persistence_timeout: Duration,
    /// Outbound frame buffer per connection. A connection that falls this
    /// far behind is disconnected rather than back-pressuring rooms.
    pub send_buffer: usize,
}

impl GatewayConfig {
    /// Load configuration from process environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if any variable is present but malformed.
    pub fn from_env() -> Result<Self, GatewayError> {
        let vars: HashMap<String, String> = std::env::vars().collect();
        Self::from_vars(&vars)
    }

    /// Load configuration from the given variable map. Split out from
    /// [`Self::from_env`] so tests never touch process environment.
    ///
    /// # Errors
    ///
    /// Returns an error if any variable is present but malformed.
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, GatewayError> {
        let bind_address = parse_addr(vars, "GW_BIND_ADDRESS", DEFAULT_BIND_ADDRESS)?;
        let health_bind_address =
            parse_addr(vars, "GW_HEALTH_BIND_ADDRESS", DEFAULT_HEALTH_BIND_ADDRESS)?;

        let instance_id = vars
            .get("GW_INSTANCE_ID")
            .cloned()
            .unwrap_or_else(|| format!("gw-{}", uuid::Uuid::new_v4()));

        let store_dsn = vars
            .get("GW_STORE_DSN")
            .filter(|v| !v.is_empty())
            .map(|v| SecretString::from(v.clone()));

        let typing_ttl = Duration::from_secs(parse_u64(
            vars,
            "GW_TYPING_TTL_SECONDS",
            DEFAULT_TYPING_TTL_SECONDS,
        )?);
        let typing_sweep_interval = Duration::from_secs(parse_u64(
            vars,
            "GW_TYPING_SWEEP_SECONDS",
            DEFAULT_TYPING_SWEEP_SECONDS,
        )?);
        let persistence_timeout = Duration::from_millis(parse_u64(
            vars,
            "GW_PERSISTENCE_TIMEOUT_MS",
            DEFAULT_PERSISTENCE_TIMEOUT_MS,
        )?);

        let send_buffer = usize::try_from(parse_u64(vars, "GW_SEND_BUFFER", DEFAULT_SEND_BUFFER)?)
            .map_err(|e| GatewayError::Internal(format!("invalid GW_SEND_BUFFER: {e}")))?;
        if send_buffer == 0 {
            return Err(GatewayError::Internal(
                "GW_SEND_BUFFER must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            bind_address,
            health_bind_address,
            instance_id,
            store_dsn,
            typing_ttl,
            typing_sweep_interval,
            persistence_timeout,
            send_buffer,
        })
    }

    /// Room-facing slice of the configuration.
    #[must_use]
    pub fn room_config(&self) -> RoomConfig {
        RoomConfig {
            typing_ttl: self.typing_ttl,
            typing_sweep_interval: self.typing_sweep_interval,
            persistence_timeout: self.persistence_timeout,
        }
    }
}

/// The subset of configuration room actors need.
#[derive(Debug, Clone, Copy)]
pub struct RoomConfig {
    pub typing_ttl: Duration,
    pub typing_sweep_interval: Duration,
    pub persistence_timeout: Duration,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            typing_ttl: Duration::from_secs(DEFAULT_TYPING_TTL_SECONDS),
            typing_sweep_interval: Duration::from_secs(DEFAULT_TYPING_SWEEP_SECONDS),
            persistence_timeout: Duration::from_millis(DEFAULT_PERSISTENCE_TIMEOUT_MS),
        }
    }
}

fn parse_addr(
    vars: &HashMap<String, String>,
    key: &str,
    default: &str,
) -> Result<SocketAddr, GatewayError> {
    vars.get(key)
        .map_or(default, String::as_str)
        .parse()
        .map_err(|e| GatewayError::Internal(format!("invalid {key}: {e}")))
}

fn parse_u64(vars: &HashMap<String, String>, key: &str, default: u64) -> Result<u64, GatewayError> {
    match vars.get(key) {
        None => Ok(default),
        Some(raw) => raw
            .parse()
            .map_err(|e| GatewayError::Internal(format!("invalid {key}: {e}"))),
    }
}

// Manual Debug so the DSN is never logged.
impl std::fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayConfig")
            .field("bind_address", &self.bind_address)
            .field("health_bind_address", &self.health_bind_address)
            .field("instance_id", &self.instance_id)
            .field(
                "store_dsn",
                &self.store_dsn.as_ref().map(|_| "[REDACTED]"),
            )
            .field("typing_ttl", &self.typing_ttl)
            .field("typing_sweep_interval", &self.typing_sweep_interval)
            .field("persistence_timeout", &self.persistence_timeout)
            .field("send_buffer", &self.send_buffer)
            .finish()
    }
}

impl GatewayConfig {
    /// Expose the DSN for store construction. Callers must not log it.
    #[must_use]
    pub fn store_dsn_value(&self) -> Option<&str> {
        self.store_dsn.as_ref().map(ExposeSecret::expose_secret)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = GatewayConfig::from_vars(&HashMap::new()).unwrap();
        assert_eq!(config.bind_address.port(), 8080);
        assert_eq!(config.health_bind_address.port(), 8081);
        assert!(config.store_dsn.is_none());
        assert_eq!(config.typing_ttl, Duration::from_secs(10));
        assert_eq!(config.persistence_timeout, Duration::from_millis(3_000));
        assert_eq!(config.send_buffer, 64);
    }

    #[test]
    fn test_overrides() {
        let vars = HashMap::from([
            ("GW_BIND_ADDRESS".to_string(), "127.0.0.1:9000".to_string()),
            ("GW_TYPING_TTL_SECONDS".to_string(), "5".to_string()),
            ("GW_SEND_BUFFER".to_string(), "8".to_string()),
        ]);
        let config = GatewayConfig::from_vars(&vars).unwrap();
        assert_eq!(config.bind_address.port(), 9000);
        assert_eq!(config.typing_ttl, Duration::from_secs(5));
        assert_eq!(config.send_buffer, 8);
    }

    #[test]
    fn test_malformed_address_rejected() {
        let vars = HashMap::from([("GW_BIND_ADDRESS".to_string(), "not-an-addr".to_string())]);
        assert!(GatewayConfig::from_vars(&vars).is_err());
    }

    #[test]
    fn test_zero_send_buffer_rejected() {
        let vars = HashMap::from([("GW_SEND_BUFFER".to_string(), "0".to_string())]);
        assert!(GatewayConfig::from_vars(&vars).is_err());
    }

    #[test]
    fn test_dsn_redacted_in_debug() {
        let vars = HashMap::from([(
            "GW_STORE_DSN".to_string(),
            "postgres://user:hunter2@db/messenger".to_string(),
        )]);
        let config = GatewayConfig::from_vars(&vars).unwrap();
        let debug = format!("{config:?}");
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("REDACTED"));
    }
}
