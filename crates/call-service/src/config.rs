//! Call service configuration.
//!
//! Configuration is loaded from environment variables. The Redis URL may carry
//! credentials and is redacted in Debug output.

use common::UserId;
use secrecy::SecretString;
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Default ring timeout in seconds.
pub const DEFAULT_RING_TIMEOUT_SECONDS: u64 = 60;

/// Default health endpoint bind address.
pub const DEFAULT_HEALTH_BIND_ADDRESS: &str = "0.0.0.0:8090";

/// Default service instance ID prefix.
pub const DEFAULT_SERVICE_ID_PREFIX: &str = "call";

/// Public STUN servers used when none are configured.
pub const DEFAULT_ICE_SERVERS: [&str; 5] = [
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
    "stun:stun2.l.google.com:19302",
    "stun:stun3.l.google.com:19302",
    "stun:stun4.l.google.com:19302",
];

/// Call service configuration.
#[derive(Clone)]
pub struct Config {
    /// Redis connection URL for the call registry.
    pub redis_url: SecretString,

    /// User this instance places and receives calls for.
    pub local_user_id: UserId,

    /// How long an outgoing call rings before it times out (default: 60).
    pub ring_timeout_seconds: u64,

    /// Health endpoint bind address (default: "0.0.0.0:8090").
    pub health_bind_address: String,

    /// Unique identifier for this instance.
    pub service_id: String,

    /// STUN/TURN servers handed to the peer negotiation library.
    pub ice_servers: Vec<String>,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("redis_url", &"[REDACTED]")
            .field("local_user_id", &self.local_user_id)
            .field("ring_timeout_seconds", &self.ring_timeout_seconds)
            .field("health_bind_address", &self.health_bind_address)
            .field("service_id", &self.service_id)
            .field("ice_servers", &self.ice_servers)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a required variable is missing or a value is invalid.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a required variable is missing or a value is invalid.
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let redis_url = SecretString::from(
            vars.get("REDIS_URL")
                .ok_or_else(|| ConfigError::MissingEnvVar("REDIS_URL".to_string()))?
                .clone(),
        );

        let local_user_id = vars
            .get("CALL_LOCAL_USER_ID")
            .filter(|s| !s.trim().is_empty())
            .map(|s| UserId::new(s.trim()))
            .ok_or_else(|| ConfigError::MissingEnvVar("CALL_LOCAL_USER_ID".to_string()))?;

        let ring_timeout_seconds = match vars.get("CALL_RING_TIMEOUT_SECONDS") {
            Some(raw) => {
                let value: u64 = raw.parse().map_err(|e| {
                    ConfigError::InvalidValue(format!(
                        "CALL_RING_TIMEOUT_SECONDS must be a positive integer: {e}"
                    ))
                })?;
                if value == 0 {
                    return Err(ConfigError::InvalidValue(
                        "CALL_RING_TIMEOUT_SECONDS must be greater than 0".to_string(),
                    ));
                }
                value
            }
            None => DEFAULT_RING_TIMEOUT_SECONDS,
        };

        let health_bind_address = vars
            .get("CALL_HEALTH_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_HEALTH_BIND_ADDRESS.to_string());

        let ice_servers = vars
            .get("CALL_ICE_SERVERS")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
            })
            .filter(|servers| !servers.is_empty())
            .unwrap_or_else(|| DEFAULT_ICE_SERVERS.iter().map(ToString::to_string).collect());

        let service_id = vars.get("CALL_SERVICE_ID").cloned().unwrap_or_else(|| {
            let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string());
            let uuid_suffix = uuid::Uuid::new_v4().to_string();
            let short_suffix = uuid_suffix.get(..8).unwrap_or("00000000");
            format!("{DEFAULT_SERVICE_ID_PREFIX}-{hostname}-{short_suffix}")
        });

        Ok(Config {
            redis_url,
            local_user_id,
            ring_timeout_seconds,
            health_bind_address,
            service_id,
            ice_servers,
        })
    }

    #[must_use]
    pub fn ring_timeout(&self) -> Duration {
        Duration::from_secs(self.ring_timeout_seconds)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    fn base_vars() -> HashMap<String, String> {
        HashMap::from([
            (
                "REDIS_URL".to_string(),
                "redis://:hunter2@localhost:6379".to_string(),
            ),
            ("CALL_LOCAL_USER_ID".to_string(), "u2".to_string()),
        ])
    }

    #[test]
    fn test_from_vars_success_with_defaults() {
        let config = Config::from_vars(&base_vars()).expect("Config should load successfully");

        assert_eq!(
            config.redis_url.expose_secret(),
            "redis://:hunter2@localhost:6379"
        );
        assert_eq!(config.local_user_id, UserId::from("u2"));
        assert_eq!(config.ring_timeout_seconds, DEFAULT_RING_TIMEOUT_SECONDS);
        assert_eq!(config.ring_timeout(), Duration::from_secs(60));
        assert_eq!(config.health_bind_address, DEFAULT_HEALTH_BIND_ADDRESS);
        assert_eq!(config.ice_servers.len(), 5);
        assert!(config.service_id.starts_with("call-"));
    }

    #[test]
    fn test_from_vars_success_with_custom_values() {
        let mut vars = base_vars();
        vars.insert("CALL_RING_TIMEOUT_SECONDS".to_string(), "30".to_string());
        vars.insert(
            "CALL_HEALTH_BIND_ADDRESS".to_string(),
            "127.0.0.1:9000".to_string(),
        );
        vars.insert("CALL_SERVICE_ID".to_string(), "call-custom-001".to_string());
        vars.insert(
            "CALL_ICE_SERVERS".to_string(),
            "stun:a.example:3478, turn:b.example:3478".to_string(),
        );

        let config = Config::from_vars(&vars).expect("Config should load successfully");

        assert_eq!(config.ring_timeout_seconds, 30);
        assert_eq!(config.health_bind_address, "127.0.0.1:9000");
        assert_eq!(config.service_id, "call-custom-001");
        assert_eq!(
            config.ice_servers,
            vec![
                "stun:a.example:3478".to_string(),
                "turn:b.example:3478".to_string()
            ]
        );
    }

    #[test]
    fn test_from_vars_missing_redis_url() {
        let mut vars = base_vars();
        vars.remove("REDIS_URL");

        let result = Config::from_vars(&vars);
        assert!(matches!(result, Err(ConfigError::MissingEnvVar(v)) if v == "REDIS_URL"));
    }

    #[test]
    fn test_from_vars_blank_local_user() {
        let mut vars = base_vars();
        vars.insert("CALL_LOCAL_USER_ID".to_string(), "  ".to_string());

        let result = Config::from_vars(&vars);
        assert!(matches!(result, Err(ConfigError::MissingEnvVar(v)) if v == "CALL_LOCAL_USER_ID"));
    }

    #[test]
    fn test_zero_ring_timeout_rejected() {
        let mut vars = base_vars();
        vars.insert("CALL_RING_TIMEOUT_SECONDS".to_string(), "0".to_string());

        assert!(matches!(
            Config::from_vars(&vars),
            Err(ConfigError::InvalidValue(_))
        ));
    }

    #[test]
    fn test_non_numeric_ring_timeout_rejected() {
        let mut vars = base_vars();
        vars.insert("CALL_RING_TIMEOUT_SECONDS".to_string(), "soon".to_string());

        assert!(matches!(
            Config::from_vars(&vars),
            Err(ConfigError::InvalidValue(_))
        ));
    }

    #[test]
    fn test_empty_ice_servers_fall_back_to_defaults() {
        let mut vars = base_vars();
        vars.insert("CALL_ICE_SERVERS".to_string(), " , ".to_string());

        let config = Config::from_vars(&vars).unwrap();
        assert_eq!(config.ice_servers.len(), DEFAULT_ICE_SERVERS.len());
    }

    #[test]
    fn test_debug_redacts_sensitive_fields() {
        let config = Config::from_vars(&base_vars()).unwrap();
        let debug_output = format!("{config:?}");

        assert!(debug_output.contains("[REDACTED]"));
        assert!(!debug_output.contains("hunter2"));
        assert!(!debug_output.contains("redis://"));
    }
}
