//! Konfiguration über Umgebungsvariablen
//!
//! Relay:  `RELAY_ADDR`, `RELAY_OUTBOX_CAPACITY`
//! Client: `SIGNALING_URL`, `DISPLAY_NAME`, `ICE_SERVERS`,
//!         `CALL_INVITE_TIMEOUT_SECS`, `CALL_CONNECT_TIMEOUT_SECS`,
//!         `SIGNALING_REGISTER_TIMEOUT_SECS`

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use url::Url;

pub const DEFAULT_SIGNALING_URL: &str = "ws://localhost:5000";
pub const DEFAULT_OUTBOX_CAPACITY: usize = 100;

/// Öffentliche Google STUN Server
pub const DEFAULT_ICE_SERVERS: &[&str] = &[
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
    "stun:stun2.l.google.com:19302",
];

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value:?} ({reason})")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}

// ============================================================================
// RELAY CONFIG
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    pub bind_addr: SocketAddr,
    pub outbox_capacity: usize,
}

impl RelayConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Liest die Konfiguration aus einer beliebigen Quelle
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let bind_addr: SocketAddr = parse_or(&lookup, "RELAY_ADDR", defaults.bind_addr)?;
        let outbox_capacity: usize =
            parse_or(&lookup, "RELAY_OUTBOX_CAPACITY", defaults.outbox_capacity)?;

        if outbox_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                key: "RELAY_OUTBOX_CAPACITY",
                value: "0".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }

        Ok(Self {
            bind_addr,
            outbox_capacity,
        })
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 5000)),
            outbox_capacity: DEFAULT_OUTBOX_CAPACITY,
        }
    }
}

// ============================================================================
// CLIENT CONFIG
// ============================================================================

/// Zeitlimits für Wartephasen eines Anrufs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallTimeouts {
    /// Klingeln (ausgehend und eingehend)
    pub invite: Duration,
    /// Von `Accepted` bis Medien fließen
    pub connect: Duration,
}

impl Default for CallTimeouts {
    fn default() -> Self {
        Self {
            invite: Duration::from_secs(30),
            connect: Duration::from_secs(20),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    pub signaling_url: Url,
    pub display_name: String,
    pub ice_servers: Vec<String>,
    pub timeouts: CallTimeouts,
    pub register_timeout: Duration,
}

impl ClientConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let raw_url = lookup("SIGNALING_URL").unwrap_or_else(|| DEFAULT_SIGNALING_URL.to_string());
        let signaling_url = parse_signaling_url(&raw_url)?;

        let display_name = lookup("DISPLAY_NAME").unwrap_or_default();

        let ice_servers = match lookup("ICE_SERVERS") {
            Some(list) => list
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect(),
            None => DEFAULT_ICE_SERVERS.iter().map(|s| s.to_string()).collect(),
        };

        let defaults = CallTimeouts::default();
        let timeouts = CallTimeouts {
            invite: seconds_or(&lookup, "CALL_INVITE_TIMEOUT_SECS", defaults.invite)?,
            connect: seconds_or(&lookup, "CALL_CONNECT_TIMEOUT_SECS", defaults.connect)?,
        };
        let register_timeout =
            seconds_or(&lookup, "SIGNALING_REGISTER_TIMEOUT_SECS", Duration::from_secs(10))?;

        Ok(Self {
            signaling_url,
            display_name,
            ice_servers,
            timeouts,
            register_timeout,
        })
    }
}

/// Akzeptiert `ws(s)://` und `http(s)://` (wird umgeschrieben)
fn parse_signaling_url(raw: &str) -> Result<Url, ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidValue {
        key: "SIGNALING_URL",
        value: raw.to_string(),
        reason,
    };

    let mut url = Url::parse(raw).map_err(|e| invalid(e.to_string()))?;
    let scheme = match url.scheme() {
        "ws" | "http" => "ws",
        "wss" | "https" => "wss",
        other => return Err(invalid(format!("unsupported scheme {}", other))),
    };
    url.set_scheme(scheme)
        .map_err(|_| invalid("cannot change scheme".to_string()))?;
    Ok(url)
}

fn parse_or<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(value) => value
            .trim()
            .parse::<T>()
            .map_err(|e| ConfigError::InvalidValue {
                key,
                value: value.clone(),
                reason: e.to_string(),
            }),
        None => Ok(default),
    }
}

fn seconds_or(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    let secs: u64 = parse_or(lookup, key, default.as_secs())?;
    if secs == 0 {
        return Err(ConfigError::InvalidValue {
            key,
            value: "0".to_string(),
            reason: "must be at least 1 second".to_string(),
        });
    }
    Ok(Duration::from_secs(secs))
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_relay_defaults() {
        let config = RelayConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, RelayConfig::default());
    }

    #[test]
    fn test_relay_overrides() {
        let config = RelayConfig::from_lookup(lookup(&[
            ("RELAY_ADDR", "127.0.0.1:7000"),
            ("RELAY_OUTBOX_CAPACITY", "8"),
        ]))
        .unwrap();
        assert_eq!(config.bind_addr.port(), 7000);
        assert_eq!(config.outbox_capacity, 8);
    }

    #[test]
    fn test_relay_rejects_bad_address() {
        let err = RelayConfig::from_lookup(lookup(&[("RELAY_ADDR", "nowhere")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key: "RELAY_ADDR", .. }));
    }

    #[test]
    fn test_client_defaults() {
        let config = ClientConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.signaling_url.as_str(), "ws://localhost:5000/");
        assert_eq!(config.ice_servers.len(), 3);
        assert_eq!(config.timeouts, CallTimeouts::default());
        assert_eq!(config.register_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_http_url_is_rewritten() {
        let config =
            ClientConfig::from_lookup(lookup(&[("SIGNALING_URL", "https://relay.example.org")]))
                .unwrap();
        assert_eq!(config.signaling_url.scheme(), "wss");
    }

    #[test]
    fn test_client_overrides() {
        let config = ClientConfig::from_lookup(lookup(&[
            ("DISPLAY_NAME", "Bob"),
            ("ICE_SERVERS", "stun:a:1, stun:b:2,"),
            ("CALL_INVITE_TIMEOUT_SECS", "5"),
        ]))
        .unwrap();
        assert_eq!(config.display_name, "Bob");
        assert_eq!(config.ice_servers, vec!["stun:a:1", "stun:b:2"]);
        assert_eq!(config.timeouts.invite, Duration::from_secs(5));
    }

    #[test]
    fn test_zero_timeout_is_rejected() {
        let err = ClientConfig::from_lookup(lookup(&[("CALL_CONNECT_TIMEOUT_SECS", "0")]))
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                key: "CALL_CONNECT_TIMEOUT_SECS",
                ..
            }
        ));
    }
}
