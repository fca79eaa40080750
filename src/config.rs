// Engine configuration with environment overrides
use crate::adb::auth::default_key_path;
use crate::adb::discovery::ResolveMode;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub const ENV_CONNECT_TIMEOUT: &str = "ADB_LINK_CONNECT_TIMEOUT";
pub const ENV_PAIRING_TIMEOUT: &str = "ADB_LINK_PAIRING_TIMEOUT";
pub const ENV_DELAYED_ACK: &str = "ADB_LINK_DELAYED_ACK";
pub const ENV_RESOLVE_MODE: &str = "ADB_LINK_RESOLVE_MODE";
pub const ENV_KEY_PATH: &str = "ADB_LINK_KEY_PATH";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdbConfig {
    /// Per-attempt bound on transport open plus handshake.
    pub connect_timeout: Duration,
    pub pairing_timeout: Duration,
    pub enable_delayed_ack: bool,
    pub max_concurrent_connects: usize,
    pub usb_open_attempts: u32,
    pub resolve_mode: ResolveMode,
    pub key_path: PathBuf,
}

impl Default for AdbConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            pairing_timeout: Duration::from_secs(30),
            enable_delayed_ack: false,
            max_concurrent_connects: 4,
            usb_open_attempts: 3,
            resolve_mode: ResolveMode::Subscribe,
            key_path: default_key_path()
                .unwrap_or_else(|_| PathBuf::from(".android").join("adbkey")),
        }
    }
}

fn parse_secs(name: &str, value: &str) -> Option<Duration> {
    match value.trim().parse::<u64>() {
        Ok(secs) if secs > 0 => Some(Duration::from_secs(secs)),
        _ => {
            log::warn!("Ignoring {name}={value}: expected a positive number of seconds");
            None
        }
    }
}

fn parse_bool(name: &str, value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => {
            log::warn!("Ignoring {name}={value}: expected true or false");
            None
        }
    }
}

fn parse_resolve_mode(name: &str, value: &str) -> Option<ResolveMode> {
    match value.trim().to_ascii_lowercase().as_str() {
        "subscribe" => Some(ResolveMode::Subscribe),
        "oneshot" | "one-shot" => Some(ResolveMode::OneShot),
        _ => {
            log::warn!("Ignoring {name}={value}: expected subscribe or oneshot");
            None
        }
    }
}

impl AdbConfig {
    /// Defaults overlaid with `ADB_LINK_*` variables. Invalid values are
    /// logged and skipped.
    pub fn from_env() -> Self {
        Self::default().with_overrides(|name| std::env::var(name).ok())
    }

    /// Apply overrides from any key/value source.
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(v) = lookup(ENV_CONNECT_TIMEOUT)
            && let Some(timeout) = parse_secs(ENV_CONNECT_TIMEOUT, &v)
        {
            self.connect_timeout = timeout;
        }
        if let Some(v) = lookup(ENV_PAIRING_TIMEOUT)
            && let Some(timeout) = parse_secs(ENV_PAIRING_TIMEOUT, &v)
        {
            self.pairing_timeout = timeout;
        }
        if let Some(v) = lookup(ENV_DELAYED_ACK)
            && let Some(enabled) = parse_bool(ENV_DELAYED_ACK, &v)
        {
            self.enable_delayed_ack = enabled;
        }
        if let Some(v) = lookup(ENV_RESOLVE_MODE)
            && let Some(mode) = parse_resolve_mode(ENV_RESOLVE_MODE, &v)
        {
            self.resolve_mode = mode;
        }
        if let Some(v) = lookup(ENV_KEY_PATH)
            && !v.trim().is_empty()
        {
            self.key_path = PathBuf::from(v);
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults() {
        let config = AdbConfig::default();
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.pairing_timeout, Duration::from_secs(30));
        assert!(!config.enable_delayed_ack);
        assert_eq!(config.resolve_mode, ResolveMode::Subscribe);
        assert!(config.key_path.ends_with("adbkey"));
    }

    #[test]
    fn overrides_skip_invalid_values() {
        let vars: HashMap<&str, &str> = HashMap::from([
            (ENV_CONNECT_TIMEOUT, "3"),
            (ENV_PAIRING_TIMEOUT, "soon"),
            (ENV_DELAYED_ACK, "yes"),
            (ENV_RESOLVE_MODE, "oneshot"),
            (ENV_KEY_PATH, "/tmp/key"),
        ]);
        let config = AdbConfig::default().with_overrides(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(config.connect_timeout, Duration::from_secs(3));
        assert_eq!(config.pairing_timeout, Duration::from_secs(30));
        assert!(config.enable_delayed_ack);
        assert_eq!(config.resolve_mode, ResolveMode::OneShot);
        assert_eq!(config.key_path, PathBuf::from("/tmp/key"));
    }
}
