use std::collections::HashMap;
use std::env;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::fs;
use std::path::Path;

#[derive(Debug)]
pub enum ConfigError {
    Io,
    Parse,
    Invalid,
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io => write!(f, "cannot read configuration file"),
            Self::Parse => write!(f, "configuration syntax error"),
            Self::Invalid => write!(f, "invalid configuration value"),
        }
    }
}

impl Error for ConfigError {}

#[derive(Debug, Clone)]
pub struct HubConfig {
    pub bind: String,
    /// Deadline for the hello frame on a fresh connection.
    pub hello_timeout_secs: u64,
    /// Server-initiated WebSocket ping interval.
    pub keepalive_secs: u64,
    /// An unanswered offer auto-ends with reason `timeout` after this.
    pub offer_timeout_secs: u64,
    /// Per-destination bound on a single fan-out send.
    pub send_timeout_ms: u64,
    pub metrics_interval_secs: u64,
    /// Outbound frame queue depth per session.
    pub session_buffer: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        HubConfig {
            bind: "127.0.0.1:8750".to_string(),
            hello_timeout_secs: 10,
            keepalive_secs: 30,
            offer_timeout_secs: 30,
            send_timeout_ms: 250,
            metrics_interval_secs: 60,
            session_buffer: 64,
        }
    }
}

/// Loads hub configuration from an optional config file with
/// environment overrides; every key has a default.
pub fn load_configuration(path: &Path) -> Result<HubConfig, ConfigError> {
    let mut map = HashMap::new();
    if path.exists() {
        let contents = fs::read_to_string(path).map_err(|_| ConfigError::Io)?;
        parse_sections(&contents, &mut map)?;
    }
    let defaults = HubConfig::default();
    let bind = override_env("CONVO_BIND", map.remove("server.bind"))?.unwrap_or(defaults.bind);
    let hello_timeout = parse_u64(
        override_env("CONVO_HELLO_TIMEOUT", map.remove("server.hello_timeout"))?,
        defaults.hello_timeout_secs,
    )?;
    let keepalive = parse_u64(
        override_env("CONVO_KEEPALIVE", map.remove("server.keepalive"))?,
        defaults.keepalive_secs,
    )?;
    let offer_timeout = parse_u64(
        override_env("CONVO_OFFER_TIMEOUT", map.remove("calls.offer_timeout"))?,
        defaults.offer_timeout_secs,
    )?;
    let send_timeout = parse_u64(
        override_env("CONVO_SEND_TIMEOUT_MS", map.remove("delivery.send_timeout_ms"))?,
        defaults.send_timeout_ms,
    )?;
    let metrics_interval = parse_u64(
        override_env("CONVO_METRICS_INTERVAL", map.remove("server.metrics_interval"))?,
        defaults.metrics_interval_secs,
    )?;
    let session_buffer = parse_u64(
        override_env("CONVO_SESSION_BUFFER", map.remove("delivery.session_buffer"))?,
        defaults.session_buffer as u64,
    )? as usize;
    if session_buffer == 0 || send_timeout == 0 {
        return Err(ConfigError::Invalid);
    }
    Ok(HubConfig {
        bind,
        hello_timeout_secs: hello_timeout,
        keepalive_secs: keepalive,
        offer_timeout_secs: offer_timeout,
        send_timeout_ms: send_timeout,
        metrics_interval_secs: metrics_interval,
        session_buffer,
    })
}

fn parse_sections(contents: &str, map: &mut HashMap<String, String>) -> Result<(), ConfigError> {
    let mut section: Option<String> = None;
    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some(name) = line.strip_prefix('[').and_then(|rest| rest.strip_suffix(']')) {
            section = Some(name.to_string());
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            return Err(ConfigError::Parse);
        };
        let key = match &section {
            Some(section) => format!("{section}.{}", key.trim()),
            None => key.trim().to_string(),
        };
        let mut value = value.trim();
        // Trailing comments and optional quoting.
        if let Some((head, _)) = value.split_once('#') {
            value = head.trim();
        }
        let value = value
            .strip_prefix('"')
            .and_then(|v| v.strip_suffix('"'))
            .unwrap_or(value);
        map.insert(key, value.to_string());
    }
    Ok(())
}

fn override_env(key: &str, current: Option<String>) -> Result<Option<String>, ConfigError> {
    match env::var(key) {
        Ok(value) => Ok(Some(value)),
        Err(env::VarError::NotPresent) => Ok(current),
        Err(env::VarError::NotUnicode(_)) => Err(ConfigError::Invalid),
    }
}

fn parse_u64(value: Option<String>, default: u64) -> Result<u64, ConfigError> {
    match value {
        Some(raw) => raw.parse::<u64>().map_err(|_| ConfigError::Invalid),
        None => Ok(default),
    }
}
