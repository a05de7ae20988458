//! Configuration surface: defaults, YAML file, command-line overrides.
//!
//! Both sources funnel through [`Config::set`] so a key behaves identically
//! whether it came from `config.yaml` or from `--server.port 11861`. The key
//! set is closed: anything outside the table is a startup error, with the
//! single exception of the reserved `memcache.*` subtree which is accepted
//! and ignored.

use crate::types::NodeId;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::Path;
use thiserror::Error;

/// Default UDP port for the mesh.
pub const DEFAULT_PORT: u16 = 11860;

/// Default discovery broadcast cadence.
pub const DEFAULT_DISCOVERY_INTERVAL_MS: u64 = 5_000;

/// Default grace period before a silent peer is evicted.
pub const DEFAULT_PEER_EXPIRY_MS: u64 = 60_000;

/// Log verbosity, most to least severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
}

/// Scalar parse failures, distinguished so callers can report which rule broke.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("invalid format")]
    InvalidFormat,
    #[error("invalid unit")]
    InvalidUnit,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot open config file {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("cannot parse config file: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("unknown configuration key '{0}'")]
    UnknownKey(String),
    #[error("{key}: {reason}")]
    BadValue { key: String, reason: String },
}

/// Read-only view of configuration consumed by the core.
#[derive(Debug, Clone)]
pub struct Config {
    /// Fixed node id; `None` means pick a random one at startup.
    pub node_id: Option<NodeId>,
    pub bind_address: Ipv4Addr,
    pub port: u16,
    /// Silent peers older than this are dropped from the registry.
    pub peer_expiry_ms: u64,
    pub local_discovery_enable: bool,
    pub local_discovery_interval_ms: u64,
    /// Unicast Discovery targets sent alongside the broadcast each interval.
    pub seeds: Vec<SocketAddrV4>,
    pub log_level: LogLevel,
    pub disable_splash: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_id: None,
            bind_address: Ipv4Addr::UNSPECIFIED,
            port: DEFAULT_PORT,
            peer_expiry_ms: DEFAULT_PEER_EXPIRY_MS,
            local_discovery_enable: true,
            local_discovery_interval_ms: DEFAULT_DISCOVERY_INTERVAL_MS,
            seeds: Vec::new(),
            log_level: LogLevel::Info,
            disable_splash: false,
        }
    }
}

impl Config {
    /// Load and apply a YAML config file. Unknown keys are errors.
    pub fn load_yaml<P: AsRef<Path>>(&mut self, path: P) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        self.apply_yaml_str(&text)
    }

    /// Apply YAML text. Split out of [`Config::load_yaml`] so tests can feed
    /// documents without touching the filesystem.
    pub fn apply_yaml_str(&mut self, text: &str) -> Result<(), ConfigError> {
        let root: serde_yaml::Value = serde_yaml::from_str(text)?;
        if root.is_null() {
            return Ok(());
        }
        let map = root.as_mapping().ok_or_else(|| ConfigError::BadValue {
            key: "<root>".into(),
            reason: "config root must be a map".into(),
        })?;

        for (section_key, section_val) in map {
            let section = section_key.as_str().ok_or_else(|| ConfigError::BadValue {
                key: "<root>".into(),
                reason: "section names must be strings".into(),
            })?;

            // Reserved for the (unbuilt) memcached facade.
            if section == "memcache" {
                tracing::debug!("ignoring reserved memcache.* configuration");
                continue;
            }

            let entries = section_val
                .as_mapping()
                .ok_or_else(|| ConfigError::BadValue {
                    key: section.to_string(),
                    reason: "section must be a map".into(),
                })?;

            for (k, v) in entries {
                let name = k.as_str().ok_or_else(|| ConfigError::BadValue {
                    key: section.to_string(),
                    reason: "keys must be strings".into(),
                })?;
                let key = format!("{}.{}", section, name);
                self.set(&key, &yaml_scalar_to_string(&key, v)?)?;
            }
        }
        Ok(())
    }

    /// Apply one `key = value` pair. The key is the dotted form from the
    /// configuration table; the value is always textual.
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        let bad = |reason: &str| ConfigError::BadValue {
            key: key.to_string(),
            reason: reason.to_string(),
        };

        match key {
            "server.id" => {
                let id = parse_hex_u64(value)
                    .map_err(|_| bad("must be a 64-bit hex literal (16 digits)"))?;
                self.node_id = Some(id);
            }
            "server.ip4_address" => {
                self.bind_address =
                    parse_ipv4(value).map_err(|_| bad("must be a valid IPv4 address"))?;
            }
            "server.port" => {
                self.port = value.parse::<u16>().map_err(|_| bad("must be a UDP port"))?;
            }
            "server.peer_expiry" => {
                let ms = parse_duration(value).map_err(|e| bad(&e.to_string()))?;
                if ms <= 0 {
                    return Err(bad("must be a positive duration"));
                }
                self.peer_expiry_ms = ms as u64;
            }
            "local_discovery.enable" => {
                self.local_discovery_enable = parse_bool(value)
                    .map_err(|_| bad("must be 'true','t','yes','false','f','no'"))?;
            }
            "local_discovery.interval" => {
                let ms = parse_duration(value).map_err(|e| bad(&e.to_string()))?;
                if ms <= 0 {
                    return Err(bad("must be a positive duration"));
                }
                self.local_discovery_interval_ms = ms as u64;
            }
            "local_discovery.seeds" => {
                let mut seeds = Vec::new();
                for part in value.split(',').map(str::trim).filter(|s| !s.is_empty()) {
                    let addr: SocketAddrV4 = part
                        .parse()
                        .map_err(|_| bad("seeds must be 'ip:port' entries"))?;
                    seeds.push(addr);
                }
                self.seeds = seeds;
            }
            "logging.level" => {
                self.log_level = parse_log_level(value)
                    .map_err(|_| bad("must be error|warn|warning|info|debug"))?;
            }
            "logging.disable_splash" => {
                self.disable_splash = parse_bool(value)
                    .map_err(|_| bad("must be 'true','t','yes','false','f','no'"))?;
            }
            _ => return Err(ConfigError::UnknownKey(key.to_string())),
        }
        Ok(())
    }

    /// Socket address the node binds to.
    pub fn bind_addr(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.bind_address, self.port)
    }
}

fn yaml_scalar_to_string(key: &str, v: &serde_yaml::Value) -> Result<String, ConfigError> {
    match v {
        serde_yaml::Value::String(s) => Ok(s.clone()),
        serde_yaml::Value::Number(n) => Ok(n.to_string()),
        serde_yaml::Value::Bool(b) => Ok(b.to_string()),
        serde_yaml::Value::Sequence(items) => {
            // Only the seed list is a sequence; flatten to the CLI form.
            let mut parts = Vec::with_capacity(items.len());
            for item in items {
                match item {
                    serde_yaml::Value::String(s) => parts.push(s.clone()),
                    _ => {
                        return Err(ConfigError::BadValue {
                            key: key.to_string(),
                            reason: "list entries must be strings".into(),
                        })
                    }
                }
            }
            Ok(parts.join(","))
        }
        _ => Err(ConfigError::BadValue {
            key: key.to_string(),
            reason: "value must be a scalar".into(),
        }),
    }
}

/// Parse a duration like `1h27m16s` or `0.5h` into milliseconds.
///
/// Units are `h`, `m`, `s`, `u` (microseconds) in strictly decreasing order,
/// each appearing at most once. A fractional value is allowed only in the
/// trailing component. A leading `-` negates the whole duration.
pub fn parse_duration(input: &str) -> Result<i64, ParseError> {
    let bytes = input.as_bytes();
    let mut pos = 0usize;

    let negative = bytes.first() == Some(&b'-');
    if negative {
        pos += 1;
    }
    if pos >= bytes.len() {
        return Err(ParseError::InvalidFormat);
    }

    // (milliseconds contribution, had a fraction)
    let mut components: Vec<(f64, bool)> = Vec::new();
    let mut last_rank = 4u8;

    while pos < bytes.len() {
        let mut value = 0f64;
        let mut frac_scale = 0f64;
        let mut has_fraction = false;
        let mut digits = 0usize;

        while pos < bytes.len() && (bytes[pos].is_ascii_digit() || bytes[pos] == b'.') {
            if bytes[pos] == b'.' {
                if has_fraction {
                    return Err(ParseError::InvalidFormat);
                }
                has_fraction = true;
                frac_scale = 0.1;
            } else {
                let d = (bytes[pos] - b'0') as f64;
                if has_fraction {
                    value += d * frac_scale;
                    frac_scale /= 10.0;
                } else {
                    value = value * 10.0 + d;
                }
                digits += 1;
            }
            pos += 1;
        }

        if digits == 0 || pos >= bytes.len() {
            // No digits, or a number with no unit behind it.
            return Err(if digits == 0 {
                ParseError::InvalidFormat
            } else {
                ParseError::InvalidUnit
            });
        }

        let unit = bytes[pos];
        pos += 1;

        let (rank, ms_per_unit) = match unit {
            b'h' => (3u8, 3_600_000.0),
            b'm' => (2, 60_000.0),
            b's' => (1, 1_000.0),
            b'u' => (0, 0.001),
            _ => return Err(ParseError::InvalidUnit),
        };

        // Units must strictly decrease: 1m1h and 3s2s are both malformed.
        if rank >= last_rank {
            return Err(ParseError::InvalidFormat);
        }
        last_rank = rank;

        components.push((value * ms_per_unit, has_fraction));
    }

    // A fraction is only legal in the trailing component.
    if components
        .iter()
        .rev()
        .skip(1)
        .any(|&(_, fraction)| fraction)
    {
        return Err(ParseError::InvalidFormat);
    }

    let mut milliseconds: i64 = 0;
    for (ms, _) in &components {
        milliseconds += *ms as i64;
    }

    Ok(if negative { -milliseconds } else { milliseconds })
}

/// Parse a 64-bit hex literal: optional `0x`/`0X`, then exactly 16 hex digits.
pub fn parse_hex_u64(input: &str) -> Result<u64, ParseError> {
    let digits = input
        .strip_prefix("0x")
        .or_else(|| input.strip_prefix("0X"))
        .unwrap_or(input);
    if digits.len() != 16 || !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(ParseError::InvalidFormat);
    }
    u64::from_str_radix(digits, 16).map_err(|_| ParseError::InvalidFormat)
}

pub fn parse_bool(input: &str) -> Result<bool, ParseError> {
    match input.to_ascii_lowercase().as_str() {
        "true" | "t" | "yes" => Ok(true),
        "false" | "f" | "no" => Ok(false),
        _ => Err(ParseError::InvalidFormat),
    }
}

pub fn parse_ipv4(input: &str) -> Result<Ipv4Addr, ParseError> {
    input.parse().map_err(|_| ParseError::InvalidFormat)
}

pub fn parse_log_level(input: &str) -> Result<LogLevel, ParseError> {
    match input.to_ascii_lowercase().as_str() {
        "error" => Ok(LogLevel::Error),
        "warn" | "warning" => Ok(LogLevel::Warn),
        "info" => Ok(LogLevel::Info),
        "debug" => Ok(LogLevel::Debug),
        _ => Err(ParseError::InvalidFormat),
    }
}
