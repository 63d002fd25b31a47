//! Service configuration.
//!
//! Loaded from a YAML file. Durations use Go's `48h30m10s` syntax because
//! the intake reply renders TTLs the same way and existing deployments
//! carry config files in that format.

use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level configuration record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Zone under which claimed labels are served. A trailing dot is
    /// tolerated in the file and stripped on load.
    pub parent_zone: String,

    /// Claim lifetime.
    #[serde(with = "go_duration")]
    pub ttl: Duration,

    pub provider: ProviderConfig,
    pub dns: DnsConfig,
    pub net: NetConfig,
    pub http: HttpConfig,
    pub store: StoreConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default)]
    pub random: RandomProviderConfig,
    #[serde(default)]
    pub wordlist: WordlistProviderConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RandomProviderConfig {
    pub enable: bool,
    /// Number of characters exposed from the generated id.
    #[serde(default = "default_id_len")]
    pub id_len: usize,
}

impl Default for RandomProviderConfig {
    fn default() -> Self {
        Self {
            enable: false,
            id_len: default_id_len(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WordlistProviderConfig {
    pub enable: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsConfig {
    #[serde(default)]
    pub address: String,
    pub port: u16,

    /// Mailbox reported in the SOA RNAME field.
    pub mname: String,
    /// Nameserver hosts served at the apex. The first one doubles as the
    /// SOA MNAME.
    pub ns: Vec<String>,
    /// Base64 key blob produced by a previous run. When absent a fresh key
    /// is generated and logged for operator capture.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dnssec_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetConfig {
    #[serde(default)]
    pub address: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default)]
    pub address: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub file: PathBuf,
    /// How often the background sweeper wakes to delete expired claims.
    #[serde(default = "default_sweep_interval", with = "go_duration")]
    pub sweep_interval: Duration,
}

fn default_id_len() -> usize {
    5
}

fn default_sweep_interval() -> Duration {
    Duration::from_secs(3600)
}

impl Config {
    /// Read and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let mut config: Config = serde_yaml::from_str(&raw)?;
        config.parent_zone = config.parent_zone.trim_end_matches('.').to_string();
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.parent_zone.is_empty() {
            return Err(ConfigError::Invalid("parent_zone must be set".into()));
        }
        if !self.provider.random.enable && !self.provider.wordlist.enable {
            return Err(ConfigError::Invalid(
                "at least one id provider must be enabled".into(),
            ));
        }
        if self.provider.random.enable && self.provider.random.id_len == 0 {
            return Err(ConfigError::Invalid(
                "provider.random.id_len must be > 0".into(),
            ));
        }
        if self.dns.ns.is_empty() {
            return Err(ConfigError::Invalid(
                "dns.ns must list at least one nameserver".into(),
            ));
        }
        if self.ttl.as_secs() == 0 {
            return Err(ConfigError::Invalid("ttl must be > 0".into()));
        }
        Ok(())
    }

    /// Parent zone with the trailing dot DNS wire names carry.
    pub fn zone_fqdn(&self) -> String {
        format!("{}.", self.parent_zone)
    }
}

/// Resolve a configured `address`/`port` pair into a socket address. An
/// empty address means the IPv6 unspecified address, which on dual-stack
/// hosts accepts IPv4 connections as well.
pub fn listen_addr(address: &str, port: u16) -> Result<SocketAddr, ConfigError> {
    let ip: IpAddr = if address.is_empty() {
        IpAddr::V6(Ipv6Addr::UNSPECIFIED)
    } else {
        address
            .parse()
            .map_err(|_| ConfigError::Invalid(format!("invalid listen address {address:?}")))?
    };
    Ok(SocketAddr::new(ip, port))
}

/// Render a duration the way Go's `time.Duration` does for whole seconds:
/// `48h0m0s`, `30m0s`, `10s`.
pub fn format_go_duration(d: Duration) -> String {
    let secs = d.as_secs();
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{h}h{m}m{s}s")
    } else if m > 0 {
        format!("{m}m{s}s")
    } else {
        format!("{s}s")
    }
}

/// Parse a Go-style duration (`48h`, `1h30m`, `90s`). Fractions and
/// sub-second units are not accepted; claims live for whole seconds.
pub fn parse_go_duration(input: &str) -> Result<Duration, String> {
    let s = input.trim();
    if s.is_empty() {
        return Err("empty duration".into());
    }
    if s == "0" {
        return Ok(Duration::ZERO);
    }

    let mut total: u64 = 0;
    let mut number = String::new();
    let mut matched = false;
    for c in s.chars() {
        if c.is_ascii_digit() {
            number.push(c);
            continue;
        }
        let value: u64 = number
            .parse()
            .map_err(|_| format!("invalid duration {input:?}"))?;
        number.clear();
        let unit = match c {
            'h' => 3600,
            'm' => 60,
            's' => 1,
            _ => return Err(format!("unknown unit {c:?} in duration {input:?}")),
        };
        total = total
            .checked_add(value.checked_mul(unit).ok_or("duration overflow")?)
            .ok_or("duration overflow")?;
        matched = true;
    }
    if !number.is_empty() || !matched {
        return Err(format!("missing unit in duration {input:?}"));
    }
    Ok(Duration::from_secs(total))
}

/// Serde adapter for Go-style duration fields.
mod go_duration {
    use std::time::Duration;

    use serde::{de::Error as _, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_go_duration(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        super::parse_go_duration(&raw).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXAMPLE: &str = r#"
parent_zone: example.net.
ttl: 48h
provider:
  random: { enable: true, id_len: 5 }
  wordlist: { enable: false }
dns:
  address: "::"
  port: 5354
  mname: hostmaster.example.net.
  ns: [ns1.example.net., ns2.example.net.]
net: { address: "", port: 9999 }
http: { address: "", port: 8053 }
store:
  file: /tmp/claims.db
"#;

    #[test]
    fn parse_example_config() {
        let mut config: Config = serde_yaml::from_str(EXAMPLE).unwrap();
        config.parent_zone = config.parent_zone.trim_end_matches('.').to_string();
        config.validate().unwrap();

        assert_eq!(config.parent_zone, "example.net");
        assert_eq!(config.zone_fqdn(), "example.net.");
        assert_eq!(config.ttl, Duration::from_secs(48 * 3600));
        assert!(config.provider.random.enable);
        assert_eq!(config.provider.random.id_len, 5);
        assert_eq!(config.dns.ns.len(), 2);
        assert!(config.dns.dnssec_key.is_none());
        assert_eq!(config.store.sweep_interval, Duration::from_secs(3600));
    }

    #[test]
    fn rejects_config_without_providers() {
        let mut config: Config = serde_yaml::from_str(EXAMPLE).unwrap();
        config.provider.random.enable = false;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_config_without_ns() {
        let mut config: Config = serde_yaml::from_str(EXAMPLE).unwrap();
        config.dns.ns.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn go_duration_formatting() {
        assert_eq!(format_go_duration(Duration::from_secs(48 * 3600)), "48h0m0s");
        assert_eq!(format_go_duration(Duration::from_secs(30 * 60)), "30m0s");
        assert_eq!(format_go_duration(Duration::from_secs(10)), "10s");
        assert_eq!(format_go_duration(Duration::from_secs(3661)), "1h1m1s");
        assert_eq!(format_go_duration(Duration::ZERO), "0s");
    }

    #[test]
    fn go_duration_parsing() {
        assert_eq!(parse_go_duration("48h").unwrap(), Duration::from_secs(48 * 3600));
        assert_eq!(parse_go_duration("1h30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_go_duration("90s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_go_duration("48h0m0s").unwrap(), Duration::from_secs(48 * 3600));
        assert!(parse_go_duration("48").is_err());
        assert!(parse_go_duration("h").is_err());
        assert!(parse_go_duration("10x").is_err());
        assert!(parse_go_duration("").is_err());
    }

    #[test]
    fn listen_addr_defaults_to_unspecified_v6() {
        let addr = listen_addr("", 53).unwrap();
        assert_eq!(addr, "[::]:53".parse().unwrap());

        let addr = listen_addr("127.0.0.1", 5353).unwrap();
        assert_eq!(addr, "127.0.0.1:5353".parse().unwrap());

        assert!(listen_addr("not-an-ip", 53).is_err());
    }
}
