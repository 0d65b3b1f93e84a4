/// Bridge configuration: a JSON file plus environment overrides.
///
/// `TIDEPOOL_CONFIG` names the file (default `tidepool.json`). A missing
/// default file is not an error; a missing file that was asked for is.
/// `TIDEPOOL_NETWORKS` adds or overrides networks as comma-separated
/// `host[:port]` entries, port 6697 switching TLS on.
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::info;

use crate::error::ConfigError;

pub const CONFIG_ENV: &str = "TIDEPOOL_CONFIG";
pub const NETWORKS_ENV: &str = "TIDEPOOL_NETWORKS";
const DEFAULT_CONFIG_PATH: &str = "tidepool.json";

const DEFAULT_PORT: u16 = 6667;
const DEFAULT_TLS_PORT: u16 = 6697;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Named in CTCP VERSION replies.
    pub homeserver_domain: String,
    pub networks: Vec<NetworkConfig>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            homeserver_domain: "localhost".into(),
            networks: Vec::new(),
        }
    }
}

impl BridgeConfig {
    /// Load from `TIDEPOOL_CONFIG` and apply `TIDEPOOL_NETWORKS`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = match std::env::var(CONFIG_ENV) {
            Ok(path) => Self::load(Path::new(&path))?,
            Err(_) if Path::new(DEFAULT_CONFIG_PATH).exists() => {
                Self::load(Path::new(DEFAULT_CONFIG_PATH))?
            }
            Err(_) => Self::default(),
        };
        if let Ok(list) = std::env::var(NETWORKS_ENV) {
            config.apply_network_overrides(&list)?;
        }
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::parse(&raw)?;
        info!(path = %path.display(), networks = config.networks.len(), "config: loaded");
        Ok(config)
    }

    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for net in &self.networks {
            if net.domain.trim().is_empty() {
                return Err(ConfigError::InvalidNetwork("empty domain".into()));
            }
            let debounce = &net.quit_debounce;
            if debounce.delay_min_ms > debounce.delay_max_ms {
                return Err(ConfigError::InvalidNetwork(format!(
                    "{}: quit_debounce.delay_min_ms exceeds delay_max_ms",
                    net.domain
                )));
            }
        }
        Ok(())
    }

    /// Merge `host[:port]` entries into the network list.
    pub fn apply_network_overrides(&mut self, list: &str) -> Result<(), ConfigError> {
        for entry in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let (host, port) = parse_network_entry(entry)?;
            let tls = port == DEFAULT_TLS_PORT;
            match self.networks.iter_mut().find(|n| n.domain == host) {
                Some(existing) => {
                    existing.port = port;
                    existing.tls = tls;
                }
                None => self.networks.push(NetworkConfig {
                    domain: host.to_owned(),
                    port,
                    tls,
                    ..NetworkConfig::default()
                }),
            }
            info!(host, port, tls, "config: network from {NETWORKS_ENV}");
        }
        Ok(())
    }

    pub fn network(&self, domain: &str) -> Option<&NetworkConfig> {
        self.networks.iter().find(|n| n.domain == domain)
    }
}

fn parse_network_entry(entry: &str) -> Result<(&str, u16), ConfigError> {
    // Bracketed IPv6 literals keep their colons.
    if let Some(rest) = entry.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| ConfigError::InvalidNetwork(entry.to_owned()))?;
        let port = match tail.strip_prefix(':') {
            Some(p) => p.parse().map_err(|_| ConfigError::InvalidNetwork(entry.to_owned()))?,
            None => DEFAULT_PORT,
        };
        return Ok((host, port));
    }
    match entry.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => {
            let port = port
                .parse()
                .map_err(|_| ConfigError::InvalidNetwork(entry.to_owned()))?;
            Ok((host, port))
        }
        _ => Ok((entry, DEFAULT_PORT)),
    }
}

/// One IRC network and how clients on it behave.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub domain: String,
    pub port: u16,
    pub tls: bool,
    /// Extra trust anchors (PEM) on top of the bundled web roots.
    pub ca_file: Option<PathBuf>,
    /// Alternative hostnames; each attempt picks one of these or `domain`.
    pub additional_addresses: Vec<String>,
    pub local_address: Option<IpAddr>,
    /// Server password sent as PASS.
    pub password: Option<String>,
    pub user_name: String,
    pub real_name: String,

    pub reconnect_interval_ms: u64,
    /// Lanes in the reconnect pool; 0 reconnects without a pool.
    pub concurrent_reconnect_limit: usize,
    /// 0 disables the idle timer.
    pub idle_timeout_secs: u64,
    pub join_attempts: u32,
    pub join_timeout_ms: u64,
    pub nick_timeout_ms: u64,
    pub flood_delay_ms: u64,
    pub ping_rate_ms: u64,
    pub ping_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    /// 0 never expires outbound actions.
    pub expiry_time_secs: u64,

    pub connection_notices: bool,
    /// Membership mirrored onto IRC keeps clients connected while idle.
    pub membership_sync_to_irc: bool,
    pub channel_keys: HashMap<String, String>,

    pub bot: BotConfig,
    pub quit_debounce: QuitDebounceConfig,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            domain: String::new(),
            port: DEFAULT_PORT,
            tls: false,
            ca_file: None,
            additional_addresses: Vec::new(),
            local_address: None,
            password: None,
            user_name: "tidepool".into(),
            real_name: "tidepool bridge user".into(),
            reconnect_interval_ms: 5000,
            concurrent_reconnect_limit: 50,
            idle_timeout_secs: 172_800,
            join_attempts: 5,
            join_timeout_ms: 15_000,
            nick_timeout_ms: 10_000,
            flood_delay_ms: 700,
            ping_rate_ms: 60_000,
            ping_timeout_ms: 600_000,
            connect_timeout_ms: 30_000,
            expiry_time_secs: 0,
            connection_notices: true,
            membership_sync_to_irc: false,
            channel_keys: HashMap::new(),
            bot: BotConfig::default(),
            quit_debounce: QuitDebounceConfig::default(),
        }
    }
}

impl NetworkConfig {
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            ..Self::default()
        }
    }

    pub fn reconnect_interval(&self) -> Option<Duration> {
        (self.reconnect_interval_ms > 0).then(|| Duration::from_millis(self.reconnect_interval_ms))
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }

    pub fn expiry(&self) -> Option<Duration> {
        (self.expiry_time_secs > 0).then(|| Duration::from_secs(self.expiry_time_secs))
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    pub fn nick_timeout(&self) -> Duration {
        Duration::from_millis(self.nick_timeout_ms)
    }

    pub fn channel_key(&self, channel: &str) -> Option<&str> {
        self.channel_keys.get(channel).map(String::as_str)
    }

    pub fn timing(&self) -> ConnectionTiming {
        ConnectionTiming {
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            ping_rate: Duration::from_millis(self.ping_rate_ms),
            ping_timeout: Duration::from_millis(self.ping_timeout_ms),
            flood_delay: Duration::from_millis(self.flood_delay_ms),
        }
    }
}

/// Timers owned by one connection task.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionTiming {
    pub connect_timeout: Duration,
    pub ping_rate: Duration,
    pub ping_timeout: Duration,
    pub flood_delay: Duration,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BotConfig {
    /// With the bot enabled it alone reports shared channel events.
    pub enabled: bool,
    pub nick: String,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            nick: "appservicebot".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QuitDebounceConfig {
    pub enabled: bool,
    /// More departures than this within a second counts as a net split.
    pub quits_per_second: usize,
    pub delay_min_ms: u64,
    pub delay_max_ms: u64,
}

impl Default for QuitDebounceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            quits_per_second: 5,
            delay_min_ms: 3_600_000,
            delay_max_ms: 7_200_000,
        }
    }
}
