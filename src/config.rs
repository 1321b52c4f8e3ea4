//! Configuration loading.
//!
//! One TOML file describes the dispatcher, the optional HTTP listener, the
//! optional contacts directory and every device:
//!
//! ```toml
//! [dispatcher]
//! app_lock = "/var/run/smstoxmpp.lock"
//!
//! [devices.phone1]
//! xmpp_server = "jabber.example.com"
//! xmpp_username = "sms-phone1"
//! xmpp_password = "secret"
//! xmpp_receiver = "me@example.com"
//! gateway_type = "eu.apksoft.android.smsgateway"
//! gateway_path = "auto"
//! ```
//!
//! Path precedence: `--config` > `$SMSTOXMPP_CONFIG` > `~/.smstoxmpp/config.toml`.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

/// Environment variable naming the config file.
pub const CONFIG_PATH_ENV: &str = "SMSTOXMPP_CONFIG";

/// Top-level configuration. Immutable once loaded.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Process-wide settings.
    #[serde(default)]
    pub dispatcher: DispatcherConfig,

    /// HTTP listener for inbound SMS.
    #[serde(default)]
    pub listener: ListenerConfig,

    /// Contacts directory sync.
    #[serde(default)]
    pub contacts: ContactsConfig,

    /// Devices keyed by identifier. Ordered so startup is deterministic.
    #[serde(default)]
    pub devices: BTreeMap<String, Arc<DeviceConfig>>,
}

/// Process-wide dispatcher settings.
#[derive(Debug, Clone, Deserialize)]
pub struct DispatcherConfig {
    /// Lock file guarding against a second dispatcher.
    #[serde(default = "default_app_lock")]
    pub app_lock: PathBuf,

    /// Directory for the rolling log file.
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,

    /// Upper bound on an encoded bus payload.
    #[serde(default = "default_max_payload")]
    pub max_payload_bytes: usize,

    /// How long a worker waits for chat events per loop iteration.
    #[serde(default = "default_event_wait_ms")]
    pub event_wait_ms: u64,

    /// How long a worker waits for a contacts reply.
    #[serde(default = "default_contacts_timeout_ms")]
    pub contacts_timeout_ms: u64,

    /// Minimum interval between unforced gateway health probes.
    #[serde(default = "default_health_check_frequency")]
    pub health_check_frequency_secs: u64,

    /// Connect timeout for one gateway health probe.
    #[serde(default = "default_health_check_timeout")]
    pub health_check_timeout_secs: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            app_lock: default_app_lock(),
            log_dir: default_log_dir(),
            max_payload_bytes: default_max_payload(),
            event_wait_ms: default_event_wait_ms(),
            contacts_timeout_ms: default_contacts_timeout_ms(),
            health_check_frequency_secs: default_health_check_frequency(),
            health_check_timeout_secs: default_health_check_timeout(),
        }
    }
}

impl DispatcherConfig {
    /// Timing knobs as durations.
    pub fn timings(&self) -> Timings {
        Timings {
            event_wait: Duration::from_millis(self.event_wait_ms),
            contacts_timeout: Duration::from_millis(self.contacts_timeout_ms),
            health_check_frequency: Duration::from_secs(self.health_check_frequency_secs),
            health_check_timeout: Duration::from_secs(self.health_check_timeout_secs),
        }
    }
}

/// Timing knobs handed to each worker at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timings {
    /// Bounded wait for chat events.
    pub event_wait: Duration,
    /// Bounded wait for a contacts reply.
    pub contacts_timeout: Duration,
    /// Health memo window.
    pub health_check_frequency: Duration,
    /// Health probe connect timeout.
    pub health_check_timeout: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        DispatcherConfig::default().timings()
    }
}

/// HTTP listener settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ListenerConfig {
    /// Whether to run the listener in-process.
    #[serde(default)]
    pub enabled: bool,

    /// Address to bind.
    #[serde(default = "default_listener_bind")]
    pub bind: SocketAddr,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind: default_listener_bind(),
        }
    }
}

/// Contacts directory settings.
#[derive(Clone, Deserialize)]
pub struct ContactsConfig {
    /// Whether to launch the contacts resolver.
    #[serde(default)]
    pub enabled: bool,

    /// CardDAV address book URL.
    #[serde(default)]
    pub url: String,

    /// Directory username.
    #[serde(default)]
    pub username: String,

    /// Directory password.
    #[serde(default)]
    pub password: String,

    /// Directory holding one cached record per entry.
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,

    /// Optional periodic rescan. Unset means rescan only on request.
    #[serde(default)]
    pub rescan_interval_secs: Option<u64>,
}

impl Default for ContactsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: String::new(),
            username: String::new(),
            password: String::new(),
            cache_dir: default_cache_dir(),
            rescan_interval_secs: None,
        }
    }
}

impl std::fmt::Debug for ContactsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContactsConfig")
            .field("enabled", &self.enabled)
            .field("url", &self.url)
            .field("username", &self.username)
            .field("password", &"__REDACTED__")
            .field("cache_dir", &self.cache_dir)
            .field("rescan_interval_secs", &self.rescan_interval_secs)
            .finish()
    }
}

/// One configured device.
///
/// Chat settings are optional at load time; the device's worker reports a
/// missing value and exits without affecting the other devices.
#[derive(Clone, Default, Deserialize)]
pub struct DeviceConfig {
    /// Chat server host.
    pub xmpp_server: Option<String>,

    /// Chat server port.
    #[serde(default = "default_xmpp_port")]
    pub xmpp_port: u16,

    /// Chat account username.
    pub xmpp_username: Option<String>,

    /// Chat account password.
    #[serde(default)]
    pub xmpp_password: String,

    /// Chat domain, when it differs from the server host.
    pub xmpp_domain: Option<String>,

    /// The one peer address allowed to talk to this device.
    pub xmpp_receiver: Option<String>,

    /// Gateway registry tag.
    pub gateway_type: String,

    /// Gateway address: `auto`, `dynamic` or `host[:port]`.
    #[serde(default)]
    pub gateway_path: String,
}

impl std::fmt::Debug for DeviceConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceConfig")
            .field("xmpp_server", &self.xmpp_server)
            .field("xmpp_port", &self.xmpp_port)
            .field("xmpp_username", &self.xmpp_username)
            .field("xmpp_password", &"__REDACTED__")
            .field("xmpp_domain", &self.xmpp_domain)
            .field("xmpp_receiver", &self.xmpp_receiver)
            .field("gateway_type", &self.gateway_type)
            .field("gateway_path", &self.gateway_path)
            .finish()
    }
}

impl Config {
    /// Parse a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is malformed or misses required keys.
    pub fn from_toml(toml_str: &str) -> anyhow::Result<Self> {
        toml::from_str(toml_str).context("failed to parse config TOML")
    }
}

// Default value functions for serde

fn default_app_lock() -> PathBuf {
    std::env::temp_dir().join("smstoxmpp.lock")
}
fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}
fn default_max_payload() -> usize {
    crate::bus::DEFAULT_MAX_PAYLOAD
}
fn default_event_wait_ms() -> u64 {
    1000
}
fn default_contacts_timeout_ms() -> u64 {
    1000
}
fn default_health_check_frequency() -> u64 {
    60
}
fn default_health_check_timeout() -> u64 {
    2
}
fn default_listener_bind() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}
fn default_cache_dir() -> PathBuf {
    PathBuf::from("contacts")
}
fn default_xmpp_port() -> u16 {
    5222
}

/// Load the configuration from a TOML file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed.
pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read config at {}: {e}", path.display()))?;
    let config: Config = toml::from_str(&contents)
        .map_err(|e| anyhow::anyhow!("failed to parse config at {}: {e}", path.display()))?;
    Ok(config)
}

/// Resolve which config file to load.
///
/// Takes an env resolver so tests do not have to mutate the process
/// environment.
///
/// # Errors
///
/// Returns an error if no explicit path is given and the home directory
/// cannot be determined.
pub fn resolve_config_path(
    explicit: Option<&Path>,
    env: impl Fn(&str) -> Option<String>,
) -> anyhow::Result<PathBuf> {
    if let Some(path) = explicit {
        return Ok(path.to_path_buf());
    }
    if let Some(path) = env(CONFIG_PATH_ENV) {
        return Ok(PathBuf::from(path));
    }
    Ok(config_dir()?.join("config.toml"))
}

/// Resolve the default config directory (`~/.smstoxmpp/`).
///
/// # Errors
///
/// Returns an error if the home directory cannot be determined.
pub fn config_dir() -> anyhow::Result<PathBuf> {
    let home = directories::BaseDirs::new()
        .ok_or_else(|| anyhow::anyhow!("cannot determine home directory"))?;
    Ok(home.home_dir().join(".smstoxmpp"))
}
