//! Configuration management for the CCU event bridge
//!
//! Configuration comes from a TOML file or from the environment variables
//! the bridge has always used (`SERVER_IP`, `HM_SERVER_IP`, `HM_DEVICES`, ...).
//! Either way the result is validated once at startup and never changes.

use crate::error::{BridgeError, Result};
use crate::filter::FilterConfig;
use crate::registration::BackoffPolicy;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

/// Complete bridge configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    pub server: ServerConfig,

    #[serde(default)]
    pub ccu: CcuConfig,

    pub interfaces: Vec<InterfaceConfig>,

    pub filter: FilterConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub watchdog: WatchdogConfig,

    #[serde(default)]
    pub webhook: Option<WebhookConfig>,
}

/// Callback listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address the shared listener binds to
    #[serde(default = "default_bind_host")]
    pub bind_host: String,

    /// Port of the shared listener
    pub port: u16,

    /// Host advertised to the CCU in the callback URL
    #[serde(default)]
    pub callback_host: Option<String>,

    /// Credentials the CCU must present on callbacks
    #[serde(default)]
    pub auth: Option<Credentials>,

    /// Deadline for handling one inbound call
    #[serde(default = "default_processing_timeout", with = "humantime_serde")]
    pub processing_timeout: Duration,

    /// Largest accepted callback body; `newDevices` of big installations runs to megabytes
    #[serde(default = "default_max_body_size")]
    pub max_body_size: usize,
}

/// Outbound settings shared by all interfaces
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CcuConfig {
    #[serde(default)]
    pub credentials: Option<Credentials>,

    /// Timeout of a single init call
    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,

    /// Recognizable prefix of generated client identifiers
    #[serde(default = "default_client_id_prefix")]
    pub client_id_prefix: String,

    #[serde(default)]
    pub retry: BackoffPolicy,

    /// How often every subscription is renewed and lost ones retried; zero disables
    #[serde(default = "default_renew_interval", with = "humantime_serde")]
    pub renew_interval: Duration,
}

/// One CCU interface to subscribe to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterfaceConfig {
    /// Interface name, e.g. `HmIP-RF`
    pub id: String,

    /// XML-RPC endpoint of the interface
    pub url: Url,

    /// Dedicated callback port; shares the main listener when unset
    #[serde(default)]
    pub callback_port: Option<u16>,
}

/// HTTP Basic Auth credentials
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    /// Value of an `Authorization: Basic ...` header
    pub fn basic_header(&self) -> String {
        use base64::Engine;
        let token = base64::engine::general_purpose::STANDARD
            .encode(format!("{}:{}", self.username, self.password));
        format!("Basic {token}")
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Where state records are kept
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StoreConfig {
    Sqlite { path: PathBuf },
    Memory,
}

/// Supervisor watchdog settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WatchdogConfig {
    /// Watchdog deadline; falls back to systemd's `WATCHDOG_USEC`
    #[serde(default, with = "humantime_serde")]
    pub timeout: Option<Duration>,
}

/// HTTP GET fired for selected parameters after a value was stored
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub url: Url,
    pub parameters: HashSet<String>,
    #[serde(default = "default_webhook_timeout", with = "humantime_serde")]
    pub timeout: Duration,
    /// Notifications in flight at once; further ones are dropped
    #[serde(default = "default_webhook_max_in_flight")]
    pub max_in_flight: usize,
}

fn default_bind_host() -> String {
    "0.0.0.0".to_string()
}

pub(crate) fn default_max_body_size() -> usize {
    64 * 1024 * 1024
}

fn default_processing_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(15)
}

fn default_webhook_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_webhook_max_in_flight() -> usize {
    32
}

fn default_renew_interval() -> Duration {
    Duration::from_secs(300)
}

fn default_client_id_prefix() -> String {
    "ccu-bridge".to_string()
}

impl Default for CcuConfig {
    fn default() -> Self {
        Self {
            credentials: None,
            request_timeout: default_request_timeout(),
            client_id_prefix: default_client_id_prefix(),
            retry: BackoffPolicy::default(),
            renew_interval: default_renew_interval(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        let base = dirs::data_local_dir().unwrap_or_else(|| PathBuf::from("."));
        Self::Sqlite {
            path: base.join("ccu-event-bridge").join("state.db"),
        }
    }
}

impl ServerConfig {
    /// Host placed into callback URLs
    pub fn advertised_host(&self) -> String {
        if let Some(host) = self.callback_host.as_ref().filter(|h| !h.is_empty()) {
            return host.clone();
        }
        if self.bind_host != "0.0.0.0" && self.bind_host != "::" {
            return self.bind_host.clone();
        }
        hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "localhost".to_string())
    }
}

impl InterfaceConfig {
    pub fn new(id: impl Into<String>, url: Url) -> Self {
        Self {
            id: id.into(),
            url,
            callback_port: None,
        }
    }
}

impl BridgeConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            BridgeError::config(format!("Cannot read {}: {e}", path.display()))
        })?;
        let config: Self = toml::from_str(&text)
            .map_err(|e| BridgeError::config(format!("Invalid {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from `.env`-style keys supplied by `lookup`
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let require = |key: &str| {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| BridgeError::config(format!("Missing required key {key}")))
        };
        let port = |key: &str, raw: String| {
            raw.trim()
                .parse::<u16>()
                .map_err(|e| BridgeError::config(format!("Invalid {key}: {e}")))
        };

        let server_ip = require("SERVER_IP")?;
        let server_port = port("SERVER_PORT", require("SERVER_PORT")?)?;
        let ccu_host = require("HM_SERVER_IP")?;

        let mut interfaces = Vec::new();
        if let Some(raw) = lookup("HM_SERVER_BIDCOS_PORT") {
            let p = port("HM_SERVER_BIDCOS_PORT", raw)?;
            interfaces.push(interface("BidCos-RF", &ccu_host, p, "")?);
        }
        if let Some(raw) = lookup("HM_SERVER_HMIP_PORT") {
            let p = port("HM_SERVER_HMIP_PORT", raw)?;
            interfaces.push(interface("HmIP-RF", &ccu_host, p, "")?);
        }
        if let Some(raw) = lookup("HM_SERVER_VIRTUALDEVICES_PORT") {
            let p = port("HM_SERVER_VIRTUALDEVICES_PORT", raw)?;
            interfaces.push(interface("VirtualDevices", &ccu_host, p, "groups")?);
        }

        let credentials = match (lookup("HM_USERNAME"), lookup("HM_PASSWORD")) {
            (Some(username), Some(password)) => Some(Credentials { username, password }),
            (None, None) => None,
            _ => {
                return Err(BridgeError::config(
                    "HM_USERNAME and HM_PASSWORD must be set together",
                ))
            }
        };

        let filter = FilterConfig::from_lists(
            &require("HM_DEVICES")?,
            &lookup("HM_PARAMETERS").unwrap_or_default(),
        );

        let store = match lookup("DB_FILE") {
            Some(path) if path == ":memory:" => StoreConfig::Memory,
            Some(path) => StoreConfig::Sqlite {
                path: PathBuf::from(path),
            },
            None => StoreConfig::default(),
        };

        let watchdog = WatchdogConfig {
            timeout: lookup("WATCHDOG_TIMEOUT")
                .map(|raw| {
                    humantime_serde::re::humantime::parse_duration(raw.trim())
                        .map_err(|e| BridgeError::config(format!("Invalid WATCHDOG_TIMEOUT: {e}")))
                })
                .transpose()?,
        };

        let webhook = match lookup("STATE_URL") {
            Some(raw) => Some(WebhookConfig {
                url: raw
                    .parse()
                    .map_err(|e| BridgeError::config(format!("Invalid STATE_URL: {e}")))?,
                parameters: lookup("STATE_PARAMETERS")
                    .unwrap_or_else(|| "WINDOW_STATE".to_string())
                    .split(',')
                    .map(str::trim)
                    .filter(|p| !p.is_empty())
                    .map(str::to_string)
                    .collect(),
                timeout: default_webhook_timeout(),
                max_in_flight: default_webhook_max_in_flight(),
            }),
            None => None,
        };

        let config = Self {
            server: ServerConfig {
                bind_host: server_ip,
                port: server_port,
                callback_host: lookup("CALLBACK_HOST"),
                auth: None,
                processing_timeout: default_processing_timeout(),
                max_body_size: default_max_body_size(),
            },
            ccu: CcuConfig {
                credentials,
                ..CcuConfig::default()
            },
            interfaces,
            filter,
            store,
            watchdog,
            webhook,
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.interfaces.is_empty() {
            return Err(BridgeError::config("At least one CCU interface is required"));
        }

        let mut seen = HashSet::new();
        for iface in &self.interfaces {
            if iface.id.trim().is_empty() {
                return Err(BridgeError::config("Interface id cannot be empty"));
            }
            if !seen.insert(iface.id.as_str()) {
                return Err(BridgeError::config(format!(
                    "Interface {} configured twice",
                    iface.id
                )));
            }
            if iface.url.scheme() != "http" && iface.url.scheme() != "https" {
                return Err(BridgeError::config(format!(
                    "Interface {} URL must use http or https scheme",
                    iface.id
                )));
            }
        }

        if self.filter.devices.is_empty() {
            return Err(BridgeError::config(
                "Device allow-list is empty, nothing would be stored",
            ));
        }

        if self.server.processing_timeout.is_zero() || self.ccu.request_timeout.is_zero() {
            return Err(BridgeError::config("Timeouts must be greater than zero"));
        }
        if self.server.max_body_size == 0 {
            return Err(BridgeError::config("server.max_body_size must be greater than zero"));
        }

        if self.ccu.retry.max_attempts == 0 {
            return Err(BridgeError::config("retry.max_attempts must be at least 1"));
        }

        if matches!(&self.webhook, Some(hook) if hook.max_in_flight == 0) {
            return Err(BridgeError::config("webhook.max_in_flight must be at least 1"));
        }

        Ok(())
    }
}

fn interface(id: &str, host: &str, port: u16, path: &str) -> Result<InterfaceConfig> {
    let raw = if host.starts_with("http://") || host.starts_with("https://") {
        format!("{host}:{port}/{path}")
    } else {
        format!("http://{host}:{port}/{path}")
    };
    let url = raw
        .parse()
        .map_err(|e| BridgeError::config(format!("Invalid URL for {id} ({raw}): {e}")))?;
    Ok(InterfaceConfig::new(id, url))
}
