use figment::{
    providers::{Env, Format, Serialized, Toml, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::warn;

/// Default location of the configuration file.
const DEFAULT_CONFIG_FILE: &str = "labeld.yaml";

/// Upper bound for every interval and timeout, in seconds (30 days).
const MAX_SECONDS: u64 = 30 * 24 * 60 * 60;

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Config {
    /// Container runtime hosts to watch.
    pub nodes: Vec<String>,
    pub tls: TlsConfig,
    pub poll: PollConfig,
    pub ping: PingConfig,
    pub runtime: RuntimeConfig,
    pub cache: CacheConfig,
    /// Event statuses that trigger an inspect.
    pub events: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook: Option<WebhookConfig>,
    pub rfc2136: Rfc2136Config,
    pub supervisor: SupervisorConfig,
    pub reload: ReloadConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct TlsConfig {
    pub ca: PathBuf,
    pub crt: PathBuf,
    pub key: PathBuf,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct PollConfig {
    /// Seconds between full sweeps.
    pub interval: u64,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct PingConfig {
    /// Seconds between health probes.
    pub interval: f64,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RuntimeConfig {
    /// Seconds before a runtime API call is abandoned.
    pub timeout: u64,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct CacheConfig {
    pub url: String,
    /// Seconds added to the poll interval to form the entry TTL.
    pub buffer: u64,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct WebhookConfig {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<WebhookAuth>,
    #[serde(default = "default_webhook_timeout")]
    pub timeout: f64,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct WebhookAuth {
    /// `user:password`
    pub basic: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Rfc2136Config {
    /// Drop `update add` statements the zone already answers.  Also set
    /// by `rfc2136.update-only`.
    pub verify: bool,
    pub nsupdate: PathBuf,
    /// Seconds before an update transaction is abandoned.
    pub timeout: u64,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SupervisorConfig {
    /// Seconds between worker health checks.
    pub interval: f64,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ReloadConfig {
    /// Seconds between configuration re-reads; disabled when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interval: Option<u64>,
}

fn default_webhook_timeout() -> f64 {
    2.5
}

impl Default for Config {
    fn default() -> Self {
        Self {
            nodes: Vec::new(),
            tls: TlsConfig {
                ca: "ssl/ca.crt".into(),
                crt: "ssl/labels.crt".into(),
                key: "ssl/labels.key".into(),
                port: 2376,
            },
            poll: PollConfig { interval: 300 },
            ping: PingConfig { interval: 2.5 },
            runtime: RuntimeConfig { timeout: 10 },
            cache: CacheConfig {
                url: "rediss://localhost:6379/0#insecure".into(),
                buffer: 30,
            },
            events: vec!["start".into(), "die".into()],
            webhook: None,
            rfc2136: Rfc2136Config {
                verify: false,
                nsupdate: "/usr/bin/nsupdate".into(),
                timeout: 30,
            },
            supervisor: SupervisorConfig { interval: 5.0 },
            reload: ReloadConfig { interval: None },
        }
    }
}

impl Config {
    /// Load from the default location (or `LABELD_CONFIG`) and the
    /// environment.
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(config_path())
    }

    pub fn load_from(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let defaults = Figment::from(Serialized::defaults(Config::default()));
        let file = if path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"))
        {
            defaults.merge(Toml::file(path))
        } else {
            defaults.merge(Yaml::file(path))
        };

        // `update-only` is the legacy name of `verify`; fold it in before the
        // environment so `LABELD_RFC2136__VERIFY` still has the last word.
        let file = match file.find_value("rfc2136.update-only") {
            Ok(value) => {
                let verify = value.to_bool().ok_or_else(|| {
                    anyhow::anyhow!("Failed to load configuration: rfc2136.update-only must be a boolean")
                })?;
                file.merge(("rfc2136.verify", verify))
            }
            Err(_) => file,
        };

        let config: Config = file
            .merge(Env::prefixed("LABELD_").ignore(&["CONFIG"]).split("__"))
            .extract()
            .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

        Ok(config)
    }

    /// Refuse to start without TLS material or with an unusable interval;
    /// an empty node list only warns.
    pub fn validate(&self) -> anyhow::Result<()> {
        for (what, path) in [
            ("CA certificate", &self.tls.ca),
            ("client certificate", &self.tls.crt),
            ("client key", &self.tls.key),
        ] {
            if !path.is_file() {
                anyhow::bail!("Missing TLS {}: {}", what, path.display());
            }
        }
        self.validate_intervals()?;
        if self.nodes.is_empty() {
            warn!("No nodes configured, nothing to watch");
        }
        Ok(())
    }

    /// Every interval and timeout must convert to a non-zero duration of
    /// at most 30 days.
    pub fn validate_intervals(&self) -> anyhow::Result<()> {
        seconds("poll.interval", self.poll.interval as f64)?;
        seconds("ping.interval", self.ping.interval)?;
        seconds("supervisor.interval", self.supervisor.interval)?;
        seconds("runtime.timeout", self.runtime.timeout as f64)?;
        seconds("rfc2136.timeout", self.rfc2136.timeout as f64)?;
        if self.cache.buffer > MAX_SECONDS {
            anyhow::bail!("cache.buffer must not exceed {} seconds", MAX_SECONDS);
        }
        if let Some(reload) = self.reload.interval.filter(|s| *s > 0) {
            seconds("reload.interval", reload as f64)?;
        }
        if let Some(webhook) = &self.webhook {
            seconds("webhook.timeout", webhook.timeout)?;
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll.interval.clamp(1, MAX_SECONDS))
    }

    pub fn ping_interval(&self) -> Duration {
        seconds("ping.interval", self.ping.interval).unwrap_or(Duration::from_millis(2500))
    }

    pub fn supervisor_interval(&self) -> Duration {
        seconds("supervisor.interval", self.supervisor.interval).unwrap_or(Duration::from_secs(5))
    }

    pub fn reload_interval(&self) -> Option<Duration> {
        self.reload
            .interval
            .filter(|s| *s > 0)
            .map(|s| Duration::from_secs(s.min(MAX_SECONDS)))
    }

    /// TTL of cache entries: one poll interval plus the buffer, so entries
    /// outlive the gap between two sweeps.
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.poll.interval.saturating_add(self.cache.buffer))
    }

    /// Node descriptors for every configured host.
    pub fn node_list(&self) -> Vec<Node> {
        self.nodes
            .iter()
            .map(|host| Node {
                id: host.clone(),
                port: self.tls.port,
                tls: self.tls.clone(),
                poll_interval: self.poll_interval(),
                ping_interval: self.ping_interval(),
                timeout: Duration::from_secs(self.runtime.timeout),
                events: self.events.iter().map(|e| e.to_ascii_lowercase()).collect(),
            })
            .collect()
    }
}

/// `LABELD_CONFIG`, else `labeld.yaml`, else `labeld.toml` when only that
/// one exists.
/// Convert a configured number of seconds, rejecting negative, infinite,
/// sub-nanosecond and overlong values.
pub fn seconds(what: &str, value: f64) -> anyhow::Result<Duration> {
    let duration = Duration::try_from_secs_f64(value)
        .map_err(|e| anyhow::anyhow!("{} is not a valid number of seconds ({}): {}", what, value, e))?;
    if duration.is_zero() {
        anyhow::bail!("{} must be greater than zero", what);
    }
    if duration > Duration::from_secs(MAX_SECONDS) {
        anyhow::bail!("{} must not exceed {} seconds", what, MAX_SECONDS);
    }
    Ok(duration)
}

fn config_path() -> PathBuf {
    if let Some(path) = std::env::var_os("LABELD_CONFIG") {
        return PathBuf::from(path);
    }
    let yaml = PathBuf::from(DEFAULT_CONFIG_FILE);
    let toml = yaml.with_extension("toml");
    if !yaml.exists() && toml.exists() {
        toml
    } else {
        yaml
    }
}

/// A configured container runtime endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    /// Host address; unique across the node set.
    pub id: String,
    pub port: u16,
    pub tls: TlsConfig,
    pub poll_interval: Duration,
    pub ping_interval: Duration,
    pub timeout: Duration,
    /// Accepted event statuses, lowercase.
    pub events: Vec<String>,
}

impl Node {
    pub fn accepts(&self, status: &str) -> bool {
        self.events.iter().any(|e| e.eq_ignore_ascii_case(status))
    }
}

/// Where the orchestrator gets its node set from.
pub trait NodeSource: Send {
    fn nodes(&self) -> anyhow::Result<Vec<Node>>;
}

/// Re-reads the configuration file on every call.
pub struct ConfigFile {
    path: PathBuf,
}

impl ConfigFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn from_env() -> Self {
        Self::new(config_path())
    }
}

impl NodeSource for ConfigFile {
    fn nodes(&self) -> anyhow::Result<Vec<Node>> {
        let config = Config::load_from(&self.path)?;
        config.validate_intervals()?;
        Ok(config.node_list())
    }
}
