//! Agent configuration.
//!
//! TOML at `$CANBRIDGE_CONFIG`, or `canbridge/agent.toml` under
//! `$XDG_CONFIG_HOME` (falling back to `~/.config`). A missing file is
//! created with defaults, which also pins the generated agent id.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use canbridge_control::CommandPolicy;
use canbridge_discovery::scanner::DEFAULT_PORT;
use rand::Rng;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "new_agent_id")]
    pub agent_id: String,
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default = "default_backend_url")]
    pub backend_url: String,
    #[serde(default)]
    pub token: String,
    /// Local address of the REMP socket.
    #[serde(default = "default_udp_bind")]
    pub udp_bind: SocketAddr,
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
    #[serde(default = "default_discovery_interval")]
    pub discovery_interval_secs: u64,
    #[serde(default = "default_stale_timeout")]
    pub stale_timeout_secs: u64,
    #[serde(default = "default_heartbeat")]
    pub heartbeat_secs: u64,
    /// Per-request timeout for dongle operations.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    /// Host commands the backend may run on this machine.
    #[serde(default)]
    pub commands: Vec<CommandPolicy>,
}

fn new_agent_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn default_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "canbridge-agent".into())
}

fn default_backend_url() -> String {
    "ws://127.0.0.1:9180".into()
}

fn default_udp_bind() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 0))
}

fn default_discovery_port() -> u16 {
    DEFAULT_PORT
}

fn default_discovery_interval() -> u64 {
    5
}

fn default_stale_timeout() -> u64 {
    30
}

fn default_heartbeat() -> u64 {
    15
}

fn default_request_timeout() -> u64 {
    3000
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            agent_id: new_agent_id(),
            name: default_name(),
            backend_url: default_backend_url(),
            token: String::new(),
            udp_bind: default_udp_bind(),
            discovery_port: default_discovery_port(),
            discovery_interval_secs: default_discovery_interval(),
            stale_timeout_secs: default_stale_timeout(),
            heartbeat_secs: default_heartbeat(),
            request_timeout_ms: default_request_timeout(),
            reconnect: ReconnectConfig::default(),
            commands: Vec::new(),
        }
    }
}

impl AgentConfig {
    /// Loads the file at `path`, creating it with defaults when missing.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            let config = Self::default();
            config.save(path)?;
            tracing::info!(path = %path.display(), "wrote default agent config");
            return Ok(config);
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: Self =
            toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))?;

        // Persist a freshly generated id so the agent keeps its identity.
        let table: toml::Table = toml::from_str(&content)?;
        if !table.contains_key("agent_id") {
            config.save(path)?;
        }
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let text = toml::to_string_pretty(self)?;
        std::fs::write(path, text).with_context(|| format!("writing {}", path.display()))?;
        set_permissions_0600(path);
        tracing::debug!("agent configuration saved");
        Ok(())
    }

    pub fn discovery_interval(&self) -> Duration {
        Duration::from_secs(self.discovery_interval_secs.max(1))
    }

    pub fn stale_timeout(&self) -> Duration {
        Duration::from_secs(self.stale_timeout_secs.max(1))
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs.max(1))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms.max(1))
    }
}

/// Backoff for reconnecting to the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconnectConfig {
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
}

fn default_initial_delay() -> u64 {
    250
}

fn default_max_delay() -> u64 {
    15_000
}

fn default_backoff_factor() -> f64 {
    2.0
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
            backoff_factor: default_backoff_factor(),
        }
    }
}

impl ReconnectConfig {
    /// Delay before the given attempt (1-based), with ±25% jitter.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(63) as i32;
        let secs = self.initial_delay_ms as f64 / 1000.0 * self.backoff_factor.powi(exp);
        let capped = secs.min(self.max_delay_ms as f64 / 1000.0);
        let offset: f64 = rand::thread_rng().gen_range(-1.0..=1.0);
        let with_jitter = (capped + capped * 0.25 * offset).max(0.05);
        Duration::from_secs_f64(with_jitter)
    }
}

fn set_permissions_0600(path: &Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600));
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
}

/// Resolves the config file path.
pub fn config_path() -> anyhow::Result<PathBuf> {
    if let Some(p) = std::env::var_os("CANBRIDGE_CONFIG") {
        return Ok(PathBuf::from(p));
    }
    let base = match std::env::var_os("XDG_CONFIG_HOME") {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => {
            let home = std::env::var_os("HOME").context("HOME is not set")?;
            PathBuf::from(home).join(".config")
        }
    };
    Ok(base.join("canbridge").join("agent.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_is_created_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("agent.toml");

        let first = AgentConfig::load(&path).unwrap();
        assert!(path.exists());
        assert_eq!(first.backend_url, "ws://127.0.0.1:9180");
        assert_eq!(first.heartbeat_interval(), Duration::from_secs(15));
        assert!(uuid::Uuid::parse_str(&first.agent_id).is_ok());

        // Same identity on the next start.
        let second = AgentConfig::load(&path).unwrap();
        assert_eq!(first, second);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn partial_file_fills_defaults_and_pins_id() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.toml");
        std::fs::write(
            &path,
            r#"
backend_url = "ws://backend.lan:9180"
token = "s3cret"

[[commands]]
name = "uptime"
max_args = 0
timeout = 5
"#,
        )
        .unwrap();

        let cfg = AgentConfig::load(&path).unwrap();
        assert_eq!(cfg.backend_url, "ws://backend.lan:9180");
        assert_eq!(cfg.discovery_port, DEFAULT_PORT);
        assert_eq!(cfg.commands.len(), 1);
        assert_eq!(cfg.commands[0].timeout, Duration::from_secs(5));
        assert_eq!(cfg.reconnect, ReconnectConfig::default());

        let again = AgentConfig::load(&path).unwrap();
        assert_eq!(cfg.agent_id, again.agent_id);
    }

    #[test]
    fn invalid_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.toml");
        std::fs::write(&path, "udp_bind = 12").unwrap();
        assert!(AgentConfig::load(&path).is_err());
    }

    #[test]
    fn reconnect_backoff() {
        let cfg = ReconnectConfig::default();
        for _ in 0..20 {
            let first = cfg.delay_for_attempt(1).as_secs_f64();
            assert!((0.1875..=0.3125).contains(&first), "{first}");

            let third = cfg.delay_for_attempt(3).as_secs_f64();
            assert!((0.75..=1.25).contains(&third), "{third}");

            let capped = cfg.delay_for_attempt(30).as_secs_f64();
            assert!((11.25..=18.75).contains(&capped), "{capped}");
        }
    }
}
