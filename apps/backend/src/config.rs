//! Backend configuration.
//!
//! TOML at `$CANBRIDGE_CONFIG`, or `canbridge/backend.toml` under
//! `$XDG_CONFIG_HOME` (falling back to `~/.config`). A missing file is
//! created with defaults.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use canbridge_control::CommandPolicy;
use canbridge_pairing::PairingConfig;
use canbridge_relay::{DEFAULT_MAX_BUFFERED, Group};
use canbridge_stream::StreamConfig;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Where agents connect.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,
    /// Frames kept per group and direction while the far side is offline.
    #[serde(default = "default_max_buffered")]
    pub max_buffered: usize,
    #[serde(default = "default_last_seen_interval")]
    pub last_seen_interval_secs: u64,
    /// agent id -> token
    #[serde(default)]
    pub agent_tokens: HashMap<String, String>,
    /// dongle id -> serving agent id, known before any agent reports in.
    #[serde(default)]
    pub dongles: HashMap<String, String>,
    #[serde(default)]
    pub groups: Vec<Group>,
    #[serde(default)]
    pub stream: StreamSettings,
    #[serde(default)]
    pub pairing: PairingSettings,
    #[serde(default)]
    pub commands: Vec<CommandPolicy>,
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 9180))
}

fn default_request_timeout() -> u64 {
    10_000
}

fn default_max_buffered() -> usize {
    DEFAULT_MAX_BUFFERED
}

fn default_last_seen_interval() -> u64 {
    5
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            request_timeout_ms: default_request_timeout(),
            max_buffered: default_max_buffered(),
            last_seen_interval_secs: default_last_seen_interval(),
            agent_tokens: HashMap::new(),
            dongles: HashMap::new(),
            groups: Vec::new(),
            stream: StreamSettings::default(),
            pairing: PairingSettings::default(),
            commands: Vec::new(),
        }
    }
}

impl BackendConfig {
    /// Loads the file at `path`, creating it with defaults when missing.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            let config = Self::default();
            config.save(path)?;
            tracing::info!(path = %path.display(), "wrote default backend config");
            return Ok(config);
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let text = toml::to_string_pretty(self)?;
        std::fs::write(path, text).with_context(|| format!("writing {}", path.display()))?;
        set_permissions_0600(path);
        tracing::debug!("backend configuration saved");
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms.max(1))
    }

    pub fn last_seen_interval(&self) -> Duration {
        Duration::from_secs(self.last_seen_interval_secs)
    }
}

/// Per-topic event stream limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamSettings {
    #[serde(default = "default_max_events")]
    pub max_events: usize,
    #[serde(default = "default_max_age")]
    pub max_age_secs: u64,
    /// CAN frames per second before sampling starts.
    #[serde(default = "default_can_threshold")]
    pub can_threshold: u32,
    #[serde(default = "default_sample_window")]
    pub sample_window_secs: u64,
}

fn default_max_events() -> usize {
    1000
}

fn default_max_age() -> u64 {
    300
}

fn default_can_threshold() -> u32 {
    200
}

fn default_sample_window() -> u64 {
    2
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            max_events: default_max_events(),
            max_age_secs: default_max_age(),
            can_threshold: default_can_threshold(),
            sample_window_secs: default_sample_window(),
        }
    }
}

impl From<&StreamSettings> for StreamConfig {
    fn from(s: &StreamSettings) -> Self {
        Self {
            max_events: s.max_events.max(1),
            max_age: Duration::from_secs(s.max_age_secs),
            can_threshold: s.can_threshold.max(1),
            sample_window: Duration::from_secs(s.sample_window_secs.max(1)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairingSettings {
    #[serde(default = "default_session_ttl")]
    pub session_ttl_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u8,
    #[serde(default = "default_lockout")]
    pub lockout_secs: u64,
}

fn default_session_ttl() -> u64 {
    120
}

fn default_max_attempts() -> u8 {
    5
}

fn default_lockout() -> u64 {
    15 * 60
}

impl Default for PairingSettings {
    fn default() -> Self {
        Self {
            session_ttl_secs: default_session_ttl(),
            max_attempts: default_max_attempts(),
            lockout_secs: default_lockout(),
        }
    }
}

impl From<&PairingSettings> for PairingConfig {
    fn from(s: &PairingSettings) -> Self {
        Self {
            session_ttl: Duration::from_secs(s.session_ttl_secs),
            max_attempts: s.max_attempts.max(1),
            lockout: Duration::from_secs(s.lockout_secs),
        }
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
    Ok(base.join("canbridge").join("backend.toml"))
}
