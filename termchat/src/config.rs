//! Load config from file and environment.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Chat configuration. File: ~/.config/termchat/config.toml or /etc/termchat/config.toml.
/// Env overrides: TERMCHAT_PORT, TERMCHAT_BIND, TERMCHAT_HANDSHAKE_TIMEOUT.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Listener TCP port; also the default port for join targets (default 9999).
    #[serde(default = "default_port")]
    pub port: u16,
    /// Listener bind host (default 0.0.0.0).
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Seconds a handshake read may take before the attempt is dropped; 0 disables (default 30).
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,
}

pub const DEFAULT_PORT: u16 = 9999;

fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_handshake_timeout_secs() -> u64 {
    30
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind: default_bind(),
            handshake_timeout_secs: default_handshake_timeout_secs(),
        }
    }
}

impl Config {
    pub fn handshake_timeout(&self) -> Option<Duration> {
        match self.handshake_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Result<Config, ConfigError> {
    let c = match config_paths().into_iter().find(|p| p.exists()) {
        Some(path) => load_file(&path)?,
        None => Config::default(),
    };
    Ok(apply_env(c, |key| std::env::var(key).ok()))
}

/// Apply env overrides through `lookup`. Unparseable values are ignored.
pub fn apply_env(mut c: Config, lookup: impl Fn(&str) -> Option<String>) -> Config {
    if let Some(p) = lookup("TERMCHAT_PORT").and_then(|s| s.parse::<u16>().ok()) {
        c.port = p;
    }
    if let Some(b) = lookup("TERMCHAT_BIND").filter(|s| !s.is_empty()) {
        c.bind = b;
    }
    if let Some(t) = lookup("TERMCHAT_HANDSHAKE_TIMEOUT").and_then(|s| s.parse::<u64>().ok()) {
        c.handshake_timeout_secs = t;
    }
    c
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/termchat/config.toml"));
    }
    out.push(PathBuf::from("/etc/termchat/config.toml"));
    out
}

fn load_file(path: &Path) -> Result<Config, ConfigError> {
    let s = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str::<Config>(&s).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}
