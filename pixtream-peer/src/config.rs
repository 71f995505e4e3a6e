//! Load config from file and environment. Command-line flags are applied last, in main.

use serde::Deserialize;
use std::net::IpAddr;
use std::path::PathBuf;

use pixtream_core::DEFAULT_PIECE_SIZE;
use tracing::warn;

/// Daemon configuration. File: ~/.config/pixtream/config.toml or /etc/pixtream/config.toml.
/// Env overrides: PIXTREAM_LISTEN_PORT, PIXTREAM_STREAM_PORT, PIXTREAM_TRACKER_URL, PIXTREAM_IP.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Peer protocol listen port (default 60000).
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// Port the joined stream is served on (default 30000).
    #[serde(default = "default_stream_port")]
    pub stream_port: u16,
    #[serde(default = "default_tracker_url")]
    pub tracker_url: String,
    /// Address announced to the tracker; the tracker uses the request source if unset.
    #[serde(default)]
    pub ip: Option<IpAddr>,
    /// Stream origin: `tcp://host:port` or a file path. Unset for a receiving peer.
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default = "default_piece_size")]
    pub piece_size: usize,
    /// Seconds before an unanswered piece request is cancelled. Unset: never.
    #[serde(default)]
    pub request_timeout_secs: Option<u64>,
}

fn default_listen_port() -> u16 {
    60000
}
fn default_stream_port() -> u16 {
    30000
}
fn default_tracker_url() -> String {
    "http://127.0.0.1:8080".to_string()
}
fn default_piece_size() -> usize {
    DEFAULT_PIECE_SIZE
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_port: default_listen_port(),
            stream_port: default_stream_port(),
            tracker_url: default_tracker_url(),
            ip: None,
            source: None,
            piece_size: default_piece_size(),
            request_timeout_secs: None,
        }
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    apply_env(&mut c, |key| std::env::var(key).ok());
    c
}

fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(p) = var("PIXTREAM_LISTEN_PORT").and_then(|s| s.parse().ok()) {
        c.listen_port = p;
    }
    if let Some(p) = var("PIXTREAM_STREAM_PORT").and_then(|s| s.parse().ok()) {
        c.stream_port = p;
    }
    if let Some(url) = var("PIXTREAM_TRACKER_URL") {
        c.tracker_url = url;
    }
    if let Some(ip) = var("PIXTREAM_IP").and_then(|s| s.parse().ok()) {
        c.ip = Some(ip);
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/pixtream/config.toml"));
    }
    out.push(PathBuf::from("/etc/pixtream/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            match std::fs::read_to_string(&p).map(|s| toml::from_str::<Config>(&s)) {
                Ok(Ok(c)) => return Some(c),
                Ok(Err(e)) => warn!(path = %p.display(), error = %e, "bad config file"),
                Err(e) => warn!(path = %p.display(), error = %e, "cannot read config file"),
            }
            break;
        }
    }
    None
}
