//! Node configuration: file plus environment overrides.

use serde::Deserialize;
use std::path::PathBuf;

/// Node configuration. File: ~/.config/segpool/config.toml or
/// /etc/segpool/config.toml. Env overrides: SEGPOOL_STORAGE,
/// SEGPOOL_DISCOVERY_PORT, SEGPOOL_TRANSPORT_PORT, SEGPOOL_FFMPEG.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Root directory holding all local drives (default ".segpool").
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,
    /// Discovery UDP port shared by the swarm (default 49737). This is the
    /// bootstrap setting peers and pools must agree on.
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
    /// TCP listen port for pool connections (default 0 = ephemeral).
    #[serde(default)]
    pub transport_port: u16,
    /// ffmpeg binary to invoke for encode and mux (default "ffmpeg").
    #[serde(default = "default_ffmpeg_bin")]
    pub ffmpeg_bin: String,
}

fn default_storage_dir() -> PathBuf {
    PathBuf::from(".segpool")
}
fn default_discovery_port() -> u16 {
    49737
}
fn default_ffmpeg_bin() -> String {
    "ffmpeg".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_dir: default_storage_dir(),
            discovery_port: default_discovery_port(),
            transport_port: 0,
            ffmpeg_bin: default_ffmpeg_bin(),
        }
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    if let Ok(s) = std::env::var("SEGPOOL_STORAGE") {
        if !s.is_empty() {
            c.storage_dir = PathBuf::from(s);
        }
    }
    if let Ok(s) = std::env::var("SEGPOOL_DISCOVERY_PORT") {
        if let Ok(p) = s.parse::<u16>() {
            c.discovery_port = p;
        }
    }
    if let Ok(s) = std::env::var("SEGPOOL_TRANSPORT_PORT") {
        if let Ok(p) = s.parse::<u16>() {
            c.transport_port = p;
        }
    }
    if let Ok(s) = std::env::var("SEGPOOL_FFMPEG") {
        if !s.is_empty() {
            c.ffmpeg_bin = s;
        }
    }
    c
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/segpool/config.toml"));
    }
    out.push(PathBuf::from("/etc/segpool/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            if let Ok(s) = std::fs::read_to_string(&p) {
                if let Ok(c) = toml::from_str::<Config>(&s) {
                    return Some(c);
                }
            }
            break;
        }
    }
    None
}
