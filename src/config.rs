use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::error;

const DEFAULT_PORT: u16 = 4000;
const DEFAULT_WS_PORT: u16 = 4001;
const DEFAULT_COOKIE_SECRET: &str = "SECRET:_";
const DEFAULT_IDLE_TIMEOUT_SECS: i64 = 600;
const DEFAULT_COLD_TIMEOUT_SECS: u64 = 10;
const DEFAULT_COLD_GRACE_SECS: u64 = 60;

// ─── TOML config file ─────────────────────────────────────────────────────────

/// `{data_dir}/config.toml` — all fields are optional overrides.
/// Priority: CLI / env var  >  TOML  >  built-in default.
#[derive(Deserialize, Default)]
struct TomlConfig {
    /// REST API port (default: 4000).
    port: Option<u16>,
    /// WebSocket listener port for providers and change-feed subscribers (default: 4001).
    ws_port: Option<u16>,
    /// Log level filter string, e.g. "debug", "info,fleetd=trace" (default: "info").
    log: Option<String>,
    /// Secret used to sign the `user_id` cookie.
    cookie_secret: Option<String>,
    /// Seconds of lessee inactivity before a lease auto-releases (default: 600).
    default_idle_timeout: Option<i64>,
    /// Timeout for the provider cool-down HTTP callback, seconds (default: 10).
    cold_timeout: Option<u64>,
    /// Fallback grace period after which a stuck cool-down is cleared, seconds (default: 60).
    cold_grace: Option<u64>,
}

fn load_toml(data_dir: &Path) -> Option<TomlConfig> {
    let path = data_dir.join("config.toml");
    let contents = std::fs::read_to_string(&path).ok()?;
    match toml::from_str::<TomlConfig>(&contents) {
        Ok(cfg) => Some(cfg),
        Err(e) => {
            error!(path = %path.display(), err = %e, "failed to parse config.toml — using defaults");
            None
        }
    }
}

// ─── Config ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub ws_port: u16,
    pub data_dir: PathBuf,
    pub log: String,
    /// Secret used to sign the `user_id` cookie (SECRET env var).
    pub cookie_secret: String,
    /// Default `idleTimeout` applied when an acquire request omits one.
    pub default_idle_timeout: i64,
    /// Timeout for the provider cool-down HTTP callback.
    pub cold_timeout: std::time::Duration,
    /// Grace period after which `colding` is force-cleared if the provider
    /// never completes cool-down.
    pub cold_grace: std::time::Duration,
}

impl Config {
    /// Build config from CLI/env args + optional TOML file.
    ///
    /// Priority (highest to lowest):
    ///   1. CLI / env — passed as `Some(value)` from clap
    ///   2. TOML file at `{data_dir}/config.toml`
    ///   3. Built-in defaults
    pub fn new(
        port: Option<u16>,
        ws_port: Option<u16>,
        data_dir: Option<PathBuf>,
        log: Option<String>,
    ) -> Self {
        let data_dir = data_dir.unwrap_or_else(default_data_dir);
        let toml = load_toml(&data_dir).unwrap_or_default();

        let port = port.or(toml.port).unwrap_or(DEFAULT_PORT);
        let ws_port = ws_port.or(toml.ws_port).unwrap_or(DEFAULT_WS_PORT);
        let log = log.or(toml.log).unwrap_or_else(|| "info".to_string());

        let cookie_secret = std::env::var("SECRET")
            .ok()
            .filter(|s| !s.is_empty())
            .or(toml.cookie_secret)
            .unwrap_or_else(|| DEFAULT_COOKIE_SECRET.to_string());

        let default_idle_timeout = toml
            .default_idle_timeout
            .unwrap_or(DEFAULT_IDLE_TIMEOUT_SECS);
        let cold_timeout = std::time::Duration::from_secs(
            toml.cold_timeout.unwrap_or(DEFAULT_COLD_TIMEOUT_SECS),
        );
        let cold_grace =
            std::time::Duration::from_secs(toml.cold_grace.unwrap_or(DEFAULT_COLD_GRACE_SECS));

        Self {
            port,
            ws_port,
            data_dir,
            log,
            cookie_secret,
            default_idle_timeout,
            cold_timeout,
            cold_grace,
        }
    }
}

fn default_data_dir() -> PathBuf {
    #[cfg(target_os = "macos")]
    {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join("Library")
                .join("Application Support")
                .join("fleetd");
        }
    }
    #[cfg(target_os = "linux")]
    {
        // $XDG_DATA_HOME/fleetd or ~/.local/share/fleetd
        if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
            return PathBuf::from(xdg).join("fleetd");
        }
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join(".local")
                .join("share")
                .join("fleetd");
        }
    }
    #[cfg(target_os = "windows")]
    {
        if let Ok(appdata) = std::env::var("APPDATA") {
            return PathBuf::from(appdata).join("fleetd");
        }
    }
    PathBuf::from(".fleetd")
}
