//! Configuration file management
//!
//! Loads TOML configuration and resolves per-seat settings.
//! Default config path: /etc/seatwarden/config.toml

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::constants::{
    CONFIG_ENV_VAR, DEFAULT_CONTROL_SOCKET, DEFAULT_PAM_SERVICE, DEFAULT_SESSION_PATH,
    DEFAULT_TERMINATE_TIMEOUT_SECS, DEFAULT_USER_TEMPLATE, SYSTEM_CONFIG_PATH,
};

/// Application settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Settings shared by every seat
    pub general: GeneralConfig,
    /// Per-seat overrides, keyed by seat id
    pub seats: BTreeMap<String, SeatOverrides>,
    /// Free-form string options per plugin, keyed by plugin name
    pub plugins: BTreeMap<String, HashMap<String, String>>,
}

/// Settings shared by every seat
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Auth service used when a request doesn't name one
    pub pam_service: String,
    /// Default user template: %S = seat number, %I = seat id
    pub default_user: String,
    /// Log the default user back in whenever a seat becomes idle
    pub auto_login: bool,
    /// Reset an existing default user through the accounts plugin
    pub prepare_default: bool,
    /// Command run through the user's shell with -c (empty = login shell)
    pub session_cmd: String,
    /// PATH exported into sessions
    pub session_path: String,
    /// Seconds between termination signals
    pub terminate_timeout: u64,
    /// Accounts plugin name ("" = none)
    pub accounts_plugin: String,
    /// Auth trigger plugins to start
    pub auth_plugins: Vec<String>,
    /// Control socket path ("" = disabled)
    pub control_socket: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            pam_service: DEFAULT_PAM_SERVICE.to_string(),
            default_user: DEFAULT_USER_TEMPLATE.to_string(),
            auto_login: false,
            prepare_default: false,
            session_cmd: String::new(),
            session_path: DEFAULT_SESSION_PATH.to_string(),
            terminate_timeout: DEFAULT_TERMINATE_TIMEOUT_SECS,
            accounts_plugin: "default".to_string(),
            auth_plugins: Vec::new(),
            control_socket: DEFAULT_CONTROL_SOCKET.to_string(),
        }
    }
}

/// Optional per-seat overrides of [`GeneralConfig`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SeatOverrides {
    pub pam_service: Option<String>,
    pub default_user: Option<String>,
    pub auto_login: Option<bool>,
    pub prepare_default: Option<bool>,
    pub session_cmd: Option<String>,
    /// Terminal device for the session (e.g. /dev/tty7)
    pub tty: Option<String>,
    /// Virtual terminal number exported as XDG_VTNR
    pub vtnr: Option<u32>,
}

/// Resolved settings for one seat
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeatConfig {
    pub pam_service: String,
    pub default_user: String,
    pub auto_login: bool,
    pub prepare_default: bool,
    pub session_cmd: Option<String>,
    pub session_path: String,
    pub tty: Option<String>,
    pub vtnr: Option<u32>,
}

impl Default for SeatConfig {
    fn default() -> Self {
        Config::default().seat("seat0")
    }
}

fn non_empty(s: &str) -> Option<String> {
    let s = s.trim();
    (!s.is_empty()).then(|| s.to_string())
}

impl Config {
    /// Settings for `seat_id`: seat overrides on top of [general]
    pub fn seat(&self, seat_id: &str) -> SeatConfig {
        let general = &self.general;
        let overrides = self.seats.get(seat_id).cloned().unwrap_or_default();

        SeatConfig {
            pam_service: overrides
                .pam_service
                .as_deref()
                .and_then(non_empty)
                .or_else(|| non_empty(&general.pam_service))
                .unwrap_or_else(|| DEFAULT_PAM_SERVICE.to_string()),
            default_user: overrides
                .default_user
                .as_deref()
                .and_then(non_empty)
                .or_else(|| non_empty(&general.default_user))
                .unwrap_or_else(|| DEFAULT_USER_TEMPLATE.to_string()),
            auto_login: overrides.auto_login.unwrap_or(general.auto_login),
            prepare_default: overrides.prepare_default.unwrap_or(general.prepare_default),
            session_cmd: match overrides.session_cmd {
                Some(cmd) => non_empty(&cmd),
                None => non_empty(&general.session_cmd),
            },
            session_path: non_empty(&general.session_path)
                .unwrap_or_else(|| DEFAULT_SESSION_PATH.to_string()),
            tty: overrides.tty.as_deref().and_then(non_empty),
            vtnr: overrides.vtnr,
        }
    }

    /// Seats to manage when the login broker cannot enumerate them
    pub fn static_seats(&self) -> Vec<String> {
        if self.seats.is_empty() {
            vec!["seat0".to_string()]
        } else {
            self.seats.keys().cloned().collect()
        }
    }

    pub fn terminate_timeout(&self) -> Duration {
        Duration::from_secs(self.general.terminate_timeout.max(1))
    }

    /// Options for a plugin (empty if unconfigured)
    pub fn plugin_options(&self, name: &str) -> HashMap<String, String> {
        self.plugins.get(name).cloned().unwrap_or_default()
    }

    /// Find the config file path (for display purposes)
    pub fn config_path() -> Option<PathBuf> {
        // 1. SEATWARDEN_CONFIG environment variable
        if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
            let p = Path::new(&path);
            if p.exists() {
                return Some(p.to_path_buf());
            }
        }

        // 2. User config: ~/.config/seatwarden/config.toml (launcher)
        if let Some(config_dir) = dirs::config_dir() {
            let config_path = config_dir.join("seatwarden").join("config.toml");
            if config_path.exists() {
                return Some(config_path);
            }
        }

        // 3. System config: /etc/seatwarden/config.toml
        let system_config = Path::new(SYSTEM_CONFIG_PATH);
        if system_config.exists() {
            return Some(system_config.to_path_buf());
        }

        None
    }

    /// Load configuration with priority:
    /// 1. SEATWARDEN_CONFIG environment variable
    /// 2. ~/.config/seatwarden/config.toml (user config)
    /// 3. /etc/seatwarden/config.toml (system config)
    /// 4. Built-in defaults
    pub fn load() -> Self {
        if let Some(path) = Self::config_path() {
            match Self::load_from_file(&path) {
                Ok(config) => {
                    info!("Loaded config: {}", path.display());
                    return config;
                }
                Err(e) => {
                    warn!("Failed to load config {}: {:#}", path.display(), e);
                }
            }
        }
        info!("Using built-in default config");
        Self::default()
    }

    /// Load settings from an explicit path
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        Ok(config)
    }

    /// Write the built-in defaults as a template
    pub fn write_default(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let mut config = Config::default();
        config.seats.insert(
            "seat0".to_string(),
            SeatOverrides {
                tty: Some("/dev/tty7".to_string()),
                vtnr: Some(7),
                ..Default::default()
            },
        );
        let content = toml::to_string_pretty(&config).context("Failed to serialize config")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        let seat = config.seat("seat0");
        assert_eq!(seat.pam_service, DEFAULT_PAM_SERVICE);
        assert_eq!(seat.default_user, "guest%S");
        assert!(!seat.auto_login);
        assert_eq!(seat.session_cmd, None);
        assert_eq!(config.terminate_timeout(), Duration::from_secs(3));
        assert_eq!(config.static_seats(), vec!["seat0"]);
    }

    #[test]
    fn test_seat_overrides() {
        let config: Config = toml::from_str(
            r#"
            [general]
            pam_service = "login"
            auto_login = true
            session_cmd = "startx"
            terminate_timeout = 5

            [seats.seat1]
            default_user = "kiosk"
            auto_login = false
            session_cmd = ""
            tty = "/dev/tty8"
            vtnr = 8

            [plugins.signal]
            seat = "seat1"
            "#,
        )
        .unwrap();

        let seat0 = config.seat("seat0");
        assert_eq!(seat0.pam_service, "login");
        assert!(seat0.auto_login);
        assert_eq!(seat0.session_cmd.as_deref(), Some("startx"));

        let seat1 = config.seat("seat1");
        assert_eq!(seat1.pam_service, "login");
        assert_eq!(seat1.default_user, "kiosk");
        assert!(!seat1.auto_login);
        // An explicit empty override clears the general command
        assert_eq!(seat1.session_cmd, None);
        assert_eq!(seat1.tty.as_deref(), Some("/dev/tty8"));
        assert_eq!(seat1.vtnr, Some(8));

        assert_eq!(config.static_seats(), vec!["seat1"]);
        assert_eq!(config.terminate_timeout(), Duration::from_secs(5));
        assert_eq!(config.plugin_options("signal").get("seat").map(String::as_str), Some("seat1"));
        assert!(config.plugin_options("missing").is_empty());
    }

    #[test]
    fn test_zero_timeout_clamped() {
        let config: Config = toml::from_str("[general]\nterminate_timeout = 0\n").unwrap();
        assert_eq!(config.terminate_timeout(), Duration::from_secs(1));
    }

    #[test]
    fn test_write_default_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("etc").join("config.toml");
        Config::write_default(&path).unwrap();

        let loaded = Config::load_from_file(&path).unwrap();
        assert_eq!(loaded.seat("seat0").vtnr, Some(7));
        assert_eq!(loaded.general.pam_service, DEFAULT_PAM_SERVICE);
    }

    #[test]
    fn test_parse_error_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[general\n").unwrap();
        assert!(Config::load_from_file(&path).is_err());
    }
}
