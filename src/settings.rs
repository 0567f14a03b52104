use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::coordinator::CoordinatorConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_true")]
    pub console_logging_enabled: bool,
    #[serde(default = "default_false")]
    pub file_logging_enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_prefix")]
    pub file_name_prefix: String,
    #[serde(default = "default_rotation")]
    pub rotation: String, // "daily", "hourly", "minutely", "never"
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            console_logging_enabled: default_true(),
            file_logging_enabled: default_false(),
            log_dir: default_log_dir(),
            file_name_prefix: default_prefix(),
            rotation: default_rotation(),
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}
fn default_false() -> bool {
    false
}
fn default_log_dir() -> String {
    "logs".to_string()
}
fn default_prefix() -> String {
    "ledlink".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub log_settings: LogSettings,

    // Connection behavior
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    // Command flow control
    #[serde(default = "default_color_debounce_ms")]
    pub color_debounce_ms: u64,
    #[serde(default = "default_animation_retry_attempts")]
    pub animation_retry_attempts: u32,
    #[serde(default = "default_animation_retry_backoff_ms")]
    pub animation_retry_backoff_ms: u64,

    /// Name of the device the operator last connected to, for a reconnect
    /// shortcut in the UI.
    #[serde(default)]
    pub last_device: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_settings: LogSettings::default(),
            connect_timeout_ms: default_connect_timeout_ms(),
            color_debounce_ms: default_color_debounce_ms(),
            animation_retry_attempts: default_animation_retry_attempts(),
            animation_retry_backoff_ms: default_animation_retry_backoff_ms(),
            last_device: None,
        }
    }
}

fn default_connect_timeout_ms() -> u64 {
    5000
}
fn default_color_debounce_ms() -> u64 {
    100
}
fn default_animation_retry_attempts() -> u32 {
    2
}
fn default_animation_retry_backoff_ms() -> u64 {
    100
}

impl Settings {
    /// Project the connection-related knobs into a coordinator config.
    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            color_debounce: Duration::from_millis(self.color_debounce_ms),
            animation_retry_attempts: self.animation_retry_attempts,
            animation_retry_backoff: Duration::from_millis(self.animation_retry_backoff_ms),
        }
    }
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::settings_path()?;
        let settings = Self::load_from_file(&settings_path).unwrap_or_default();

        Ok(Self {
            settings,
            settings_path,
        })
    }

    fn settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("ledlink");
        fs::create_dir_all(&path)?;
        path.push("settings.json");
        Ok(path)
    }

    fn load_from_file(path: &PathBuf) -> anyhow::Result<Settings> {
        let contents = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&contents)?;
        Ok(settings)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(&self.settings)?;
        fs::write(&self.settings_path, json)?;
        Ok(())
    }

    pub fn get(&self) -> &Settings {
        &self.settings
    }

    pub fn get_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }

    pub fn set_last_device(&mut self, name: &str) -> anyhow::Result<()> {
        if self.settings.last_device.as_deref() != Some(name) {
            self.settings.last_device = Some(name.to_string());
            self.save()?;
        }
        Ok(())
    }
}
