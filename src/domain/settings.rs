use crate::domain::signal;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_true")]
    pub file_logging_enabled: bool,
    #[serde(default = "default_true")]
    pub console_logging_enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_prefix")]
    pub file_name_prefix: String,
    #[serde(default = "default_true")]
    pub show_file_line: bool,
    #[serde(default = "default_false")]
    pub show_thread_ids: bool,
    #[serde(default = "default_true")]
    pub show_target: bool,
    #[serde(default = "default_true")]
    pub ansi_colors: bool,
    #[serde(default = "default_rotation")]
    pub rotation: String, // "daily", "hourly", "minutely", "never"
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            file_logging_enabled: default_true(),
            console_logging_enabled: default_true(),
            log_dir: default_log_dir(),
            file_name_prefix: default_prefix(),
            show_file_line: default_true(),
            show_thread_ids: default_false(),
            show_target: default_true(),
            ansi_colors: default_true(),
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
    "garage_opener".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    // BLE identity of the one device this app connects to
    #[serde(default = "default_service_uuid")]
    pub ble_service_uuid: String,
    #[serde(default = "default_device_id")]
    pub ble_device_id: String,
    #[serde(default = "default_write_char_uuid")]
    pub ble_write_char_uuid: String,
    #[serde(default = "default_notify_char_uuid")]
    pub ble_notify_char_uuid: String,

    // Door password, prefixed onto the open command payload
    #[serde(default)]
    pub door_password: String,

    // Signal filtering
    #[serde(default = "default_reject_threshold")]
    pub rssi_reject_threshold: i16,

    // Timing policy
    #[serde(default = "default_scan_timeout_secs")]
    pub scan_timeout_secs: u64,
    #[serde(default = "default_low_signal_backoff_ms")]
    pub low_signal_backoff_ms: u64,
    #[serde(default = "default_disconnect_settle_ms")]
    pub disconnect_settle_ms: u64,
    #[serde(default = "default_rssi_poll_interval_ms")]
    pub rssi_poll_interval_ms: u64,

    #[serde(default)]
    pub log_settings: LogSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            ble_service_uuid: default_service_uuid(),
            ble_device_id: default_device_id(),
            ble_write_char_uuid: default_write_char_uuid(),
            ble_notify_char_uuid: default_notify_char_uuid(),
            door_password: String::new(),
            rssi_reject_threshold: default_reject_threshold(),
            scan_timeout_secs: default_scan_timeout_secs(),
            low_signal_backoff_ms: default_low_signal_backoff_ms(),
            disconnect_settle_ms: default_disconnect_settle_ms(),
            rssi_poll_interval_ms: default_rssi_poll_interval_ms(),
            log_settings: LogSettings::default(),
        }
    }
}

fn default_service_uuid() -> String {
    crate::infrastructure::bluetooth::protocol::SERVICE_UUID.to_string()
}
fn default_device_id() -> String {
    crate::infrastructure::bluetooth::protocol::DEVICE_IDENTIFIER.to_string()
}
fn default_write_char_uuid() -> String {
    crate::infrastructure::bluetooth::protocol::WRITE_CHAR_UUID.to_string()
}
fn default_notify_char_uuid() -> String {
    crate::infrastructure::bluetooth::protocol::NOTIFY_CHAR_UUID.to_string()
}
fn default_reject_threshold() -> i16 {
    signal::DEFAULT_REJECT_THRESHOLD
}
fn default_scan_timeout_secs() -> u64 {
    30
}
fn default_low_signal_backoff_ms() -> u64 {
    1000
}
fn default_disconnect_settle_ms() -> u64 {
    2000
}
fn default_rssi_poll_interval_ms() -> u64 {
    2000
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        let settings = Self::load_from_file(&settings_path).unwrap_or_default();

        Ok(Self {
            settings,
            settings_path,
        })
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("GarageOpener");
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

    pub fn set_password(&mut self, password: String) -> anyhow::Result<()> {
        self.settings.door_password = password;
        self.save()
    }
}
