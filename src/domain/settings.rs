use crate::infrastructure::bluetooth::protocol::{self, GattIdentifiers};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_false")]
    pub file_logging_enabled: bool,
    #[serde(default = "default_true")]
    pub console_logging_enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_prefix")]
    pub file_name_prefix: String,
    #[serde(default = "default_false")]
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
            file_logging_enabled: default_false(),
            console_logging_enabled: default_true(),
            log_dir: default_log_dir(),
            file_name_prefix: default_prefix(),
            show_file_line: default_false(),
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
    "dsc_reader".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub log_settings: LogSettings,

    #[serde(default)]
    pub last_connected_address: Option<String>,
    #[serde(default)]
    pub known_addresses: Vec<String>,

    // DSC GATT identifiers
    #[serde(default = "default_service_uuid")]
    pub ble_service_uuid: String,
    #[serde(default = "default_azel_uuid")]
    pub ble_azel_char_uuid: String,
    #[serde(default = "default_az_resolution_uuid")]
    pub ble_az_resolution_char_uuid: String,
    #[serde(default = "default_el_resolution_uuid")]
    pub ble_el_resolution_char_uuid: String,
    #[serde(default = "default_azimuth_uuid")]
    pub ble_azimuth_char_uuid: String,
    #[serde(default = "default_elevation_uuid")]
    pub ble_elevation_char_uuid: String,

    // Debug Settings
    #[serde(default = "default_false")]
    pub debug_raw_data_logging: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_settings: LogSettings::default(),
            last_connected_address: None,
            known_addresses: Vec::new(),
            ble_service_uuid: default_service_uuid(),
            ble_azel_char_uuid: default_azel_uuid(),
            ble_az_resolution_char_uuid: default_az_resolution_uuid(),
            ble_el_resolution_char_uuid: default_el_resolution_uuid(),
            ble_azimuth_char_uuid: default_azimuth_uuid(),
            ble_elevation_char_uuid: default_elevation_uuid(),
            debug_raw_data_logging: false,
        }
    }
}

impl Settings {
    /// Parse the configured identifier strings.
    pub fn gatt_identifiers(&self) -> anyhow::Result<GattIdentifiers> {
        fn parse(name: &str, value: &str) -> anyhow::Result<Uuid> {
            Uuid::parse_str(value).with_context(|| format!("Invalid {name} UUID: {value:?}"))
        }

        Ok(GattIdentifiers {
            service: parse("service", &self.ble_service_uuid)?,
            azel: parse("az+el characteristic", &self.ble_azel_char_uuid)?,
            az_resolution: parse("az resolution characteristic", &self.ble_az_resolution_char_uuid)?,
            el_resolution: parse("el resolution characteristic", &self.ble_el_resolution_char_uuid)?,
            azimuth: parse("azimuth characteristic", &self.ble_azimuth_char_uuid)?,
            elevation: parse("elevation characteristic", &self.ble_elevation_char_uuid)?,
        })
    }
}

fn default_service_uuid() -> String {
    protocol::DSC_SERVICE_UUID.to_string()
}
fn default_azel_uuid() -> String {
    protocol::AZEL_CHAR_UUID.to_string()
}
fn default_az_resolution_uuid() -> String {
    protocol::AZ_RESOLUTION_CHAR_UUID.to_string()
}
fn default_el_resolution_uuid() -> String {
    protocol::EL_RESOLUTION_CHAR_UUID.to_string()
}
fn default_azimuth_uuid() -> String {
    protocol::AZIMUTH_CHAR_UUID.to_string()
}
fn default_elevation_uuid() -> String {
    protocol::ELEVATION_CHAR_UUID.to_string()
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    /// Load settings from the per-user config directory, falling back to defaults.
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        Ok(Self::from_path(settings_path))
    }

    /// Load settings from an explicit file. A missing or unreadable file yields defaults.
    pub fn from_path(settings_path: PathBuf) -> Self {
        let settings = match Self::load_from_file(&settings_path) {
            Ok(settings) => settings,
            Err(e) => {
                tracing::debug!("Using default settings ({}): {:#}", settings_path.display(), e);
                Settings::default()
            }
        };

        Self {
            settings,
            settings_path,
        }
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("DscReader");
        fs::create_dir_all(&path)?;
        path.push("settings.json");
        Ok(path)
    }

    fn load_from_file(path: &Path) -> anyhow::Result<Settings> {
        let contents = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&contents)?;
        Ok(settings)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        if let Some(parent) = self.settings_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&self.settings)?;
        fs::write(&self.settings_path, json)?;
        Ok(())
    }

    pub fn get(&self) -> &Settings {
        &self.settings
    }

    pub fn path(&self) -> &Path {
        &self.settings_path
    }

    /// Record a successfully requested address as the last used one.
    pub fn remember_address(&mut self, address: &str) -> anyhow::Result<()> {
        self.settings.last_connected_address = Some(address.to_string());
        if !self.settings.known_addresses.iter().any(|a| a == address) {
            self.settings.known_addresses.push(address.to_string());
        }
        self.save()
    }
}
