use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

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

/// A vendor/product pair the user has picked before.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizedDevice {
    pub vendor_id: u16,
    pub product_id: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsbSettings {
    /// How long to wait for the firmware's answer after sending
    #[serde(default = "default_receive_timeout_ms")]
    pub receive_timeout_ms: u64,
    /// Upper bound handed to libusb for a single transfer
    #[serde(default = "default_transfer_timeout_ms")]
    pub transfer_timeout_ms: u64,
    #[serde(default)]
    pub authorized_devices: Vec<AuthorizedDevice>,
}

impl Default for UsbSettings {
    fn default() -> Self {
        Self {
            receive_timeout_ms: default_receive_timeout_ms(),
            transfer_timeout_ms: default_transfer_timeout_ms(),
            authorized_devices: Vec::new(),
        }
    }
}

/// Prefill values for a new configuration record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordDefaults {
    #[serde(default = "default_time_between_measurements")]
    pub time_between_measurements: u32,
    #[serde(default = "default_max_rtc_records")]
    pub max_rtc_records: u32,
}

impl Default for RecordDefaults {
    fn default() -> Self {
        Self {
            time_between_measurements: default_time_between_measurements(),
            max_rtc_records: default_max_rtc_records(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub log_settings: LogSettings,
    #[serde(default)]
    pub usb: UsbSettings,
    #[serde(default)]
    pub defaults: RecordDefaults,
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
    dirs::data_local_dir()
        .map(|p| p.join("SensorProvisioner").join("logs"))
        .and_then(|p| p.to_str().map(str::to_string))
        .unwrap_or_else(|| "logs".to_string())
}
fn default_prefix() -> String {
    "sensor_provisioner".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}
fn default_receive_timeout_ms() -> u64 {
    3000
}
fn default_transfer_timeout_ms() -> u64 {
    5000
}
fn default_time_between_measurements() -> u32 {
    10
}
fn default_max_rtc_records() -> u32 {
    4
}

pub struct SettingsService {
    settings: Settings,
    settings_path: Option<PathBuf>,
}

impl SettingsService {
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        Ok(Self::load(settings_path))
    }

    /// Load from an explicit path, falling back to defaults when the file is missing.
    pub fn load(settings_path: PathBuf) -> Self {
        let settings = match Self::load_from_file(&settings_path) {
            Ok(settings) => settings,
            Err(e) => {
                if settings_path.exists() {
                    tracing::warn!(
                        "Ignoring unreadable settings at {}: {}",
                        settings_path.display(),
                        e
                    );
                }
                Settings::default()
            }
        };

        Self {
            settings,
            settings_path: Some(settings_path),
        }
    }

    /// Settings that are never written to disk.
    #[cfg(test)]
    pub fn in_memory(settings: Settings) -> Self {
        Self {
            settings,
            settings_path: None,
        }
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("SensorProvisioner");
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
        let Some(path) = &self.settings_path else {
            return Ok(());
        };
        let json = serde_json::to_string_pretty(&self.settings)?;
        fs::write(path, json)?;
        Ok(())
    }

    pub fn path(&self) -> Option<&Path> {
        self.settings_path.as_deref()
    }

    pub fn get(&self) -> &Settings {
        &self.settings
    }

    #[cfg(test)]
    pub fn get_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }

    pub fn is_authorized(&self, vendor_id: u16, product_id: u16) -> bool {
        self.settings
            .usb
            .authorized_devices
            .contains(&AuthorizedDevice {
                vendor_id,
                product_id,
            })
    }

    pub fn authorize(&mut self, vendor_id: u16, product_id: u16) -> anyhow::Result<()> {
        if !self.is_authorized(vendor_id, product_id) {
            self.settings.usb.authorized_devices.push(AuthorizedDevice {
                vendor_id,
                product_id,
            });
            self.save()?;
        }
        Ok(())
    }

    pub fn forget_all(&mut self) -> anyhow::Result<usize> {
        let count = self.settings.usb.authorized_devices.len();
        self.settings.usb.authorized_devices.clear();
        self.save()?;
        Ok(count)
    }
}
