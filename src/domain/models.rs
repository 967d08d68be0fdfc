use serde::{Deserialize, Serialize};
use std::fmt;

/// Configuration delivered to the sensor firmware.
///
/// Only the shape is checked here; whether the firmware accepts the values
/// is decided on the device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigurationRecord {
    pub access_token: String,
    #[serde(rename = "wifiSSID", default)]
    pub wifi_ssid: Option<String>,
    #[serde(default)]
    pub wifi_password: Option<String>,
    /// Minutes between two measurements
    pub time_between_measurements: u32,
    /// Records cached on the device before an RTC sync is required (1 = no cache)
    pub max_rtc_records: u32,
}

impl ConfigurationRecord {
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            wifi_ssid: None,
            wifi_password: None,
            time_between_measurements: 10,
            max_rtc_records: 4,
        }
    }

    #[cfg(test)]
    pub fn with_wifi(mut self, ssid: impl Into<String>, password: impl Into<String>) -> Self {
        self.wifi_ssid = Some(ssid.into());
        self.wifi_password = Some(password.into());
        self
    }

    /// Check presence and numeric ranges.
    pub fn validate(&self) -> Result<(), String> {
        if self.access_token.trim().is_empty() {
            return Err("access token is required".to_string());
        }
        if self.time_between_measurements == 0 {
            return Err("time between measurements must be at least 1 minute".to_string());
        }
        if self.max_rtc_records == 0 {
            return Err("max RTC records must be at least 1".to_string());
        }

        // A NUL would terminate the frame early on the firmware side
        let strings = [
            ("access token", Some(self.access_token.as_str())),
            ("WiFi SSID", self.wifi_ssid.as_deref()),
            ("WiFi password", self.wifi_password.as_deref()),
        ];
        for (name, value) in strings {
            if value.is_some_and(|v| v.contains('\0')) {
                return Err(format!("{} must not contain NUL bytes", name));
            }
        }

        Ok(())
    }
}

/// Result of one send attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisioningOutcome {
    Success,
    Failure,
    Timeout,
    TransportError,
}

impl fmt::Display for ProvisioningOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Timeout => "timeout",
            Self::TransportError => "transport error",
        };
        f.write_str(text)
    }
}

/// Lifecycle of the provisioning controller as seen by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisioningStatus {
    Disconnected,
    Connecting,
    Connected,
    Sending,
    AwaitingResult,
    Success,
    Failure,
    Error,
}

impl ProvisioningStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Sending => "sending",
            Self::AwaitingResult => "awaiting result",
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Error => "error",
        }
    }

    /// A handle is open and idle, so a new record may be submitted.
    pub fn accepts_submit(&self) -> bool {
        matches!(self, Self::Connected | Self::Success | Self::Failure)
    }
}

impl fmt::Display for ProvisioningStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub enum AppEvent {
    Status(ProvisioningStatus),
    LogMessage(StatusMessage),
}

#[derive(Debug, Clone)]
pub struct StatusMessage {
    pub message: String,
    pub severity: MessageSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageSeverity {
    Info,
    Success,
    Warning,
    Error,
}
