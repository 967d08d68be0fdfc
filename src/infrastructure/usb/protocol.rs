//! Sensor Provisioning Protocol
//!
//! Wire constants for the firmware's vendor-specific USB interface and the
//! codec for the configuration frame and its textual acknowledgement.

use crate::domain::error::ProvisionError;
use crate::domain::models::{ConfigurationRecord, ProvisioningOutcome};
use crate::infrastructure::usb::DeviceFilter;
use serde::Serialize;
use tracing::{debug, warn};

/// Interface number the firmware exposes its data channel on
pub const CHANNEL_INTERFACE: u8 = 2;

/// bInterfaceClass for vendor-specific interfaces
pub const VENDOR_SPECIFIC_CLASS: u8 = 0xff;

/// Configuration selected when the device is unconfigured
pub const DEFAULT_CONFIGURATION: u8 = 1;

/// Class request toggling the firmware's data channel
pub const SET_CHANNEL_REQUEST: u8 = 0x22;
pub const CHANNEL_ENABLE: u16 = 0x01;
pub const CHANNEL_DISABLE: u16 = 0x00;

/// Bulk packet size on both endpoints
pub const MAX_PACKET_SIZE: usize = 64;

/// Marks the end of a request frame
pub const FRAME_TERMINATOR: u8 = 0x00;

pub const SUCCESS_TOKEN: &str = "success";
pub const FAILURE_TOKEN: &str = "failure";

/// Board vendors known to run compatible firmware
pub const ALLOWED_VENDORS: [u16; 4] = [
    0x239a, // Adafruit
    0x303a, // Espressif
    0xcafe, // Custom
    0x2341, // Arduino
];

/// Filters covering every allow-listed vendor
pub fn default_filters() -> Vec<DeviceFilter> {
    ALLOWED_VENDORS
        .iter()
        .copied()
        .map(DeviceFilter::vendor)
        .collect()
}

pub fn is_allowed_vendor(vendor_id: u16) -> bool {
    ALLOWED_VENDORS.contains(&vendor_id)
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WireRecord<'a> {
    access_token: &'a str,
    #[serde(rename = "wifiSSID")]
    wifi_ssid: &'a str,
    wifi_password: &'a str,
    time_between_measurements: u32,
    max_rtc_records: u32,
}

/// Serialize a record into a zero-terminated JSON frame.
pub fn encode(record: &ConfigurationRecord) -> Result<Vec<u8>, ProvisionError> {
    record.validate().map_err(ProvisionError::InvalidRecord)?;

    let wire = WireRecord {
        access_token: &record.access_token,
        wifi_ssid: record.wifi_ssid.as_deref().unwrap_or_default(),
        wifi_password: record.wifi_password.as_deref().unwrap_or_default(),
        time_between_measurements: record.time_between_measurements,
        max_rtc_records: record.max_rtc_records,
    };

    let mut frame = serde_json::to_vec(&wire)?;
    frame.push(FRAME_TERMINATOR);

    let packets = frame.len().div_ceil(MAX_PACKET_SIZE);
    debug!("Encoded configuration frame: {} bytes, {} packet(s)", frame.len(), packets);

    Ok(frame)
}

/// Interpret the firmware's response text.
///
/// Anything other than the two status tokens is reported as a transport
/// error, since the channel is no longer in a known state.
pub fn decode(response: &str) -> ProvisioningOutcome {
    let token = response
        .trim_end_matches(char::from(FRAME_TERMINATOR))
        .trim();

    match token {
        SUCCESS_TOKEN => ProvisioningOutcome::Success,
        FAILURE_TOKEN => ProvisioningOutcome::Failure,
        _ => {
            warn!("Unrecognized firmware response: {:?}", response);
            ProvisioningOutcome::TransportError
        }
    }
}
