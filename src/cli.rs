use crate::domain::models::ConfigurationRecord;
use crate::domain::settings::RecordDefaults;
use anyhow::Context;
use clap::{ArgAction, Args, Parser, Subcommand};
use std::num::ParseIntError;
use std::path::PathBuf;
use std::time::Duration;

fn parse_duration(s: &str) -> Result<Duration, ParseIntError> {
    let millis: u64 = s.parse()?;
    Ok(Duration::from_millis(millis))
}

#[derive(Clone, Debug, Parser)]
#[command(version, about, long_about = None)] // read from Cargo.toml
pub struct Cli {
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Settings file, defaults to the user configuration directory
    #[arg(
        env = "SENSOR_PROVISIONER_SETTINGS",
        long = "settings",
        value_name = "path",
        global = true
    )]
    pub settings: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Clone, Debug, Subcommand)]
pub enum Command {
    /// List attached devices that were paired before
    List,

    /// Pick a compatible device and remember it
    Pair {
        /// Take the first compatible device instead of prompting
        #[arg(long)]
        yes: bool,
    },

    /// Forget every paired device
    Forget,

    /// Send a configuration record to an attached sensor
    Provision(ProvisionArgs),
}

#[derive(Clone, Debug, Args)]
pub struct ProvisionArgs {
    /// Sensor access token issued by the backend
    #[arg(
        env = "SENSOR_ACCESS_TOKEN",
        long = "access-token",
        value_name = "token",
        required_unless_present = "record"
    )]
    pub access_token: Option<String>,

    /// WiFi network the sensor should join
    #[arg(env = "SENSOR_WIFI_SSID", long = "wifi-ssid", value_name = "ssid")]
    pub wifi_ssid: Option<String>,

    /// WiFi password
    #[arg(env = "SENSOR_WIFI_PASSWORD", long = "wifi-password", value_name = "password")]
    pub wifi_password: Option<String>,

    /// Minutes between two measurements
    #[arg(
        long = "interval",
        value_name = "minutes",
        value_parser = clap::value_parser!(u32).range(1..)
    )]
    pub interval: Option<u32>,

    /// Records cached before an RTC sync is required (1 for no cache)
    #[arg(
        long = "max-rtc-records",
        value_name = "count",
        value_parser = clap::value_parser!(u32).range(1..)
    )]
    pub max_rtc_records: Option<u32>,

    /// JSON file holding the record, using the firmware's camelCase keys
    #[arg(long = "record", value_name = "file")]
    pub record: Option<PathBuf>,

    /// How long to wait for the device's answer, in milliseconds
    #[arg(
        long = "receive-timeout-ms",
        value_name = "ms",
        value_parser = parse_duration
    )]
    pub receive_timeout: Option<Duration>,

    /// Take the first compatible device instead of prompting when pairing
    #[arg(long)]
    pub yes: bool,
}

impl ProvisionArgs {
    /// Build the record from the optional file, then apply flags on top.
    pub fn to_record(&self, defaults: &RecordDefaults) -> anyhow::Result<ConfigurationRecord> {
        let mut record = match &self.record {
            Some(path) => {
                let contents = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read {}", path.display()))?;
                serde_json::from_str(&contents)
                    .with_context(|| format!("Invalid record in {}", path.display()))?
            }
            None => {
                let token = self
                    .access_token
                    .clone()
                    .context("An access token is required")?;
                let mut record = ConfigurationRecord::new(token);
                record.time_between_measurements = defaults.time_between_measurements;
                record.max_rtc_records = defaults.max_rtc_records;
                record
            }
        };

        if let Some(token) = &self.access_token {
            record.access_token = token.clone();
        }
        if let Some(ssid) = &self.wifi_ssid {
            record.wifi_ssid = Some(ssid.clone());
        }
        if let Some(password) = &self.wifi_password {
            record.wifi_password = Some(password.clone());
        }
        if let Some(interval) = self.interval {
            record.time_between_measurements = interval;
        }
        if let Some(max) = self.max_rtc_records {
            record.max_rtc_records = max;
        }

        record.validate().map_err(anyhow::Error::msg)?;
        Ok(record)
    }
}
