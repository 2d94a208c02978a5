//! Configuration of the uploadable feature, the broker connection and the
//! log output.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Errors detected while parsing or validating configuration.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("period should be larger than zero")]
    NonPositivePeriod,

    #[error("'activeFrom' time should be before 'activeTill' time")]
    InvertedWindow,

    #[error("invalid duration '{0}'")]
    InvalidDuration(String),
}

/// Wall-clock duration expressed as a Go-style string, e.g. `10h`, `10m30s`,
/// `1.5h` or `300ms`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DurationString(pub Duration);

impl DurationString {
    pub fn duration(self) -> Duration {
        self.0
    }
}

impl FromStr for DurationString {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_duration(s).map(DurationString)
    }
}

impl fmt::Display for DurationString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut nanos = self.0.as_nanos();
        if nanos == 0 {
            return f.write_str("0s");
        }

        const UNITS: [(&str, u128); 6] = [
            ("h", 3_600_000_000_000),
            ("m", 60_000_000_000),
            ("s", 1_000_000_000),
            ("ms", 1_000_000),
            ("us", 1_000),
            ("ns", 1),
        ];

        for (suffix, scale) in UNITS {
            let amount = nanos / scale;
            if amount > 0 {
                write!(f, "{amount}{suffix}")?;
                nanos -= amount * scale;
            }
        }
        Ok(())
    }
}

impl Serialize for DurationString {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for DurationString {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

/// Parses a sequence of decimal numbers with optional fractions and a unit
/// suffix each: `ns`, `us` (or `µs`), `ms`, `s`, `m`, `h`.
fn parse_duration(s: &str) -> Result<Duration, ConfigError> {
    let invalid = || ConfigError::InvalidDuration(s.to_string());
    let mut rest = s.trim();
    if rest.is_empty() {
        return Err(invalid());
    }

    let mut total = Duration::ZERO;
    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .ok_or_else(invalid)?;
        if number_len == 0 {
            return Err(invalid());
        }

        let (number, tail) = rest.split_at(number_len);
        let value: f64 = number.parse().map_err(|_| invalid())?;

        let unit_len = tail
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(tail.len());
        let (unit, remainder) = tail.split_at(unit_len);

        let unit_secs = match unit {
            "ns" => 1e-9,
            "us" | "µs" => 1e-6,
            "ms" => 1e-3,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            _ => return Err(invalid()),
        };

        total += Duration::from_secs_f64(value * unit_secs);
        rest = remainder;
    }

    Ok(total)
}

/// Configuration of the AutoUploadable feature.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UploadableConfig {
    /// Name under which the feature is announced.
    pub name: String,
    /// ID of the feature.
    pub context: String,
    /// Type of the feature.
    #[serde(rename = "type")]
    pub feature_type: String,

    /// Period of automatic uploads.
    pub period: DurationString,

    /// Activate periodic uploads.
    pub active: bool,
    /// Time from which periodic uploads should be active, RFC 3339.
    pub active_from: Option<DateTime<Utc>>,
    /// Time until which periodic uploads should be active, RFC 3339.
    pub active_till: Option<DateTime<Utc>>,

    /// Delete successfully uploaded files.
    pub delete: bool,
    /// Send an MD5 checksum for uploaded files. Computing checksums incurs
    /// additional CPU and disk usage.
    pub checksum: bool,
    /// Forbid new triggers while an upload is in progress; the backend can
    /// override with the `force` option.
    pub single_upload: bool,

    /// Time to wait for running uploads to finish when stopping.
    pub stop_timeout: DurationString,

    /// PEM certificate used to validate the upload endpoint.
    pub server_cert: String,
}

impl Default for UploadableConfig {
    fn default() -> Self {
        Self {
            name: "AutoUploadable".into(),
            context: "edge".into(),
            feature_type: "file".into(),
            period: DurationString(Duration::from_secs(10 * 3600)),
            active: false,
            active_from: None,
            active_till: None,
            delete: false,
            checksum: false,
            single_upload: false,
            stop_timeout: DurationString(Duration::from_secs(30)),
            server_cert: String::new(),
        }
    }
}

impl UploadableConfig {
    /// Checks configuration validity. Setting either activity-window bound
    /// implies periodic uploads are active.
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        if self.period.0.is_zero() {
            return Err(ConfigError::NonPositivePeriod);
        }

        if let (Some(from), Some(till)) = (self.active_from, self.active_till) {
            if till < from {
                return Err(ConfigError::InvertedWindow);
            }
        }
        if self.active_from.is_some() || self.active_till.is_some() {
            self.active = true;
        }

        Ok(())
    }
}

/// Address and credentials for the local MQTT broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BrokerConfig {
    /// Local broker address.
    pub broker: String,
    /// Username for an authorized local client.
    pub username: String,
    /// Password for an authorized local client.
    pub password: String,
    /// PEM certificate authority that signed the broker certificate.
    pub ca_cert: String,
    /// PEM client certificate.
    pub cert: String,
    /// Private key for the client certificate.
    pub key: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            broker: "tcp://localhost:1883".into(),
            username: String::new(),
            password: String::new(),
            ca_cert: String::new(),
            cert: String::new(),
            key: String::new(),
        }
    }
}

/// Log output configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LogConfig {
    /// Log file location; empty logs to standard output.
    pub log_file: String,
    /// Log level: ERROR, WARN, INFO, DEBUG or TRACE.
    pub log_level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            log_file: String::new(),
            log_level: "INFO".into(),
        }
    }
}
