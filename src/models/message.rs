use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::str::FromStr;

use super::alert::GeoPoint;

/// JSON telemetry envelope published by the device gateway.
#[derive(Debug, Deserialize)]
pub struct TelemetryMessage {
    pub data: Data,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub uuid: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct Data {
    #[serde(rename = "GPS_DATETIME")]
    pub gps_datetime: Option<String>,
    #[serde(rename = "GPS_EPOCH", default, deserialize_with = "parse_i64_option")]
    pub gps_epoch: Option<i64>,
    #[serde(rename = "LATITUD", default, deserialize_with = "parse_f64_option")]
    pub latitude: Option<f64>,
    #[serde(rename = "LONGITUD", default, deserialize_with = "parse_f64_option")]
    pub longitude: Option<f64>,
    #[serde(rename = "FIX_")]
    pub fix: Option<String>,
    #[serde(rename = "DEVICE_ID")]
    pub device_id: Option<String>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Metadata {
    #[serde(rename = "DEVICE_ID")]
    pub device_id: Option<String>,
    #[serde(flatten)]
    pub other: HashMap<String, Value>,
}

/// Compact binary form of one position report.
#[derive(Clone, PartialEq, prost::Message)]
pub struct PositionFix {
    #[prost(string, tag = "1")]
    pub device_id: String,
    #[prost(double, tag = "2")]
    pub latitude: f64,
    #[prost(double, tag = "3")]
    pub longitude: f64,
    /// Seconds since the unix epoch, as reported by the GPS module.
    #[prost(int64, tag = "4")]
    pub gps_epoch: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TelemetryFormat {
    Json,
    Protobuf,
}

impl FromStr for TelemetryFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(TelemetryFormat::Json),
            "protobuf" | "proto" => Ok(TelemetryFormat::Protobuf),
            other => Err(format!("unknown telemetry format: {other}")),
        }
    }
}

/// A decoded, validated position for one device.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceFix {
    pub device_id: String,
    pub point: GeoPoint,
    pub gps_time: DateTime<Utc>,
}

impl TelemetryMessage {
    pub fn get_device_id(&self) -> Option<&String> {
        self.data.device_id.as_ref().or(self.metadata.device_id.as_ref())
    }

    /// GPS time from `GPS_DATETIME`, falling back to `GPS_EPOCH`.
    pub fn gps_time(&self) -> Option<DateTime<Utc>> {
        let from_datetime = self.data.gps_datetime.as_deref().and_then(|s| {
            NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
                .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S"))
                .ok()
        });

        match from_datetime {
            Some(naive) => Some(Utc.from_utc_datetime(&naive)),
            None => self
                .data
                .gps_epoch
                .and_then(|secs| Utc.timestamp_opt(secs, 0).single()),
        }
    }

    /// `FIX_ = "0"` means the receiver had no satellite lock.
    pub fn has_fix(&self) -> bool {
        self.data.fix.as_deref().map(str::trim) != Some("0")
    }
}

fn parse_f64_option<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrFloat {
        String(String),
        Float(f64),
    }

    let v: Option<StringOrFloat> = Option::deserialize(deserializer)?;
    match v {
        Some(StringOrFloat::Float(f)) => Ok(Some(f)),
        Some(StringOrFloat::String(s)) => {
            if s.trim().is_empty() {
                Ok(None)
            } else {
                s.trim().parse::<f64>().map(Some).map_err(serde::de::Error::custom)
            }
        }
        None => Ok(None),
    }
}

fn parse_i64_option<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrInt {
        String(String),
        Int(i64),
    }

    let v: Option<StringOrInt> = Option::deserialize(deserializer)?;
    match v {
        Some(StringOrInt::Int(i)) => Ok(Some(i)),
        Some(StringOrInt::String(s)) => {
            if s.trim().is_empty() {
                Ok(None)
            } else {
                s.trim().parse::<i64>().map(Some).map_err(serde::de::Error::custom)
            }
        }
        None => Ok(None),
    }
}
