use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Coordinate used by the focused view when an alert has no fix yet.
pub const FALLBACK_COORDINATE: GeoPoint = GeoPoint { lat: 0.0, lng: 0.0 };

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

impl GeoPoint {
    /// Returns `None` for non-finite or out-of-range coordinates.
    pub fn new(lat: f64, lng: f64) -> Option<Self> {
        let point = Self { lat, lng };
        point.is_valid().then_some(point)
    }

    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lng.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lng)
    }
}

impl fmt::Display for GeoPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:.6}, {:.6})", self.lat, self.lng)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
    Active,
    Ended,
}

impl AlertStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertStatus::Active => "active",
            AlertStatus::Ended => "ended",
        }
    }

    pub fn for_active(active: bool) -> Self {
        if active {
            AlertStatus::Active
        } else {
            AlertStatus::Ended
        }
    }
}

impl fmt::Display for AlertStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AlertStatus {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(AlertStatus::Active),
            "ended" => Ok(AlertStatus::Ended),
            other => Err(ParseError::UnknownStatus(other.to_string())),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("malformed alert document: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("unknown alert status: {0}")]
    UnknownStatus(String),
    #[error("alert document has an empty subjectId")]
    EmptySubject,
    #[error("status '{status}' disagrees with active={active}")]
    StatusMismatch { status: AlertStatus, active: bool },
    #[error("location out of range: {0}")]
    InvalidLocation(GeoPoint),
}

/// One SOS session's current state, keyed by subject id.
///
/// The wire shape is camelCase; `lastUpdateTimestamp` and `startedAt` are
/// assigned by the store, so a record built locally carries `None` until it
/// is read back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertRecord {
    pub subject_id: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub contact_email: String,
    pub active: bool,
    pub status: AlertStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<GeoPoint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update_timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
}

impl AlertRecord {
    /// Initial document for a fresh activation: active, no location yet.
    pub fn activate(
        subject_id: impl Into<String>,
        display_name: impl Into<String>,
        contact_email: impl Into<String>,
    ) -> Self {
        Self {
            subject_id: subject_id.into(),
            display_name: display_name.into(),
            contact_email: contact_email.into(),
            active: true,
            status: AlertStatus::Active,
            location: None,
            last_update_timestamp: None,
            session_id: Some(Uuid::new_v4()),
            started_at: None,
        }
    }

    pub fn from_document(doc: &Value) -> Result<Self, ParseError> {
        let mut record = AlertRecord::deserialize(doc)?;

        if record.subject_id.trim().is_empty() {
            return Err(ParseError::EmptySubject);
        }
        if AlertStatus::for_active(record.active) != record.status {
            return Err(ParseError::StatusMismatch {
                status: record.status,
                active: record.active,
            });
        }
        if let Some(location) = record.location {
            if !location.is_valid() {
                return Err(ParseError::InvalidLocation(location));
            }
        }

        // Identification is best-effort; the id is always a usable label.
        if record.display_name.trim().is_empty() {
            record.display_name = record.subject_id.clone();
        }
        if record.contact_email.trim().is_empty() {
            record.contact_email = record.subject_id.clone();
        }

        Ok(record)
    }

    pub fn to_document(&self) -> Value {
        // Plain data with string keys; serialization cannot fail.
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Time since the last store write, `None` if the store never stamped it.
    pub fn silence(&self, now: DateTime<Utc>) -> Option<chrono::Duration> {
        self.last_update_timestamp.map(|ts| now - ts)
    }
}
