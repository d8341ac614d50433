pub mod alert;
pub mod message;
pub mod profile;

pub use alert::{AlertRecord, AlertStatus, GeoPoint, ParseError, FALLBACK_COORDINATE};
pub use message::{DeviceFix, PositionFix, TelemetryFormat, TelemetryMessage};
pub use profile::Profile;
