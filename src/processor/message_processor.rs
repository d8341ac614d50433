use crate::location::FixCache;
use crate::models::{DeviceFix, GeoPoint, PositionFix, TelemetryFormat, TelemetryMessage};
use chrono::{TimeZone, Utc};
use prost::Message;
use tracing::{debug, warn};

/// Decodes one telemetry payload into a validated fix.
pub fn decode_fix(format: TelemetryFormat, payload: &[u8]) -> Option<DeviceFix> {
    match format {
        TelemetryFormat::Json => decode_json(payload),
        TelemetryFormat::Protobuf => decode_protobuf(payload),
    }
}

fn decode_json(payload: &[u8]) -> Option<DeviceFix> {
    // 1. Parse JSON
    let message: TelemetryMessage = match serde_json::from_slice(payload) {
        Ok(m) => m,
        Err(e) => {
            warn!("Failed to parse telemetry message: {}", e);
            return None;
        }
    };

    // 2. Extract Data
    let device_id = match message.get_device_id() {
        Some(id) => id.clone(),
        None => {
            warn!("Telemetry message missing device_id, skipping");
            return None;
        }
    };

    if !message.has_fix() {
        debug!("No satellite fix for device {}, skipping", device_id);
        return None;
    }

    let gps_time = match message.gps_time() {
        Some(t) => t,
        None => {
            warn!("Invalid GPS time for device {}: {:?}", device_id, message.data.gps_datetime);
            return None;
        }
    };

    let point = match (message.data.latitude, message.data.longitude) {
        (Some(lat), Some(lng)) => GeoPoint::new(lat, lng),
        _ => None,
    };
    let Some(point) = point else {
        warn!("Missing or invalid coordinates for device {}", device_id);
        return None;
    };

    Some(DeviceFix {
        device_id,
        point,
        gps_time,
    })
}

fn decode_protobuf(payload: &[u8]) -> Option<DeviceFix> {
    let fix = match PositionFix::decode(payload) {
        Ok(f) => f,
        Err(e) => {
            warn!("Failed to decode position fix: {}", e);
            return None;
        }
    };

    if fix.device_id.is_empty() {
        warn!("Position fix missing device_id, skipping");
        return None;
    }

    let Some(gps_time) = Utc.timestamp_opt(fix.gps_epoch, 0).single() else {
        warn!("Invalid GPS epoch for device {}: {}", fix.device_id, fix.gps_epoch);
        return None;
    };

    // Receivers without a lock report exactly (0, 0).
    let point = GeoPoint::new(fix.latitude, fix.longitude)
        .filter(|p| p.lat != 0.0 || p.lng != 0.0);
    let Some(point) = point else {
        warn!("Missing or invalid coordinates for device {}", fix.device_id);
        return None;
    };

    Some(DeviceFix {
        device_id: fix.device_id,
        point,
        gps_time,
    })
}

/// Decodes a payload and records it if it belongs to a tracked device.
///
/// An empty `tracked` list accepts every device.
pub fn process_message(
    fixes: &FixCache,
    tracked: &[String],
    format: TelemetryFormat,
    payload: &[u8],
) -> bool {
    let Some(fix) = decode_fix(format, payload) else {
        return false;
    };

    if !tracked.is_empty() && !tracked.contains(&fix.device_id) {
        return false;
    }

    let device_id = fix.device_id.clone();
    let point = fix.point;
    if fixes.record(fix) {
        debug!("Fix for device {}: {}", device_id, point);
        true
    } else {
        debug!("Ignored out-of-order fix for device {}", device_id);
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn json_payload(device: &str, datetime: &str, lat: &str, lng: &str) -> Vec<u8> {
        format!(
            r#"{{"data": {{"DEVICE_ID": "{device}", "GPS_DATETIME": "{datetime}", "LATITUD": "{lat}", "LONGITUD": "{lng}", "FIX_": "1"}}, "metadata": {{}}}}"#
        )
        .into_bytes()
    }

    #[test]
    fn test_json_payload_becomes_fix() {
        let payload = json_payload("0848086072", "2025-11-29T06:15:15", "+25.55", "-100.93");
        let fix = decode_fix(TelemetryFormat::Json, &payload).unwrap();
        assert_eq!(fix.device_id, "0848086072");
        assert_eq!(fix.point, GeoPoint::new(25.55, -100.93).unwrap());
        assert_eq!(fix.gps_time.timestamp(), 1764396915);
    }

    #[test]
    fn test_rejects_unusable_payloads() {
        assert!(decode_fix(TelemetryFormat::Json, b"not json").is_none());
        let no_time = json_payload("77", "yesterday", "25.55", "-100.93");
        assert!(decode_fix(TelemetryFormat::Json, &no_time).is_none());
        let off_map = json_payload("77", "2025-11-29 06:15:15", "125.55", "-100.93");
        assert!(decode_fix(TelemetryFormat::Json, &off_map).is_none());
    }

    #[test]
    fn test_protobuf_payload_becomes_fix() {
        let payload = PositionFix {
            device_id: "77".to_string(),
            latitude: 25.55,
            longitude: -100.93,
            gps_epoch: 1764396915,
        }
        .encode_to_vec();
        let fix = decode_fix(TelemetryFormat::Protobuf, &payload).unwrap();
        assert_eq!(fix.device_id, "77");

        let no_lock = PositionFix {
            device_id: "77".to_string(),
            latitude: 0.0,
            longitude: 0.0,
            gps_epoch: 1764396915,
        }
        .encode_to_vec();
        assert!(decode_fix(TelemetryFormat::Protobuf, &no_lock).is_none());
    }

    #[tokio::test]
    async fn test_only_tracked_devices_are_recorded() {
        let fixes = FixCache::new();
        let tracked = vec!["77".to_string()];

        let other = json_payload("78", "2025-11-29 06:15:15", "25.55", "-100.93");
        assert!(!process_message(&fixes, &tracked, TelemetryFormat::Json, &other));

        let mine = json_payload("77", "2025-11-29 06:15:15", "25.55", "-100.93");
        assert!(process_message(&fixes, &tracked, TelemetryFormat::Json, &mine));

        let older = json_payload("77", "2025-11-29 06:10:00", "25.00", "-100.00");
        assert!(!process_message(&fixes, &tracked, TelemetryFormat::Json, &older));

        let latest = fixes.latest("77", Duration::from_secs(60)).unwrap();
        assert_eq!(latest.point.lat, 25.55);
        assert!(fixes.latest("78", Duration::from_secs(60)).is_none());
    }
}
