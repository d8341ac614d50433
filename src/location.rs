use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::time::Instant;

use crate::models::{DeviceFix, GeoPoint};

/// The device's location capability: one sample per request, or nothing.
#[async_trait]
pub trait LocationSource: Send + Sync {
    async fn sample(&self) -> Option<GeoPoint>;
}

#[derive(Debug, Clone)]
struct CachedFix {
    fix: DeviceFix,
    received_at: Instant,
}

/// Latest fix per device, fed by the telemetry consumer.
///
/// Fixes older (by GPS time) than the one already held are ignored, so a
/// late-delivered message never rolls a device's position back.
#[derive(Debug, Clone, Default)]
pub struct FixCache {
    fixes: Arc<RwLock<HashMap<String, CachedFix>>>,
}

impl FixCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` when the fix replaced the held one.
    pub fn record(&self, fix: DeviceFix) -> bool {
        let mut fixes = self.fixes.write().unwrap_or_else(|e| e.into_inner());
        if let Some(held) = fixes.get(&fix.device_id) {
            if held.fix.gps_time > fix.gps_time {
                return false;
            }
        }
        fixes.insert(
            fix.device_id.clone(),
            CachedFix {
                fix,
                received_at: Instant::now(),
            },
        );
        true
    }

    /// Latest fix for the device, if it arrived within `max_age`.
    pub fn latest(&self, device_id: &str, max_age: Duration) -> Option<DeviceFix> {
        let fixes = self.fixes.read().unwrap_or_else(|e| e.into_inner());
        fixes
            .get(device_id)
            .filter(|held| held.received_at.elapsed() <= max_age)
            .map(|held| held.fix.clone())
    }

    pub fn device(&self, device_id: impl Into<String>, max_age: Duration) -> DeviceLocation {
        DeviceLocation {
            cache: self.clone(),
            device_id: device_id.into(),
            max_age,
        }
    }
}

/// Location capability of one device, backed by a [`FixCache`].
#[derive(Debug, Clone)]
pub struct DeviceLocation {
    cache: FixCache,
    device_id: String,
    max_age: Duration,
}

#[async_trait]
impl LocationSource for DeviceLocation {
    async fn sample(&self) -> Option<GeoPoint> {
        self.cache
            .latest(&self.device_id, self.max_age)
            .map(|fix| fix.point)
    }
}

/// Replays a fixed sequence of samples, then reports nothing.
#[derive(Debug, Default)]
pub struct ScriptedLocation {
    samples: Mutex<VecDeque<Option<GeoPoint>>>,
    requests: Mutex<usize>,
}

impl ScriptedLocation {
    pub fn new(samples: impl IntoIterator<Item = Option<GeoPoint>>) -> Self {
        Self {
            samples: Mutex::new(samples.into_iter().collect()),
            requests: Mutex::new(0),
        }
    }

    pub fn requests(&self) -> usize {
        *self.requests.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl LocationSource for ScriptedLocation {
    async fn sample(&self) -> Option<GeoPoint> {
        *self.requests.lock().unwrap_or_else(|e| e.into_inner()) += 1;
        self.samples
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .flatten()
    }
}
