//! Admin-side live view of active SOS alerts.

use chrono::{DateTime, Utc};
use futures::StreamExt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::models::{AlertRecord, GeoPoint, FALLBACK_COORDINATE};
use crate::store::AlertStore;

/// Maps one pushed snapshot to the alert list, dropping documents that do
/// not parse. The result replaces the previous list wholesale.
pub fn reduce_snapshot(docs: &[serde_json::Value]) -> Vec<AlertRecord> {
    docs.iter()
        .filter_map(|doc| match AlertRecord::from_document(doc) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!("Dropping alert document from snapshot: {}", e);
                None
            }
        })
        .collect()
}

pub struct Monitor {
    store: Arc<dyn AlertStore>,
    alerts: Arc<watch::Sender<Vec<AlertRecord>>>,
    discarded: Arc<AtomicU64>,
    subscription: Mutex<Option<JoinHandle<()>>>,
}

impl Monitor {
    pub fn new(store: Arc<dyn AlertStore>) -> Self {
        let (alerts, _) = watch::channel(Vec::new());
        Self {
            store,
            alerts: Arc::new(alerts),
            discarded: Arc::new(AtomicU64::new(0)),
            subscription: Mutex::new(None),
        }
    }

    /// Subscribes to active alerts. No-op while a subscription is live.
    pub fn start_listening(&self) {
        let mut subscription = self.subscription.lock().unwrap_or_else(|e| e.into_inner());
        if subscription.as_ref().is_some_and(|h| !h.is_finished()) {
            debug!("Alert subscription already live");
            return;
        }

        let store = Arc::clone(&self.store);
        let alerts = Arc::clone(&self.alerts);
        let discarded = Arc::clone(&self.discarded);

        *subscription = Some(tokio::spawn(async move {
            let mut pushes = match store.subscribe_active().await {
                Ok(pushes) => pushes,
                Err(e) => {
                    error!("Failed to subscribe to active alerts: {}", e);
                    return;
                }
            };
            info!("Subscribed to active alerts");

            while let Some(push) = pushes.next().await {
                match push {
                    Ok(docs) => {
                        let list = reduce_snapshot(&docs);
                        debug!("Active alerts: {} of {} documents", list.len(), docs.len());
                        alerts.send_replace(list);
                    }
                    Err(e) => {
                        discarded.fetch_add(1, Ordering::Relaxed);
                        error!("Discarding alert push: {}", e);
                    }
                }
            }
            info!("Active alert feed closed");
        }));
    }

    /// Releases the subscription. Safe to call repeatedly.
    pub fn stop_listening(&self) {
        let mut subscription = self.subscription.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = subscription.take() {
            handle.abort();
            debug!("Alert subscription released");
        }
    }

    pub fn is_listening(&self) -> bool {
        let subscription = self.subscription.lock().unwrap_or_else(|e| e.into_inner());
        subscription.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Current active alerts, in store order.
    pub fn alerts(&self) -> Vec<AlertRecord> {
        self.alerts.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<AlertRecord>> {
        self.alerts.subscribe()
    }

    /// Pushes dropped because the live query reported an error.
    pub fn discarded_pushes(&self) -> u64 {
        self.discarded.load(Ordering::Relaxed)
    }

    /// Opens a focused view on a record selected from the list.
    pub fn focus(&self, record: &AlertRecord) -> FocusedAlert {
        let mut focused = FocusedAlert {
            record: record.clone(),
            live: false,
            feed: self.alerts.subscribe(),
        };
        focused.refresh();
        focused
    }

    /// Active alerts with no store write for longer than `max_silence`.
    pub fn stale_alerts(
        &self,
        now: DateTime<Utc>,
        max_silence: chrono::Duration,
    ) -> Vec<AlertRecord> {
        self.alerts
            .borrow()
            .iter()
            .filter(|record| record.silence(now).map_or(true, |s| s > max_silence))
            .cloned()
            .collect()
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        self.stop_listening();
    }
}

/// Live drill-down on one alert.
///
/// Follows the record through later pushes; once the alert leaves the
/// active list the last known state is kept and `is_live` turns false.
pub struct FocusedAlert {
    record: AlertRecord,
    live: bool,
    feed: watch::Receiver<Vec<AlertRecord>>,
}

impl FocusedAlert {
    pub fn record(&self) -> &AlertRecord {
        &self.record
    }

    /// Map position: the last known location, or `FALLBACK_COORDINATE`
    /// when no sample has arrived yet.
    pub fn coordinate(&self) -> GeoPoint {
        self.record.location.unwrap_or(FALLBACK_COORDINATE)
    }

    /// Whether `coordinate` is a real fix rather than the fallback.
    pub fn has_fix(&self) -> bool {
        self.record.location.is_some()
    }

    pub fn is_live(&self) -> bool {
        self.live
    }

    /// Waits for the next push and applies it. Returns `false` once the
    /// monitor is gone.
    pub async fn changed(&mut self) -> bool {
        if self.feed.changed().await.is_err() {
            return false;
        }
        self.refresh();
        true
    }

    fn refresh(&mut self) {
        let list = self.feed.borrow_and_update();
        match list.iter().find(|r| r.subject_id == self.record.subject_id) {
            Some(current) => {
                self.record = current.clone();
                self.live = true;
            }
            None => self.live = false,
        }
    }
}
