use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};

use super::{AlertStore, Snapshot, SnapshotStream, StoreError, WriteKind};
use crate::models::{AlertRecord, GeoPoint};

/// In-process alert collection with a live change feed.
///
/// Documents keep insertion order, which is the order snapshots are pushed
/// in. Every successful write bumps a `watch` version; subscribers re-read
/// the whole active set on each bump, so bursts of writes may coalesce into
/// one push.
#[derive(Clone)]
pub struct MemoryAlertStore {
    shared: Arc<Shared>,
}

struct Shared {
    collection: Mutex<Collection>,
    version: watch::Sender<u64>,
    fail_writes: AtomicBool,
    fail_next_push: AtomicBool,
}

#[derive(Default)]
struct Collection {
    docs: Vec<(String, Value)>,
    applied: Vec<(WriteKind, String)>,
}

impl Default for MemoryAlertStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryAlertStore {
    pub fn new() -> Self {
        let (version, _) = watch::channel(0);
        Self {
            shared: Arc::new(Shared {
                collection: Mutex::new(Collection::default()),
                version,
                fail_writes: AtomicBool::new(false),
                fail_next_push: AtomicBool::new(false),
            }),
        }
    }

    /// Makes every following write fail until reset.
    pub fn fail_writes(&self, fail: bool) {
        self.shared.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Turns the next pushed snapshot into a subscription error.
    pub fn fail_next_push(&self) {
        self.shared.fail_next_push.store(true, Ordering::SeqCst);
    }

    /// Stores a raw document as-is, bypassing the record contract.
    pub async fn insert_document(&self, key: &str, doc: Value) {
        let mut collection = self.shared.collection.lock().await;
        collection.upsert(key, doc);
        drop(collection);
        self.bump();
    }

    pub async fn document(&self, key: &str) -> Option<Value> {
        let collection = self.shared.collection.lock().await;
        collection.find(key).cloned()
    }

    pub async fn record(&self, key: &str) -> Option<AlertRecord> {
        let doc = self.document(key).await?;
        AlertRecord::from_document(&doc).ok()
    }

    pub async fn len(&self) -> usize {
        self.shared.collection.lock().await.docs.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Writes applied so far, in completion order.
    pub async fn applied_writes(&self) -> Vec<(WriteKind, String)> {
        self.shared.collection.lock().await.applied.clone()
    }

    pub async fn applied_count(&self, kind: WriteKind) -> usize {
        self.shared
            .collection
            .lock()
            .await
            .applied
            .iter()
            .filter(|(k, _)| *k == kind)
            .count()
    }

    fn bump(&self) {
        self.shared.version.send_modify(|v| *v += 1);
    }

    fn check_writable(&self) -> Result<(), StoreError> {
        if self.shared.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("writes rejected".to_string()));
        }
        Ok(())
    }

    async fn patch(
        &self,
        kind: WriteKind,
        subject_id: &str,
        fields: Value,
    ) -> Result<(), StoreError> {
        self.check_writable()?;

        let mut collection = self.shared.collection.lock().await;
        let doc = collection
            .find_mut(subject_id)
            .ok_or_else(|| StoreError::NotFound(subject_id.to_string()))?;

        if let (Some(target), Value::Object(fields)) = (doc.as_object_mut(), fields) {
            for (field, value) in fields {
                target.insert(field, value);
            }
            target.insert("lastUpdateTimestamp".to_string(), server_time());
        }
        collection.applied.push((kind, subject_id.to_string()));
        drop(collection);

        self.bump();
        Ok(())
    }
}

impl Shared {
    async fn active_snapshot(&self) -> Snapshot {
        let collection = self.collection.lock().await;
        collection
            .docs
            .iter()
            .filter(|(_, doc)| doc.get("active") == Some(&Value::Bool(true)))
            .map(|(_, doc)| doc.clone())
            .collect()
    }
}

impl Collection {
    fn find(&self, key: &str) -> Option<&Value> {
        self.docs.iter().find(|(k, _)| k == key).map(|(_, doc)| doc)
    }

    fn find_mut(&mut self, key: &str) -> Option<&mut Value> {
        self.docs.iter_mut().find(|(k, _)| k == key).map(|(_, doc)| doc)
    }

    fn upsert(&mut self, key: &str, doc: Value) {
        match self.find_mut(key) {
            Some(existing) => *existing = doc,
            None => self.docs.push((key.to_string(), doc)),
        }
    }
}

fn server_time() -> Value {
    Value::String(Utc::now().to_rfc3339())
}

#[async_trait]
impl AlertStore for MemoryAlertStore {
    async fn set_alert(&self, record: &AlertRecord) -> Result<(), StoreError> {
        self.check_writable()?;

        let mut doc = record.to_document();
        if let Some(fields) = doc.as_object_mut() {
            fields.insert("lastUpdateTimestamp".to_string(), server_time());
            fields.insert("startedAt".to_string(), server_time());
        }

        let mut collection = self.shared.collection.lock().await;
        collection.upsert(&record.subject_id, doc);
        collection
            .applied
            .push((WriteKind::Set, record.subject_id.clone()));
        drop(collection);

        self.bump();
        Ok(())
    }

    async fn update_location(
        &self,
        subject_id: &str,
        location: GeoPoint,
    ) -> Result<(), StoreError> {
        let fields = json!({ "location": { "lat": location.lat, "lng": location.lng } });
        self.patch(WriteKind::Location, subject_id, fields).await
    }

    async fn end_alert(&self, subject_id: &str) -> Result<(), StoreError> {
        let fields = json!({ "active": false, "status": "ended" });
        self.patch(WriteKind::End, subject_id, fields).await
    }

    async fn subscribe_active(&self) -> Result<SnapshotStream, StoreError> {
        let rx = self.shared.version.subscribe();
        let shared = Arc::clone(&self.shared);

        let pushes = stream::unfold((shared, rx, true), |(shared, mut rx, first)| async move {
            if !first && rx.changed().await.is_err() {
                return None;
            }
            let push = if shared.fail_next_push.swap(false, Ordering::SeqCst) {
                Err(StoreError::Unavailable("live query failed".to_string()))
            } else {
                Ok(shared.active_snapshot().await)
            };
            Some((push, (shared, rx, false)))
        });

        Ok(pushes.boxed())
    }
}
