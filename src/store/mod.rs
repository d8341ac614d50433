//! Shared alert store.
//!
//! The tracker and the monitor never talk to each other directly; the
//! `sos_alerts` collection is the only channel between them. A store offers
//! keyed writes (full set and partial update) and a live query over active
//! alerts that pushes the complete matching set on every change.

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::Value;

use crate::models::{AlertRecord, GeoPoint};

pub mod memory;
pub mod postgres;

pub use memory::MemoryAlertStore;
pub use postgres::PgAlertStore;

/// One push of the live query: every active alert document, unparsed.
pub type Snapshot = Vec<Value>;

pub type SnapshotStream = BoxStream<'static, Result<Snapshot, StoreError>>;

/// Which of the three keyed writes a store call performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    Set,
    Location,
    End,
}

impl WriteKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WriteKind::Set => "set",
            WriteKind::Location => "location",
            WriteKind::End => "end",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("alert document not found: {0}")]
    NotFound(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait AlertStore: Send + Sync {
    /// Full-document upsert keyed by `record.subject_id`.
    async fn set_alert(&self, record: &AlertRecord) -> Result<(), StoreError>;

    /// Partial update of `location` and `lastUpdateTimestamp`.
    async fn update_location(&self, subject_id: &str, location: GeoPoint)
        -> Result<(), StoreError>;

    /// Partial update to `active=false`, `status="ended"`.
    async fn end_alert(&self, subject_id: &str) -> Result<(), StoreError>;

    /// Live query for `active == true`. The first item is the current set.
    async fn subscribe_active(&self) -> Result<SnapshotStream, StoreError>;
}
