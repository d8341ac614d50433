use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use sqlx::postgres::PgListener;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use super::{AlertStore, Snapshot, SnapshotStream, StoreError};
use crate::db::{queries, DbPool};
use crate::models::{AlertRecord, GeoPoint};

/// Alert collection backed by the `sos_alerts` table.
///
/// Every insert or update fires `pg_notify('sos_alerts', subject_id)` from a
/// row trigger; subscribers re-run the active query on each notification and
/// push the full result, ordered by activation time.
#[derive(Clone)]
pub struct PgAlertStore {
    pool: DbPool,
}

impl PgAlertStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

async fn active_documents(pool: &DbPool) -> Result<Snapshot, StoreError> {
    let docs: Vec<serde_json::Value> =
        sqlx::query_scalar(queries::SELECT_ACTIVE_ALERT_DOCUMENTS)
            .fetch_all(pool)
            .await?;
    Ok(docs)
}

#[async_trait]
impl AlertStore for PgAlertStore {
    async fn set_alert(&self, record: &AlertRecord) -> Result<(), StoreError> {
        sqlx::query(queries::UPSERT_ALERT)
            .bind(&record.subject_id)
            .bind(&record.display_name)
            .bind(&record.contact_email)
            .bind(record.active)
            .bind(record.status.as_str())
            .bind(record.location.map(|l| l.lat))
            .bind(record.location.map(|l| l.lng))
            .bind(record.session_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn update_location(
        &self,
        subject_id: &str,
        location: GeoPoint,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(queries::UPDATE_ALERT_LOCATION)
            .bind(subject_id)
            .bind(location.lat)
            .bind(location.lng)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(subject_id.to_string()));
        }
        Ok(())
    }

    async fn end_alert(&self, subject_id: &str) -> Result<(), StoreError> {
        let result = sqlx::query(queries::END_ALERT)
            .bind(subject_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(subject_id.to_string()));
        }
        Ok(())
    }

    async fn subscribe_active(&self) -> Result<SnapshotStream, StoreError> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(queries::ALERTS_CHANNEL).await?;
        debug!("Listening on channel {}", queries::ALERTS_CHANNEL);

        let pool = self.pool.clone();
        Ok(refresh_on_change(listener, move || {
            let pool = pool.clone();
            async move { active_documents(&pool).await }
        }))
    }
}

/// Source of change signals for the live query.
#[async_trait]
trait ChangeFeed: Send + 'static {
    /// `Ok(None)` means the connection dropped and changes may have been missed.
    async fn next_change(&mut self) -> Result<Option<String>, sqlx::Error>;
}

#[async_trait]
impl ChangeFeed for PgListener {
    async fn next_change(&mut self) -> Result<Option<String>, sqlx::Error> {
        Ok(self.try_recv().await?.map(|n| n.payload().to_string()))
    }
}

/// Pushes `query` once up front, then again after every change signal.
///
/// A lost connection or a feed error also re-queries: notifications sent in
/// the gap are not replayed, so only a fresh read brings the set up to date.
fn refresh_on_change<C, Q, Fut>(feed: C, query: Q) -> SnapshotStream
where
    C: ChangeFeed,
    Q: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Snapshot, StoreError>> + Send + 'static,
{
    stream::unfold((feed, query, true), |(mut feed, query, first)| async move {
        if !first {
            match feed.next_change().await {
                Ok(Some(subject_id)) => {
                    debug!("Alert changed: {}", subject_id);
                }
                Ok(None) => {
                    // The next call reconnects.
                    warn!("Alert listener connection lost, refreshing active alerts");
                }
                Err(e) => {
                    warn!("Alert listener error: {}", e);
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
            }
        }
        let push = query().await;
        Some((push, (feed, query, false)))
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct ScriptedFeed {
        changes: VecDeque<Result<Option<String>, sqlx::Error>>,
    }

    #[async_trait]
    impl ChangeFeed for ScriptedFeed {
        async fn next_change(&mut self) -> Result<Option<String>, sqlx::Error> {
            match self.changes.pop_front() {
                Some(change) => change,
                None => futures::future::pending().await,
            }
        }
    }

    fn counting_query(
        queries: Arc<AtomicUsize>,
    ) -> impl Fn() -> futures::future::Ready<Result<Snapshot, StoreError>> {
        move || {
            let n = queries.fetch_add(1, Ordering::SeqCst) + 1;
            futures::future::ready(Ok(vec![json!({ "query": n })]))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_connection_and_errors_trigger_requery() {
        let queries = Arc::new(AtomicUsize::new(0));
        let feed = ScriptedFeed {
            changes: VecDeque::from([
                Ok(Some("S1".to_string())),
                Ok(None),
                Err(sqlx::Error::PoolTimedOut),
            ]),
        };
        let mut pushes = refresh_on_change(feed, counting_query(queries.clone()));

        for expected in 1..=4 {
            let push = pushes.next().await.unwrap().unwrap();
            assert_eq!(push, vec![json!({ "query": expected })]);
        }
        assert_eq!(queries.load(Ordering::SeqCst), 4);

        let idle = tokio::time::timeout(Duration::from_secs(5), pushes.next()).await;
        assert!(idle.is_err());
        assert_eq!(queries.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_requery_is_pushed_as_error() {
        let feed = ScriptedFeed {
            changes: VecDeque::from([Ok(None)]),
        };
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let mut pushes = refresh_on_change(feed, move || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Ok(Vec::new())
                } else {
                    Err(StoreError::Unavailable("database down".to_string()))
                }
            }
        });

        assert!(pushes.next().await.unwrap().unwrap().is_empty());
        assert!(matches!(
            pushes.next().await.unwrap(),
            Err(StoreError::Unavailable(_))
        ));
    }
}
