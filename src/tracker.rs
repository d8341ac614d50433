//! SOS tracker: the reporting side of the alert flow.
//!
//! Activation writes the subject's alert document, then a sampling loop
//! refreshes its location every interval until cancellation marks the
//! document ended. Store writes are fire-and-forget: the loop never waits
//! on them, they reach the store in the order issued, and failures are
//! logged and recorded in the [`WriteLog`] but never retried.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use futures::future::{BoxFuture, FutureExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::identity::{resolve_display, IdentityProvider, ProfileDirectory};
use crate::location::LocationSource;
use crate::models::AlertRecord;
use crate::store::{AlertStore, StoreError, WriteKind};

const WRITE_HISTORY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerState {
    Idle,
    Starting,
    Tracking,
    Stopped,
}

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    pub sample_interval: Duration,
    /// A sample that takes longer than this counts as a missed tick.
    pub sample_timeout: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            sample_interval: Duration::from_secs(5),
            sample_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    Pending,
    Succeeded,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteAttempt {
    pub seq: u64,
    pub kind: WriteKind,
    pub subject_id: String,
    pub outcome: WriteOutcome,
}

type QueuedWrite = (u64, WriteKind, String, BoxFuture<'static, Result<(), StoreError>>);

/// Record of issued writes and their outcomes, newest last.
///
/// Writes are applied one at a time by a single writer task, in the order
/// they were dispatched, so a terminating write can never overtake the
/// activation that follows it.
#[derive(Clone, Default)]
pub struct WriteLog {
    history: Arc<Mutex<WriteHistory>>,
    writer: Arc<Mutex<Option<Writer>>>,
}

#[derive(Default)]
struct WriteHistory {
    next_seq: u64,
    attempts: VecDeque<WriteAttempt>,
}

struct Writer {
    queue: mpsc::UnboundedSender<QueuedWrite>,
    applied: watch::Receiver<u64>,
}

impl WriteLog {
    /// Queues `write` without waiting on it.
    fn dispatch<F>(&self, kind: WriteKind, subject_id: &str, write: F)
    where
        F: Future<Output = Result<(), StoreError>> + Send + 'static,
    {
        let mut writer = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        let seq = {
            let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
            history.next_seq += 1;
            let seq = history.next_seq;
            if history.attempts.len() == WRITE_HISTORY {
                history.attempts.pop_front();
            }
            history.attempts.push_back(WriteAttempt {
                seq,
                kind,
                subject_id: subject_id.to_string(),
                outcome: WriteOutcome::Pending,
            });
            seq
        };

        let queue = match writer.as_ref() {
            Some(current) if !current.queue.is_closed() => current.queue.clone(),
            _ => {
                let (queue, rx) = mpsc::unbounded_channel();
                let (applied_tx, applied) = watch::channel(seq - 1);
                tokio::spawn(run_writer(Arc::clone(&self.history), rx, applied_tx));
                *writer = Some(Writer {
                    queue: queue.clone(),
                    applied,
                });
                queue
            }
        };

        if queue
            .send((seq, kind, subject_id.to_string(), write.boxed()))
            .is_err()
        {
            warn!("{} write #{} for {} dropped: writer stopped", kind.as_str(), seq, subject_id);
            finish(&self.history, seq, WriteOutcome::Failed("writer stopped".to_string()));
        }
    }

    /// Waits for every write issued so far to complete.
    pub async fn settle(&self) {
        let target = {
            let history = self.history.lock().unwrap_or_else(|e| e.into_inner());
            history.next_seq
        };
        let applied = {
            let writer = self.writer.lock().unwrap_or_else(|e| e.into_inner());
            writer.as_ref().map(|w| w.applied.clone())
        };
        if let Some(mut applied) = applied {
            let _ = applied.wait_for(|done| *done >= target).await;
        }
    }

    pub fn attempts(&self) -> Vec<WriteAttempt> {
        let history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        history.attempts.iter().cloned().collect()
    }

    pub fn count(&self, kind: WriteKind) -> usize {
        let history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        history.attempts.iter().filter(|a| a.kind == kind).count()
    }
}

async fn run_writer(
    history: Arc<Mutex<WriteHistory>>,
    mut queue: mpsc::UnboundedReceiver<QueuedWrite>,
    applied: watch::Sender<u64>,
) {
    while let Some((seq, kind, subject_id, write)) = queue.recv().await {
        let outcome = match write.await {
            Ok(()) => {
                debug!("{} write #{} for {} applied", kind.as_str(), seq, subject_id);
                WriteOutcome::Succeeded
            }
            Err(e) => {
                warn!("{} write #{} for {} failed: {}", kind.as_str(), seq, subject_id, e);
                WriteOutcome::Failed(e.to_string())
            }
        };
        finish(&history, seq, outcome);
        applied.send_replace(seq);
    }
}

fn finish(history: &Mutex<WriteHistory>, seq: u64, outcome: WriteOutcome) {
    let mut history = history.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(attempt) = history.attempts.iter_mut().find(|a| a.seq == seq) {
        attempt.outcome = outcome;
    }
}

struct Session {
    subject_id: String,
    cancel: watch::Sender<bool>,
    sampling: JoinHandle<()>,
}

pub struct Tracker {
    store: Arc<dyn AlertStore>,
    location: Arc<dyn LocationSource>,
    identity: Arc<dyn IdentityProvider>,
    profiles: Arc<dyn ProfileDirectory>,
    config: TrackerConfig,
    state: watch::Sender<TrackerState>,
    session: tokio::sync::Mutex<Option<Session>>,
    writes: WriteLog,
}

impl Tracker {
    pub fn new(
        store: Arc<dyn AlertStore>,
        location: Arc<dyn LocationSource>,
        identity: Arc<dyn IdentityProvider>,
        profiles: Arc<dyn ProfileDirectory>,
        config: TrackerConfig,
    ) -> Self {
        let (state, _) = watch::channel(TrackerState::Idle);
        Self {
            store,
            location,
            identity,
            profiles,
            config,
            state,
            session: tokio::sync::Mutex::new(None),
            writes: WriteLog::default(),
        }
    }

    /// Activates SOS for the current identity and starts the sampling loop.
    ///
    /// No-op while a loop is live, and when no identity is available.
    pub async fn start_tracking(&self) {
        let mut session = self.session.lock().await;
        if session.is_some() {
            debug!("SOS tracking already running");
            return;
        }

        let Some(identity) = self.identity.current() else {
            warn!("SOS activation ignored: no identity available");
            return;
        };

        self.state.send_replace(TrackerState::Starting);

        let display = resolve_display(&identity, self.profiles.as_ref()).await;
        let record = AlertRecord::activate(
            &identity.subject_id,
            display.display_name,
            display.contact_email,
        );
        info!(
            "SOS activated for {} ({}), session {:?}",
            record.subject_id, record.display_name, record.session_id
        );

        let store = Arc::clone(&self.store);
        self.writes
            .dispatch(WriteKind::Set, &identity.subject_id, async move {
                store.set_alert(&record).await
            });

        let (cancel, cancel_rx) = watch::channel(false);
        let sampling = SamplingLoop {
            subject_id: identity.subject_id.clone(),
            store: Arc::clone(&self.store),
            location: Arc::clone(&self.location),
            writes: self.writes.clone(),
            interval: self.config.sample_interval,
            sample_timeout: self.config.sample_timeout,
        };
        let handle = tokio::spawn(sampling.run(cancel_rx));

        *session = Some(Session {
            subject_id: identity.subject_id,
            cancel,
            sampling: handle,
        });
        self.state.send_replace(TrackerState::Tracking);
    }

    /// Cancels the sampling loop, if any, and marks the alert ended.
    ///
    /// The terminating write is issued whenever a subject is known, even if
    /// no loop was running.
    pub async fn stop_tracking(&self) {
        let mut session = self.session.lock().await;
        let stopped = session.take();

        let subject_id = match (stopped, self.identity.current()) {
            (Some(stopped), _) => {
                stopped.cancel.send_replace(true);
                // Wait out the loop so no late location write follows the end.
                let _ = stopped.sampling.await;
                info!("SOS cancelled for {}", stopped.subject_id);
                self.state.send_replace(TrackerState::Stopped);
                stopped.subject_id
            }
            (None, Some(identity)) => identity.subject_id,
            (None, None) => {
                debug!("SOS cancel ignored: no identity available");
                return;
            }
        };

        let store = Arc::clone(&self.store);
        let id = subject_id.clone();
        self.writes
            .dispatch(WriteKind::End, &subject_id, async move {
                store.end_alert(&id).await
            });
    }

    pub fn state(&self) -> TrackerState {
        *self.state.borrow()
    }

    pub fn is_tracking(&self) -> bool {
        matches!(
            self.state(),
            TrackerState::Starting | TrackerState::Tracking
        )
    }

    pub fn watch_state(&self) -> watch::Receiver<TrackerState> {
        self.state.subscribe()
    }

    pub fn writes(&self) -> &WriteLog {
        &self.writes
    }

    /// Waits for in-flight writes, e.g. the terminating write before exit.
    pub async fn flush_writes(&self) {
        self.writes.settle().await;
    }
}

struct SamplingLoop {
    subject_id: String,
    store: Arc<dyn AlertStore>,
    location: Arc<dyn LocationSource>,
    writes: WriteLog,
    interval: Duration,
    sample_timeout: Duration,
}

impl SamplingLoop {
    async fn run(self, mut cancel: watch::Receiver<bool>) {
        let mut tick: u64 = 0;

        loop {
            tokio::select! {
                _ = cancel.changed() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
            tick += 1;

            let sample = tokio::select! {
                _ = cancel.changed() => break,
                sample = tokio::time::timeout(self.sample_timeout, self.location.sample()) => {
                    sample.ok().flatten()
                }
            };

            let Some(point) = sample else {
                debug!("Tick {} for {}: no location sample, skipping", tick, self.subject_id);
                continue;
            };

            debug!("Tick {} for {}: {}", tick, self.subject_id, point);
            let store = Arc::clone(&self.store);
            let id = self.subject_id.clone();
            self.writes
                .dispatch(WriteKind::Location, &self.subject_id, async move {
                    store.update_location(&id, point).await
                });
        }

        debug!(
            "Sampling loop for {} stopped after {} ticks",
            self.subject_id, tick
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{Identity, MemoryProfileDirectory, SessionIdentity};
    use crate::location::ScriptedLocation;
    use crate::models::{AlertStatus, GeoPoint};
    use crate::store::MemoryAlertStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn identity() -> Identity {
        Identity::new("S1", Some("ana.lopez@uadec.edu.mx".to_string()))
    }

    fn tracker(
        store: &MemoryAlertStore,
        location: Arc<dyn LocationSource>,
        identity: Option<Identity>,
    ) -> Tracker {
        let provider = match identity {
            Some(identity) => SessionIdentity::signed_in(identity),
            None => SessionIdentity::default(),
        };
        Tracker::new(
            Arc::new(store.clone()),
            location,
            Arc::new(provider),
            Arc::new(MemoryProfileDirectory::default()),
            TrackerConfig::default(),
        )
    }

    fn point(lat: f64, lng: f64) -> Option<GeoPoint> {
        GeoPoint::new(lat, lng)
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_is_idempotent() {
        let store = MemoryAlertStore::new();
        let location = Arc::new(ScriptedLocation::new([
            point(25.55, -100.93),
            point(25.56, -100.94),
        ]));
        let tracker = tracker(&store, location.clone(), Some(identity()));

        tracker.start_tracking().await;
        tracker.start_tracking().await;
        assert!(tracker.is_tracking());

        tokio::time::sleep(Duration::from_secs(11)).await;
        tracker.flush_writes().await;

        assert_eq!(tracker.writes().count(WriteKind::Set), 1);
        assert_eq!(store.applied_count(WriteKind::Set).await, 1);
        // One loop: two ticks, two samples.
        assert_eq!(location.requests(), 2);
        assert_eq!(store.applied_count(WriteKind::Location).await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_document() {
        let store = MemoryAlertStore::new();
        let tracker = tracker(&store, Arc::new(ScriptedLocation::default()), Some(identity()));

        tracker.start_tracking().await;
        tracker.flush_writes().await;

        let record = store.record("S1").await.unwrap();
        assert!(record.active);
        assert_eq!(record.status, AlertStatus::Active);
        assert_eq!(record.location, None);
        assert_eq!(record.display_name, "Ana Lopez");
        assert_eq!(record.contact_email, "ana.lopez@uadec.edu.mx");
        assert!(record.last_update_timestamp.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_without_identity_does_nothing() {
        let store = MemoryAlertStore::new();
        let tracker = tracker(&store, Arc::new(ScriptedLocation::default()), None);

        tracker.start_tracking().await;
        tokio::time::sleep(Duration::from_secs(6)).await;

        assert_eq!(tracker.state(), TrackerState::Idle);
        assert!(tracker.writes().attempts().is_empty());
        assert!(store.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_without_identity_or_session_is_silent() {
        let store = MemoryAlertStore::new();
        let tracker = tracker(&store, Arc::new(ScriptedLocation::default()), None);

        tracker.stop_tracking().await;
        tracker.stop_tracking().await;

        assert!(tracker.writes().attempts().is_empty());
        assert_eq!(tracker.state(), TrackerState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_with_identity_but_no_loop_still_ends_alert() {
        let store = MemoryAlertStore::new();
        store
            .set_alert(&AlertRecord::activate("S1", "Ana", "ana@uadec.edu.mx"))
            .await
            .unwrap();
        let tracker = tracker(&store, Arc::new(ScriptedLocation::default()), Some(identity()));

        tracker.stop_tracking().await;
        tracker.flush_writes().await;

        let attempts = tracker.writes().attempts();
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].kind, WriteKind::End);
        assert_eq!(attempts[0].outcome, WriteOutcome::Succeeded);
        assert!(!store.record("S1").await.unwrap().active);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempts_are_distinct_from_successes() {
        // No document exists yet, so the terminating write is attempted and fails.
        let store = MemoryAlertStore::new();
        let tracker = tracker(&store, Arc::new(ScriptedLocation::default()), Some(identity()));

        tracker.stop_tracking().await;
        tracker.flush_writes().await;

        let attempts = tracker.writes().attempts();
        assert_eq!(attempts.len(), 1);
        assert!(matches!(attempts[0].outcome, WriteOutcome::Failed(_)));
        assert!(store.applied_writes().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_overwrites_ended_record() {
        let store = MemoryAlertStore::new();
        let location = Arc::new(ScriptedLocation::new([point(25.55, -100.93)]));
        let tracker = tracker(&store, location, Some(identity()));

        tracker.start_tracking().await;
        tokio::time::sleep(Duration::from_secs(6)).await;
        tracker.stop_tracking().await;
        tracker.flush_writes().await;

        let ended = store.record("S1").await.unwrap();
        assert!(!ended.active);
        assert_eq!(ended.status, AlertStatus::Ended);
        assert_eq!(tracker.state(), TrackerState::Stopped);

        tracker.start_tracking().await;
        tracker.flush_writes().await;

        let restarted = store.record("S1").await.unwrap();
        assert_eq!(store.len().await, 1);
        assert!(restarted.active);
        assert_eq!(restarted.status, AlertStatus::Active);
        assert_eq!(restarted.location, None);
        assert_ne!(restarted.session_id, ended.session_id);
        assert!(tracker.is_tracking());
    }

    #[tokio::test(start_paused = true)]
    async fn test_missed_sample_skips_only_that_tick() {
        let store = MemoryAlertStore::new();
        let location = Arc::new(ScriptedLocation::new([
            point(25.55, -100.93),
            None,
            point(25.57, -100.95),
        ]));
        let tracker = tracker(&store, location.clone(), Some(identity()));

        tracker.start_tracking().await;
        tokio::time::sleep(Duration::from_secs(16)).await;
        tracker.flush_writes().await;

        assert_eq!(location.requests(), 3);
        assert_eq!(tracker.writes().count(WriteKind::Location), 2);
        assert_eq!(
            store.record("S1").await.unwrap().location,
            point(25.57, -100.95)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_loop() {
        let store = MemoryAlertStore::new();
        let location = Arc::new(ScriptedLocation::new(
            std::iter::repeat(point(25.55, -100.93)).take(10),
        ));
        let tracker = tracker(&store, location.clone(), Some(identity()));

        tracker.start_tracking().await;
        tokio::time::sleep(Duration::from_secs(6)).await;
        tracker.stop_tracking().await;
        tokio::time::sleep(Duration::from_secs(30)).await;
        tracker.flush_writes().await;

        assert_eq!(location.requests(), 1);
        assert!(!tracker.is_tracking());
        assert_eq!(store.applied_count(WriteKind::End).await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_failures_do_not_stop_tracking() {
        let store = MemoryAlertStore::new();
        store.fail_writes(true);
        let location = Arc::new(ScriptedLocation::new([point(25.55, -100.93)]));
        let tracker = tracker(&store, location, Some(identity()));

        tracker.start_tracking().await;
        tokio::time::sleep(Duration::from_secs(6)).await;
        tracker.flush_writes().await;

        assert!(tracker.is_tracking());
        let attempts = tracker.writes().attempts();
        assert_eq!(attempts.len(), 2);
        assert!(attempts
            .iter()
            .all(|a| matches!(a.outcome, WriteOutcome::Failed(_))));
        assert!(store.is_empty().await);
    }

    /// Memory store whose terminating write takes a while to land.
    struct SlowEndStore {
        inner: MemoryAlertStore,
        delay: Duration,
    }

    #[async_trait]
    impl AlertStore for SlowEndStore {
        async fn set_alert(&self, record: &AlertRecord) -> Result<(), StoreError> {
            self.inner.set_alert(record).await
        }

        async fn update_location(
            &self,
            subject_id: &str,
            location: GeoPoint,
        ) -> Result<(), StoreError> {
            self.inner.update_location(subject_id, location).await
        }

        async fn end_alert(&self, subject_id: &str) -> Result<(), StoreError> {
            tokio::time::sleep(self.delay).await;
            self.inner.end_alert(subject_id).await
        }

        async fn subscribe_active(&self) -> Result<crate::store::SnapshotStream, StoreError> {
            self.inner.subscribe_active().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_end_does_not_overtake_reactivation() {
        let memory = MemoryAlertStore::new();
        let store = Arc::new(SlowEndStore {
            inner: memory.clone(),
            delay: Duration::from_millis(50),
        });
        let location = Arc::new(ScriptedLocation::new([point(25.55, -100.93)]));
        let tracker = Tracker::new(
            store,
            location,
            Arc::new(SessionIdentity::signed_in(identity())),
            Arc::new(MemoryProfileDirectory::default()),
            TrackerConfig::default(),
        );

        tracker.start_tracking().await;
        tracker.flush_writes().await;
        tracker.stop_tracking().await;
        tracker.start_tracking().await;
        tracker.flush_writes().await;

        let kinds: Vec<WriteKind> = memory
            .applied_writes()
            .await
            .into_iter()
            .map(|(kind, _)| kind)
            .collect();
        assert_eq!(kinds, vec![WriteKind::Set, WriteKind::End, WriteKind::Set]);

        let record = memory.record("S1").await.unwrap();
        assert!(tracker.is_tracking());
        assert!(record.active);
        assert_eq!(record.status, AlertStatus::Active);
        assert_eq!(record.location, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_writes_keep_issue_order() {
        let store = MemoryAlertStore::new();
        let location = Arc::new(ScriptedLocation::new(
            std::iter::repeat(point(25.55, -100.93)).take(3),
        ));
        let tracker = tracker(&store, location, Some(identity()));

        tracker.start_tracking().await;
        tokio::time::sleep(Duration::from_secs(16)).await;
        tracker.stop_tracking().await;
        tracker.flush_writes().await;

        let attempts = tracker.writes().attempts();
        let seqs: Vec<u64> = attempts.iter().map(|a| a.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
        assert!(attempts
            .iter()
            .all(|a| a.outcome == WriteOutcome::Succeeded));

        let applied: Vec<WriteKind> = store
            .applied_writes()
            .await
            .into_iter()
            .map(|(kind, _)| kind)
            .collect();
        assert_eq!(
            applied,
            attempts.iter().map(|a| a.kind).collect::<Vec<_>>()
        );
        assert_eq!(applied.last(), Some(&WriteKind::End));
    }

    struct HangingLocation {
        requests: AtomicUsize,
    }

    #[async_trait]
    impl LocationSource for HangingLocation {
        async fn sample(&self) -> Option<GeoPoint> {
            self.requests.fetch_add(1, Ordering::SeqCst);
            futures::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_sample_counts_as_missed_tick() {
        let store = MemoryAlertStore::new();
        let location = Arc::new(HangingLocation {
            requests: AtomicUsize::new(0),
        });
        let tracker = Tracker::new(
            Arc::new(store.clone()),
            location.clone(),
            Arc::new(SessionIdentity::signed_in(identity())),
            Arc::new(MemoryProfileDirectory::default()),
            TrackerConfig {
                sample_interval: Duration::from_secs(5),
                sample_timeout: Duration::from_secs(1),
            },
        );

        tracker.start_tracking().await;
        tokio::time::sleep(Duration::from_secs(13)).await;

        assert_eq!(location.requests.load(Ordering::SeqCst), 2);
        assert_eq!(tracker.writes().count(WriteKind::Location), 0);
        assert!(tracker.is_tracking());
    }
}
