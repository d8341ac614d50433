use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use chrono::Utc;
use siscom_sos::config::{AppConfig, Role};
use siscom_sos::db::{self, DbPool};
use siscom_sos::identity::{Identity, PgProfileDirectory, SessionIdentity};
use siscom_sos::kafka;
use siscom_sos::location::FixCache;
use siscom_sos::monitor::Monitor;
use siscom_sos::store::{AlertStore, PgAlertStore};
use siscom_sos::tracker::Tracker;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load config
    let config = AppConfig::load()?;

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(&config.log_level)
        .init();

    info!("Starting Siscom SOS Service ({})...", config.role);

    // Init DB
    let pool = db::init_pool(&config.database_url).await?;
    db::ensure_schema(&pool).await?;
    info!("Connected to database");

    let store: Arc<dyn AlertStore> = Arc::new(PgAlertStore::new(pool.clone()));

    match config.role {
        Role::Monitor => run_monitor(&config, store).await,
        Role::Tracker => run_tracker(&config, pool, store).await,
    }
}

async fn run_monitor(config: &AppConfig, store: Arc<dyn AlertStore>) -> anyhow::Result<()> {
    let monitor = Monitor::new(store);
    let mut alerts = monitor.subscribe();
    monitor.start_listening();

    let mut stale_check = tokio::time::interval(Duration::from_secs(30));
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Shutting down monitor");
                break;
            }
            changed = alerts.changed() => {
                if changed.is_err() {
                    break;
                }
                let list = alerts.borrow_and_update().clone();
                info!("{} active SOS alert(s)", list.len());
                for record in &list {
                    match record.location {
                        Some(location) => info!(
                            "  {} <{}> at {}",
                            record.display_name, record.contact_email, location
                        ),
                        None => info!(
                            "  {} <{}> waiting for first location",
                            record.display_name, record.contact_email
                        ),
                    }
                }
            }
            _ = stale_check.tick() => {
                for record in monitor.stale_alerts(Utc::now(), config.stale_after()) {
                    warn!(
                        "SOS alert for {} has not been updated since {:?}",
                        record.subject_id, record.last_update_timestamp
                    );
                }
            }
        }
    }

    monitor.stop_listening();
    Ok(())
}

async fn run_tracker(
    config: &AppConfig,
    pool: DbPool,
    store: Arc<dyn AlertStore>,
) -> anyhow::Result<()> {
    let subject_id = config
        .subject_id
        .clone()
        .ok_or_else(|| anyhow!("SOS_SUBJECT_ID is required for the tracker role"))?;
    let device_id = config.device_id.clone().unwrap_or_else(|| subject_id.clone());

    let fixes = FixCache::new();
    let location = Arc::new(fixes.device(device_id.clone(), config.max_fix_age()));
    let identity = Arc::new(SessionIdentity::new(Some(Identity::new(
        subject_id,
        config.contact_email.clone(),
    ))));
    let profiles = Arc::new(PgProfileDirectory::new(pool));

    let tracker = Tracker::new(store, location, identity, profiles, config.tracker_config());

    // Start Kafka
    let consumer_config = config.clone();
    let mut consumer = tokio::spawn(async move {
        kafka::start_kafka_consumer(&consumer_config, fixes, vec![device_id]).await
    });

    tracker.start_tracking().await;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Cancelling SOS");
        }
        result = &mut consumer => {
            match result {
                Ok(Err(e)) => error!("Telemetry consumer stopped: {}", e),
                Ok(Ok(())) => warn!("Telemetry consumer exited"),
                Err(e) => error!("Telemetry consumer task failed: {}", e),
            }
        }
    }

    tracker.stop_tracking().await;
    tracker.flush_writes().await;
    consumer.abort();

    Ok(())
}
