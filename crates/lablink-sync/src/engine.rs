//! # Sync Engine
//!
//! One scheduler task plus a bounded worker pool for outbound HTTP.
//!
//! The scheduler wakes on the configured trigger (realtime notify, fixed
//! interval, or cron), selects the local rows that are due, chunks them
//! into batches and hands the batches to the pool. Each batch marks its
//! own rows afterwards: synced on 2xx, rescheduled with exponential
//! backoff on transient failures, poisoned on permanent rejections.
//! Everything is recorded in the sync log and on the event bus.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use lablink_core::{
    AppEvent, EventBus, ExternalServerConfig, SyncFrequency, SyncOutcome,
};
use lablink_db::{Database, PendingResult};

use crate::retry;
use crate::schedule;
use crate::uplink::{BatchBundle, BatchPayload, DeliveryOutcome, Uplink};

/// Safety poll period for realtime mode; catches rows whose backoff
/// elapsed with no new-result notification.
const REALTIME_POLL: Duration = Duration::from_secs(5);

/// Fallback wait when a cron expression stops yielding occurrences.
const CRON_FALLBACK_WAIT: Duration = Duration::from_secs(60);

// =============================================================================
// Handle
// =============================================================================

/// Control handle for a running [`SyncEngine`].
#[derive(Clone)]
pub struct SyncEngineHandle {
    notify_tx: mpsc::Sender<()>,
    shutdown_tx: watch::Sender<bool>,
}

impl SyncEngineHandle {
    /// Wakes the engine because new results were stored. Cheap and
    /// non-blocking; coalesces when the engine is already busy.
    pub fn notify_new_results(&self) {
        let _ = self.notify_tx.try_send(());
    }

    /// Asks the engine to finish its in-flight work and exit.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

// =============================================================================
// Engine
// =============================================================================

/// Background task draining local rows to the external server.
pub struct SyncEngine {
    db: Database,
    events: EventBus,
    config: ExternalServerConfig,
    instance_id: String,
    notify_rx: mpsc::Receiver<()>,
    shutdown_rx: watch::Receiver<bool>,
}

impl SyncEngine {
    /// Creates the engine and its control handle.
    pub fn new(
        db: Database,
        events: EventBus,
        config: ExternalServerConfig,
        instance_id: String,
    ) -> (Self, SyncEngineHandle) {
        let (notify_tx, notify_rx) = mpsc::channel(1);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let engine = SyncEngine {
            db,
            events,
            config,
            instance_id,
            notify_rx,
            shutdown_rx,
        };
        let handle = SyncEngineHandle {
            notify_tx,
            shutdown_tx,
        };

        (engine, handle)
    }

    /// Runs the scheduler loop. Spawn this as a background task.
    pub async fn run(mut self) {
        if !self.config.enabled {
            info!("External sync disabled");
            return;
        }

        let uplink = match Uplink::new(
            &self.config.url,
            self.config.auth.clone(),
            Duration::from_secs(self.config.request_timeout_secs),
        ) {
            Ok(uplink) => Arc::new(uplink),
            Err(e) => {
                error!(error = %e, "Sync engine cannot start");
                self.events.error("sync", e.to_string());
                return;
            }
        };

        let cron = match self.config.sync_frequency {
            SyncFrequency::Cron => match schedule::parse_cron(&self.config.cron_schedule) {
                Some(schedule) => Some(schedule),
                None => {
                    error!(expr = %self.config.cron_schedule, "Invalid cron schedule");
                    self.events.error(
                        "sync",
                        format!("invalid cron schedule '{}'", self.config.cron_schedule),
                    );
                    return;
                }
            },
            _ => None,
        };

        info!(
            url = %self.config.url,
            mode = %self.config.sync_frequency,
            batch_size = self.config.batch_size,
            workers = self.config.workers,
            "Sync engine starting"
        );

        let mut poll = tokio::time::interval(match self.config.sync_frequency {
            SyncFrequency::Realtime => REALTIME_POLL,
            SyncFrequency::Scheduled => Duration::from_secs(self.config.interval_seconds.max(1)),
            SyncFrequency::Cron => CRON_FALLBACK_WAIT,
        });
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            // Wait for the next trigger.
            match self.config.sync_frequency {
                SyncFrequency::Realtime => {
                    tokio::select! {
                        _ = self.shutdown_rx.changed() => break,
                        Some(()) = self.notify_rx.recv() => {}
                        _ = poll.tick() => {}
                    }
                }
                SyncFrequency::Scheduled => {
                    tokio::select! {
                        _ = self.shutdown_rx.changed() => break,
                        _ = poll.tick() => {}
                    }
                }
                SyncFrequency::Cron => {
                    let wait = cron
                        .as_ref()
                        .and_then(|s| schedule::next_cron_wait(s, Utc::now()))
                        .unwrap_or(CRON_FALLBACK_WAIT);
                    debug!(wait_secs = wait.as_secs(), "Next cron sync");
                    tokio::select! {
                        _ = self.shutdown_rx.changed() => break,
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
            }

            self.drain(&uplink).await;

            if *self.shutdown_rx.borrow() {
                break;
            }
        }

        info!("Sync engine stopped");
    }

    /// Sends every due row, batch by batch, until the queue is empty or
    /// everything left is scheduled for later.
    async fn drain(&mut self, uplink: &Arc<Uplink>) {
        loop {
            let limit = (self.config.batch_size * self.config.workers) as u32;
            let rows = match self.db.results().pending_batch(limit, Utc::now()).await {
                Ok(rows) => rows,
                Err(e) => {
                    error!(error = %e, "Could not select pending results");
                    self.events.error("sync", e.to_string());
                    return;
                }
            };

            if rows.is_empty() {
                return;
            }

            debug!(count = rows.len(), "Draining pending results");

            let semaphore = Arc::new(Semaphore::new(self.config.workers));
            let mut workers: JoinSet<()> = JoinSet::new();

            for chunk in rows.chunks(self.config.batch_size) {
                let chunk = chunk.to_vec();
                let semaphore = semaphore.clone();
                let uplink = uplink.clone();
                let db = self.db.clone();
                let events = self.events.clone();
                let instance_id = self.instance_id.clone();
                let base = Duration::from_secs(self.config.retry_base_secs);

                workers.spawn(async move {
                    let Ok(_permit) = semaphore.acquire_owned().await else {
                        return;
                    };
                    send_batch(uplink, db, events, instance_id, base, chunk).await;
                });
            }

            while workers.join_next().await.is_some() {}

            if *self.shutdown_rx.borrow() {
                return;
            }
        }
    }
}

// =============================================================================
// Batch Sending
// =============================================================================

/// Sends one batch and applies the outcome to its rows.
async fn send_batch(
    uplink: Arc<Uplink>,
    db: Database,
    events: EventBus,
    instance_id: String,
    backoff_base: Duration,
    rows: Vec<PendingResult>,
) {
    let ids: Vec<i64> = rows.iter().map(|r| r.result.id).collect();
    let max_attempts = rows.iter().map(|r| r.result.attempts).max().unwrap_or(0);

    let payload = match build_payload(&db, &instance_id, &rows).await {
        Ok(payload) => payload,
        Err(e) => {
            error!(error = %e, "Could not assemble sync payload");
            events.error("sync", e.to_string());
            return;
        }
    };

    match uplink.send(&payload).await {
        DeliveryOutcome::Accepted { status } => {
            let now = Utc::now();
            if let Err(e) = db.results().mark_synced(&ids, now).await {
                error!(error = %e, "Batch delivered but rows not marked synced");
                events.error("sync", e.to_string());
                return;
            }
            let detail = format!("HTTP {}", status);
            let _ = db.sync_log().record("success", &detail, ids.len() as i64).await;
            info!(results = ids.len(), status, "Batch synced");
            events.publish(AppEvent::SyncAttempt {
                outcome: SyncOutcome::Synced,
                attempts: max_attempts,
                results: ids.len(),
                detail,
            });
        }

        DeliveryOutcome::Retryable { detail } => {
            let now = Utc::now();
            let schedule: Vec<_> = rows
                .iter()
                .map(|r| {
                    (
                        r.result.id,
                        retry::next_attempt_at(now, backoff_base, r.result.attempts),
                    )
                })
                .collect();
            if let Err(e) = db.results().mark_failed(&schedule, &detail).await {
                error!(error = %e, "Could not reschedule failed batch");
            }
            let _ = db.sync_log().record("failed", &detail, 0).await;
            warn!(results = ids.len(), %detail, "Batch delivery failed, will retry");
            events.publish(AppEvent::SyncAttempt {
                outcome: SyncOutcome::Retrying,
                attempts: max_attempts + 1,
                results: ids.len(),
                detail,
            });
        }

        DeliveryOutcome::Poisoned { detail } => {
            if let Err(e) = db.results().mark_poisoned(&ids, &detail).await {
                error!(error = %e, "Could not poison rejected rows");
            }
            let _ = db.sync_log().record("poisoned", &detail, 0).await;
            warn!(results = ids.len(), %detail, "Batch rejected permanently");
            events.publish(AppEvent::SyncAttempt {
                outcome: SyncOutcome::Poisoned,
                attempts: max_attempts + 1,
                results: ids.len(),
                detail: detail.clone(),
            });
            events.warn("poisoned", detail);
        }
    }
}

/// Groups rows into per-(patient, order) bundles, preserving the batch
/// order, and resolves the owning patient and order rows.
async fn build_payload(
    db: &Database,
    instance_id: &str,
    rows: &[PendingResult],
) -> Result<BatchPayload, lablink_db::DbError> {
    let mut patients = HashMap::new();
    let mut orders = HashMap::new();
    let mut bundles: Vec<BatchBundle> = Vec::new();
    let mut current_key: Option<(i64, i64)> = None;

    for row in rows {
        let key = (row.patient_id, row.result.order_id);

        if current_key != Some(key) {
            if !patients.contains_key(&row.patient_id) {
                patients.insert(row.patient_id, db.patients().get(row.patient_id).await?);
            }
            if !orders.contains_key(&row.result.order_id) {
                orders.insert(
                    row.result.order_id,
                    db.orders().get(row.result.order_id).await?,
                );
            }

            bundles.push(BatchBundle {
                patient: (&patients[&row.patient_id]).into(),
                order: (&orders[&row.result.order_id]).into(),
                results: Vec::new(),
            });
            current_key = Some(key);
        }

        bundles
            .last_mut()
            .expect("bundle pushed above")
            .results
            .push((&row.result).into());
    }

    Ok(BatchPayload {
        instance_id: instance_id.to_string(),
        batch: bundles,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use lablink_core::{
        AnalyzerType, CanonicalMessage, NewOrder, NewPatient, NewResult, OrderGroup,
    };
    use lablink_db::DbConfig;

    async fn seeded_db() -> Database {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let msg = CanonicalMessage {
            analyzer: AnalyzerType::SysmexXnL,
            patient: NewPatient {
                external_id: "322288".into(),
                name: Some("WORLANYO TIMOTHY".into()),
                ..Default::default()
            },
            orders: vec![OrderGroup {
                order: NewOrder {
                    sample_id: "SID01".into(),
                    ..Default::default()
                },
                results: vec![
                    NewResult {
                        test_code: "GLU".into(),
                        value: "5.3".into(),
                        observed_at: Some("20240115093000".into()),
                        ..Default::default()
                    },
                    NewResult {
                        test_code: "CREA".into(),
                        value: "88".into(),
                        observed_at: Some("20240115093000".into()),
                        ..Default::default()
                    },
                ],
            }],
        };
        db.store_message(&msg).await.unwrap();
        db
    }

    #[tokio::test]
    async fn payload_groups_rows_into_one_bundle_per_order() {
        let db = seeded_db().await;
        let rows = db.results().pending_batch(10, Utc::now()).await.unwrap();
        assert_eq!(rows.len(), 2);

        let payload = build_payload(&db, "XN-L-001", &rows).await.unwrap();
        assert_eq!(payload.instance_id, "XN-L-001");
        assert_eq!(payload.batch.len(), 1);
        assert_eq!(payload.batch[0].patient.patient_id, "322288");
        assert_eq!(payload.batch[0].order.sample_id, "SID01");
        assert_eq!(payload.batch[0].results.len(), 2);
    }

    #[tokio::test]
    async fn disabled_engine_exits_immediately() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let config = ExternalServerConfig::default();
        let (engine, _handle) =
            SyncEngine::new(db, EventBus::new(), config, "XN-L-001".into());
        // Disabled config: run returns without doing anything.
        engine.run().await;
    }
}
