//! Reactive recalculation
//!
//! Wearables sync late and in bursts. When the collaborator announces new
//! samples of a critical metric (HRV, RHR, sleep analysis), the Recovery Score
//! for today and yesterday is recomputed and the persisted score replaced.
//!
//! Duplicate work is prevented by a pending set with an atomic
//! check-and-insert: a date already being recomputed is skipped, and the date
//! leaves the set when its recompute finishes, successfully or not.

use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::baseline::BaselineEngine;
use crate::clock::Clock;
use crate::database::{Database, StoredScore};
use crate::logging::log_score_error;
use crate::models::{MetricKind, SampleArrival};
use crate::orchestrator::ScoreOrchestrator;
use crate::provider::RawMetricsProvider;
use crate::recovery::RecoveryScoreCalculator;

const CHANGE_CAPACITY: usize = 64;
const ARRIVAL_QUEUE: usize = 128;

/// Broadcast after a recomputed score was persisted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreChanged {
    pub date: NaiveDate,
    pub recovery_score: u8,
    pub sleep_score: Option<u8>,
    pub trigger: MetricKind,
}

/// Result of handling one affected date
#[derive(Debug, Clone, PartialEq)]
pub enum RecalcOutcome {
    Recomputed { date: NaiveDate, recovery_score: u8 },
    AlreadyPending { date: NaiveDate },
    Failed { date: NaiveDate, reason: String },
}

impl RecalcOutcome {
    pub fn date(&self) -> NaiveDate {
        match self {
            RecalcOutcome::Recomputed { date, .. }
            | RecalcOutcome::AlreadyPending { date }
            | RecalcOutcome::Failed { date, .. } => *date,
        }
    }
}

/// Removes its date from the pending set when dropped
struct PendingGuard<'a> {
    pending: &'a Mutex<HashSet<NaiveDate>>,
    date: NaiveDate,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.date);
    }
}

pub struct ReactiveRecalculationManager {
    clock: Arc<dyn Clock>,
    db: Arc<Database>,
    baselines: Arc<BaselineEngine>,
    orchestrator: Arc<ScoreOrchestrator>,
    recovery: Arc<RecoveryScoreCalculator>,
    pending: Mutex<HashSet<NaiveDate>>,
    changes: broadcast::Sender<ScoreChanged>,
}

impl ReactiveRecalculationManager {
    pub fn new(
        clock: Arc<dyn Clock>,
        db: Arc<Database>,
        baselines: Arc<BaselineEngine>,
        orchestrator: Arc<ScoreOrchestrator>,
        recovery: Arc<RecoveryScoreCalculator>,
    ) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CAPACITY);
        Self {
            clock,
            db,
            baselines,
            orchestrator,
            recovery,
            pending: Mutex::new(HashSet::new()),
            changes,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ScoreChanged> {
        self.changes.subscribe()
    }

    /// Today, plus yesterday for samples that synced late
    pub fn affected_dates(&self) -> [NaiveDate; 2] {
        let today = self.clock.today();
        [today, today - Duration::days(1)]
    }

    pub fn is_pending(&self, date: NaiveDate) -> bool {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&date)
    }

    fn try_claim(&self, date: NaiveDate) -> Option<PendingGuard<'_>> {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        if pending.insert(date) {
            Some(PendingGuard {
                pending: &self.pending,
                date,
            })
        } else {
            None
        }
    }

    /// Recompute every affected date for one arrival notification
    pub async fn handle_arrival(&self, arrival: SampleArrival) -> Vec<RecalcOutcome> {
        let [today, yesterday] = self.affected_dates();
        let span = info_span!("recalculation", run_id = %Uuid::new_v4(), metric = ?arrival.metric);

        async {
            debug!(received_at = %arrival.received_at, "Sample arrival");

            // New samples for yesterday shift the windows of every later date
            self.baselines.invalidate_after(yesterday);

            let (today_outcome, yesterday_outcome) = tokio::join!(
                self.recalculate(today, arrival.metric),
                self.recalculate(yesterday, arrival.metric),
            );
            vec![today_outcome, yesterday_outcome]
        }
        .instrument(span)
        .await
    }

    async fn recalculate(&self, date: NaiveDate, trigger: MetricKind) -> RecalcOutcome {
        let Some(_guard) = self.try_claim(date) else {
            debug!(date = %date, "Recalculation already pending");
            return RecalcOutcome::AlreadyPending { date };
        };

        info!(date = %date, trigger = ?trigger, "Recalculating score");

        if let Err(err) = self.db.delete_score(date) {
            warn!(date = %date, error = %err, "Failed to delete persisted score");
        }
        self.orchestrator.invalidate(date);

        let result = match self.recovery.calculate_recovery_score(date).await {
            Ok(result) => result,
            Err(err) => {
                log_score_error("reactive recalculation", &err);
                return RecalcOutcome::Failed {
                    date,
                    reason: err.to_string(),
                };
            }
        };

        let stored = StoredScore::from_recovery(&result, self.clock.now())
            .and_then(|row| self.db.store_score(&row));
        if let Err(err) = stored {
            warn!(date = %date, error = %err, "Failed to persist recalculated score");
            return RecalcOutcome::Failed {
                date,
                reason: err.to_string(),
            };
        }

        let change = ScoreChanged {
            date,
            recovery_score: result.final_score,
            sleep_score: result.details.sleep_score,
            trigger,
        };
        if self.changes.send(change).is_err() {
            debug!(date = %date, "No score change subscribers");
        }

        info!(date = %date, score = result.final_score, "Score recalculated");
        RecalcOutcome::Recomputed {
            date,
            recovery_score: result.final_score,
        }
    }

    /// Forward critical-metric notifications to a worker handling each on its own task
    pub fn spawn(self: &Arc<Self>, provider: Arc<dyn RawMetricsProvider>) -> ReactiveHandle {
        let (tx, mut rx) = mpsc::channel::<SampleArrival>(ARRIVAL_QUEUE);

        let mut forwarders = Vec::new();
        for metric in MetricKind::CRITICAL {
            let mut notifications = provider.notify_on_new_sample(metric);
            let tx = tx.clone();
            let clock = self.clock.clone();

            forwarders.push(tokio::spawn(async move {
                loop {
                    let arrival = match notifications.recv().await {
                        Ok(arrival) => arrival,
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(metric = ?metric, skipped, "Arrival notifications lagged");
                            SampleArrival {
                                metric,
                                received_at: clock.now(),
                            }
                        }
                        Err(RecvError::Closed) => break,
                    };
                    if tx.send(arrival).await.is_err() {
                        break;
                    }
                }
            }));
        }
        drop(tx);

        let manager = Arc::clone(self);
        let worker = tokio::spawn(async move {
            while let Some(arrival) = rx.recv().await {
                let manager = Arc::clone(&manager);
                tokio::spawn(async move {
                    manager.handle_arrival(arrival).await;
                });
            }
        });

        ReactiveHandle { forwarders, worker }
    }
}

/// Tasks started by [`ReactiveRecalculationManager::spawn`]
pub struct ReactiveHandle {
    forwarders: Vec<JoinHandle<()>>,
    worker: JoinHandle<()>,
}

impl ReactiveHandle {
    pub fn shutdown(self) {
        for forwarder in &self.forwarders {
            forwarder.abort();
        }
        self.worker.abort();
    }
}
