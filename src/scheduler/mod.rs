//! Ingestion scheduler.
//!
//! One slot per registered dataset. A slot moves `idle → dispatched →
//! running → idle` through an atomic state word, so a dataset never has two
//! jobs in flight; distinct datasets share a semaphore that bounds total
//! concurrency.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use futures_util::future::join_all;
use serde::Serialize;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::ingest::runner;
use crate::ingest::{DatasetType, IngestContext, Ingester, IngestionJob, JobResult, Trigger, Window};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum SlotState {
    Idle = 0,
    Dispatched = 1,
    Running = 2,
}

impl SlotState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => SlotState::Dispatched,
            2 => SlotState::Running,
            _ => SlotState::Idle,
        }
    }
}

struct Slot {
    ingester: Arc<dyn Ingester>,
    state: AtomicU8,
    interval: Duration,
    last_job: Mutex<Option<IngestionJob>>,
}

impl Slot {
    fn state(&self) -> SlotState {
        SlotState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn try_dispatch(&self) -> bool {
        self.state
            .compare_exchange(
                SlotState::Idle as u8,
                SlotState::Dispatched as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    fn record(&self, job: &IngestionJob) {
        if let Ok(mut last) = self.last_job.lock() {
            *last = Some(job.clone());
        }
    }
}

/// Returns the slot to idle however the job task ends.
struct SlotGuard(Arc<Slot>);

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.0.state.store(SlotState::Idle as u8, Ordering::SeqCst);
    }
}

/// Snapshot of one slot for status endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct SlotStatus {
    pub dataset: DatasetType,
    pub state: SlotState,
    pub interval_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_job: Option<IngestionJob>,
}

pub struct Scheduler {
    slots: BTreeMap<DatasetType, Arc<Slot>>,
    ctx: Arc<IngestContext>,
    permits: Arc<Semaphore>,
    shutdown_tx: watch::Sender<bool>,
}

impl Scheduler {
    pub fn new(ctx: IngestContext, max_concurrency: usize) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            slots: BTreeMap::new(),
            ctx: Arc::new(ctx),
            permits: Arc::new(Semaphore::new(max_concurrency.max(1))),
            shutdown_tx,
        }
    }

    /// Adds (or replaces) the ingester for its dataset type.
    pub fn register(&mut self, ingester: Arc<dyn Ingester>, interval: Duration) {
        let dataset = ingester.dataset();
        self.slots.insert(
            dataset,
            Arc::new(Slot {
                ingester,
                state: AtomicU8::new(SlotState::Idle as u8),
                interval,
                last_job: Mutex::new(None),
            }),
        );
    }

    pub fn datasets(&self) -> Vec<DatasetType> {
        self.slots.keys().copied().collect()
    }

    fn slot(&self, dataset: DatasetType) -> Result<&Arc<Slot>> {
        self.slots
            .get(&dataset)
            .ok_or_else(|| Error::Configuration(format!("no ingester registered for {dataset}")))
    }

    /// Runs one job for `dataset` and waits for its result.
    ///
    /// `window` defaults to the ingester's lookback ending now. Fails with
    /// `AlreadyRunning` when the dataset already has a job in flight. The
    /// job runs on its own task, so dropping the returned future does not
    /// abort it.
    pub async fn run_now(
        self: &Arc<Self>,
        dataset: DatasetType,
        window: Option<Window>,
        trigger: Trigger,
    ) -> Result<JobResult> {
        let handle = self.dispatch(dataset, window, trigger)?;
        handle
            .await
            .map_err(|e| Error::Internal(format!("{dataset} job task failed: {e}")))
    }

    /// Claims the slot and spawns the job; the slot is released when the task ends.
    fn dispatch(
        self: &Arc<Self>,
        dataset: DatasetType,
        window: Option<Window>,
        trigger: Trigger,
    ) -> Result<JoinHandle<JobResult>> {
        let slot = Arc::clone(self.slot(dataset)?);
        if self.is_shutting_down() {
            return Err(Error::Cancelled);
        }
        if !slot.try_dispatch() {
            return Err(Error::AlreadyRunning(dataset));
        }
        let guard = SlotGuard(Arc::clone(&slot));

        let window = match window {
            Some(window) => window,
            None => Window::trailing(Utc::now(), slot.ingester.default_lookback())?,
        };
        let mut job = IngestionJob::pending(dataset, window, trigger);
        slot.record(&job);

        let ctx = Arc::clone(&self.ctx);
        let permits = Arc::clone(&self.permits);
        let mut cancel = self.shutdown_tx.subscribe();

        Ok(tokio::spawn(async move {
            let _guard = guard;
            let permit = tokio::select! {
                biased;
                _ = runner::cancelled(&mut cancel) => None,
                permit = permits.acquire_owned() => permit.ok(),
            };
            let Some(_permit) = permit else {
                job.fail(&Error::Cancelled);
                slot.record(&job);
                return job.result();
            };

            slot.state.store(SlotState::Running as u8, Ordering::SeqCst);
            job.start();
            slot.record(&job);

            let result = runner::run(slot.ingester.as_ref(), &ctx, &mut job, cancel).await;
            slot.record(&job);
            result
        }))
    }

    /// Runs every registered dataset once, concurrently within the bound.
    /// Datasets that are already busy are reported as errors.
    pub async fn run_all_once(
        self: &Arc<Self>,
        window: Option<Window>,
        trigger: Trigger,
    ) -> Vec<(DatasetType, Result<JobResult>)> {
        let runs = self.datasets().into_iter().map(|dataset| async move {
            (dataset, self.run_now(dataset, window, trigger).await)
        });
        join_all(runs).await
    }

    /// Spawns one ticker per slot. A tick that finds its slot busy is skipped.
    pub fn start(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        self.slots
            .iter()
            .map(|(dataset, slot)| {
                let scheduler = Arc::clone(self);
                let dataset = *dataset;
                let period = slot.interval.max(Duration::from_secs(1));
                let mut shutdown = self.shutdown_tx.subscribe();

                tokio::spawn(async move {
                    let mut ticker = tokio::time::interval(period);
                    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                    info!("Scheduling {} every {:?}", dataset, period);

                    loop {
                        tokio::select! {
                            _ = ticker.tick() => {}
                            _ = runner::cancelled(&mut shutdown) => break,
                        }
                        match scheduler.dispatch(dataset, None, Trigger::Scheduled) {
                            Ok(handle) => {
                                tokio::spawn(async move {
                                    if let Err(e) = handle.await {
                                        error!("{} job task panicked: {}", dataset, e);
                                    }
                                });
                            }
                            Err(Error::Cancelled) => break,
                            Err(Error::AlreadyRunning(_)) => {
                                debug!("Skipping {} tick, previous job still in flight", dataset);
                            }
                            Err(e) => warn!("Could not dispatch {}: {}", dataset, e),
                        }
                    }
                    debug!("{} ticker stopped", dataset);
                })
            })
            .collect()
    }

    pub fn status(&self, dataset: DatasetType) -> Result<SlotStatus> {
        let slot = self.slot(dataset)?;
        Ok(SlotStatus {
            dataset,
            state: slot.state(),
            interval_secs: slot.interval.as_secs(),
            last_job: slot.last_job.lock().ok().and_then(|j| j.clone()),
        })
    }

    pub fn statuses(&self) -> Vec<SlotStatus> {
        self.slots
            .keys()
            .filter_map(|dataset| self.status(*dataset).ok())
            .collect()
    }

    /// Cancels in-flight jobs and stops the tickers. Jobs end as `failed`.
    pub fn shutdown(&self) {
        info!("Scheduler shutting down");
        self.shutdown_tx.send_replace(true);
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Waits until every slot is idle or `deadline` passes. Returns whether all drained.
    pub async fn drain(&self, deadline: Duration) -> bool {
        let wait = async {
            while self.slots.values().any(|s| s.state() != SlotState::Idle) {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        };
        tokio::time::timeout(deadline, wait).await.is_ok()
    }
}
