//! Drives one [`IngestionJob`] through fetch → normalize → upsert with
//! retries, honouring shutdown.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::database::RecordStore;
use crate::error::{Error, Result};
use crate::ingest::{Ingester, IngestionJob, JobResult, Record, RetryPolicy, RetryState, RetryStep, Window};

pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Everything a run needs besides the ingester itself.
#[derive(Clone)]
pub struct IngestContext {
    pub store: Arc<dyn RecordStore>,
    pub policy: RetryPolicy,
    pub fetch_timeout: Duration,
}

impl IngestContext {
    pub fn new(store: Arc<dyn RecordStore>, policy: RetryPolicy, fetch_timeout: Duration) -> Self {
        Self {
            store,
            policy,
            fetch_timeout,
        }
    }
}

/// Runs `job` to a terminal status and returns its result.
///
/// Never returns an error: every failure, including cancellation through
/// `cancel`, is recorded on the job. Cancellation only interrupts between
/// statements, so a batch already inside its transaction is either
/// committed or rolled back by the store.
pub async fn run(
    ingester: &dyn Ingester,
    ctx: &IngestContext,
    job: &mut IngestionJob,
    mut cancel: watch::Receiver<bool>,
) -> JobResult {
    job.start();
    let dataset = job.dataset;
    let window = job.window;
    info!(
        "Starting {} ingestion {} for {} .. {}",
        dataset, job.id, window.start, window.end
    );

    let outcome = {
        let attempts = &mut job.attempts;
        tokio::select! {
            outcome = attempt_loop(ingester, ctx, window, attempts) => outcome,
            _ = cancelled(&mut cancel) => Err(Error::Cancelled),
        }
    };

    match outcome {
        Ok((seen, written)) => {
            job.succeed(seen, written);
            info!(
                "{} ingestion {} succeeded: {} records seen, {} written, {} attempt(s)",
                dataset, job.id, seen, written, job.attempts
            );
        }
        Err(err) => {
            job.fail(&err);
            error!(
                dataset = %dataset,
                job_id = %job.id,
                attempts = job.attempts,
                kind = ?err.kind(),
                "Ingestion failed: {}",
                err
            );
        }
    }

    job.result()
}

async fn attempt_loop(
    ingester: &dyn Ingester,
    ctx: &IngestContext,
    window: Window,
    attempts: &mut u32,
) -> Result<(usize, u64)> {
    let mut state = RetryState::new(Instant::now());
    loop {
        *attempts = state.attempt();
        let err = match attempt_once(ingester, ctx, &window).await {
            Ok(counts) => return Ok(counts),
            Err(err) => err,
        };

        let jitter = ctx.policy.sample_jitter();
        match state.on_failure(&ctx.policy, &err, Instant::now(), jitter) {
            RetryStep::Retry { attempt, delay } => {
                warn!(
                    "{} attempt {} failed ({}), retrying in {:?} as attempt {}",
                    ingester.dataset(),
                    attempt - 1,
                    err,
                    delay,
                    attempt
                );
                tokio::time::sleep_until(state.next_eligible_at()).await;
            }
            RetryStep::GiveUp => return Err(err),
        }
    }
}

async fn attempt_once(
    ingester: &dyn Ingester,
    ctx: &IngestContext,
    window: &Window,
) -> Result<(usize, u64)> {
    let raw = ingester.fetch(window, ctx.fetch_timeout).await?;
    let fetched_at = Utc::now();

    let records = ingester
        .normalize(&raw, fetched_at)
        .map_err(|e| {
            if e.is_transient() {
                Error::permanent_upstream(ingester.dataset().as_str(), e)
            } else {
                e
            }
        })?;
    let seen = records.len();
    let records = dedupe_last_wins(records);

    let written = ingester.upsert(ctx.store.as_ref(), &records).await?;
    Ok((seen, written))
}

/// Collapses duplicate natural keys, keeping each key's last occurrence.
fn dedupe_last_wins(records: Vec<Record>) -> Vec<Record> {
    let mut seen = HashSet::with_capacity(records.len());
    let mut unique: Vec<Record> = records
        .into_iter()
        .rev()
        .filter(|r| seen.insert(r.natural_key.clone()))
        .collect();
    unique.reverse();
    unique
}

/// Resolves once shutdown is broadcast. A dropped sender never cancels.
pub async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    if cancel.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}
