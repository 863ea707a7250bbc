use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, ErrorKind};
use crate::ingest::{DatasetType, Window};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    Scheduled,
    Manual,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&Error> for JobError {
    fn from(err: &Error) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestionJob {
    pub id: Uuid,
    pub dataset: DatasetType,
    pub window: Window,
    pub trigger: Trigger,
    pub trigger_time: DateTime<Utc>,
    pub status: JobStatus,
    pub attempts: u32,
    pub records_seen: usize,
    pub records_written: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl IngestionJob {
    pub fn pending(dataset: DatasetType, window: Window, trigger: Trigger) -> Self {
        Self {
            id: Uuid::new_v4(),
            dataset,
            window,
            trigger,
            trigger_time: Utc::now(),
            status: JobStatus::Pending,
            attempts: 0,
            records_seen: 0,
            records_written: 0,
            error: None,
            finished_at: None,
        }
    }

    pub fn start(&mut self) {
        if self.status == JobStatus::Pending {
            self.status = JobStatus::Running;
        }
    }

    pub fn succeed(&mut self, records_seen: usize, records_written: u64) {
        if self.status.is_terminal() {
            return;
        }
        self.status = JobStatus::Succeeded;
        self.records_seen = records_seen;
        self.records_written = records_written;
        self.finished_at = Some(Utc::now());
    }

    pub fn fail(&mut self, err: &Error) {
        if self.status.is_terminal() {
            return;
        }
        self.status = JobStatus::Failed;
        self.error = Some(JobError::from(err));
        self.finished_at = Some(Utc::now());
    }

    pub fn result(&self) -> JobResult {
        JobResult {
            job_id: self.id,
            dataset: self.dataset,
            window: self.window,
            final_status: self.status,
            attempts: self.attempts,
            records_seen: self.records_seen,
            records_written: self.records_written,
            error: self.error.clone(),
        }
    }
}

/// Outcome of one `run`, handed back to the scheduler and to operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobResult {
    pub job_id: Uuid,
    pub dataset: DatasetType,
    pub window: Window,
    pub final_status: JobStatus,
    pub attempts: u32,
    pub records_seen: usize,
    pub records_written: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
}

impl JobResult {
    pub fn succeeded(&self) -> bool {
        self.final_status == JobStatus::Succeeded
    }
}
